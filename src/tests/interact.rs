#[cfg(test)]
mod button_id {
    use crate::interact::{ButtonId, ParseError};

    #[test]
    fn round_trip() {
        let id = ButtonId::new(3, 111_222_333_444, 555_666_777_888);
        let parsed: ButtonId = id.to_string().parse().expect("round trip");
        assert_eq!(parsed, id);
    }

    #[test]
    fn round_trip_zero_fields() {
        let id = ButtonId::new(0, 0, 0);
        assert_eq!(id.to_string().parse::<ButtonId>(), Ok(id));
    }

    #[test]
    fn rejects_wrong_prefix() {
        assert_eq!(
            "other:1:2:3".parse::<ButtonId>(),
            Err(ParseError::Shape)
        );
    }

    #[test]
    fn rejects_missing_fields() {
        assert_eq!("pick:1:2".parse::<ButtonId>(), Err(ParseError::Shape));
        assert_eq!("pick".parse::<ButtonId>(), Err(ParseError::Shape));
    }

    #[test]
    fn rejects_extra_fields() {
        assert_eq!("pick:1:2:3:4".parse::<ButtonId>(), Err(ParseError::Shape));
    }

    #[test]
    fn rejects_non_numeric_fields() {
        assert_eq!(
            "pick:one:2:3".parse::<ButtonId>(),
            Err(ParseError::Field("one".to_owned()))
        );
    }
}
