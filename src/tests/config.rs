#[cfg(test)]
mod config {
    use crate::config::{Config, Error};

    async fn write_and_load(contents: &str) -> Result<Config, Error> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, contents).await.expect("write");

        Config::load(&path).await
    }

    #[tokio::test]
    async fn minimal_config_gets_defaults() {
        let config = write_and_load(r#"{"discord_token": "t0k3n"}"#)
            .await
            .expect("load");

        assert_eq!(config.radio_url, "https://listen.moe/stream");
        assert_eq!(config.idle_timeout, 30);
        assert_eq!(config.uds_path.to_str(), Some("/tmp/downloader.sock"));
        assert_eq!(config.db_path.to_str(), Some("bot.db"));
    }

    #[tokio::test]
    async fn empty_token_is_fatal() {
        let result = write_and_load(r#"{"discord_token": "  "}"#).await;
        assert!(matches!(result, Err(Error::MissingToken)));

        let result = write_and_load("{}").await;
        assert!(matches!(result, Err(Error::MissingToken)));
    }

    #[tokio::test]
    async fn malformed_json_is_a_parse_error() {
        let result = write_and_load("{not json").await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn ids_parse_from_strings() {
        let config = write_and_load(
            r#"{"discord_token": "x", "default_guild_id": "123", "default_vc_id": "456"}"#,
        )
        .await
        .expect("load");

        assert_eq!(config.guild_id().expect("guild"), 123);
        assert_eq!(config.idle_channel_id().expect("channel"), 456);
    }

    #[tokio::test]
    async fn bad_id_is_rejected() {
        let config = write_and_load(
            r#"{"discord_token": "x", "default_guild_id": "not-a-number"}"#,
        )
        .await
        .expect("load");

        assert!(matches!(config.guild_id(), Err(Error::BadId(_))));
    }
}
