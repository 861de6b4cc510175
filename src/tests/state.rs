#[cfg(test)]
mod state {
    use crate::state::{Mode, Op, State, MAX_VOLUME, MIN_VOLUME};

    fn store() -> State {
        State::new(0.05, "https://radio.example/stream".to_owned(), 42)
    }

    #[test]
    fn volume_in_range_is_stored() {
        let state = store();
        assert!(state.set_volume(0.03));
        assert!((state.volume() - 0.03).abs() < f32::EPSILON);
    }

    #[test]
    fn volume_out_of_range_is_rejected() {
        let state = store();
        let before = state.volume();

        assert!(!state.set_volume(0.5));
        assert!(!state.set_volume(0.0));
        assert!(!state.set_volume(-1.0));
        assert!((state.volume() - before).abs() < f32::EPSILON);
    }

    #[test]
    fn volume_bounds_are_inclusive() {
        let state = store();
        assert!(state.set_volume(MIN_VOLUME));
        assert!(state.set_volume(MAX_VOLUME));
    }

    #[test]
    fn bad_initial_volume_falls_back() {
        let state = State::new(3.0, String::new(), 0);
        let volume = state.volume();
        assert!((MIN_VOLUME..=MAX_VOLUME).contains(&volume));
    }

    #[test]
    fn op_flags_drive_operation_in_progress() {
        let state = store();
        assert!(!state.operation_in_progress());

        state.set_op(Op::Joining, true);
        assert!(state.operation_in_progress());

        state.set_op(Op::Joining, false);
        assert!(!state.operation_in_progress());
    }

    #[test]
    fn op_guard_clears_on_drop() {
        let state = store();
        {
            let _guard = state.op_guard(Op::Streaming);
            assert!(state.operation_in_progress());
        }
        assert!(!state.operation_in_progress());
    }

    #[test]
    fn shutdown_makes_flag_setters_noops() {
        let state = store();
        state.set_shutting_down();

        state.set_op(Op::Playing, true);
        assert!(!state.operation_in_progress());
    }

    #[test]
    fn shutdown_hides_stale_flags() {
        let state = store();
        state.set_op(Op::Playing, true);
        state.set_shutting_down();

        // Teardown must not be blocked by the flag set before shutdown.
        assert!(!state.operation_in_progress());
    }

    #[test]
    fn mode_swap_returns_previous() {
        let state = store();
        assert_eq!(state.set_mode(Mode::Dj), Mode::Idle);
        assert_eq!(state.set_mode(Mode::Radio), Mode::Dj);
        assert_eq!(state.mode(), Mode::Radio);
    }

    #[test]
    fn idle_channel_membership() {
        let state = store();
        assert!(!state.in_idle_channel());

        state.set_current_channel(Some(42));
        assert!(state.in_idle_channel());

        state.set_current_channel(Some(7));
        assert!(!state.in_idle_channel());
    }
}
