//! Property-based tests for the lock policy engine
//!
//! These tests verify invariants that should hold for every combination of
//! lock state, automatic locking policy and environment.

use proptest::prelude::*;
use devlock_core::{
    policy::{needs_timer, required_state},
    AutomaticLocking, EnvironmentSnapshot, LockState, Methods, RelockWindow, WAKEUP_SLACK_SECS,
};

// ============================================
// Arbitrary Implementations
// ============================================

fn arb_lock_state() -> impl Strategy<Value = LockState> {
    prop_oneof![
        Just(LockState::Undefined),
        Just(LockState::Unlocked),
        Just(LockState::Locked),
    ]
}

fn arb_settled_state() -> impl Strategy<Value = LockState> {
    prop_oneof![Just(LockState::Unlocked), Just(LockState::Locked)]
}

fn arb_locking() -> impl Strategy<Value = AutomaticLocking> {
    (-3i32..=60).prop_map(AutomaticLocking::from)
}

fn arb_env() -> impl Strategy<Value = EnvironmentSnapshot> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(display_on, call_active, input_lock_active, user_active)| EnvironmentSnapshot {
            display_on,
            call_active,
            input_lock_active,
            user_active,
        },
    )
}

// ============================================
// Property Tests
// ============================================

proptest! {
    #[test]
    fn required_state_is_idempotent(
        state in arb_lock_state(),
        locking in arb_locking(),
        env in arb_env(),
    ) {
        // A second evaluation never moves again, so settling converges
        let once = required_state(state, locking, &env);
        let twice = required_state(once, locking, &env);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn undefined_is_never_produced_from_a_settled_state(
        state in arb_settled_state(),
        locking in arb_locking(),
        env in arb_env(),
    ) {
        prop_assert_ne!(required_state(state, locking, &env), LockState::Undefined);
    }

    #[test]
    fn disabled_policy_never_locks(
        state in arb_settled_state(),
        env in arb_env(),
    ) {
        prop_assert_eq!(
            required_state(state, AutomaticLocking::Disabled, &env),
            LockState::Unlocked
        );
    }

    #[test]
    fn timer_only_runs_while_unlocked_with_timeout(
        state in arb_lock_state(),
        locking in arb_locking(),
        env in arb_env(),
    ) {
        if needs_timer(state, locking, &env) {
            prop_assert_eq!(state, LockState::Unlocked);
            prop_assert!(locking.minutes() > 0);
            prop_assert!(!env.call_active);
            prop_assert!(!env.in_active_use());
        }
    }

    #[test]
    fn relock_window_has_fixed_slack(minutes in 1i32..=1440) {
        let window = RelockWindow::for_policy(AutomaticLocking::from(minutes)).unwrap();
        prop_assert_eq!(window.earliest_secs, minutes as u64 * 60);
        prop_assert_eq!(window.latest_secs - window.earliest_secs, WAKEUP_SLACK_SECS);
    }

    #[test]
    fn methods_intersection_is_subset(requested in 0u32..8, available in 0u32..8) {
        let requested = Methods::from_bits_truncate(requested);
        let available = Methods::from_bits_truncate(available);
        let utilized = requested & available;
        prop_assert!(requested.contains(utilized));
        prop_assert!(available.contains(utilized));
    }

    #[test]
    fn automatic_locking_minutes_roundtrip(minutes in -1i32..=100_000) {
        let locking = AutomaticLocking::from(minutes);
        prop_assert_eq!(locking.minutes(), minutes);
    }
}
