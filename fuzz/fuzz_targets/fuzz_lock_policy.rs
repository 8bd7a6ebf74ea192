#![no_main]

use arbitrary::Arbitrary;
use devlock_core::policy::{self, AutomaticLocking, RelockWindow};
use devlock_core::{EnvironmentSnapshot, LockState};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct PolicyInput {
    state: u32,
    minutes: i32,
    display_on: bool,
    call_active: bool,
    input_lock_active: bool,
    user_active: bool,
}

fuzz_target!(|input: PolicyInput| {
    let Ok(current) = LockState::try_from(input.state) else {
        return;
    };
    let locking = AutomaticLocking::from(input.minutes);
    let env = EnvironmentSnapshot {
        display_on: input.display_on,
        call_active: input.call_active,
        input_lock_active: input.input_lock_active,
        user_active: input.user_active,
    };

    let required = policy::required_state(current, locking, &env);
    if current != LockState::Undefined {
        assert_ne!(required, LockState::Undefined);
    }
    if locking.minutes() < 0 && current != LockState::Undefined {
        assert_eq!(required, LockState::Unlocked);
    }

    // A running timer always has a window to fire in
    if policy::needs_timer(current, locking, &env) {
        let window = RelockWindow::for_policy(locking).unwrap();
        assert!(window.earliest_secs <= window.latest_secs);
    }

    assert_ne!(policy::initial_state(locking), LockState::Undefined);
});
