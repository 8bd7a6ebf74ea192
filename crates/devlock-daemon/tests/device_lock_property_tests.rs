//! Property-based tests for the device lock state machine
//!
//! Random sequences of environment changes, policy changes, unlocks, lock
//! requests and clock advances are replayed against a real `DeviceLock`.

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use tokio::sync::broadcast;

use devlock_core::policy::needs_timer;
use devlock_core::{AutomaticLocking, EnvironmentSnapshot, LockState};
use devlock_daemon::device_lock::{DeviceLockEvent, UnlockTarget};
use devlock_daemon::{DeviceLock, ManualClock};

#[derive(Debug, Clone)]
enum Step {
    Environment(EnvironmentSnapshot),
    Policy(AutomaticLocking),
    Unlock,
    Lock,
    Advance(i64),
}

// ============================================
// Arbitrary Implementations
// ============================================

fn arb_locking() -> impl Strategy<Value = AutomaticLocking> {
    (-1i32..=10).prop_map(AutomaticLocking::from)
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

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => arb_env().prop_map(Step::Environment),
        1 => arb_locking().prop_map(Step::Policy),
        2 => Just(Step::Unlock),
        1 => Just(Step::Lock),
        3 => (0i64..=700).prop_map(Step::Advance),
    ]
}

fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn drain(rx: &mut broadcast::Receiver<DeviceLockEvent>, into: &mut Vec<DeviceLockEvent>) {
    while let Ok(event) = rx.try_recv() {
        into.push(event);
    }
}

fn timer_matches_policy(lock: &DeviceLock) -> bool {
    lock.timer_window().is_some()
        == needs_timer(lock.state(), lock.locking(), &lock.environment())
}

/// Replays `steps`, checking the timer after every step
///
/// Returns the final state and the full event trace.
fn replay(
    locking: AutomaticLocking,
    env: EnvironmentSnapshot,
    steps: &[Step],
) -> Result<(LockState, Vec<DeviceLockEvent>), TestCaseError> {
    let clock = ManualClock::new(start_time());
    let mut lock = DeviceLock::new(locking, env, Arc::new(clock.clone()));
    let mut rx = lock.subscribe();
    let mut trace = Vec::new();

    lock.initialize()
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert!(timer_matches_policy(&lock));
    drain(&mut rx, &mut trace);

    for step in steps {
        match step {
            Step::Environment(env) => lock
                .on_environment_changed(*env)
                .map_err(|e| TestCaseError::fail(e.to_string()))?,
            Step::Policy(locking) => lock
                .on_automatic_locking_changed(*locking)
                .map_err(|e| TestCaseError::fail(e.to_string()))?,
            Step::Unlock => lock
                .unlock_authenticated()
                .map_err(|e| TestCaseError::fail(e.to_string()))?,
            // Refused while locking is disabled
            Step::Lock => {
                let _ = lock.request_state(LockState::Locked);
            }
            Step::Advance(secs) => {
                clock.advance_secs(*secs);
                lock.poll_timer()
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
        }

        prop_assert_ne!(lock.state(), LockState::Undefined);
        prop_assert!(
            timer_matches_policy(&lock),
            "timer {:?} after {:?} in state {} with {} and {:?}",
            lock.timer_window(),
            step,
            lock.state(),
            lock.locking(),
            lock.environment()
        );
        drain(&mut rx, &mut trace);
    }

    Ok((lock.state(), trace))
}

// ============================================
// Property Tests
// ============================================

proptest! {
    #[test]
    fn timer_armed_iff_needed_after_every_step(
        locking in arb_locking(),
        env in arb_env(),
        steps in prop::collection::vec(arb_step(), 0..48),
    ) {
        replay(locking, env, &steps)?;
    }

    #[test]
    fn same_inputs_give_same_trace(
        locking in arb_locking(),
        env in arb_env(),
        steps in prop::collection::vec(arb_step(), 0..48),
    ) {
        let first = replay(locking, env, &steps)?;
        let second = replay(locking, env, &steps)?;
        prop_assert_eq!(first, second);
    }

    #[test]
    fn disabled_policy_never_locks(
        env in arb_env(),
        steps in prop::collection::vec(
            prop_oneof![
                arb_env().prop_map(Step::Environment),
                Just(Step::Lock),
                (0i64..=700).prop_map(Step::Advance),
            ],
            0..32,
        ),
    ) {
        let (state, trace) = replay(AutomaticLocking::Disabled, env, &steps)?;
        prop_assert_eq!(state, LockState::Unlocked);
        prop_assert!(!trace.contains(&DeviceLockEvent::StateChanged(LockState::Locked)));
    }
}
