//! Device lock state machine
//!
//! Owns the canonical lock state and the relock timer. Every input change
//! goes through the policy engine and is settled to a fixed point before the
//! call returns.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use devlock_core::policy::{initial_state, needs_timer, required_state};
use devlock_core::{AutomaticLocking, EnvironmentSnapshot, Error, LockState, RelockWindow};

use crate::timer::{Clock, RelockTimer, WakeWindow};

/// Maximum policy evaluations per input change
pub const MAX_SETTLE_PASSES: usize = 4;

/// Notifications emitted by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLockEvent {
    StateChanged(LockState),
    EnabledChanged(bool),
    UnlockingChanged(bool),
    TimerArmed(WakeWindow),
    TimerStopped,
}

/// Entry point for unlocking after a successful authentication
pub trait UnlockTarget {
    fn unlock_authenticated(&mut self) -> devlock_core::Result<()>;
}

/// Device lock state machine
pub struct DeviceLock {
    state: LockState,
    /// Effective automatic locking policy
    locking: AutomaticLocking,
    env: EnvironmentSnapshot,
    timer: RelockTimer,
    clock: Arc<dyn Clock>,
    /// An unlock authentication is in progress
    unlocking: bool,
    event_tx: broadcast::Sender<DeviceLockEvent>,
}

impl DeviceLock {
    pub fn new(locking: AutomaticLocking, env: EnvironmentSnapshot, clock: Arc<dyn Clock>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            state: LockState::Undefined,
            locking,
            env,
            timer: RelockTimer::new(),
            clock,
            unlocking: false,
            event_tx,
        }
    }

    /// Subscribe to state machine events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceLockEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn locking(&self) -> AutomaticLocking {
        self.locking
    }

    pub fn environment(&self) -> EnvironmentSnapshot {
        self.env
    }

    /// Device locking is in use
    pub fn is_enabled(&self) -> bool {
        self.locking.is_enabled()
    }

    pub fn is_unlocking(&self) -> bool {
        self.unlocking
    }

    /// Pending relock window, if the timer is waiting
    pub fn timer_window(&self) -> Option<WakeWindow> {
        self.timer.window()
    }

    /// Decide the startup state; later calls do nothing
    pub fn initialize(&mut self) -> devlock_core::Result<()> {
        if self.state != LockState::Undefined {
            return Ok(());
        }

        let state = initial_state(self.locking);
        info!("Initial lock state: {} (automatic locking {})", state, self.locking);
        self.apply_state(state);
        self.settle()
    }

    pub fn on_environment_changed(&mut self, env: EnvironmentSnapshot) -> devlock_core::Result<()> {
        if env == self.env {
            return Ok(());
        }
        debug!("Environment changed: {:?}", env);
        self.env = env;
        self.settle()
    }

    pub fn on_automatic_locking_changed(
        &mut self,
        locking: AutomaticLocking,
    ) -> devlock_core::Result<()> {
        if locking == self.locking {
            return Ok(());
        }

        let was_enabled = self.is_enabled();
        info!("Automatic locking changed: {} -> {}", self.locking, locking);
        self.locking = locking;

        if was_enabled != self.is_enabled() {
            let _ = self
                .event_tx
                .send(DeviceLockEvent::EnabledChanged(self.is_enabled()));
        }

        // A waiting window is kept; settle stops it if no longer needed
        self.settle()
    }

    /// Guarded state change requested by a client
    ///
    /// Clients may only lock, and only while device locking is in use.
    pub fn request_state(&mut self, state: LockState) -> devlock_core::Result<()> {
        if !self.is_enabled() {
            warn!("Rejected lock state request: device lock not in use");
            return Err(Error::access_denied("Device lock not in use"));
        }
        if state != LockState::Locked {
            warn!("Rejected lock state request for {}", state);
            return Err(Error::access_denied(format!(
                "Cannot change lock state to {}",
                state
            )));
        }
        self.set_state(LockState::Locked)
    }

    pub fn set_unlocking(&mut self, unlocking: bool) {
        if self.unlocking != unlocking {
            self.unlocking = unlocking;
            let _ = self
                .event_tx
                .send(DeviceLockEvent::UnlockingChanged(unlocking));
        }
    }

    /// How long the caller may wait before calling [`poll_timer`](Self::poll_timer)
    pub fn next_poll(&self) -> Option<Duration> {
        self.timer.next_poll(self.clock.now())
    }

    /// Fire the relock timer if its window has opened
    pub fn poll_timer(&mut self) -> devlock_core::Result<bool> {
        if !self.timer.is_due(self.clock.now()) {
            return Ok(false);
        }
        self.on_timer_fired()?;
        Ok(true)
    }

    fn on_timer_fired(&mut self) -> devlock_core::Result<()> {
        info!("Relock timer fired");
        self.timer.fire();
        let result = self.set_state(LockState::Locked);

        if self.timer.is_running() {
            warn!("Relock timer still running after lock, stopping it");
            self.timer.stop();
            let _ = self.event_tx.send(DeviceLockEvent::TimerStopped);
        }

        result
    }

    fn set_state(&mut self, state: LockState) -> devlock_core::Result<()> {
        if state == self.state {
            return Ok(());
        }
        if state == LockState::Undefined {
            return Err(Error::Internal("cannot return to Undefined".to_string()));
        }
        self.apply_state(state);
        self.settle()
    }

    fn apply_state(&mut self, state: LockState) {
        if state == self.state {
            return;
        }
        info!("Lock state: {} -> {}", self.state, state);
        self.state = state;
        let _ = self.event_tx.send(DeviceLockEvent::StateChanged(state));
    }

    /// Re-evaluate the policy until the state stops moving
    fn settle(&mut self) -> devlock_core::Result<()> {
        for _ in 0..MAX_SETTLE_PASSES {
            let required = required_state(self.state, self.locking, &self.env);
            if required == self.state {
                self.sync_timer(self.clock.now());
                return Ok(());
            }
            self.apply_state(required);
        }

        error!(
            "Lock state failed to settle after {} passes, forcing Locked",
            MAX_SETTLE_PASSES
        );
        if self.timer.stop() {
            let _ = self.event_tx.send(DeviceLockEvent::TimerStopped);
        }
        self.apply_state(LockState::Locked);
        Err(Error::SettleDiverged {
            passes: MAX_SETTLE_PASSES,
        })
    }

    fn sync_timer(&mut self, now: DateTime<Utc>) {
        let window = RelockWindow::for_policy(self.locking);
        match window {
            Some(window) if needs_timer(self.state, self.locking, &self.env) => {
                if let Some(wake) = self.timer.arm(now, window) {
                    info!(
                        "Relock timer started: between {} and {}",
                        wake.earliest, wake.latest
                    );
                    let _ = self.event_tx.send(DeviceLockEvent::TimerArmed(wake));
                }
            }
            _ => {
                if self.timer.stop() {
                    info!("Relock timer stopped");
                    let _ = self.event_tx.send(DeviceLockEvent::TimerStopped);
                }
            }
        }
    }
}

impl UnlockTarget for DeviceLock {
    fn unlock_authenticated(&mut self) -> devlock_core::Result<()> {
        if self.state != LockState::Locked {
            debug!("Authenticated unlock while {}, nothing to do", self.state);
            return Ok(());
        }
        info!("Unlocking after successful authentication");
        self.set_state(LockState::Unlocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;

    fn idle() -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            display_on: false,
            call_active: false,
            input_lock_active: true,
            user_active: false,
        }
    }

    fn in_use() -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            display_on: true,
            call_active: false,
            input_lock_active: false,
            user_active: true,
        }
    }

    fn machine(locking: AutomaticLocking, env: EnvironmentSnapshot) -> (DeviceLock, ManualClock) {
        let clock = ManualClock::default();
        let mut lock = DeviceLock::new(locking, env, Arc::new(clock.clone()));
        lock.initialize().unwrap();
        (lock, clock)
    }

    fn drain(rx: &mut broadcast::Receiver<DeviceLockEvent>) -> Vec<DeviceLockEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_initial_state() {
        let (lock, _) = machine(AutomaticLocking::After(5), in_use());
        assert_eq!(lock.state(), LockState::Locked);

        let (lock, _) = machine(AutomaticLocking::Disabled, in_use());
        assert_eq!(lock.state(), LockState::Unlocked);
        assert!(!lock.is_enabled());
    }

    #[test]
    fn test_initialize_runs_once() {
        let (mut lock, _) = machine(AutomaticLocking::After(5), in_use());
        lock.unlock_authenticated().unwrap();
        lock.initialize().unwrap();
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    #[test]
    fn test_timer_relocks_after_window() {
        let (mut lock, clock) = machine(AutomaticLocking::After(5), in_use());
        let mut rx = lock.subscribe();

        lock.unlock_authenticated().unwrap();
        assert!(lock.timer_window().is_none());

        lock.on_environment_changed(idle()).unwrap();
        let window = lock.timer_window().unwrap();
        assert_eq!((window.earliest - clock.now()).num_seconds(), 300);
        assert_eq!((window.latest - window.earliest).num_seconds(), 12);

        clock.advance_secs(299);
        assert!(!lock.poll_timer().unwrap());

        clock.advance_secs(1);
        assert!(lock.poll_timer().unwrap());
        assert_eq!(lock.state(), LockState::Locked);
        assert!(lock.timer_window().is_none());

        let events = drain(&mut rx);
        assert_eq!(events[0], DeviceLockEvent::StateChanged(LockState::Unlocked));
        assert!(matches!(events[1], DeviceLockEvent::TimerArmed(_)));
        assert_eq!(events[2], DeviceLockEvent::StateChanged(LockState::Locked));
        assert_eq!(events[3], DeviceLockEvent::TimerStopped);
    }

    #[test]
    fn test_activity_stops_timer() {
        let (mut lock, _) = machine(AutomaticLocking::After(5), idle());
        lock.unlock_authenticated().unwrap();
        assert!(lock.timer_window().is_some());

        lock.on_environment_changed(in_use()).unwrap();
        assert!(lock.timer_window().is_none());
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    #[test]
    fn test_call_suppresses_timer() {
        let (mut lock, _) = machine(AutomaticLocking::After(5), idle());
        lock.on_environment_changed(EnvironmentSnapshot {
            call_active: true,
            ..idle()
        })
        .unwrap();
        lock.unlock_authenticated().unwrap();
        assert!(lock.timer_window().is_none());
    }

    #[test]
    fn test_immediate_locks_on_display_off() {
        let (mut lock, _) = machine(AutomaticLocking::Immediate, in_use());
        lock.unlock_authenticated().unwrap();
        assert_eq!(lock.state(), LockState::Unlocked);

        lock.on_environment_changed(idle()).unwrap();
        assert_eq!(lock.state(), LockState::Locked);
        assert!(lock.timer_window().is_none());
    }

    #[test]
    fn test_disabling_unlocks() {
        let (mut lock, _) = machine(AutomaticLocking::After(5), in_use());
        let mut rx = lock.subscribe();

        lock.on_automatic_locking_changed(AutomaticLocking::Disabled)
            .unwrap();
        assert_eq!(lock.state(), LockState::Unlocked);

        let events = drain(&mut rx);
        assert!(events.contains(&DeviceLockEvent::EnabledChanged(false)));
        assert!(events.contains(&DeviceLockEvent::StateChanged(LockState::Unlocked)));
    }

    #[test]
    fn test_policy_change_keeps_waiting_window() {
        let (mut lock, clock) = machine(AutomaticLocking::After(5), idle());
        lock.unlock_authenticated().unwrap();
        let window = lock.timer_window().unwrap();

        clock.advance_secs(60);
        lock.on_automatic_locking_changed(AutomaticLocking::After(10))
            .unwrap();
        assert_eq!(lock.timer_window(), Some(window));

        clock.advance_secs(240);
        assert!(lock.poll_timer().unwrap());
        assert_eq!(lock.state(), LockState::Locked);
    }

    #[test]
    fn test_policy_without_timeout_stops_timer() {
        let (mut lock, _) = machine(AutomaticLocking::After(5), idle());
        lock.unlock_authenticated().unwrap();
        let mut rx = lock.subscribe();

        lock.on_automatic_locking_changed(AutomaticLocking::Disabled)
            .unwrap();
        assert!(lock.timer_window().is_none());
        assert_eq!(
            drain(&mut rx),
            vec![
                DeviceLockEvent::EnabledChanged(false),
                DeviceLockEvent::TimerStopped
            ]
        );
    }

    #[test]
    fn test_guarded_set_state() {
        let (mut lock, _) = machine(AutomaticLocking::After(5), in_use());
        lock.unlock_authenticated().unwrap();

        assert!(matches!(
            lock.request_state(LockState::Unlocked),
            Err(Error::AccessDenied(_))
        ));
        lock.request_state(LockState::Locked).unwrap();
        assert_eq!(lock.state(), LockState::Locked);

        let (mut disabled, _) = machine(AutomaticLocking::Disabled, in_use());
        assert_eq!(
            disabled.request_state(LockState::Locked),
            Err(Error::access_denied("Device lock not in use"))
        );
        assert_eq!(disabled.state(), LockState::Unlocked);
    }

    #[test]
    fn test_unlocking_flag_broadcasts_once() {
        let (mut lock, _) = machine(AutomaticLocking::After(5), in_use());
        let mut rx = lock.subscribe();
        lock.set_unlocking(true);
        lock.set_unlocking(true);
        lock.set_unlocking(false);
        assert_eq!(
            drain(&mut rx),
            vec![
                DeviceLockEvent::UnlockingChanged(true),
                DeviceLockEvent::UnlockingChanged(false)
            ]
        );
    }
}
