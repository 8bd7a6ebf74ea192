//! Suspend-tolerant relock timer
//!
//! Monotonic sleeps stop while the system is suspended, so the relock timer
//! is a window of wall-clock instants. The service loop re-checks the wall
//! clock at least every [`WAKEUP_SLACK_SECS`] seconds, which bounds how late
//! the device relocks after a resume.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use devlock_core::{RelockWindow, WAKEUP_SLACK_SECS};

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock advanced by hand, for tests and simulations
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move time forward, as a suspend or a long idle period would
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Absolute relock window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeWindow {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl WakeWindow {
    /// Window for a relock policy armed at `now`
    pub fn starting_at(now: DateTime<Utc>, window: RelockWindow) -> Self {
        Self {
            earliest: now + Duration::seconds(window.earliest_secs as i64),
            latest: now + Duration::seconds(window.latest_secs as i64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Stopped,
    Waiting(WakeWindow),
    /// Fired; the lock handler has not finished yet
    Running,
}

/// Relock timer owned by the device lock state machine
#[derive(Debug)]
pub struct RelockTimer {
    state: TimerState,
}

impl Default for RelockTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelockTimer {
    pub fn new() -> Self {
        Self {
            state: TimerState::Stopped,
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.state, TimerState::Waiting(_))
    }

    pub fn is_running(&self) -> bool {
        self.state == TimerState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state == TimerState::Stopped
    }

    /// Pending window, if waiting
    pub fn window(&self) -> Option<WakeWindow> {
        match self.state {
            TimerState::Waiting(window) => Some(window),
            _ => None,
        }
    }

    /// Start waiting unless already waiting
    ///
    /// Returns the new window, or None when the timer was already waiting.
    pub fn arm(&mut self, now: DateTime<Utc>, window: RelockWindow) -> Option<WakeWindow> {
        if self.is_waiting() {
            return None;
        }
        let wake = WakeWindow::starting_at(now, window);
        self.state = TimerState::Waiting(wake);
        Some(wake)
    }

    /// Stop the timer, returning whether it was active
    pub fn stop(&mut self) -> bool {
        let was_active = !self.is_stopped();
        self.state = TimerState::Stopped;
        was_active
    }

    /// The earliest relock instant has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, TimerState::Waiting(window) if now >= window.earliest)
    }

    /// Mark the timer as fired
    pub fn fire(&mut self) {
        self.state = TimerState::Running;
    }

    /// How long the service loop may sleep before checking again
    pub fn next_poll(&self, now: DateTime<Utc>) -> Option<StdDuration> {
        let window = self.window()?;
        let slack = StdDuration::from_secs(WAKEUP_SLACK_SECS);
        let until = (window.earliest - now).to_std().unwrap_or(StdDuration::ZERO);
        Some(until.min(slack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn five_minutes() -> RelockWindow {
        RelockWindow {
            earliest_secs: 300,
            latest_secs: 312,
        }
    }

    #[test]
    fn test_arm_only_when_not_waiting() {
        let clock = ManualClock::default();
        let mut timer = RelockTimer::new();

        let first = timer.arm(clock.now(), five_minutes()).unwrap();
        clock.advance_secs(30);
        assert!(timer.arm(clock.now(), five_minutes()).is_none());
        assert_eq!(timer.window(), Some(first));
    }

    #[test]
    fn test_due_after_earliest() {
        let clock = ManualClock::default();
        let mut timer = RelockTimer::new();
        timer.arm(clock.now(), five_minutes());

        clock.advance_secs(299);
        assert!(!timer.is_due(clock.now()));
        clock.advance_secs(1);
        assert!(timer.is_due(clock.now()));

        timer.fire();
        assert!(timer.is_running());
        assert!(!timer.is_due(clock.now()));
        assert!(timer.stop());
        assert!(!timer.stop());
    }

    #[test]
    fn test_poll_interval_is_bounded_by_slack() {
        let clock = ManualClock::default();
        let mut timer = RelockTimer::new();
        assert_eq!(timer.next_poll(clock.now()), None);

        timer.arm(clock.now(), five_minutes());
        assert_eq!(
            timer.next_poll(clock.now()),
            Some(StdDuration::from_secs(WAKEUP_SLACK_SECS))
        );

        clock.advance_secs(295);
        assert_eq!(timer.next_poll(clock.now()), Some(StdDuration::from_secs(5)));

        // Resumed from suspend well past the window
        clock.advance_secs(3600);
        assert_eq!(timer.next_poll(clock.now()), Some(StdDuration::ZERO));
    }
}
