//! Lock policy engine
//!
//! Pure functions deciding which lock state the device must be in and
//! whether the relock timer should be running. Nothing here performs I/O;
//! the daemon's state machine calls these after every input change.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::environment::EnvironmentSnapshot;
use crate::types::LockState;

/// Maximum extra delay tolerated when waking from suspend to relock
pub const WAKEUP_SLACK_SECS: u64 = 12;

/// Automatic locking configuration
///
/// Serialized as minutes: -1 disabled, 0 immediate, N>0 timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum AutomaticLocking {
    /// Device locking is not in use
    Disabled,
    /// Lock as soon as the display turns off
    Immediate,
    /// Relock this many minutes after becoming eligible
    After(u32),
}

impl AutomaticLocking {
    /// Minutes as the integer policy value
    pub fn minutes(self) -> i32 {
        match self {
            AutomaticLocking::Disabled => -1,
            AutomaticLocking::Immediate => 0,
            AutomaticLocking::After(minutes) => i32::try_from(minutes).unwrap_or(i32::MAX),
        }
    }

    /// Device locking is in use
    pub fn is_enabled(self) -> bool {
        self.minutes() >= 0
    }
}

impl Default for AutomaticLocking {
    fn default() -> Self {
        AutomaticLocking::After(5)
    }
}

impl From<i32> for AutomaticLocking {
    fn from(minutes: i32) -> Self {
        match minutes {
            m if m < 0 => AutomaticLocking::Disabled,
            0 => AutomaticLocking::Immediate,
            m => AutomaticLocking::After(m as u32),
        }
    }
}

impl From<AutomaticLocking> for i32 {
    fn from(locking: AutomaticLocking) -> Self {
        locking.minutes()
    }
}

impl fmt::Display for AutomaticLocking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomaticLocking::Disabled => f.write_str("disabled"),
            AutomaticLocking::Immediate => f.write_str("immediate"),
            AutomaticLocking::After(minutes) => write!(f, "{} min", minutes),
        }
    }
}

/// Relock timer window, in seconds from the moment the timer is armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelockWindow {
    pub earliest_secs: u64,
    pub latest_secs: u64,
}

impl RelockWindow {
    /// Window for a timeout policy, None when the policy has no timeout
    pub fn for_policy(locking: AutomaticLocking) -> Option<Self> {
        match locking.minutes() {
            m if m > 0 => {
                let earliest_secs = m as u64 * 60;
                Some(Self {
                    earliest_secs,
                    latest_secs: earliest_secs + WAKEUP_SLACK_SECS,
                })
            }
            _ => None,
        }
    }
}

/// State the device must be in at startup
pub fn initial_state(locking: AutomaticLocking) -> LockState {
    if locking.minutes() < 0 {
        LockState::Unlocked
    } else {
        LockState::Locked
    }
}

/// State the device must be in given the current inputs
///
/// An Undefined state is returned unchanged; the initial state is decided
/// by [`initial_state`].
pub fn required_state(
    current: LockState,
    locking: AutomaticLocking,
    env: &EnvironmentSnapshot,
) -> LockState {
    let minutes = locking.minutes();

    if current == LockState::Undefined {
        current
    } else if minutes < 0 {
        LockState::Unlocked
    } else if minutes == 0 && !env.display_on {
        LockState::Locked
    } else {
        current
    }
}

/// Whether the relock timer should be running
pub fn needs_timer(current: LockState, locking: AutomaticLocking, env: &EnvironmentSnapshot) -> bool {
    // Must be currently unlocked
    if current != LockState::Unlocked {
        return false;
    }

    // Must not be disabled or in lock-immediate mode
    if locking.minutes() <= 0 {
        return false;
    }

    if env.call_active {
        return false;
    }

    !env.in_active_use()
}
