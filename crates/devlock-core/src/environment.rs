//! Environmental signals that feed the lock policy

use serde::{Deserialize, Serialize};
use std::fmt;

/// Latest known environment, as reported by the system power service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// Display is on or dimmed
    pub display_on: bool,
    /// A call is active or ringing
    pub call_active: bool,
    /// Touchscreen/keypad lock is engaged
    pub input_lock_active: bool,
    /// The user is interacting with the device
    pub user_active: bool,
}

impl Default for EnvironmentSnapshot {
    fn default() -> Self {
        Self {
            display_on: true,
            call_active: false,
            input_lock_active: true,
            user_active: true,
        }
    }
}

impl EnvironmentSnapshot {
    /// Device is in active hands-on use
    pub fn in_active_use(&self) -> bool {
        self.display_on && !self.input_lock_active && self.user_active
    }
}

/// One boolean signal published by the environment source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvSignal {
    /// true when the display is on
    Display,
    /// true when a call is active or ringing
    Call,
    /// true when the touch/key lock is engaged
    InputLock,
    /// true when the user is inactive
    Inactivity,
}

impl EnvSignal {
    pub const ALL: [EnvSignal; 4] = [
        EnvSignal::Display,
        EnvSignal::Call,
        EnvSignal::InputLock,
        EnvSignal::Inactivity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EnvSignal::Display => "display",
            EnvSignal::Call => "call",
            EnvSignal::InputLock => "input_lock",
            EnvSignal::Inactivity => "inactivity",
        }
    }
}

impl fmt::Display for EnvSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for EnvSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "display" => Ok(EnvSignal::Display),
            "call" => Ok(EnvSignal::Call),
            "input_lock" | "input-lock" | "tklock" => Ok(EnvSignal::InputLock),
            "inactivity" | "inactive" => Ok(EnvSignal::Inactivity),
            _ => Err(format!(
                "Invalid signal: {}. Use: display, call, input-lock, inactivity",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot_is_not_in_active_use() {
        // Input lock starts engaged until the source reports otherwise
        assert!(!EnvironmentSnapshot::default().in_active_use());
    }

    #[test]
    fn test_signal_parsing() {
        assert_eq!("tklock".parse::<EnvSignal>().unwrap(), EnvSignal::InputLock);
        assert_eq!("Display".parse::<EnvSignal>().unwrap(), EnvSignal::Display);
        assert!("volume".parse::<EnvSignal>().is_err());
    }
}
