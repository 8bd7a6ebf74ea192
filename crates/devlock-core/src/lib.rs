//! devlock Core - Lock state, authentication types, and lock policy
//!
//! This crate provides the foundational types shared by the devlock daemon
//! and its clients, along with the pure policy engine that decides which
//! lock state the device must be in.

pub mod environment;
pub mod error;
pub mod policy;
pub mod signal;
pub mod types;

pub use environment::{EnvSignal, EnvironmentSnapshot};
pub use error::{Error, ErrorKind, Result};
pub use policy::{AutomaticLocking, RelockWindow, WAKEUP_SLACK_SECS};
pub use signal::{AuthSignal, InputSignal, PropertyChange, Signal};
pub use types::{
    AuthPurpose, AuthStatus, AuthenticationError, AuthenticationToken, BiometricEvent, Challenge,
    ClientId, Feedback, LockState, Methods,
};

/// Protocol version reported to clients
pub const PROTOCOL_VERSION: u32 = 1;

/// Default minimum lock code length
pub const DEFAULT_MIN_CODE_LENGTH: u32 = 5;

/// Default maximum lock code length
pub const DEFAULT_MAX_CODE_LENGTH: u32 = 42;

/// Default number of authentication attempts before lockout
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Seconds an authentication token stays redeemable
pub const TOKEN_VALIDITY_SECS: i64 = 60;
