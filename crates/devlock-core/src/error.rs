//! Error types for devlock

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned synchronously by lock and authentication operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Another client is already authenticating")]
    Busy,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("No requested authentication method is available")]
    NoUsableMethod,

    #[error("Authentication is locked out")]
    LockedOut,

    #[error("No authentication in progress")]
    NotAuthenticating,

    #[error("Authentication method not in use: {0}")]
    MethodNotInUse(String),

    #[error("Invalid lock code: {0}")]
    InvalidCode(String),

    #[error("Invalid lock state value: {0}")]
    InvalidLockState(u32),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Lock state failed to settle after {passes} passes")]
    SettleDiverged { passes: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-readable error category carried over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Busy,
    AccessDenied,
    SoftwareError,
    LockedOut,
    InvalidState,
    InvalidArgument,
    NotSupported,
    Internal,
}

impl Error {
    /// Create an access denied error
    pub fn access_denied(reason: impl Into<String>) -> Self {
        Error::AccessDenied(reason.into())
    }

    /// Wire category for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Busy => ErrorKind::Busy,
            Error::AccessDenied(_) => ErrorKind::AccessDenied,
            Error::NoUsableMethod => ErrorKind::SoftwareError,
            Error::LockedOut => ErrorKind::LockedOut,
            Error::NotAuthenticating | Error::MethodNotInUse(_) => ErrorKind::InvalidState,
            Error::InvalidCode(_) | Error::InvalidLockState(_) | Error::InvalidArgument(_) => {
                ErrorKind::InvalidArgument
            }
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::SettleDiverged { .. } | Error::Internal(_) => ErrorKind::Internal,
        }
    }
}
