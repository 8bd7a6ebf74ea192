//! Error types for the devlock daemon

use thiserror::Error;

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Errors that can occur in the daemon
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Lock or authentication error
    #[error(transparent)]
    Core(#[from] devlock_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IPC error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lock code store error
    #[error("Store error: {0}")]
    Store(String),

    /// Environment source error
    #[error("Environment source error: {0}")]
    Environment(String),

    /// The service loop has stopped
    #[error("Service is not running")]
    ServiceStopped,
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::Serialization(e.to_string())
    }
}

impl DaemonError {
    /// The core error, if this wraps one
    pub fn as_core(&self) -> Option<&devlock_core::Error> {
        match self {
            DaemonError::Core(e) => Some(e),
            _ => None,
        }
    }
}
