//! IPC protocol types
//!
//! Newline-delimited JSON. Clients send [`IpcRequest`]s; the daemon sends
//! [`ServerFrame`]s, which are either the response to the oldest pending
//! request or an asynchronous signal.

use serde::{Deserialize, Serialize};

use devlock_core::{
    AuthPurpose, AuthStatus, BiometricEvent, Challenge, ClientId, EnvSignal, ErrorKind, LockState,
    Methods, Signal,
};

use crate::auth::MirrorState;
use crate::error::DaemonError;
use crate::service::ServiceProperties;
use crate::settings::SettingsUpdate;

/// IPC request types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcRequest {
    /// Check if daemon is running
    Ping,

    /// Get all service properties
    GetProperties,

    /// Start a generic authentication
    Authenticate {
        challenge: Challenge, // hex encoded
        methods: Methods,
    },

    /// Submit a lock code to the current session
    EnterLockCode { code: String },

    /// Cancel the caller's authentication
    Cancel,

    /// Start an unlock authentication
    Unlock,

    /// Request a lock state (only Locked is honored)
    SetState { state: LockState },

    /// Receive mirrored authentication signals
    RegisterInput {
        #[serde(default)]
        purpose: AuthPurpose,
    },

    UnregisterInput,

    SetInputActive { active: bool },

    /// Set or replace the lock code
    ChangeLockCode {
        #[serde(default)]
        current: Option<String>,
        new: String,
    },

    /// Remove the lock code
    ClearLockCode { current: String },

    /// Change settings using a token from a successful authentication
    UpdateSettings {
        token: String,
        settings: SettingsUpdate,
    },

    /// Report an environment signal (dev mode)
    ReportEnvironment { signal: EnvSignal, value: bool },

    /// Report a biometric sensor event (dev mode)
    ReportBiometric { event: BiometricEvent },
}

impl IpcRequest {
    /// Request name for logging; never includes codes or tokens
    pub fn name(&self) -> &'static str {
        match self {
            IpcRequest::Ping => "Ping",
            IpcRequest::GetProperties => "GetProperties",
            IpcRequest::Authenticate { .. } => "Authenticate",
            IpcRequest::EnterLockCode { .. } => "EnterLockCode",
            IpcRequest::Cancel => "Cancel",
            IpcRequest::Unlock => "Unlock",
            IpcRequest::SetState { .. } => "SetState",
            IpcRequest::RegisterInput { .. } => "RegisterInput",
            IpcRequest::UnregisterInput => "UnregisterInput",
            IpcRequest::SetInputActive { .. } => "SetInputActive",
            IpcRequest::ChangeLockCode { .. } => "ChangeLockCode",
            IpcRequest::ClearLockCode { .. } => "ClearLockCode",
            IpcRequest::UpdateSettings { .. } => "UpdateSettings",
            IpcRequest::ReportEnvironment { .. } => "ReportEnvironment",
            IpcRequest::ReportBiometric { .. } => "ReportBiometric",
        }
    }
}

/// IPC response types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcResponse {
    /// Success with no data
    Ok,

    /// Pong response
    Pong { version: String, protocol: u32 },

    /// Error response
    Error { kind: ErrorKind, message: String },

    /// Service properties
    Properties { properties: ServiceProperties },

    /// Input observer registered; carries the current mirror state
    InputRegistered {
        status: AuthStatus,
        utilized_methods: Methods,
        attempts_remaining: Option<u32>,
        authenticating: Option<ClientId>,
    },
}

impl IpcResponse {
    /// Error response for a failed request
    pub fn from_error(error: &DaemonError) -> Self {
        match error {
            DaemonError::Core(e) => IpcResponse::Error {
                kind: e.kind(),
                message: e.to_string(),
            },
            other => IpcResponse::Error {
                kind: ErrorKind::Internal,
                message: other.to_string(),
            },
        }
    }

    pub fn input_registered(state: MirrorState) -> Self {
        IpcResponse::InputRegistered {
            status: state.status,
            utilized_methods: state.utilized_methods,
            attempts_remaining: state.attempts_remaining,
            authenticating: state.authenticating,
        }
    }
}

/// Anything the daemon writes to a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum ServerFrame {
    Response(IpcResponse),
    Signal(Signal),
}
