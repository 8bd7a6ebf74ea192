//! Client for communicating with the devlock daemon

use std::path::PathBuf;
use tracing::debug;

use devlock_core::{
    AuthPurpose, AuthSignal, AuthenticationError, AuthenticationToken, BiometricEvent, Challenge,
    EnvSignal, ErrorKind, Feedback, LockState, Methods, Signal,
};
use devlock_daemon::ipc::{IpcClient, IpcRequest, IpcResponse, IpcSession};
use devlock_daemon::{DaemonConfig, ServiceProperties, SettingsUpdate};

/// Client for the devlock daemon
pub struct DevlockClient {
    inner: IpcClient,
}

/// Error type for client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Request failed ({kind:?}): {message}")]
    RequestFailed { kind: ErrorKind, message: String },

    #[error("Incorrect lock code{}", remaining_suffix(.attempts_remaining))]
    IncorrectCode { attempts_remaining: Option<u32> },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(AuthenticationError),

    #[error("Connection closed by daemon")]
    ConnectionClosed,

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Daemon error: {0}")]
    DaemonError(String),
}

fn remaining_suffix(attempts_remaining: &Option<u32>) -> String {
    match attempts_remaining {
        Some(n) => format!(", {} attempts remaining", n),
        None => String::new(),
    }
}

impl ClientError {
    fn from_daemon_error(e: devlock_daemon::DaemonError) -> Self {
        match &e {
            devlock_daemon::DaemonError::Ipc(msg) if msg.contains("not running") => {
                ClientError::DaemonNotRunning
            }
            _ => ClientError::DaemonError(e.to_string()),
        }
    }

    fn from_response(response: IpcResponse) -> Self {
        match response {
            IpcResponse::Error { kind, message } => ClientError::RequestFailed { kind, message },
            other => ClientError::UnexpectedResponse(format!("{:?}", other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Daemon identity reported by ping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonInfo {
    pub version: String,
    pub protocol: u32,
}

fn expect_ok(response: IpcResponse) -> Result<()> {
    match response {
        IpcResponse::Ok => Ok(()),
        other => Err(ClientError::from_response(other)),
    }
}

impl DevlockClient {
    /// Create a new client with the default socket path
    pub fn new() -> Self {
        Self::with_socket_path(DaemonConfig::default_ipc_path())
    }

    /// Create a new client with a custom socket path
    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            inner: IpcClient::new(socket_path),
        }
    }

    async fn request(&self, request: &IpcRequest) -> Result<IpcResponse> {
        self.inner
            .request(request)
            .await
            .map_err(ClientError::from_daemon_error)
    }

    /// Open a persistent session with its own client identity
    pub async fn session(&self) -> Result<ClientSession> {
        let inner = self
            .inner
            .session()
            .await
            .map_err(ClientError::from_daemon_error)?;
        Ok(ClientSession { inner })
    }

    /// Check if the daemon is running
    pub async fn ping(&self) -> Result<DaemonInfo> {
        match self.request(&IpcRequest::Ping).await? {
            IpcResponse::Pong { version, protocol } => Ok(DaemonInfo { version, protocol }),
            other => Err(ClientError::from_response(other)),
        }
    }

    /// Get all service properties
    pub async fn properties(&self) -> Result<ServiceProperties> {
        match self.request(&IpcRequest::GetProperties).await? {
            IpcResponse::Properties { properties } => Ok(properties),
            other => Err(ClientError::from_response(other)),
        }
    }

    /// Lock the device now
    pub async fn lock(&self) -> Result<()> {
        expect_ok(
            self.request(&IpcRequest::SetState {
                state: LockState::Locked,
            })
            .await?,
        )
    }

    /// Unlock the device with a lock code
    ///
    /// Returns false if the device was not locked.
    pub async fn unlock(&self, code: &str) -> Result<bool> {
        let mut session = self.session().await?;
        if session.properties().await?.state != LockState::Locked {
            return Ok(false);
        }

        session.call(&IpcRequest::Unlock).await?;
        session.submit_code(code).await?;
        Ok(true)
    }

    /// Run a generic authentication with a lock code and return the token
    pub async fn authenticate(
        &self,
        challenge: Challenge,
        code: &str,
    ) -> Result<AuthenticationToken> {
        let mut session = self.session().await?;
        session.authenticate(challenge, code).await
    }

    /// Authenticate, then apply a settings change with the resulting token
    pub async fn update_settings(
        &self,
        challenge: Challenge,
        code: &str,
        settings: SettingsUpdate,
    ) -> Result<()> {
        // Tokens are bound to the connection that earned them
        let mut session = self.session().await?;
        let token = session.authenticate(challenge, code).await?;
        session
            .call(&IpcRequest::UpdateSettings {
                token: token.0,
                settings,
            })
            .await
    }

    /// Set or replace the lock code
    pub async fn change_lock_code(&self, current: Option<&str>, new: &str) -> Result<()> {
        expect_ok(
            self.request(&IpcRequest::ChangeLockCode {
                current: current.map(str::to_string),
                new: new.to_string(),
            })
            .await?,
        )
    }

    /// Remove the lock code
    pub async fn clear_lock_code(&self, current: &str) -> Result<()> {
        expect_ok(
            self.request(&IpcRequest::ClearLockCode {
                current: current.to_string(),
            })
            .await?,
        )
    }

    /// Report an environment signal (daemon must run in dev mode)
    pub async fn report_environment(&self, signal: EnvSignal, value: bool) -> Result<()> {
        expect_ok(
            self.request(&IpcRequest::ReportEnvironment { signal, value })
                .await?,
        )
    }

    /// Report a biometric event (daemon must run in dev mode)
    pub async fn report_biometric(&self, event: BiometricEvent) -> Result<()> {
        expect_ok(self.request(&IpcRequest::ReportBiometric { event }).await?)
    }
}

impl Default for DevlockClient {
    fn default() -> Self {
        Self::new()
    }
}

/// A persistent connection to the daemon
pub struct ClientSession {
    inner: IpcSession,
}

impl ClientSession {
    async fn request(&mut self, request: &IpcRequest) -> Result<IpcResponse> {
        self.inner
            .request(request)
            .await
            .map_err(ClientError::from_daemon_error)
    }

    /// Send a request expecting a plain Ok
    pub async fn call(&mut self, request: &IpcRequest) -> Result<()> {
        expect_ok(self.request(request).await?)
    }

    pub async fn properties(&mut self) -> Result<ServiceProperties> {
        match self.request(&IpcRequest::GetProperties).await? {
            IpcResponse::Properties { properties } => Ok(properties),
            other => Err(ClientError::from_response(other)),
        }
    }

    /// Register for mirrored authentication input
    pub async fn register_input(&mut self, purpose: AuthPurpose) -> Result<()> {
        match self.request(&IpcRequest::RegisterInput { purpose }).await? {
            IpcResponse::InputRegistered { status, .. } => {
                debug!("Registered for {:?} input, status {:?}", purpose, status);
                Ok(())
            }
            other => Err(ClientError::from_response(other)),
        }
    }

    /// Next signal, or None when the daemon closes the connection
    pub async fn next_signal(&mut self) -> Result<Option<Signal>> {
        self.inner
            .next_signal()
            .await
            .map_err(ClientError::from_daemon_error)
    }

    /// Start a generic authentication and answer it with `code`
    pub async fn authenticate(
        &mut self,
        challenge: Challenge,
        code: &str,
    ) -> Result<AuthenticationToken> {
        self.call(&IpcRequest::Authenticate {
            challenge,
            methods: Methods::CODE,
        })
        .await?;
        self.submit_code(code).await
    }

    /// Enter a code into this client's session and wait for the outcome
    ///
    /// A rejected code cancels the session so the next requester is not
    /// left waiting for this connection to close.
    pub async fn submit_code(&mut self, code: &str) -> Result<AuthenticationToken> {
        let result = self.enter_code(code).await;
        if matches!(result, Err(ClientError::IncorrectCode { .. })) {
            self.call(&IpcRequest::Cancel).await?;
        }
        result
    }

    async fn enter_code(&mut self, code: &str) -> Result<AuthenticationToken> {
        self.call(&IpcRequest::EnterLockCode {
            code: code.to_string(),
        })
        .await?;

        loop {
            let Some(signal) = self.next_signal().await? else {
                return Err(ClientError::ConnectionClosed);
            };

            match signal {
                Signal::Auth(AuthSignal::Authenticated { token }) => {
                    debug!("Authenticated, token {}", token.short());
                    return Ok(token);
                }
                Signal::Auth(AuthSignal::Feedback {
                    feedback: Feedback::IncorrectLockCode,
                    attempts_remaining,
                    ..
                }) => return Err(ClientError::IncorrectCode { attempts_remaining }),
                Signal::Auth(AuthSignal::Error { error }) => {
                    return Err(ClientError::AuthenticationFailed(error))
                }
                other => debug!("Ignoring signal {:?}", other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_response() {
        let error = ClientError::from_response(IpcResponse::Error {
            kind: ErrorKind::Busy,
            message: "Another client is already authenticating".to_string(),
        });
        assert!(matches!(
            error,
            ClientError::RequestFailed {
                kind: ErrorKind::Busy,
                ..
            }
        ));

        let error = ClientError::from_response(IpcResponse::Ok);
        assert!(matches!(error, ClientError::UnexpectedResponse(_)));
    }

    #[test]
    fn test_daemon_not_running() {
        let error = ClientError::from_daemon_error(devlock_daemon::DaemonError::Ipc(
            "Daemon not running".to_string(),
        ));
        assert!(matches!(error, ClientError::DaemonNotRunning));
    }

    #[test]
    fn test_incorrect_code_message() {
        let error = ClientError::IncorrectCode {
            attempts_remaining: Some(3),
        };
        assert_eq!(
            error.to_string(),
            "Incorrect lock code, 3 attempts remaining"
        );
        let error = ClientError::IncorrectCode {
            attempts_remaining: None,
        };
        assert_eq!(error.to_string(), "Incorrect lock code");
    }
}
