//! A single in-flight authentication attempt

use std::fmt;

use devlock_core::{AuthPurpose, AuthStatus, Challenge, ClientId, Error, Feedback, Methods};

/// Monotonic session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Authentication session owned by one client
#[derive(Debug, Clone)]
pub struct AuthenticationSession {
    pub id: SessionId,
    pub client: ClientId,
    pub purpose: AuthPurpose,
    pub challenge: Challenge,
    /// Methods the client asked for
    pub requested: Methods,
    /// Requested methods that are available
    pub utilized: Methods,
    attempts_remaining: Option<u32>,
    status: AuthStatus,
    /// A lock code is being verified off-loop
    code_pending: bool,
}

impl AuthenticationSession {
    pub fn new(
        id: SessionId,
        client: ClientId,
        purpose: AuthPurpose,
        challenge: Challenge,
        requested: Methods,
        utilized: Methods,
        attempts_remaining: Option<u32>,
    ) -> Self {
        Self {
            id,
            client,
            purpose,
            challenge,
            requested,
            utilized,
            attempts_remaining,
            status: AuthStatus::Authenticating,
            code_pending: false,
        }
    }

    /// None when attempts are unlimited
    pub fn attempts_remaining(&self) -> Option<u32> {
        self.attempts_remaining
    }

    pub fn status(&self) -> AuthStatus {
        self.status
    }

    pub fn is_code_pending(&self) -> bool {
        self.code_pending
    }

    pub fn is_locked_out(&self) -> bool {
        self.attempts_remaining == Some(0)
    }

    /// Prompt shown when the session starts
    pub fn initial_feedback(&self) -> Feedback {
        if self.utilized.contains(Methods::CODE) {
            Feedback::EnterSecurityCode
        } else {
            Feedback::PresentFinger
        }
    }

    /// Start evaluating a lock code
    pub fn begin_code_evaluation(&mut self) -> devlock_core::Result<()> {
        if !self.utilized.contains(Methods::CODE) {
            return Err(Error::MethodNotInUse("code".to_string()));
        }
        if self.code_pending {
            return Err(Error::Busy);
        }
        self.code_pending = true;
        self.status = AuthStatus::Evaluating;
        Ok(())
    }

    pub fn finish_code_evaluation(&mut self) {
        self.code_pending = false;
        self.status = AuthStatus::Authenticating;
    }

    pub fn set_evaluating(&mut self) {
        self.status = AuthStatus::Evaluating;
    }

    pub fn set_authenticating(&mut self) {
        self.status = AuthStatus::Authenticating;
    }

    /// Recompute remaining attempts from the persisted failure count
    ///
    /// The remaining count never increases while the session lives.
    pub fn apply_failure(&mut self, failed_attempts: u32, max_attempts: Option<u32>) -> Option<u32> {
        self.attempts_remaining = match max_attempts {
            Some(max) => {
                let remaining = max.saturating_sub(failed_attempts);
                Some(match self.attempts_remaining {
                    Some(previous) => previous.saturating_sub(1).min(remaining),
                    None => remaining,
                })
            }
            None => None,
        };
        self.attempts_remaining
    }
}
