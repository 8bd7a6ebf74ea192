//! Authentication broker
//!
//! Arbitrates the single system-wide authentication session: accepts a
//! request from one client at a time, routes lock code and biometric input
//! to it, and reports progress back through broker events.

use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use devlock_core::{
    AuthPurpose, AuthenticationError, AuthenticationToken, BiometricEvent, Challenge, ClientId,
    Error, Feedback, Methods, TOKEN_VALIDITY_SECS,
};

use super::session::{AuthenticationSession, SessionId};
use crate::device_lock::UnlockTarget;
use crate::lockcode::{CodeVerdict, CodeVerifier};
use crate::settings::SettingsStore;
use crate::timer::Clock;

/// What happened to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEventKind {
    Started {
        methods: Methods,
        feedback: Feedback,
        attempts_remaining: Option<u32>,
    },
    /// The request was refused before a session existed
    Unavailable { error: AuthenticationError },
    Evaluating,
    Feedback {
        feedback: Feedback,
        attempts_remaining: Option<u32>,
        methods: Methods,
    },
    Authenticated { token: AuthenticationToken },
    Error { error: AuthenticationError },
    /// The session is gone
    Ended { confirmed: bool },
}

/// Broker notification, tagged with the session owner and purpose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEvent {
    pub client: ClientId,
    pub purpose: AuthPurpose,
    pub kind: BrokerEventKind,
}

/// What a pending verification checks
enum Check {
    LockCode(Zeroizing<String>),
    /// Count a rejected fingerprint against the attempt limit
    BiometricMismatch,
    /// Clear the attempt counter after a matched fingerprint
    BiometricMatch,
}

impl Check {
    fn method(&self) -> Methods {
        match self {
            Check::LockCode(_) => Methods::CODE,
            Check::BiometricMismatch | Check::BiometricMatch => Methods::BIOMETRIC,
        }
    }
}

/// Work against the lock code store, to be done off the service loop
pub struct PendingVerification {
    pub session: SessionId,
    verifier: Arc<dyn CodeVerifier>,
    check: Check,
}

impl PendingVerification {
    /// Run the check; it hashes and writes the store, so call from a blocking thread
    pub fn run(self) -> VerificationResult {
        let outcome = match &self.check {
            Check::LockCode(code) => self.verifier.verify(code),
            Check::BiometricMismatch => self
                .verifier
                .record_failure()
                .map(|failed_attempts| CodeVerdict::Rejected { failed_attempts }),
            Check::BiometricMatch => {
                if let Err(e) = self.verifier.reset_failures() {
                    warn!("Failed to reset attempt counter: {}", e);
                }
                Ok(CodeVerdict::Accepted)
            }
        };

        VerificationResult {
            session: self.session,
            method: self.check.method(),
            outcome: outcome.map_err(|e| e.to_string()),
        }
    }
}

/// Result of a verification, routed back to the broker
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub session: SessionId,
    /// Method the verdict belongs to
    pub method: Methods,
    pub outcome: std::result::Result<CodeVerdict, String>,
}

#[derive(Debug, Clone)]
struct IssuedToken {
    client: ClientId,
    expires: DateTime<Utc>,
}

/// Authentication broker
pub struct AuthenticationBroker {
    settings: Arc<SettingsStore>,
    verifier: Arc<dyn CodeVerifier>,
    clock: Arc<dyn Clock>,
    biometric_enabled: bool,
    session: Option<AuthenticationSession>,
    next_session: u64,
    tokens: HashMap<String, IssuedToken>,
    event_tx: broadcast::Sender<BrokerEvent>,
}

impl AuthenticationBroker {
    pub fn new(
        settings: Arc<SettingsStore>,
        verifier: Arc<dyn CodeVerifier>,
        clock: Arc<dyn Clock>,
        biometric_enabled: bool,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            settings,
            verifier,
            clock,
            biometric_enabled,
            session: None,
            next_session: 1,
            tokens: HashMap::new(),
            event_tx,
        }
    }

    /// Subscribe to broker events
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.event_tx.subscribe()
    }

    /// Methods that can currently be used
    pub fn available_methods(&self) -> Methods {
        if !self.verifier.is_set() {
            return Methods::NONE;
        }
        let mut methods = Methods::CODE;
        if self.biometric_enabled {
            methods |= Methods::BIOMETRIC;
        }
        methods
    }

    /// Methods in use by the current session
    pub fn utilized_methods(&self) -> Methods {
        self.session
            .as_ref()
            .map(|s| s.utilized)
            .unwrap_or(Methods::NONE)
    }

    pub fn is_authenticating(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&AuthenticationSession> {
        self.session.as_ref()
    }

    /// Start a session for `client`
    pub fn authenticate(
        &mut self,
        client: ClientId,
        purpose: AuthPurpose,
        challenge: Challenge,
        methods: Methods,
    ) -> devlock_core::Result<()> {
        if let Some(session) = &self.session {
            if session.client != client {
                debug!("{} refused: {} is authenticating", client, session.client);
                return Err(Error::Busy);
            }
            debug!("{} replaces its own {}", client, session.id);
            self.end_session(false);
        }

        let utilized = methods & self.available_methods();
        if utilized.is_empty() {
            warn!(
                "{} requested {} but only {} is available",
                client,
                methods,
                self.available_methods()
            );
            self.emit(
                client,
                purpose,
                BrokerEventKind::Unavailable {
                    error: AuthenticationError::SoftwareError,
                },
            );
            return Err(Error::NoUsableMethod);
        }

        let max_attempts = self.settings.current().max_attempts();
        let failed = self.verifier.failed_attempts();
        let attempts_remaining = max_attempts.map(|max| max.saturating_sub(failed));
        if attempts_remaining == Some(0) {
            warn!("{} refused: locked out after {} failed attempts", client, failed);
            self.emit(
                client,
                purpose,
                BrokerEventKind::Unavailable {
                    error: AuthenticationError::LockedOut,
                },
            );
            return Err(Error::LockedOut);
        }

        let id = SessionId(self.next_session);
        self.next_session += 1;

        let session = AuthenticationSession::new(
            id,
            client,
            purpose,
            challenge,
            methods,
            utilized,
            attempts_remaining,
        );
        let feedback = session.initial_feedback();
        info!("{} started for {} ({:?}, {})", id, client, purpose, utilized);
        self.session = Some(session);

        self.emit(
            client,
            purpose,
            BrokerEventKind::Started {
                methods: utilized,
                feedback,
                attempts_remaining,
            },
        );
        Ok(())
    }

    /// Accept a lock code from the session owner
    ///
    /// The returned verification must be run and fed back through
    /// [`complete_verification`](Self::complete_verification).
    pub fn enter_code(
        &mut self,
        client: ClientId,
        code: Zeroizing<String>,
    ) -> devlock_core::Result<PendingVerification> {
        let session = self.owned_session(client)?;
        session.begin_code_evaluation()?;

        let (id, purpose) = (session.id, session.purpose);
        debug!("{} evaluating lock code", id);
        self.emit(client, purpose, BrokerEventKind::Evaluating);

        Ok(self.pending(id, Check::LockCode(code)))
    }

    fn pending(&self, session: SessionId, check: Check) -> PendingVerification {
        PendingVerification {
            session,
            verifier: self.verifier.clone(),
            check,
        }
    }

    /// Apply a finished verification
    pub fn complete_verification(
        &mut self,
        result: VerificationResult,
        unlock: &mut dyn UnlockTarget,
    ) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == result.session) else {
            debug!("Discarding verification result for stale {}", result.session);
            return;
        };

        let rejected = if result.method == Methods::CODE {
            session.finish_code_evaluation();
            Feedback::IncorrectLockCode
        } else {
            Feedback::UnrecognizedFinger
        };

        match result.outcome {
            Ok(CodeVerdict::Accepted) => self.succeed(unlock),
            Ok(CodeVerdict::Rejected { failed_attempts }) => {
                self.fail_attempt(failed_attempts, rejected)
            }
            Err(e) => {
                error!("Lock code verification failed: {}", e);
                self.abort(AuthenticationError::SoftwareError);
            }
        }
    }

    /// Route a biometric sensor event to the current session
    ///
    /// Events that touch the attempt counter return a verification to run
    /// off the loop and feed back through
    /// [`complete_verification`](Self::complete_verification).
    pub fn on_biometric(
        &mut self,
        event: BiometricEvent,
    ) -> devlock_core::Result<Option<PendingVerification>> {
        let session = self.session.as_mut().ok_or(Error::NotAuthenticating)?;
        if !session.utilized.contains(Methods::BIOMETRIC) {
            return Err(Error::MethodNotInUse("biometric".to_string()));
        }
        let (id, client, purpose) = (session.id, session.client, session.purpose);

        match event {
            BiometricEvent::Feedback { feedback } => {
                let kind = BrokerEventKind::Feedback {
                    feedback,
                    attempts_remaining: session.attempts_remaining(),
                    methods: session.utilized,
                };
                self.emit(client, purpose, kind);
                Ok(None)
            }
            BiometricEvent::Evaluating => {
                session.set_evaluating();
                self.emit(client, purpose, BrokerEventKind::Evaluating);
                Ok(None)
            }
            BiometricEvent::Mismatch => {
                session.set_authenticating();
                if self.settings.current().biometric_mismatch_consumes_attempt {
                    return Ok(Some(self.pending(id, Check::BiometricMismatch)));
                }
                let kind = BrokerEventKind::Feedback {
                    feedback: Feedback::UnrecognizedFinger,
                    attempts_remaining: session.attempts_remaining(),
                    methods: session.utilized,
                };
                self.emit(client, purpose, kind);
                Ok(None)
            }
            BiometricEvent::Match => Ok(Some(self.pending(id, Check::BiometricMatch))),
        }
    }

    /// Cancel the caller's session
    ///
    /// Cancelling with no session is a no-op; another client's session
    /// cannot be cancelled.
    pub fn cancel(&mut self, client: ClientId) -> devlock_core::Result<()> {
        match &self.session {
            None => Ok(()),
            Some(session) if session.client != client => {
                warn!("{} tried to cancel {} owned by {}", client, session.id, session.client);
                Err(Error::access_denied("Authentication owned by another client"))
            }
            Some(session) => {
                info!("{} canceled by its owner", session.id);
                self.abort(AuthenticationError::Canceled);
                Ok(())
            }
        }
    }

    /// Cancel a session of the given purpose regardless of owner
    pub fn cancel_purpose(&mut self, purpose: AuthPurpose) -> bool {
        match &self.session {
            Some(session) if session.purpose == purpose => {
                info!("{} canceled by lock state change", session.id);
                self.abort(AuthenticationError::Canceled);
                true
            }
            _ => false,
        }
    }

    /// The client's connection went away
    pub fn client_disconnected(&mut self, client: ClientId) {
        if self.session.as_ref().is_some_and(|s| s.client == client) {
            info!("{} disconnected during authentication", client);
            self.end_session(false);
        }
        self.tokens.retain(|_, issued| issued.client != client);
    }

    /// Consume a token issued to `client`
    pub fn redeem_token(&mut self, client: ClientId, token: &str) -> devlock_core::Result<()> {
        let now = self.clock.now();
        match self.tokens.remove(token) {
            Some(issued) if issued.client == client && now <= issued.expires => {
                debug!("{} redeemed an authentication token", client);
                Ok(())
            }
            Some(issued) if issued.client != client => {
                // Not theirs; put it back for the owner
                self.tokens.insert(token.to_string(), issued);
                Err(Error::access_denied("Invalid authentication token"))
            }
            _ => Err(Error::access_denied("Invalid authentication token")),
        }
    }

    fn owned_session(&mut self, client: ClientId) -> devlock_core::Result<&mut AuthenticationSession> {
        match self.session.as_mut() {
            None => Err(Error::NotAuthenticating),
            Some(session) if session.client != client => {
                Err(Error::access_denied("Authentication owned by another client"))
            }
            Some(session) => Ok(session),
        }
    }

    fn fail_attempt(&mut self, failed_attempts: u32, feedback: Feedback) {
        let max_attempts = self.settings.current().max_attempts();
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let remaining = session.apply_failure(failed_attempts, max_attempts);
        let (client, purpose, methods) = (session.client, session.purpose, session.utilized);
        if session.is_locked_out() {
            warn!("{} locked out", session.id);
            self.abort(AuthenticationError::LockedOut);
            return;
        }

        session.set_authenticating();
        self.emit(
            client,
            purpose,
            BrokerEventKind::Feedback {
                feedback,
                attempts_remaining: remaining,
                methods,
            },
        );
    }

    fn succeed(&mut self, unlock: &mut dyn UnlockTarget) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let (client, purpose) = (session.client, session.purpose);
        let challenge = session.challenge.clone();

        if purpose == AuthPurpose::DeviceUnlock {
            if let Err(e) = unlock.unlock_authenticated() {
                error!("Unlock after authentication failed: {}", e);
                self.abort(AuthenticationError::SoftwareError);
                return;
            }
        }

        let token = self.issue_token(client, &challenge);
        info!("{} authenticated ({})", client, token.short());
        self.emit(client, purpose, BrokerEventKind::Authenticated { token });
        self.end_session(true);
    }

    fn issue_token(&mut self, client: ClientId, challenge: &Challenge) -> AuthenticationToken {
        let now = self.clock.now();
        self.tokens.retain(|_, issued| issued.expires >= now);

        let mut nonce = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut nonce[..]);

        let mut hasher = Sha256::new();
        hasher.update(challenge.as_bytes());
        hasher.update(&nonce[..]);
        let token = hex::encode(hasher.finalize());

        self.tokens.insert(
            token.clone(),
            IssuedToken {
                client,
                expires: now + Duration::seconds(TOKEN_VALIDITY_SECS),
            },
        );
        AuthenticationToken::new(token)
    }

    /// End the session with an error
    fn abort(&mut self, error: AuthenticationError) {
        if let Some(session) = &self.session {
            let (client, purpose) = (session.client, session.purpose);
            self.emit(client, purpose, BrokerEventKind::Error { error });
            self.end_session(false);
        }
    }

    fn end_session(&mut self, confirmed: bool) {
        if let Some(session) = self.session.take() {
            debug!("{} ended", session.id);
            self.emit(
                session.client,
                session.purpose,
                BrokerEventKind::Ended { confirmed },
            );
        }
    }

    fn emit(&self, client: ClientId, purpose: AuthPurpose, kind: BrokerEventKind) {
        let _ = self.event_tx.send(BrokerEvent {
            client,
            purpose,
            kind,
        });
    }
}
