//! Authentication input mirror
//!
//! Observers (typically the lock screen or a system PIN dialog) register for
//! one purpose and receive a mirrored view of sessions of that purpose. The
//! `active` flag gates delivery only; the mirror keeps tracking regardless.

use std::collections::HashMap;
use tracing::debug;

use devlock_core::{AuthPurpose, AuthStatus, ClientId, Error, InputSignal, Methods};

use super::broker::{BrokerEvent, BrokerEventKind};

/// Mirrored state of the sessions of one purpose
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorState {
    pub status: AuthStatus,
    pub utilized_methods: Methods,
    pub attempts_remaining: Option<u32>,
    /// Client owning the mirrored session
    pub authenticating: Option<ClientId>,
}

#[derive(Debug, Clone, Copy)]
struct Observer {
    purpose: AuthPurpose,
    active: bool,
}

/// Read model of broker state for input observers
#[derive(Debug, Default)]
pub struct InputMirror {
    observers: HashMap<ClientId, Observer>,
    states: HashMap<AuthPurpose, MirrorState>,
}

impl InputMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` as an observer; re-registering changes the purpose
    pub fn register(&mut self, client: ClientId, purpose: AuthPurpose) -> MirrorState {
        debug!("{} registered as {:?} input observer", client, purpose);
        self.observers.insert(
            client,
            Observer {
                purpose,
                active: true,
            },
        );
        self.state(purpose)
    }

    pub fn unregister(&mut self, client: ClientId) -> bool {
        self.observers.remove(&client).is_some()
    }

    pub fn set_active(&mut self, client: ClientId, active: bool) -> devlock_core::Result<()> {
        let observer = self
            .observers
            .get_mut(&client)
            .ok_or_else(|| Error::InvalidArgument("not registered for input".to_string()))?;
        observer.active = active;
        Ok(())
    }

    pub fn is_registered(&self, client: ClientId) -> bool {
        self.observers.contains_key(&client)
    }

    /// Current mirrored state for a purpose
    pub fn state(&self, purpose: AuthPurpose) -> MirrorState {
        self.states.get(&purpose).copied().unwrap_or_default()
    }

    /// Fold a broker event into the mirror
    ///
    /// Returns the signals to deliver, one entry per receiving observer.
    pub fn on_broker_event(&mut self, event: &BrokerEvent) -> Vec<(ClientId, InputSignal)> {
        let state = self.states.entry(event.purpose).or_default();
        let before = state.status;
        let mut signals = Vec::new();

        match &event.kind {
            BrokerEventKind::Started {
                methods,
                feedback,
                attempts_remaining,
            } => {
                state.status = AuthStatus::Authenticating;
                state.utilized_methods = *methods;
                state.attempts_remaining = *attempts_remaining;
                state.authenticating = Some(event.client);
                signals.push(InputSignal::AuthenticationStarted {
                    client: event.client,
                    methods: *methods,
                    feedback: *feedback,
                });
            }
            BrokerEventKind::Unavailable { error } => {
                signals.push(InputSignal::AuthenticationUnavailable {
                    client: event.client,
                    error: *error,
                });
            }
            BrokerEventKind::Evaluating => {
                state.status = AuthStatus::Evaluating;
                signals.push(InputSignal::AuthenticationEvaluating);
            }
            BrokerEventKind::Feedback {
                feedback,
                attempts_remaining,
                methods,
            } => {
                state.status = AuthStatus::Authenticating;
                state.attempts_remaining = *attempts_remaining;
                signals.push(InputSignal::Feedback {
                    feedback: *feedback,
                    attempts_remaining: *attempts_remaining,
                    methods: *methods,
                });
            }
            // Tokens go to the requester only
            BrokerEventKind::Authenticated { .. } => {}
            BrokerEventKind::Error { error } => {
                state.status = AuthStatus::AuthenticationError;
                signals.push(InputSignal::Error { error: *error });
            }
            BrokerEventKind::Ended { confirmed } => {
                *state = MirrorState::default();
                signals.push(InputSignal::AuthenticationEnded {
                    confirmed: *confirmed,
                });
            }
        }

        if state.status != before {
            signals.push(InputSignal::Status {
                status: state.status,
            });
        }

        let receivers: Vec<ClientId> = self
            .observers
            .iter()
            .filter(|(_, o)| o.active && o.purpose == event.purpose)
            .map(|(client, _)| *client)
            .collect();

        receivers
            .into_iter()
            .flat_map(|client| signals.iter().cloned().map(move |s| (client, s)))
            .collect()
    }
}
