//! Asynchronous notifications pushed from the daemon to clients

use serde::{Deserialize, Serialize};

use crate::policy::AutomaticLocking;
use crate::types::{
    AuthStatus, AuthenticationError, AuthenticationToken, ClientId, Feedback, LockState, Methods,
};

/// Signals addressed to the client that owns the authentication session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum AuthSignal {
    /// The session was accepted
    AuthenticationStarted { methods: Methods, feedback: Feedback },
    /// Input is being verified
    AuthenticationEvaluating,
    /// Non-fatal guidance
    Feedback {
        feedback: Feedback,
        /// None when attempts are unlimited
        attempts_remaining: Option<u32>,
        methods: Methods,
    },
    /// The session succeeded
    Authenticated { token: AuthenticationToken },
    /// The session ended without success
    Error { error: AuthenticationError },
}

/// Mirrored authentication stream delivered to registered input observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum InputSignal {
    AuthenticationStarted {
        client: ClientId,
        methods: Methods,
        feedback: Feedback,
    },
    AuthenticationUnavailable {
        client: ClientId,
        error: AuthenticationError,
    },
    AuthenticationEvaluating,
    AuthenticationEnded {
        confirmed: bool,
    },
    Feedback {
        feedback: Feedback,
        attempts_remaining: Option<u32>,
        methods: Methods,
    },
    Error {
        error: AuthenticationError,
    },
    /// Mirror status changed
    Status { status: AuthStatus },
}

/// Change of a service property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "property", content = "value", rename_all = "snake_case")]
pub enum PropertyChange {
    State(LockState),
    Enabled(bool),
    Unlocking(bool),
    AutomaticLocking(AutomaticLocking),
    AvailableMethods(Methods),
    UtilizedMethods(Methods),
    Authenticating(bool),
    MinimumCodeLength(u32),
    MaximumCodeLength(u32),
    MaximumAttempts(Option<u32>),
    CodeInputIsKeyboard(bool),
    LockCodeSet(bool),
}

/// Any server-pushed notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "payload", rename_all = "snake_case")]
pub enum Signal {
    Auth(AuthSignal),
    Input(InputSignal),
    Property(PropertyChange),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_wire_format() {
        let signal = Signal::Auth(AuthSignal::Feedback {
            feedback: Feedback::IncorrectLockCode,
            attempts_remaining: Some(2),
            methods: Methods::CODE,
        });
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["channel"], "auth");
        assert_eq!(json["payload"]["signal"], "feedback");
        assert_eq!(json["payload"]["attempts_remaining"], 2);
        assert_eq!(json["payload"]["methods"], 1);

        let property = serde_json::to_value(Signal::Property(PropertyChange::State(
            LockState::Locked,
        )))
        .unwrap();
        assert_eq!(property["payload"]["property"], "state");
        assert_eq!(property["payload"]["value"], 2);
    }
}
