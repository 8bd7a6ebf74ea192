//! Authentication: sessions, the broker that arbitrates them, and the input
//! mirror that exposes their progress to observers

pub mod broker;
pub mod input;
pub mod session;

pub use broker::{
    AuthenticationBroker, BrokerEvent, BrokerEventKind, PendingVerification, VerificationResult,
};
pub use input::{InputMirror, MirrorState};
pub use session::{AuthenticationSession, SessionId};
