//! Core lock and authentication types

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::error::Error;

/// Canonical security posture of the device
///
/// Serialized as its numeric value (Undefined=0, Unlocked=1, Locked=2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum LockState {
    /// Before the first policy evaluation
    #[default]
    Undefined,
    Unlocked,
    Locked,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Undefined => "Undefined",
            LockState::Unlocked => "Unlocked",
            LockState::Locked => "Locked",
        }
    }
}

impl From<LockState> for u32 {
    fn from(state: LockState) -> Self {
        match state {
            LockState::Undefined => 0,
            LockState::Unlocked => 1,
            LockState::Locked => 2,
        }
    }
}

impl TryFrom<u32> for LockState {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LockState::Undefined),
            1 => Ok(LockState::Unlocked),
            2 => Ok(LockState::Locked),
            other => Err(Error::InvalidLockState(other)),
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of authentication methods
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct Methods(u32);

impl Methods {
    pub const NONE: Methods = Methods(0x00);
    pub const CODE: Methods = Methods(0x01);
    pub const BIOMETRIC: Methods = Methods(0x02);
    pub const ALL: Methods = Methods(0x03);

    /// Build from raw bits, dropping unknown flags
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every method in `other` is also in `self`
    pub const fn contains(self, other: Methods) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersection(self, other: Methods) -> Self {
        Self(self.0 & other.0)
    }
}

impl From<u32> for Methods {
    fn from(bits: u32) -> Self {
        Self::from_bits_truncate(bits)
    }
}

impl From<Methods> for u32 {
    fn from(methods: Methods) -> Self {
        methods.0
    }
}

impl BitOr for Methods {
    type Output = Methods;

    fn bitor(self, rhs: Methods) -> Methods {
        Methods(self.0 | rhs.0)
    }
}

impl BitOrAssign for Methods {
    fn bitor_assign(&mut self, rhs: Methods) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Methods {
    type Output = Methods;

    fn bitand(self, rhs: Methods) -> Methods {
        self.intersection(rhs)
    }
}

impl fmt::Display for Methods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Methods::CODE), self.contains(Methods::BIOMETRIC)) {
            (false, false) => f.write_str("none"),
            (true, false) => f.write_str("code"),
            (false, true) => f.write_str("biometric"),
            (true, true) => f.write_str("code|biometric"),
        }
    }
}

/// Guidance given to the user while an authentication is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    EnterSecurityCode,
    PresentFinger,
    PartialPrint,
    PrintIsUnclear,
    SensorIsDirty,
    SwipeFaster,
    SwipeSlower,
    UnrecognizedFinger,
    IncorrectLockCode,
}

/// Terminal outcome of a failed authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationError {
    LockedOut,
    Canceled,
    SoftwareError,
}

impl fmt::Display for AuthenticationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthenticationError::LockedOut => f.write_str("locked out"),
            AuthenticationError::Canceled => f.write_str("canceled"),
            AuthenticationError::SoftwareError => f.write_str("software error"),
        }
    }
}

/// Authentication status as seen by input observers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    #[default]
    Idle,
    Authenticating,
    Evaluating,
    AuthenticationError,
}

/// What a session is authenticating for
///
/// Input observers register for one purpose and only see sessions of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPurpose {
    /// Generic authentication (settings, encryption setup)
    #[default]
    Authentication,
    /// Unlocking the device
    DeviceUnlock,
}

/// Identity of a connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Opaque challenge supplied by the requester, carried as hex on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge(pub Vec<u8>);

impl Challenge {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        Ok(Self(hex::decode(s)?))
    }
}

impl Serialize for Challenge {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Challenge {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Challenge::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Token handed to the requester after a successful authentication
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthenticationToken(pub String);

impl AuthenticationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short display format (first 8 characters)
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

/// Event reported by a biometric sensor driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BiometricEvent {
    /// Per-attempt guidance, never consumes an attempt
    Feedback { feedback: Feedback },
    /// The sensor has captured a sample and is matching it
    Evaluating,
    /// The sample matched an enrolled template
    Match,
    /// The sample was affirmatively rejected
    Mismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_state_numeric_wire_format() {
        assert_eq!(serde_json::to_string(&LockState::Locked).unwrap(), "2");
        let state: LockState = serde_json::from_str("1").unwrap();
        assert_eq!(state, LockState::Unlocked);
        assert!(serde_json::from_str::<LockState>("7").is_err());
    }

    #[test]
    fn test_methods_flags() {
        let both = Methods::CODE | Methods::BIOMETRIC;
        assert_eq!(both, Methods::ALL);
        assert!(both.contains(Methods::CODE));
        assert!(!Methods::CODE.contains(Methods::BIOMETRIC));
        assert_eq!(both & Methods::BIOMETRIC, Methods::BIOMETRIC);
        assert!((Methods::CODE & Methods::BIOMETRIC).is_empty());
        assert_eq!(Methods::from_bits_truncate(0xff), Methods::ALL);
        assert_eq!(both.to_string(), "code|biometric");
    }

    #[test]
    fn test_challenge_hex() {
        let challenge = Challenge::new(vec![0xde, 0xad]);
        let json = serde_json::to_string(&challenge).unwrap();
        assert_eq!(json, "\"dead\"");
        assert_eq!(Challenge::from_hex("0xdead").unwrap(), challenge);
    }

    #[test]
    fn test_biometric_event_wire_format() {
        let event: BiometricEvent =
            serde_json::from_str(r#"{"event":"feedback","feedback":"swipe_faster"}"#).unwrap();
        assert_eq!(
            event,
            BiometricEvent::Feedback {
                feedback: Feedback::SwipeFaster
            }
        );
    }
}
