//! Wire-level vocabulary shared by both sides of a connection.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Returned by a request call for any failure without a dedicated code.
pub const REQUEST_ERROR_GENERIC: i64 = -1;
/// Returned by a request call when the matching handler does not accept the
/// caller's client version.
pub const REQUEST_ERROR_CLIENT_NOT_SUPPORTED: i64 = -2;
/// Returned by the handshake when the service refuses the client.
pub const HANDSHAKE_REJECTED: i64 = -1;
/// Peer version of a connection that has not completed a handshake.
pub const NO_VERSION: i64 = -1;

/// Server-assigned identifier correlating a request with its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub i64);

impl RequestId {
    pub fn raw(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CallbackState {
    Next = 0,
    Error = 1,
    Complete = 2,
}

impl CallbackState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CallbackState::Next)
    }
}

/// Inclusive range of protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: i64,
    pub max: i64,
}

impl VersionRange {
    pub const ANY: VersionRange = VersionRange {
        min: 0,
        max: i64::MAX,
    };

    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn at_least(min: i64) -> Self {
        Self { min, max: i64::MAX }
    }

    pub fn contains(&self, version: i64) -> bool {
        self.min <= version && version <= self.max
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::ANY
    }
}

impl std::fmt::Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} to {}", self.min, self.max)
    }
}

/// Everything a request call carries besides the session token.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub payload: Bytes,
    pub request_type: String,
    pub result_type: String,
    /// `None` lets the service pick the first compatible handler.
    pub method: Option<String>,
    /// Service versions the caller is willing to talk to.
    pub service_versions: VersionRange,
}
