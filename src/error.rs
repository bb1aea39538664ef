use thiserror::Error;

use crate::protocol::VersionRange;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Service is not supported: current version is {current}, required version is {required}")]
    VersionMismatch { current: i64, required: VersionRange },

    #[error("Client is not supported by the service")]
    UnsupportedByClient,

    #[error("Service version {negotiated} rejected a request requiring {required}")]
    UnsupportedByService {
        negotiated: i64,
        required: VersionRange,
    },

    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    #[error("Failed to dispatch request: {0}")]
    DispatchFailed(String),

    #[error("Remote invocation failed: {0}")]
    RemoteInvocation(String),

    /// Error reported by the handler stream on the other side.
    #[error("{0}")]
    Remote(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Permission denied while binding to {0}")]
    PermissionDenied(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Remote call failed: {0}")]
    CallFailed(String),
}

pub type Result<T> = std::result::Result<T, RpcError>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl RpcError {
    /// Maps a failed bind onto the client-facing taxonomy.
    pub(crate) fn from_bind(err: TransportError) -> Self {
        match err {
            TransportError::PeerNotFound(peer) => RpcError::PeerNotFound(peer),
            other => RpcError::Transport(other),
        }
    }
}
