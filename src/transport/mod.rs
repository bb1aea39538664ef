//! Seams to the inter-process channel.
//!
//! A binding provides a [`Connector`] on the client side, hands the client a
//! [`ServiceInterface`] once connected, and carries [`ClientCallback`] calls
//! back from the service. [`local`] is an in-process binding.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::TransportResult;
use crate::protocol::{CallbackState, RequestEnvelope, RequestId};

pub mod local;

/// Establishes the connection to one named peer.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Identity of the peer this connector binds to.
    fn peer_name(&self) -> &str;

    /// Whether the peer can currently be located.
    async fn peer_exists(&self) -> bool;

    /// Start binding to the peer.
    ///
    /// Success only means the bind was accepted; `events` is told about the
    /// connection later. Implementations must not call `events` before this
    /// returns.
    async fn bind(&self, events: Arc<dyn ConnectionEvents>) -> TransportResult<()>;

    /// Release the binding. No disconnect notification follows.
    async fn unbind(&self);
}

/// Connection notifications delivered by a binding.
#[async_trait]
pub trait ConnectionEvents: Send + Sync + Debug {
    async fn on_connected(&self, service: Arc<dyn ServiceInterface>);

    /// The peer went away without the client asking for it.
    async fn on_disconnected(&self);
}

/// Client to service calls.
#[async_trait]
pub trait ServiceInterface: Send + Sync + Debug {
    /// Handshake. Returns the negotiated version, or a negative value when
    /// the client is refused.
    async fn register(
        &self,
        client_id: &str,
        version: i64,
        options: &str,
        callback: Arc<dyn ClientCallback>,
    ) -> TransportResult<i64>;

    /// Returns the new request id, or a negative error code.
    async fn request(&self, client_id: &str, request: RequestEnvelope) -> TransportResult<i64>;

    async fn dispose(&self, client_id: &str, request_id: RequestId) -> TransportResult<bool>;

    async fn unregister(&self, client_id: &str) -> TransportResult<bool>;
}

/// Service to client calls.
#[async_trait]
pub trait ClientCallback: Send + Sync + Debug {
    async fn on_callback(
        &self,
        request_id: RequestId,
        state: CallbackState,
        payload: Option<Bytes>,
    ) -> TransportResult<()>;
}
