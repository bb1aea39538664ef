//! rxipc - streaming, cancelable requests between local processes
//!
//! A [`StreamService`] resolves typed requests to registered handlers and
//! forwards every value they produce back to the caller. A [`StreamClient`]
//! connects to a service on demand, multiplexes any number of requests over
//! one session and hands each caller a [`ResponseStream`]. Dropping the
//! stream cancels the request on the service side.
pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod transport;

pub use client::{ClientConfig, ConnectionPhase, IdlePolicy, RequestOptions, StreamClient};
pub use codec::{BincodeCodec, Codec, JsonCodec, Payload};
pub use error::{Result, RpcError, TransportError, TransportResult};
pub use protocol::{
    CallbackState, HANDSHAKE_REJECTED, NO_VERSION, REQUEST_ERROR_CLIENT_NOT_SUPPORTED,
    REQUEST_ERROR_GENERIC, RequestEnvelope, RequestId, VersionRange,
};
pub use server::resolver::{HandlerDescriptor, HandlerRegistry};
pub use server::{ServiceConfig, StreamService};
pub use stream::ResponseStream;
pub use transport::local::{LocalConnector, LocalHub};
pub use transport::{ClientCallback, ConnectionEvents, Connector, ServiceInterface};

#[cfg(feature = "codec-cbor")]
pub use codec::CborCodec;
#[cfg(feature = "codec-messagepack")]
pub use codec::MessagePackCodec;
#[cfg(feature = "codec-postcard")]
pub use codec::PostcardCodec;
