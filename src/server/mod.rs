//! Service side: client registry, handler resolution and result forwarding.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::error::{RpcError, TransportResult};
use crate::protocol::{
    CallbackState, HANDSHAKE_REJECTED, REQUEST_ERROR_CLIENT_NOT_SUPPORTED, REQUEST_ERROR_GENERIC,
    RequestEnvelope, RequestId, VersionRange,
};
use crate::transport::{ClientCallback, ServiceInterface};

pub mod registry;
pub mod resolver;

use self::registry::{CancelHandle, ClientRegistry};
use self::resolver::{HandlerRegistry, HandlerStream, ResolutionCache, ResolutionKey};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Version reported to clients during the handshake.
    pub version: i64,
    /// Client versions allowed to register.
    pub client_versions: VersionRange,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            version: 0,
            client_versions: VersionRange::ANY,
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn with_client_versions(mut self, range: VersionRange) -> Self {
        self.client_versions = range;
        self
    }
}

struct ServiceState {
    clients: ClientRegistry,
    resolutions: ResolutionCache,
    last_request_id: i64,
}

struct ServiceInner<C: Codec> {
    config: ServiceConfig,
    handlers: HandlerRegistry<C>,
    codec: C,
    state: Mutex<ServiceState>,
}

/// Serves stream handlers to registered clients.
///
/// Cheap to clone; clones share the same registry. Every result is pushed
/// to the requesting client through its [`ClientCallback`]; a client whose
/// callback fails is evicted together with all of its requests.
pub struct StreamService<C: Codec = JsonCodec> {
    inner: Arc<ServiceInner<C>>,
}

impl<C: Codec> Clone for StreamService<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl StreamService<JsonCodec> {
    pub fn new(config: ServiceConfig, handlers: HandlerRegistry<JsonCodec>) -> Self {
        Self::with_codec(config, handlers, JsonCodec)
    }
}

impl<C: Codec> StreamService<C> {
    pub fn with_codec(config: ServiceConfig, handlers: HandlerRegistry<C>, codec: C) -> Self {
        info!(
            version = config.version,
            handlers = handlers.len(),
            "starting stream service"
        );
        Self {
            inner: Arc::new(ServiceInner {
                config,
                handlers,
                codec,
                state: Mutex::new(ServiceState {
                    clients: ClientRegistry::new(),
                    resolutions: ResolutionCache::new(),
                    last_request_id: 0,
                }),
            }),
        }
    }

    pub fn version(&self) -> i64 {
        self.inner.config.version
    }

    /// Handshake: returns the service version, or [`HANDSHAKE_REJECTED`].
    pub(crate) fn register_client(
        &self,
        client_id: &str,
        version: i64,
        options: &str,
        callback: Arc<dyn ClientCallback>,
    ) -> i64 {
        debug!(client_id, version, options, "register");
        if !self.inner.config.client_versions.contains(version) {
            warn!(
                client_id,
                version,
                accepted = %self.inner.config.client_versions,
                "register rejected: client version not accepted"
            );
            return HANDSHAKE_REJECTED;
        }
        if !self
            .inner
            .state
            .lock()
            .clients
            .register(client_id, version, callback)
        {
            return HANDSHAKE_REJECTED;
        }
        self.inner.config.version
    }

    /// Starts a request and returns its id, or a negative error code.
    ///
    /// The handler factory runs with the registry lock released. Must be
    /// called within a tokio runtime.
    pub(crate) fn start_request(&self, client_id: &str, request: RequestEnvelope) -> i64 {
        debug!(
            client_id,
            request_type = %request.request_type,
            result_type = %request.result_type,
            method = ?request.method,
            "request"
        );

        let RequestEnvelope {
            payload,
            request_type,
            result_type,
            method,
            service_versions,
        } = request;

        if !service_versions.contains(self.inner.config.version) {
            warn!(
                client_id,
                version = self.inner.config.version,
                required = %service_versions,
                "request rejected: service version outside requested range"
            );
            return REQUEST_ERROR_GENERIC;
        }

        let (index, callback) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;

            let Some(client) = state.clients.client(client_id) else {
                warn!(client_id, "request rejected: client not registered");
                return REQUEST_ERROR_GENERIC;
            };
            let (client_version, callback) = (client.version, client.callback.clone());

            let key = ResolutionKey {
                request_type,
                result_type,
                method,
                caller_version: client_version,
            };
            match state.resolutions.resolve(&self.inner.handlers, key) {
                Ok(index) => (index, callback),
                Err(RpcError::UnsupportedByClient) => {
                    warn!(client_id, client_version, "request rejected: client not supported");
                    return REQUEST_ERROR_CLIENT_NOT_SUPPORTED;
                }
                Err(e) => {
                    warn!(client_id, error = %e, "request rejected");
                    return REQUEST_ERROR_GENERIC;
                }
            }
        };

        let results = match self
            .inner
            .handlers
            .invoke(index, &self.inner.codec, &payload)
        {
            Ok(results) => results,
            Err(e) => {
                warn!(client_id, error = %e, "request rejected: handler invocation failed");
                return REQUEST_ERROR_GENERIC;
            }
        };

        let mut state = self.inner.state.lock();
        if state.clients.client(client_id).is_none() {
            debug!(client_id, "request dropped: client left while the handler started");
            return REQUEST_ERROR_GENERIC;
        }
        state.last_request_id += 1;
        let request_id = RequestId(state.last_request_id);

        // Registered before the lock is released, so the forwarder cannot
        // finish a request the registry has not seen yet.
        let finished = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(forward(
            Arc::downgrade(&self.inner),
            request_id,
            client_id.to_string(),
            callback,
            results,
            finished.clone(),
        ));
        state.clients.add_request(
            request_id,
            client_id,
            CancelHandle::new(task.abort_handle(), finished),
        );

        debug!(client_id, %request_id, "request started");
        request_id.raw()
    }

    /// Cancels a request owned by `client_id`. Unknown or finished ids are
    /// not an error for the caller and return false.
    pub(crate) fn dispose_request(&self, client_id: &str, request_id: RequestId) -> bool {
        let mut state = self.inner.state.lock();
        if state.clients.owner_of(request_id) != Some(client_id) {
            debug!(client_id, %request_id, "dispose ignored: request not owned by client");
            return false;
        }
        debug!(client_id, %request_id, "dispose");
        state.clients.remove_request(request_id)
    }

    pub(crate) fn unregister_client(&self, client_id: &str) -> bool {
        debug!(client_id, "unregister");
        self.inner.state.lock().clients.unregister(client_id)
    }

    /// Cancels every request and drops every client.
    pub fn shutdown(&self) {
        info!("stream service shutting down");
        self.inner.state.lock().clients.clear();
    }

    pub fn client_count(&self) -> usize {
        self.inner.state.lock().clients.client_count()
    }

    pub fn active_requests(&self) -> usize {
        self.inner.state.lock().clients.request_count()
    }

    pub fn requests_of(&self, client_id: &str) -> usize {
        self.inner.state.lock().clients.requests_of(client_id)
    }
}

/// Pushes every result of one request to its client.
async fn forward<C: Codec>(
    service: Weak<ServiceInner<C>>,
    request_id: RequestId,
    client_id: String,
    callback: Arc<dyn ClientCallback>,
    mut results: HandlerStream,
    finished: Arc<AtomicBool>,
) {
    while let Some(item) = results.next().await {
        match item {
            Ok(value) => {
                if let Err(e) = callback
                    .on_callback(request_id, CallbackState::Next, Some(value))
                    .await
                {
                    finished.store(true, Ordering::Release);
                    finish(&service, request_id, &client_id, Err(e));
                    return;
                }
            }
            Err(message) => {
                debug!(%client_id, %request_id, %message, "handler stream failed");
                finished.store(true, Ordering::Release);
                let delivered = callback
                    .on_callback(request_id, CallbackState::Error, Some(Bytes::from(message)))
                    .await;
                finish(&service, request_id, &client_id, delivered);
                return;
            }
        }
    }

    finished.store(true, Ordering::Release);
    let delivered = callback
        .on_callback(request_id, CallbackState::Complete, None)
        .await;
    finish(&service, request_id, &client_id, delivered);
}

fn finish<C: Codec>(
    service: &Weak<ServiceInner<C>>,
    request_id: RequestId,
    client_id: &str,
    delivered: TransportResult<()>,
) {
    let Some(inner) = service.upgrade() else {
        return;
    };
    let mut state = inner.state.lock();
    state.clients.remove_request(request_id);

    if let Err(e) = delivered {
        let error = RpcError::RemoteInvocation(e.to_string());
        warn!(client_id, %request_id, %error, "evicting unreachable client");
        state.clients.unregister(client_id);
    }
}

#[async_trait]
impl<C: Codec> ServiceInterface for StreamService<C> {
    async fn register(
        &self,
        client_id: &str,
        version: i64,
        options: &str,
        callback: Arc<dyn ClientCallback>,
    ) -> TransportResult<i64> {
        Ok(self.register_client(client_id, version, options, callback))
    }

    async fn request(&self, client_id: &str, request: RequestEnvelope) -> TransportResult<i64> {
        Ok(self.start_request(client_id, request))
    }

    async fn dispose(&self, client_id: &str, request_id: RequestId) -> TransportResult<bool> {
        Ok(self.dispose_request(client_id, request_id))
    }

    async fn unregister(&self, client_id: &str) -> TransportResult<bool> {
        Ok(self.unregister_client(client_id))
    }
}

impl<C: Codec> std::fmt::Debug for StreamService<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("StreamService")
            .field("version", &self.inner.config.version)
            .field("handlers", &self.inner.handlers.len())
            .field("clients", &state.clients.client_count())
            .field("active_requests", &state.clients.request_count())
            .finish()
    }
}
