//! Client side: connection lifecycle and the public request API.
//!
//! A [`StreamClient`] connects lazily. The first request starts a bind,
//! requests issued while the bind is in progress wait in order, and once the
//! handshake succeeds they are dispatched ahead of anything issued later.
//! When the client has nothing in flight it applies its [`IdlePolicy`].

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{Codec, JsonCodec, Payload};
use crate::error::{Result, RpcError, TransportError, TransportResult};
use crate::protocol::{CallbackState, HANDSHAKE_REJECTED, NO_VERSION, RequestId, VersionRange};
use crate::stream::{self, ResponseStream};
use crate::transport::{ClientCallback, ConnectionEvents, Connector, ServiceInterface};

pub mod multiplexer;

use self::multiplexer::{PendingRequest, RequestKey, RequestTable};

/// What to do once no request is pending or in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdlePolicy {
    /// Disconnect as soon as the last request ends.
    #[default]
    Immediate,
    /// Stay connected until [`StreamClient::disconnect`] is called.
    Never,
    /// Disconnect after the client stayed idle for the given time.
    After(Duration),
}

impl IdlePolicy {
    /// Zero means [`IdlePolicy::Immediate`], a negative value means
    /// [`IdlePolicy::Never`].
    pub fn from_millis(timeout_ms: i64) -> Self {
        match timeout_ms {
            0 => IdlePolicy::Immediate,
            ms if ms < 0 => IdlePolicy::Never,
            ms => IdlePolicy::After(Duration::from_millis(ms.unsigned_abs())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Version announced to the service during the handshake.
    pub version: i64,
    pub idle: IdlePolicy,
    /// Opaque string passed along with the handshake.
    pub options: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: 0,
            idle: IdlePolicy::Immediate,
            options: String::new(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn with_idle(mut self, idle: IdlePolicy) -> Self {
        self.idle = idle;
        self
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }
}

/// Per-request settings.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Handler name to target. `None` picks the first handler whose types match.
    pub method: Option<String>,
    /// Service versions this request can be served by.
    pub service_versions: VersionRange,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_service_versions(mut self, range: VersionRange) -> Self {
        self.service_versions = range;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

struct ConnectionState {
    /// Session token; rotated on every teardown so late notifications from an
    /// old connection can be told apart.
    token: String,
    phase: ConnectionPhase,
    deferred_disconnect: bool,
    peer_version: i64,
    service: Option<Arc<dyn ServiceInterface>>,
    pending: VecDeque<PendingRequest>,
    requests: RequestTable,
    idle_timer: Option<JoinHandle<()>>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            token: new_token(),
            phase: ConnectionPhase::Disconnected,
            deferred_disconnect: false,
            peer_version: NO_VERSION,
            service: None,
            pending: VecDeque::new(),
            requests: RequestTable::new(),
            idle_timer: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.requests.is_empty()
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    /// Returns to [`ConnectionPhase::Disconnected`] and fails everything
    /// still waiting on this connection.
    fn teardown(&mut self) {
        let old_token = std::mem::replace(&mut self.token, new_token());
        info!(
            token = %old_token,
            pending = self.pending.len(),
            active = self.requests.len(),
            "connection closed"
        );

        self.phase = ConnectionPhase::Disconnected;
        self.deferred_disconnect = false;
        self.peer_version = NO_VERSION;
        self.service = None;
        self.cancel_idle_timer();

        for request in self.pending.drain(..) {
            if !request.sink.is_closed() {
                request.sink.error(RpcError::ConnectionLost);
            }
        }
        self.requests.fail_all(RpcError::ConnectionLost);
    }
}

fn new_token() -> String {
    Uuid::new_v4().to_string()
}

struct ClientInner<C: Codec> {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    codec: C,
    next_key: AtomicU64,
    state: Mutex<ConnectionState>,
}

/// Issues streaming requests to one named service.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use rxipc::{ClientConfig, LocalHub, StreamClient};
/// # async fn demo(hub: LocalHub) -> rxipc::Result<()> {
/// let client = StreamClient::new(ClientConfig::default(), Arc::new(hub.connector("counter")));
/// let mut values = client.request::<u32, u32>(&3).await?;
/// while let Some(value) = values.recv().await {
///     println!("{}", value?);
/// }
/// # Ok(())
/// # }
/// ```
pub struct StreamClient<C: Codec = JsonCodec> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Codec> Clone for StreamClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl StreamClient<JsonCodec> {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_codec(config, connector, JsonCodec)
    }
}

impl<C: Codec> StreamClient<C> {
    pub fn with_codec(config: ClientConfig, connector: Arc<dyn Connector>, codec: C) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                codec,
                next_key: AtomicU64::new(1),
                state: Mutex::new(ConnectionState::new()),
            }),
        }
    }

    pub async fn request<Req, Resp>(&self, request: &Req) -> Result<ResponseStream<Resp, C>>
    where
        Req: Payload,
        Resp: Payload,
    {
        self.request_with(request, RequestOptions::default()).await
    }

    /// Starts a request. Only encoding failures are returned here; every
    /// later failure arrives on the returned stream.
    pub async fn request_with<Req, Resp>(
        &self,
        request: &Req,
        options: RequestOptions,
    ) -> Result<ResponseStream<Resp, C>>
    where
        Req: Payload,
        Resp: Payload,
    {
        let payload = Bytes::from(self.inner.codec.encode(request)?);
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let (sink, watch, stream) = stream::request_channel::<Resp, C>(self.inner.codec.clone());

        self.inner
            .issue(PendingRequest {
                key,
                payload,
                request_type: Req::TYPE_NAME,
                result_type: Resp::TYPE_NAME,
                method: options.method,
                service_versions: options.service_versions,
                sink,
            })
            .await;

        let client = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if !watch.canceled().await {
                return;
            }
            if let Some(inner) = client.upgrade() {
                inner.on_canceled(key).await;
            }
        });

        Ok(stream)
    }

    /// Ends the connection. Pending and in-flight requests fail with
    /// [`RpcError::ConnectionLost`]. While a connection attempt is in
    /// progress the disconnect is applied once it completes, unless a new
    /// request arrives first.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        self.inner.disconnect_locked(&mut state).await;
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.inner.state.lock().await.phase
    }

    /// Version reported by the service, or [`NO_VERSION`] when not connected.
    pub async fn peer_version(&self) -> i64 {
        self.inner.state.lock().await.peer_version
    }

    pub async fn session_token(&self) -> String {
        self.inner.state.lock().await.token.clone()
    }

    pub async fn active_requests(&self) -> usize {
        self.inner.state.lock().await.requests.len()
    }

    pub async fn pending_requests(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }
}

impl<C: Codec> std::fmt::Debug for StreamClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("StreamClient");
        out.field("peer", &self.inner.connector.peer_name())
            .field("config", &self.inner.config);
        if let Ok(state) = self.inner.state.try_lock() {
            out.field("phase", &state.phase)
                .field("pending", &state.pending.len())
                .field("active", &state.requests.len());
        }
        out.finish()
    }
}

impl<C: Codec> ClientInner<C> {
    async fn issue(self: &Arc<Self>, request: PendingRequest) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.cancel_idle_timer();
        state.deferred_disconnect = false;

        match state.phase {
            ConnectionPhase::Connected => match state.service.clone() {
                Some(service) => {
                    state
                        .requests
                        .dispatch(service.as_ref(), &state.token, state.peer_version, request)
                        .await;
                }
                None => request.sink.error(RpcError::ConnectionLost),
            },
            ConnectionPhase::Connecting => {
                debug!(key = request.key, "queueing request until connected");
                state.pending.push_back(request);
            }
            ConnectionPhase::Disconnected => {
                state.pending.push_back(request);
                self.connect(state).await;
            }
        }

        self.check_idle(state).await;
    }

    async fn connect(self: &Arc<Self>, state: &mut ConnectionState) {
        let peer = self.connector.peer_name();
        state.phase = ConnectionPhase::Connecting;
        info!(peer, token = %state.token, "connecting");

        let result = if !self.connector.peer_exists().await {
            Err(RpcError::PeerNotFound(peer.to_string()))
        } else {
            let events = Arc::new(ConnectionObserver {
                client: Arc::downgrade(self),
                token: state.token.clone(),
            });
            self.connector
                .bind(events)
                .await
                .map_err(RpcError::from_bind)
        };

        if let Err(error) = result {
            warn!(peer, %error, pending = state.pending.len(), "connection failed");
            state.phase = ConnectionPhase::Disconnected;
            state.deferred_disconnect = false;
            for request in state.pending.drain(..) {
                if !request.sink.is_closed() {
                    request.sink.error(error.clone());
                }
            }
        }
    }

    async fn on_connected(self: &Arc<Self>, token: &str, service: Arc<dyn ServiceInterface>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.phase != ConnectionPhase::Connecting || state.token != token {
            debug!(token, "ignoring stale connected notification");
            return;
        }

        state.phase = ConnectionPhase::Connected;
        state.service = Some(service.clone());

        if state.deferred_disconnect {
            info!(token, "applying deferred disconnect");
            self.disconnect_locked(state).await;
            return;
        }

        let callback = Arc::new(CallbackReceiver {
            client: Arc::downgrade(self),
            token: token.to_string(),
        });
        let version = match service
            .register(token, self.config.version, &self.config.options, callback)
            .await
        {
            Ok(version) => version,
            Err(e) => {
                warn!(token, error = %e, "handshake call failed");
                HANDSHAKE_REJECTED
            }
        };
        if version < 0 {
            warn!(token, client_version = self.config.version, "handshake rejected");
            self.disconnect_locked(state).await;
            return;
        }

        state.peer_version = version;
        info!(
            token,
            peer_version = version,
            pending = state.pending.len(),
            "connected"
        );

        while let Some(request) = state.pending.pop_front() {
            if !request.service_versions.contains(version) {
                let error = RpcError::VersionMismatch {
                    current: version,
                    required: request.service_versions,
                };
                warn!(token, key = request.key, %error, "not dispatching queued request");
                request.sink.error(error);
                continue;
            }
            state
                .requests
                .dispatch(service.as_ref(), &state.token, version, request)
                .await;
        }

        self.check_idle(state).await;
    }

    async fn on_peer_disconnected(&self, token: &str) {
        let mut state = self.state.lock().await;
        if state.token != token || state.phase == ConnectionPhase::Disconnected {
            debug!(token, "ignoring stale disconnected notification");
            return;
        }
        warn!(token, peer = self.connector.peer_name(), "peer disconnected");
        self.connector.unbind().await;
        state.teardown();
    }

    async fn on_callback(
        self: &Arc<Self>,
        token: &str,
        request_id: RequestId,
        callback_state: CallbackState,
        payload: Option<Bytes>,
    ) -> TransportResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.token != token {
            warn!(token, %request_id, "refusing callback for an old session");
            return Err(TransportError::NotConnected);
        }
        if state.requests.on_callback(request_id, callback_state, payload) {
            self.check_idle(state).await;
        }
        Ok(())
    }

    async fn on_canceled(self: &Arc<Self>, key: RequestKey) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if let Some(position) = state.pending.iter().position(|r| r.key == key) {
            state.pending.remove(position);
            debug!(key, "dropped queued request");
        } else {
            let service = state.service.clone();
            if !state
                .requests
                .cancel(key, service.as_deref(), &state.token)
                .await
            {
                return;
            }
        }

        self.check_idle(state).await;
    }

    async fn check_idle(self: &Arc<Self>, state: &mut ConnectionState) {
        if state.phase == ConnectionPhase::Disconnected || !state.is_idle() {
            return;
        }

        match self.config.idle {
            IdlePolicy::Never => {}
            IdlePolicy::Immediate => {
                debug!(token = %state.token, "idle, disconnecting");
                self.disconnect_locked(state).await;
            }
            IdlePolicy::After(delay) => {
                state.cancel_idle_timer();
                debug!(token = %state.token, ?delay, "idle, scheduling disconnect");
                let client = Arc::downgrade(self);
                let token = state.token.clone();
                state.idle_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = client.upgrade() {
                        inner.on_idle_timeout(&token).await;
                    }
                }));
            }
        }
    }

    async fn on_idle_timeout(&self, token: &str) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.token != token {
            return;
        }
        // This task is the timer; drop the handle instead of aborting it.
        state.idle_timer.take();
        if !state.is_idle() {
            return;
        }
        info!(token, "idle timeout reached");
        self.disconnect_locked(state).await;
    }

    async fn disconnect_locked(&self, state: &mut ConnectionState) {
        match state.phase {
            ConnectionPhase::Disconnected => {
                debug!("disconnect: already disconnected");
                return;
            }
            ConnectionPhase::Connecting => {
                debug!(token = %state.token, "disconnect deferred until connected");
                state.deferred_disconnect = true;
                return;
            }
            ConnectionPhase::Connected => {}
        }

        let registered = state.peer_version != NO_VERSION;
        if let Some(service) = state.service.as_ref().filter(|_| registered) {
            match service.unregister(&state.token).await {
                Ok(true) => {}
                Ok(false) => debug!(token = %state.token, "service did not know this client"),
                Err(e) => debug!(token = %state.token, error = %e, "unregister failed"),
            }
        }
        self.connector.unbind().await;
        state.teardown();
    }
}

/// Connection notifications for one session token.
#[derive(Debug)]
struct ConnectionObserver<C: Codec> {
    client: Weak<ClientInner<C>>,
    token: String,
}

#[async_trait]
impl<C: Codec> ConnectionEvents for ConnectionObserver<C> {
    async fn on_connected(&self, service: Arc<dyn ServiceInterface>) {
        if let Some(inner) = self.client.upgrade() {
            inner.on_connected(&self.token, service).await;
        }
    }

    async fn on_disconnected(&self) {
        if let Some(inner) = self.client.upgrade() {
            inner.on_peer_disconnected(&self.token).await;
        }
    }
}

/// Callback endpoint handed to the service during the handshake.
#[derive(Debug)]
struct CallbackReceiver<C: Codec> {
    client: Weak<ClientInner<C>>,
    token: String,
}

#[async_trait]
impl<C: Codec> ClientCallback for CallbackReceiver<C> {
    async fn on_callback(
        &self,
        request_id: RequestId,
        state: CallbackState,
        payload: Option<Bytes>,
    ) -> TransportResult<()> {
        let Some(inner) = self.client.upgrade() else {
            return Err(TransportError::NotConnected);
        };
        inner
            .on_callback(&self.token, request_id, state, payload)
            .await
    }
}
