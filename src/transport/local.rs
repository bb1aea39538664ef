//! In-process binding: services are published under a name on a
//! [`LocalHub`] and clients reach them through a [`LocalConnector`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::error::{TransportError, TransportResult};
use crate::protocol::{RequestEnvelope, RequestId};
use crate::transport::{ClientCallback, ConnectionEvents, Connector, ServiceInterface};

#[derive(Debug)]
struct LocalPeer {
    service: Arc<dyn ServiceInterface>,
    alive: Arc<AtomicBool>,
    restricted: bool,
    bindings: HashMap<u64, Arc<dyn ConnectionEvents>>,
}

#[derive(Debug, Default)]
struct HubState {
    peers: HashMap<String, LocalPeer>,
    next_binding: u64,
}

/// Directory of named in-process peers.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, name: impl Into<String>, service: Arc<dyn ServiceInterface>) {
        self.insert(name.into(), service, false).await;
    }

    /// Publishes a peer that refuses every bind with a permission error.
    pub async fn publish_restricted(
        &self,
        name: impl Into<String>,
        service: Arc<dyn ServiceInterface>,
    ) {
        self.insert(name.into(), service, true).await;
    }

    async fn insert(&self, name: String, service: Arc<dyn ServiceInterface>, restricted: bool) {
        self.shutdown_peer(&name).await;
        info!(peer = %name, restricted, "publishing local peer");
        self.state.lock().peers.insert(
            name,
            LocalPeer {
                service,
                alive: Arc::new(AtomicBool::new(true)),
                restricted,
                bindings: HashMap::new(),
            },
        );
    }

    /// Takes the peer away as if its process died: every bound client is
    /// told it was disconnected and later calls through old bindings fail.
    pub async fn shutdown_peer(&self, name: &str) -> bool {
        let peer = self.state.lock().peers.remove(name);
        let Some(peer) = peer else {
            return false;
        };

        info!(peer = %name, bindings = peer.bindings.len(), "shutting down local peer");
        peer.alive.store(false, Ordering::Release);
        for events in peer.bindings.into_values() {
            events.on_disconnected().await;
        }
        true
    }

    pub fn connector(&self, name: impl Into<String>) -> LocalConnector {
        LocalConnector {
            hub: self.clone(),
            peer: name.into(),
            binding: Mutex::new(None),
        }
    }

    pub fn binding_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .peers
            .get(name)
            .map_or(0, |peer| peer.bindings.len())
    }
}

#[derive(Debug)]
pub struct LocalConnector {
    hub: LocalHub,
    peer: String,
    binding: Mutex<Option<u64>>,
}

#[async_trait]
impl Connector for LocalConnector {
    fn peer_name(&self) -> &str {
        &self.peer
    }

    async fn peer_exists(&self) -> bool {
        self.hub.state.lock().peers.contains_key(&self.peer)
    }

    async fn bind(&self, events: Arc<dyn ConnectionEvents>) -> TransportResult<()> {
        let proxy = {
            let mut state = self.hub.state.lock();
            let HubState {
                peers,
                next_binding,
            } = &mut *state;

            let peer = peers
                .get_mut(&self.peer)
                .ok_or_else(|| TransportError::PeerNotFound(self.peer.clone()))?;
            if peer.restricted {
                return Err(TransportError::PermissionDenied(self.peer.clone()));
            }

            *next_binding += 1;
            peer.bindings.insert(*next_binding, events.clone());
            *self.binding.lock() = Some(*next_binding);

            LocalServiceProxy {
                service: peer.service.clone(),
                alive: peer.alive.clone(),
            }
        };

        debug!(peer = %self.peer, "bound to local peer");
        tokio::spawn(async move {
            events.on_connected(Arc::new(proxy)).await;
        });
        Ok(())
    }

    async fn unbind(&self) {
        let Some(id) = self.binding.lock().take() else {
            return;
        };
        if let Some(peer) = self.hub.state.lock().peers.get_mut(&self.peer) {
            peer.bindings.remove(&id);
        }
        debug!(peer = %self.peer, "unbound from local peer");
    }
}

/// Service handle given to a bound client; fails once the peer is gone.
#[derive(Debug)]
struct LocalServiceProxy {
    service: Arc<dyn ServiceInterface>,
    alive: Arc<AtomicBool>,
}

impl LocalServiceProxy {
    fn ensure_alive(&self) -> TransportResult<()> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl ServiceInterface for LocalServiceProxy {
    async fn register(
        &self,
        client_id: &str,
        version: i64,
        options: &str,
        callback: Arc<dyn ClientCallback>,
    ) -> TransportResult<i64> {
        self.ensure_alive()?;
        self.service
            .register(client_id, version, options, callback)
            .await
    }

    async fn request(&self, client_id: &str, request: RequestEnvelope) -> TransportResult<i64> {
        self.ensure_alive()?;
        self.service.request(client_id, request).await
    }

    async fn dispose(&self, client_id: &str, request_id: RequestId) -> TransportResult<bool> {
        self.ensure_alive()?;
        self.service.dispose(client_id, request_id).await
    }

    async fn unregister(&self, client_id: &str) -> TransportResult<bool> {
        self.ensure_alive()?;
        self.service.unregister(client_id).await
    }
}
