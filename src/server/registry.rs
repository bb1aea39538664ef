use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::protocol::RequestId;
use crate::transport::ClientCallback;

/// Stops the forwarding task of one request.
#[derive(Debug)]
pub(crate) struct CancelHandle {
    abort: AbortHandle,
    finished: Arc<AtomicBool>,
}

impl CancelHandle {
    /// `finished` is raised by the forwarder once it has sent a terminal
    /// callback, after which canceling is a no-op.
    pub(crate) fn new(abort: AbortHandle, finished: Arc<AtomicBool>) -> Self {
        Self { abort, finished }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.abort.is_finished()
    }

    fn cancel(self) {
        if !self.is_finished() {
            self.abort.abort();
        }
    }
}

#[derive(Debug)]
pub(crate) struct ClientRecord {
    pub(crate) version: i64,
    pub(crate) callback: Arc<dyn ClientCallback>,
    requests: HashMap<RequestId, CancelHandle>,
}

/// Registered clients and the requests each of them has in flight.
#[derive(Debug, Default)]
pub(crate) struct ClientRegistry {
    clients: HashMap<String, ClientRecord>,
    owners: HashMap<RequestId, String>,
}

impl ClientRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &mut self,
        client_id: &str,
        version: i64,
        callback: Arc<dyn ClientCallback>,
    ) -> bool {
        if self.clients.contains_key(client_id) {
            warn!(client_id, "register rejected: client already registered");
            return false;
        }
        self.clients.insert(
            client_id.to_string(),
            ClientRecord {
                version,
                callback,
                requests: HashMap::new(),
            },
        );
        true
    }

    pub(crate) fn unregister(&mut self, client_id: &str) -> bool {
        let Some(record) = self.clients.remove(client_id) else {
            return false;
        };
        debug!(client_id, requests = record.requests.len(), "unregistering client");
        for (request_id, handle) in record.requests {
            self.owners.remove(&request_id);
            handle.cancel();
        }
        true
    }

    pub(crate) fn add_request(
        &mut self,
        request_id: RequestId,
        client_id: &str,
        handle: CancelHandle,
    ) -> bool {
        if self.owners.contains_key(&request_id) {
            warn!(%request_id, "add_request rejected: request id already tracked");
            return false;
        }
        let Some(record) = self.clients.get_mut(client_id) else {
            warn!(%request_id, client_id, "add_request rejected: unknown client");
            return false;
        };
        record.requests.insert(request_id, handle);
        self.owners.insert(request_id, client_id.to_string());
        true
    }

    pub(crate) fn remove_request(&mut self, request_id: RequestId) -> bool {
        let Some(client_id) = self.owners.remove(&request_id) else {
            debug!(%request_id, "remove_request: request id not tracked");
            return false;
        };
        if let Some(handle) = self
            .clients
            .get_mut(&client_id)
            .and_then(|record| record.requests.remove(&request_id))
        {
            handle.cancel();
        }
        true
    }

    /// Cancels every request and forgets every client.
    pub(crate) fn clear(&mut self) {
        for (_, record) in self.clients.drain() {
            for (_, handle) in record.requests {
                handle.cancel();
            }
        }
        self.owners.clear();
    }

    pub(crate) fn client(&self, client_id: &str) -> Option<&ClientRecord> {
        self.clients.get(client_id)
    }

    pub(crate) fn owner_of(&self, request_id: RequestId) -> Option<&str> {
        self.owners.get(&request_id).map(String::as_str)
    }

    pub(crate) fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.owners.len()
    }

    pub(crate) fn requests_of(&self, client_id: &str) -> usize {
        self.clients
            .get(client_id)
            .map_or(0, |record| record.requests.len())
    }
}

impl Drop for ClientRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportResult;
    use crate::protocol::CallbackState;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::future::pending;
    use tokio::task::JoinHandle;

    #[derive(Debug)]
    struct NoopCallback;

    #[async_trait]
    impl ClientCallback for NoopCallback {
        async fn on_callback(
            &self,
            _request_id: RequestId,
            _state: CallbackState,
            _payload: Option<Bytes>,
        ) -> TransportResult<()> {
            Ok(())
        }
    }

    fn callback() -> Arc<dyn ClientCallback> {
        Arc::new(NoopCallback)
    }

    fn pending_task() -> (JoinHandle<()>, CancelHandle) {
        let task = tokio::spawn(pending::<()>());
        let handle = CancelHandle::new(task.abort_handle(), Arc::new(AtomicBool::new(false)));
        (task, handle)
    }

    #[tokio::test]
    async fn test_register_once_per_id() {
        let mut registry = ClientRegistry::new();
        assert!(registry.register("a", 1, callback()));
        assert!(!registry.register("a", 2, callback()));
        assert_eq!(registry.client("a").unwrap().version, 1);
        assert_eq!(registry.client_count(), 1);
    }

    #[tokio::test]
    async fn test_add_request_rules() {
        let mut registry = ClientRegistry::new();
        registry.register("a", 1, callback());
        registry.register("b", 1, callback());

        let (_t1, h1) = pending_task();
        let (_t2, h2) = pending_task();
        let (_t3, h3) = pending_task();

        assert!(registry.add_request(RequestId(1), "a", h1));
        assert!(!registry.add_request(RequestId(1), "b", h2));
        assert!(!registry.add_request(RequestId(2), "nobody", h3));

        assert_eq!(registry.owner_of(RequestId(1)), Some("a"));
        assert_eq!(registry.requests_of("b"), 0);
        assert_eq!(registry.request_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_request_cancels_once() {
        let mut registry = ClientRegistry::new();
        registry.register("a", 1, callback());
        let (task, handle) = pending_task();
        registry.add_request(RequestId(7), "a", handle);

        assert!(registry.remove_request(RequestId(7)));
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(!registry.remove_request(RequestId(7)));
        assert_eq!(registry.request_count(), 0);
        assert_eq!(registry.requests_of("a"), 0);
        assert_eq!(registry.client_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_finished_request_does_not_abort() {
        let mut registry = ClientRegistry::new();
        registry.register("a", 1, callback());

        let finished = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(pending::<()>());
        registry.add_request(
            RequestId(3),
            "a",
            CancelHandle::new(task.abort_handle(), finished.clone()),
        );

        finished.store(true, Ordering::Release);
        assert!(registry.remove_request(RequestId(3)));
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn test_unregister_cancels_only_that_client() {
        let mut registry = ClientRegistry::new();
        registry.register("a", 1, callback());
        registry.register("b", 1, callback());

        let (ta1, ha1) = pending_task();
        let (ta2, ha2) = pending_task();
        let (tb, hb) = pending_task();
        registry.add_request(RequestId(1), "a", ha1);
        registry.add_request(RequestId(2), "a", ha2);
        registry.add_request(RequestId(3), "b", hb);

        assert!(registry.unregister("a"));
        assert!(ta1.await.unwrap_err().is_cancelled());
        assert!(ta2.await.unwrap_err().is_cancelled());

        assert!(registry.owner_of(RequestId(1)).is_none());
        assert!(registry.owner_of(RequestId(2)).is_none());
        assert_eq!(registry.owner_of(RequestId(3)), Some("b"));
        assert!(!tb.is_finished());
        assert!(!registry.unregister("a"));
    }

    #[tokio::test]
    async fn test_clear_cancels_everything() {
        let mut registry = ClientRegistry::new();
        registry.register("a", 1, callback());
        registry.register("b", 1, callback());
        let (ta, ha) = pending_task();
        let (tb, hb) = pending_task();
        registry.add_request(RequestId(1), "a", ha);
        registry.add_request(RequestId(2), "b", hb);

        registry.clear();

        assert!(ta.await.unwrap_err().is_cancelled());
        assert!(tb.await.unwrap_err().is_cancelled());
        assert_eq!(registry.client_count(), 0);
        assert_eq!(registry.request_count(), 0);
    }
}
