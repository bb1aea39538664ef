//! Correlates server-assigned request ids with local sinks.

use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::protocol::{
    CallbackState, REQUEST_ERROR_CLIENT_NOT_SUPPORTED, RequestEnvelope, RequestId, VersionRange,
};
use crate::stream::RequestSink;
use crate::transport::ServiceInterface;

/// Client-local identity of a request, known before the server assigns an id.
pub(crate) type RequestKey = u64;

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) key: RequestKey,
    pub(crate) payload: Bytes,
    pub(crate) request_type: &'static str,
    pub(crate) result_type: &'static str,
    pub(crate) method: Option<String>,
    pub(crate) service_versions: VersionRange,
    pub(crate) sink: RequestSink,
}

#[derive(Debug)]
struct ActiveRequest {
    key: RequestKey,
    result_type: &'static str,
    sink: RequestSink,
}

#[derive(Debug, Default)]
pub(crate) struct RequestTable {
    active: HashMap<RequestId, ActiveRequest>,
    by_key: HashMap<RequestKey, RequestId>,
}

impl RequestTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub(crate) fn contains(&self, request_id: RequestId) -> bool {
        self.active.contains_key(&request_id)
    }

    /// Sends `request` to the service and tracks it under the returned id.
    /// Every failure ends the request's sink.
    pub(crate) async fn dispatch(
        &mut self,
        service: &dyn ServiceInterface,
        token: &str,
        peer_version: i64,
        request: PendingRequest,
    ) {
        let PendingRequest {
            key,
            payload,
            request_type,
            result_type,
            method,
            service_versions,
            sink,
        } = request;

        if sink.is_closed() {
            debug!(token, key, "skipping dispatch: consumer already gone");
            return;
        }

        let envelope = RequestEnvelope {
            payload,
            request_type: request_type.to_string(),
            result_type: result_type.to_string(),
            method,
            service_versions,
        };
        let code = match service.request(token, envelope).await {
            Ok(code) => code,
            Err(e) => {
                warn!(token, key, error = %e, "request call failed");
                sink.error(RpcError::Transport(e));
                return;
            }
        };

        if code < 0 {
            let error = if code == REQUEST_ERROR_CLIENT_NOT_SUPPORTED {
                RpcError::UnsupportedByClient
            } else if !service_versions.contains(peer_version) {
                RpcError::UnsupportedByService {
                    negotiated: peer_version,
                    required: service_versions,
                }
            } else {
                RpcError::DispatchFailed(format!(
                    "service refused {} -> {} (code {})",
                    request_type, result_type, code
                ))
            };
            warn!(token, key, code, error = %error, "request refused");
            sink.error(error);
            return;
        }

        let request_id = RequestId(code);
        debug!(token, key, %request_id, "request dispatched");
        self.by_key.insert(key, request_id);
        self.active.insert(
            request_id,
            ActiveRequest {
                key,
                result_type,
                sink,
            },
        );
    }

    /// Routes one callback. Returns true when the request left the table.
    pub(crate) fn on_callback(
        &mut self,
        request_id: RequestId,
        state: CallbackState,
        payload: Option<Bytes>,
    ) -> bool {
        let Some(active) = self.active.get(&request_id) else {
            warn!(%request_id, ?state, "dropping callback for unknown request");
            return false;
        };

        if active.sink.is_closed() {
            if !state.is_terminal() {
                return false;
            }
            debug!(%request_id, ?state, "request ended after its consumer left");
            self.remove(request_id);
            return true;
        }

        match state {
            CallbackState::Next => {
                debug!(%request_id, result_type = active.result_type, "next");
                active.sink.next(payload.unwrap_or_default());
                false
            }
            CallbackState::Error => {
                let message = payload
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_else(|| "Unknown error".to_string());
                debug!(%request_id, %message, "error");
                if let Some(active) = self.remove(request_id) {
                    active.sink.error(RpcError::Remote(message));
                }
                true
            }
            CallbackState::Complete => {
                debug!(%request_id, "complete");
                if let Some(active) = self.remove(request_id) {
                    active.sink.complete();
                }
                true
            }
        }
    }

    /// Forgets the request whose consumer left and disposes it remotely.
    /// Returns false if the request is no longer tracked.
    pub(crate) async fn cancel(
        &mut self,
        key: RequestKey,
        service: Option<&dyn ServiceInterface>,
        token: &str,
    ) -> bool {
        let Some(request_id) = self.by_key.get(&key).copied() else {
            return false;
        };
        self.remove(request_id);
        debug!(token, %request_id, "request canceled by consumer");

        if let Some(service) = service {
            match service.dispose(token, request_id).await {
                Ok(true) => {}
                Ok(false) => debug!(token, %request_id, "service had already finished the request"),
                Err(e) => warn!(token, %request_id, error = %e, "dispose failed"),
            }
        }
        true
    }

    /// Ends every tracked request with `error` and empties the table.
    pub(crate) fn fail_all(&mut self, error: RpcError) {
        self.by_key.clear();
        for (request_id, active) in self.active.drain() {
            if active.sink.is_closed() {
                continue;
            }
            debug!(%request_id, error = %error, "failing request");
            active.sink.error(error.clone());
        }
    }

    fn remove(&mut self, request_id: RequestId) -> Option<ActiveRequest> {
        let active = self.active.remove(&request_id)?;
        self.by_key.remove(&active.key);
        Some(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, JsonCodec};
    use crate::error::{TransportError, TransportResult};
    use crate::protocol::REQUEST_ERROR_GENERIC;
    use crate::stream::{ResponseStream, request_channel};
    use crate::transport::ClientCallback;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Answers request calls from a script and records dispose calls.
    #[derive(Debug, Default)]
    struct ScriptedService {
        codes: Mutex<VecDeque<TransportResult<i64>>>,
        disposed: Mutex<Vec<RequestId>>,
        fail_dispose: bool,
    }

    impl ScriptedService {
        fn answering(codes: Vec<TransportResult<i64>>) -> Self {
            Self {
                codes: Mutex::new(codes.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ServiceInterface for ScriptedService {
        async fn register(
            &self,
            _client_id: &str,
            _version: i64,
            _options: &str,
            _callback: Arc<dyn ClientCallback>,
        ) -> TransportResult<i64> {
            Ok(1)
        }

        async fn request(&self, _client_id: &str, _request: RequestEnvelope) -> TransportResult<i64> {
            self.codes.lock().pop_front().unwrap_or(Ok(REQUEST_ERROR_GENERIC))
        }

        async fn dispose(&self, _client_id: &str, request_id: RequestId) -> TransportResult<bool> {
            self.disposed.lock().push(request_id);
            if self.fail_dispose {
                Err(TransportError::CallFailed("gone".into()))
            } else {
                Ok(true)
            }
        }

        async fn unregister(&self, _client_id: &str) -> TransportResult<bool> {
            Ok(true)
        }
    }

    fn pending(key: RequestKey, versions: VersionRange) -> (PendingRequest, ResponseStream<u32>) {
        let (sink, _watch, stream) = request_channel::<u32, _>(JsonCodec);
        let request = PendingRequest {
            key,
            payload: Bytes::from_static(b"0"),
            request_type: "u32",
            result_type: "u32",
            method: None,
            service_versions: versions,
            sink,
        };
        (request, stream)
    }

    fn value(n: u32) -> Option<Bytes> {
        Some(Bytes::from(JsonCodec.encode(&n).unwrap()))
    }

    #[tokio::test]
    async fn test_dispatch_and_route() {
        let service = ScriptedService::answering(vec![Ok(5)]);
        let mut table = RequestTable::new();
        let (request, stream) = pending(1, VersionRange::ANY);

        table.dispatch(&service, "t", 1, request).await;
        assert!(table.contains(RequestId(5)));

        assert!(!table.on_callback(RequestId(5), CallbackState::Next, value(10)));
        assert!(!table.on_callback(RequestId(5), CallbackState::Next, value(11)));
        assert!(table.on_callback(RequestId(5), CallbackState::Complete, None));

        assert!(table.is_empty());
        assert_eq!(stream.collect().await.unwrap(), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_refusal_codes() {
        let service = ScriptedService::answering(vec![
            Ok(REQUEST_ERROR_CLIENT_NOT_SUPPORTED),
            Ok(REQUEST_ERROR_GENERIC),
            Ok(REQUEST_ERROR_GENERIC),
            Err(TransportError::NotConnected),
        ]);
        let mut table = RequestTable::new();

        let (request, mut stream) = pending(1, VersionRange::ANY);
        table.dispatch(&service, "t", 3, request).await;
        assert_eq!(
            stream.recv().await.unwrap().unwrap_err(),
            RpcError::UnsupportedByClient
        );

        let (request, mut stream) = pending(2, VersionRange::new(0, 2));
        table.dispatch(&service, "t", 3, request).await;
        assert_eq!(
            stream.recv().await.unwrap().unwrap_err(),
            RpcError::UnsupportedByService {
                negotiated: 3,
                required: VersionRange::new(0, 2),
            }
        );

        let (request, mut stream) = pending(3, VersionRange::ANY);
        table.dispatch(&service, "t", 3, request).await;
        assert!(matches!(
            stream.recv().await.unwrap(),
            Err(RpcError::DispatchFailed(_))
        ));

        let (request, mut stream) = pending(4, VersionRange::ANY);
        table.dispatch(&service, "t", 3, request).await;
        assert_eq!(
            stream.recv().await.unwrap().unwrap_err(),
            RpcError::Transport(TransportError::NotConnected)
        );

        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_remote_error_message() {
        let service = ScriptedService::answering(vec![Ok(1), Ok(2)]);
        let mut table = RequestTable::new();
        let (first, mut first_stream) = pending(1, VersionRange::ANY);
        let (second, mut second_stream) = pending(2, VersionRange::ANY);
        table.dispatch(&service, "t", 0, first).await;
        table.dispatch(&service, "t", 0, second).await;

        assert!(table.on_callback(
            RequestId(1),
            CallbackState::Error,
            Some(Bytes::from_static(b"disk full"))
        ));
        assert!(table.on_callback(RequestId(2), CallbackState::Error, None));

        assert_eq!(
            first_stream.recv().await.unwrap().unwrap_err(),
            RpcError::Remote("disk full".into())
        );
        assert_eq!(
            second_stream.recv().await.unwrap().unwrap_err(),
            RpcError::Remote("Unknown error".into())
        );
    }

    #[tokio::test]
    async fn test_unknown_and_closed_callbacks() {
        let service = ScriptedService::answering(vec![Ok(1)]);
        let mut table = RequestTable::new();

        assert!(!table.on_callback(RequestId(42), CallbackState::Complete, None));

        let (request, stream) = pending(1, VersionRange::ANY);
        table.dispatch(&service, "t", 0, request).await;
        drop(stream);

        assert!(!table.on_callback(RequestId(1), CallbackState::Next, value(1)));
        assert!(table.contains(RequestId(1)));
        assert!(table.on_callback(RequestId(1), CallbackState::Complete, None));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_disposes_remotely() {
        let service = ScriptedService::answering(vec![Ok(8)]);
        let mut table = RequestTable::new();
        let (request, _stream) = pending(1, VersionRange::ANY);
        table.dispatch(&service, "t", 0, request).await;

        assert!(table.cancel(1, Some(&service), "t").await);
        assert!(!table.cancel(1, Some(&service), "t").await);
        assert!(table.is_empty());
        assert_eq!(*service.disposed.lock(), vec![RequestId(8)]);

        assert!(!table.on_callback(RequestId(8), CallbackState::Complete, None));
    }

    #[tokio::test]
    async fn test_dispose_failure_is_swallowed() {
        let service = ScriptedService {
            fail_dispose: true,
            ..ScriptedService::answering(vec![Ok(3)])
        };
        let mut table = RequestTable::new();
        let (request, _stream) = pending(1, VersionRange::ANY);
        table.dispatch(&service, "t", 0, request).await;

        assert!(table.cancel(1, Some(&service), "t").await);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let service = ScriptedService::answering(vec![Ok(1), Ok(2)]);
        let mut table = RequestTable::new();
        let (first, mut first_stream) = pending(1, VersionRange::ANY);
        let (second, second_stream) = pending(2, VersionRange::ANY);
        table.dispatch(&service, "t", 0, first).await;
        table.dispatch(&service, "t", 0, second).await;
        drop(second_stream);

        table.fail_all(RpcError::ConnectionLost);

        assert!(table.is_empty());
        assert_eq!(
            first_stream.recv().await.unwrap().unwrap_err(),
            RpcError::ConnectionLost
        );
        assert!(!table.cancel(2, Some(&service), "t").await);
    }
}
