//! Handler registration and resolution.
//!
//! Handlers are registered explicitly at startup; their declaration order is
//! the priority used when a request does not name a method.

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::{Codec, JsonCodec, Payload};
use crate::error::{Result, RpcError};
use crate::protocol::VersionRange;

/// Encoded results of one handler invocation; errors carry their message.
pub(crate) type HandlerStream = BoxStream<'static, std::result::Result<Bytes, String>>;

type InvokeFn<C> = dyn Fn(&C, &[u8]) -> Result<HandlerStream> + Send + Sync;

/// What a handler accepts and produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerDescriptor {
    pub name: String,
    pub request_type: &'static str,
    pub result_type: &'static str,
    /// Client versions the handler serves; `None` serves every client.
    pub client_versions: Option<VersionRange>,
}

impl HandlerDescriptor {
    fn accepts(&self, caller_version: i64) -> bool {
        self.client_versions
            .is_none_or(|range| range.contains(caller_version))
    }
}

struct HandlerEntry<C> {
    descriptor: HandlerDescriptor,
    invoke: Arc<InvokeFn<C>>,
}

/// Ordered set of stream handlers served by one service.
pub struct HandlerRegistry<C: Codec = JsonCodec> {
    entries: Vec<HandlerEntry<C>>,
}

impl<C: Codec> HandlerRegistry<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers `handler` under `name` for every client version.
    pub fn register<Req, Resp, F, S, E>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        Req: Payload,
        Resp: Payload,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<Resp, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.insert::<Req, Resp, F, S, E>(name.into(), None, handler)
    }

    /// Registers `handler` for clients whose version lies in `client_versions`.
    pub fn register_with_versions<Req, Resp, F, S, E>(
        &mut self,
        name: impl Into<String>,
        client_versions: VersionRange,
        handler: F,
    ) -> &mut Self
    where
        Req: Payload,
        Resp: Payload,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<Resp, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.insert::<Req, Resp, F, S, E>(name.into(), Some(client_versions), handler)
    }

    fn insert<Req, Resp, F, S, E>(
        &mut self,
        name: String,
        client_versions: Option<VersionRange>,
        handler: F,
    ) -> &mut Self
    where
        Req: Payload,
        Resp: Payload,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<Resp, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let descriptor = HandlerDescriptor {
            name,
            request_type: Req::TYPE_NAME,
            result_type: Resp::TYPE_NAME,
            client_versions,
        };
        if self.entries.iter().any(|entry| {
            entry.descriptor.name == descriptor.name
                && entry.descriptor.request_type == descriptor.request_type
        }) {
            warn!(
                name = %descriptor.name,
                request_type = descriptor.request_type,
                "handler signature registered twice; the first registration wins by name"
            );
        }

        let invoke = move |codec: &C, payload: &[u8]| -> Result<HandlerStream> {
            let request: Req = codec.decode(payload)?;
            let codec = codec.clone();
            let results = handler(request).map(move |item| match item {
                Ok(value) => codec
                    .encode(&value)
                    .map(Bytes::from)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            });
            Ok(results.boxed())
        };

        self.entries.push(HandlerEntry {
            descriptor,
            invoke: Arc::new(invoke),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.entries.iter().map(|entry| &entry.descriptor)
    }

    /// Finds the handler for a request and returns its position.
    ///
    /// A named lookup matches name and request type exactly and never falls
    /// back to other handlers. Without a name the first handler, in
    /// registration order, whose types match and which accepts the caller
    /// wins. A handler whose types match but whose version range excludes the
    /// caller yields [`RpcError::UnsupportedByClient`].
    pub(crate) fn resolve(
        &self,
        request_type: &str,
        result_type: &str,
        method: Option<&str>,
        caller_version: i64,
    ) -> Result<usize> {
        match method {
            Some(name) => {
                let (index, entry) = self
                    .entries
                    .iter()
                    .enumerate()
                    .find(|(_, entry)| {
                        entry.descriptor.name == name
                            && entry.descriptor.request_type == request_type
                    })
                    .ok_or_else(|| {
                        RpcError::HandlerNotFound(format!("{}({})", name, request_type))
                    })?;

                if entry.descriptor.result_type != result_type {
                    return Err(RpcError::HandlerNotFound(format!(
                        "{}({}) produces {}, not {}",
                        name, request_type, entry.descriptor.result_type, result_type
                    )));
                }
                if !entry.descriptor.accepts(caller_version) {
                    return Err(RpcError::UnsupportedByClient);
                }
                Ok(index)
            }
            None => {
                let mut excluded = false;
                for (index, entry) in self.entries.iter().enumerate() {
                    let descriptor = &entry.descriptor;
                    if descriptor.request_type != request_type
                        || descriptor.result_type != result_type
                    {
                        continue;
                    }
                    if descriptor.accepts(caller_version) {
                        return Ok(index);
                    }
                    excluded = true;
                }

                if excluded {
                    Err(RpcError::UnsupportedByClient)
                } else {
                    Err(RpcError::HandlerNotFound(format!(
                        "*({}) -> {}",
                        request_type, result_type
                    )))
                }
            }
        }
    }

    /// Decodes `payload` for the handler at `index` and starts it.
    pub(crate) fn invoke(&self, index: usize, codec: &C, payload: &[u8]) -> Result<HandlerStream> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| RpcError::HandlerNotFound(format!("handler #{}", index)))?;
        (entry.invoke)(codec, payload)
    }
}

impl<C: Codec> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> std::fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.descriptors()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ResolutionKey {
    pub(crate) request_type: String,
    pub(crate) result_type: String,
    pub(crate) method: Option<String>,
    pub(crate) caller_version: i64,
}

/// Successful resolutions; misses are never stored.
#[derive(Debug, Default)]
pub(crate) struct ResolutionCache {
    entries: HashMap<ResolutionKey, usize>,
}

impl ResolutionCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn resolve<C: Codec>(
        &mut self,
        handlers: &HandlerRegistry<C>,
        key: ResolutionKey,
    ) -> Result<usize> {
        if let Some(index) = self.entries.get(&key) {
            return Ok(*index);
        }

        let index = handlers.resolve(
            &key.request_type,
            &key.result_type,
            key.method.as_deref(),
            key.caller_version,
        )?;
        debug!(?key, index, "resolved handler");
        self.entries.insert(key, index);
        Ok(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn numbers(count: u32) -> impl Stream<Item = std::result::Result<u32, String>> {
        stream::iter((0..count).map(Ok))
    }

    fn registry() -> HandlerRegistry {
        let mut handlers: HandlerRegistry = HandlerRegistry::new();
        handlers
            .register_with_versions("legacy_count", VersionRange::new(0, 10), |n: u32| {
                numbers(n)
            })
            .register("count", |n: u32| numbers(n + 100))
            .register("echo", |s: String| {
                stream::iter(vec![Ok::<_, String>(s)])
            });
        handlers
    }

    #[test]
    fn test_named_resolution() {
        let handlers = registry();
        assert_eq!(handlers.resolve("u32", "u32", Some("count"), 50).unwrap(), 1);
        assert_eq!(
            handlers.resolve("string", "string", Some("echo"), 0).unwrap(),
            2
        );
    }

    #[test]
    fn test_named_resolution_has_no_fallback() {
        let handlers = registry();

        assert!(matches!(
            handlers.resolve("u32", "u32", Some("missing"), 0),
            Err(RpcError::HandlerNotFound(_))
        ));
        assert!(matches!(
            handlers.resolve("u32", "string", Some("count"), 0),
            Err(RpcError::HandlerNotFound(_))
        ));
        assert_eq!(
            handlers.resolve("u32", "u32", Some("legacy_count"), 11),
            Err(RpcError::UnsupportedByClient)
        );
    }

    #[test]
    fn test_wildcard_first_match_wins() {
        let handlers = registry();
        assert_eq!(handlers.resolve("u32", "u32", None, 3).unwrap(), 0);
        assert_eq!(handlers.resolve("u32", "u32", None, 11).unwrap(), 1);
        assert!(matches!(
            handlers.resolve("i64", "u32", None, 0),
            Err(RpcError::HandlerNotFound(_))
        ));
    }

    #[test]
    fn test_wildcard_reports_version_exclusion() {
        let mut handlers: HandlerRegistry = HandlerRegistry::new();
        handlers.register_with_versions("only_new", VersionRange::at_least(5), |n: u32| {
            numbers(n)
        });
        assert_eq!(
            handlers.resolve("u32", "u32", None, 1),
            Err(RpcError::UnsupportedByClient)
        );
    }

    #[test]
    fn test_cache_stores_hits_only() {
        let handlers = registry();
        let mut cache = ResolutionCache::new();
        let key = |method: Option<&str>, version| ResolutionKey {
            request_type: "u32".into(),
            result_type: "u32".into(),
            method: method.map(String::from),
            caller_version: version,
        };

        assert_eq!(cache.resolve(&handlers, key(None, 3)).unwrap(), 0);
        assert_eq!(cache.resolve(&handlers, key(None, 3)).unwrap(), 0);
        assert_eq!(cache.resolve(&handlers, key(None, 20)).unwrap(), 1);
        assert!(cache.resolve(&handlers, key(Some("missing"), 3)).is_err());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_invoke_decodes_and_encodes() {
        let handlers = registry();
        let codec = JsonCodec;
        let payload = codec.encode(&3u32).unwrap();

        let results: Vec<_> = handlers
            .invoke(0, &codec, &payload)
            .unwrap()
            .collect()
            .await;
        let decoded: Vec<u32> = results
            .into_iter()
            .map(|item| codec.decode(&item.unwrap()).unwrap())
            .collect();
        assert_eq!(decoded, vec![0, 1, 2]);

        assert!(matches!(
            handlers.invoke(0, &codec, b"\"three\""),
            Err(RpcError::Serialization(_))
        ));
    }

    #[test]
    fn test_descriptors_keep_declaration_order() {
        let handlers = registry();
        let names: Vec<_> = handlers.descriptors().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["legacy_count", "count", "echo"]);
        assert_eq!(handlers.len(), 3);
    }
}
