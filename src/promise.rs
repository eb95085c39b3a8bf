//! Handles correlating sent requests with their not-yet-received responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::headers::{self, HeaderList};
use crate::protocol::StreamId;

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// One outstanding request on a connection.
///
/// Minted when the request head (or the last body chunk) has been handed to
/// the wire. Resolved exactly once by `getresponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePromise {
    uid: u64,
    connection_id: u64,
    stream_id: StreamId,
    request_headers: HeaderList,
}

impl ResponsePromise {
    pub(crate) fn new(connection_id: u64, stream_id: StreamId, request_headers: HeaderList) -> Self {
        Self {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            connection_id,
            stream_id,
            request_headers,
        }
    }

    /// Process-unique identifier.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Identifier of the connection that issued this promise.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Headers exactly as submitted, pseudo-headers included.
    pub fn request_headers(&self) -> &[(Bytes, Bytes)] {
        &self.request_headers
    }

    /// Request method taken from `:method`.
    pub fn method(&self) -> &str {
        headers::find(&self.request_headers, b":method")
            .and_then(|v| std::str::from_utf8(v).ok())
            .unwrap_or("")
    }
}

/// Live promises indexed both by uid and by stream id.
///
/// A stream id maps to at most one live promise.
#[derive(Debug, Default)]
pub struct PromiseRegistry {
    by_uid: HashMap<u64, ResponsePromise>,
    by_stream: HashMap<StreamId, u64>,
}

impl PromiseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `promise`, replacing whatever promise held its stream id.
    pub fn register(&mut self, promise: ResponsePromise) {
        if let Some(stale) = self.by_stream.insert(promise.stream_id, promise.uid) {
            self.by_uid.remove(&stale);
        }
        self.by_uid.insert(promise.uid, promise);
    }

    pub fn get(&self, uid: u64) -> Option<&ResponsePromise> {
        self.by_uid.get(&uid)
    }

    pub fn by_stream(&self, stream_id: StreamId) -> Option<&ResponsePromise> {
        self.by_stream.get(&stream_id).and_then(|uid| self.by_uid.get(uid))
    }

    pub fn contains(&self, uid: u64) -> bool {
        self.by_uid.contains_key(&uid)
    }

    /// Drop the promise from both indices.
    pub fn remove(&mut self, uid: u64) -> Option<ResponsePromise> {
        let promise = self.by_uid.remove(&uid)?;
        if self.by_stream.get(&promise.stream_id) == Some(&uid) {
            self.by_stream.remove(&promise.stream_id);
        }
        Some(promise)
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_uid.clear();
        self.by_stream.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn promise(stream_id: StreamId) -> ResponsePromise {
        ResponsePromise::new(
            7,
            stream_id,
            vec![(Bytes::from_static(b":method"), Bytes::from_static(b"GET"))],
        )
    }

    #[test]
    fn test_uids_are_unique() {
        let a = promise(1);
        let b = promise(1);
        assert_ne!(a.uid(), b.uid());
        assert_eq!(a.method(), "GET");
        assert_eq!(a.connection_id(), 7);
    }

    #[test]
    fn test_remove_clears_both_indices() {
        let mut registry = PromiseRegistry::new();
        let p = promise(3);
        registry.register(p.clone());
        assert_eq!(registry.by_stream(3), Some(&p));

        assert_eq!(registry.remove(p.uid()), Some(p.clone()));
        assert!(registry.by_stream(3).is_none());
        assert!(!registry.contains(p.uid()));
        assert!(registry.remove(p.uid()).is_none());
    }

    #[test]
    fn test_one_live_promise_per_stream() {
        let mut registry = PromiseRegistry::new();
        let first = promise(5);
        let second = promise(5);
        registry.register(first.clone());
        registry.register(second.clone());

        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(first.uid()));
        assert_eq!(registry.by_stream(5), Some(&second));
    }
}
