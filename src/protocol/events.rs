//! Events produced by the protocol adapters.

use std::collections::VecDeque;

use bytes::Bytes;

use super::StreamId;
use crate::headers::HeaderList;

/// Something the peer did, decoded from wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A header block (response head or trailers).
    HeadersReceived {
        stream_id: StreamId,
        headers: HeaderList,
        end_stream: bool,
    },
    /// A piece of body. The final piece has `end_stream` set and may be empty.
    DataReceived {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    StreamResetReceived { stream_id: StreamId, error_code: u64 },
    /// The connection is gone; nothing more will be decoded.
    ConnectionTerminated {
        error_code: u64,
        message: Option<String>,
    },
    /// Protocol-level handshake finished (SETTINGS exchange, QUIC handshake).
    HandshakeCompleted { alpn: Option<String> },
}

/// Discriminant of an [`Event`], used to say which events a caller waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    HeadersReceived,
    DataReceived,
    StreamResetReceived,
    ConnectionTerminated,
    HandshakeCompleted,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::HeadersReceived { .. } => EventKind::HeadersReceived,
            Self::DataReceived { .. } => EventKind::DataReceived,
            Self::StreamResetReceived { .. } => EventKind::StreamResetReceived,
            Self::ConnectionTerminated { .. } => EventKind::ConnectionTerminated,
            Self::HandshakeCompleted { .. } => EventKind::HandshakeCompleted,
        }
    }

    /// Stream the event belongs to. Connection-level events have none.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Self::HeadersReceived { stream_id, .. }
            | Self::DataReceived { stream_id, .. }
            | Self::StreamResetReceived { stream_id, .. } => Some(*stream_id),
            Self::ConnectionTerminated { .. } | Self::HandshakeCompleted { .. } => None,
        }
    }

    /// End-of-stream flag, for events that carry one.
    pub fn end_stream(&self) -> Option<bool> {
        match self {
            Self::HeadersReceived { end_stream, .. } | Self::DataReceived { end_stream, .. } => {
                Some(*end_stream)
            }
            _ => None,
        }
    }

    /// Body bytes carried by the event.
    pub fn data_len(&self) -> usize {
        match self {
            Self::DataReceived { data, .. } => data.len(),
            _ => 0,
        }
    }
}

/// FIFO of decoded events with per-stream retrieval.
///
/// Connection-level events match every filter so they are never starved.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        tracing::trace!(?event, "event queued");
        self.events.push_back(event);
    }

    fn matches(event: &Event, stream_id: Option<StreamId>) -> bool {
        match (stream_id, event.stream_id()) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }

    /// Remove and return the oldest event for `stream_id` (any stream if `None`).
    pub fn pop(&mut self, stream_id: Option<StreamId>) -> Option<Event> {
        let index = self
            .events
            .iter()
            .position(|event| Self::matches(event, stream_id))?;
        self.events.remove(index)
    }

    pub fn has_pending(&self, stream_id: Option<StreamId>) -> bool {
        self.events
            .iter()
            .any(|event| Self::matches(event, stream_id))
    }

    /// Put events back at the front, keeping their relative order.
    pub fn reshelve(&mut self, events: Vec<Event>) {
        for event in events.into_iter().rev() {
            self.events.push_front(event);
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(stream_id: StreamId, body: &'static [u8]) -> Event {
        Event::DataReceived {
            stream_id,
            data: Bytes::from_static(body),
            end_stream: false,
        }
    }

    #[test]
    fn test_pop_filters_by_stream() {
        let mut queue = EventQueue::new();
        queue.push(data(3, b"b1"));
        queue.push(data(1, b"a1"));
        queue.push(data(3, b"b2"));

        assert_eq!(queue.pop(Some(1)), Some(data(1, b"a1")));
        assert!(!queue.has_pending(Some(1)));
        assert!(queue.has_pending(Some(3)));
        assert_eq!(queue.pop(None), Some(data(3, b"b1")));
    }

    #[test]
    fn test_connection_events_match_any_stream() {
        let mut queue = EventQueue::new();
        queue.push(data(3, b"x"));
        queue.push(Event::ConnectionTerminated {
            error_code: 0,
            message: None,
        });

        assert!(queue.has_pending(Some(1)));
        assert_eq!(queue.pop(Some(1)).map(|e| e.kind()), Some(EventKind::ConnectionTerminated));
    }

    #[test]
    fn test_reshelve_preserves_order() {
        let mut queue = EventQueue::new();
        queue.push(data(1, b"later"));
        queue.reshelve(vec![data(3, b"b1"), data(3, b"b2")]);

        assert_eq!(queue.pop(Some(3)), Some(data(3, b"b1")));
        assert_eq!(queue.pop(Some(3)), Some(data(3, b"b2")));
        assert_eq!(queue.pop(None), Some(data(1, b"later")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_event_accessors() {
        let event = Event::HeadersReceived {
            stream_id: 5,
            headers: vec![],
            end_stream: true,
        };
        assert_eq!(event.stream_id(), Some(5));
        assert_eq!(event.end_stream(), Some(true));
        assert_eq!(event.data_len(), 0);
        assert_eq!(data(1, b"abc").data_len(), 3);

        let reset = Event::StreamResetReceived {
            stream_id: 1,
            error_code: 8,
        };
        assert_eq!(reset.end_stream(), None);
    }
}
