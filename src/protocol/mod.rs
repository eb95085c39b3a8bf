//! Sans-IO protocol state machines.
//!
//! Each adapter turns API calls into wire bytes (`bytes_to_send`) and wire
//! bytes into [`Event`]s (`bytes_received` + `next_event`). None of them
//! touches a socket; the backend shuttles the bytes.
//!
//! - HTTP/1.1 (`h1`): one logical stream, strictly sequential
//! - HTTP/2 (`h2`): multiplexed streams, flow control, HPACK
//! - HTTP/3 (`h3`): quiche over UDP datagrams

pub mod events;
pub mod h1;
pub mod h2;
pub mod h3;

use std::time::Duration;

use bytes::Bytes;

pub use events::{Event, EventKind, EventQueue};

use crate::error::Result;
use crate::headers::HeaderField;
use crate::version::HttpVersion;

/// Stream identifier. HTTP/1.1 uses a single fixed id.
pub type StreamId = u64;

/// Common interface of the HTTP/1.1, HTTP/2 and HTTP/3 adapters.
///
/// Failures are reported as [`crate::Error::Protocol`],
/// [`crate::Error::IncompleteRead`] or [`crate::Error::Ssl`]; library errors
/// of the underlying codecs never escape.
pub trait HttpProtocol: Send {
    fn http_version(&self) -> HttpVersion;

    /// Whether several streams can be open at once.
    fn multiplexed(&self) -> bool {
        self.http_version().supports_multiplexing()
    }

    /// Whether a new stream could be opened right now.
    fn is_available(&self) -> bool;

    /// Whether the peer announced it will accept no further streams.
    fn has_expired(&self) -> bool;

    /// Allocate the next stream id.
    fn get_available_stream_id(&mut self) -> Result<StreamId>;

    /// Queue a header block. Request lists start with pseudo-headers.
    fn submit_headers(
        &mut self,
        stream_id: StreamId,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<()>;

    /// Queue body bytes.
    fn submit_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) -> Result<()>;

    /// Queue a graceful connection close.
    fn submit_close(&mut self, error_code: u64) -> Result<()>;

    /// Drain pending outgoing bytes. Empty when there is nothing to send.
    ///
    /// Datagram protocols return one datagram per call.
    fn bytes_to_send(&mut self) -> Bytes;

    /// Feed bytes (or one datagram) read from the transport.
    fn bytes_received(&mut self, data: &[u8]) -> Result<()>;

    /// The transport reached end-of-file.
    fn eof_received(&mut self) -> Result<()>;

    /// Next decoded event, restricted to `stream_id` when given.
    fn next_event(&mut self, stream_id: Option<StreamId>) -> Option<Event>;

    fn has_pending_event(&self, stream_id: Option<StreamId>) -> bool;

    /// Return events to the front of the queue, order preserved.
    fn reshelve(&mut self, events: Vec<Event>);

    /// Whether sending `amount` body bytes on `stream_id` must wait for the
    /// peer to open its flow-control window.
    fn should_wait_remote_flow_control(&self, stream_id: StreamId, amount: usize) -> bool;

    /// Time until a protocol timer fires, for protocols with timers.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// A timer returned by [`HttpProtocol::timeout`] elapsed.
    fn on_timeout(&mut self) {}

    /// DER certificates presented by the peer during a handshake this
    /// protocol performed itself: leaf, then issuer.
    fn peer_certificates(&self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        None
    }

    /// Resumption ticket from the protocol's own TLS handshake.
    fn session_ticket(&self) -> Option<Vec<u8>> {
        None
    }
}
