//! In-memory transport and protocol doubles.
//!
//! `ScriptedTransport` replays canned reads and records writes, so the real
//! HTTP/1.1 and HTTP/2 adapters can be driven without a socket.
//! `ScriptedProtocol` stands in for the QUIC stack: each datagram read
//! releases the next batch of events.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use trident::headers::{HeaderField, HeaderList};
use trident::protocol::{Event, EventQueue, HttpProtocol, StreamId};
use trident::transport::{TlsSessionInfo, Transport, TransportKind};
use trident::{HttpVersion, Result};

#[derive(Debug, Default)]
struct Wire {
    incoming: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    broken: bool,
    closed: bool,
}

/// Transport double. Clones share the same wire.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    kind: TransportKind,
    alpn: Option<Vec<u8>>,
    wire: Arc<Mutex<Wire>>,
}

impl ScriptedTransport {
    fn with_kind(kind: TransportKind, alpn: Option<&str>) -> Self {
        Self {
            kind,
            alpn: alpn.map(|a| a.as_bytes().to_vec()),
            wire: Arc::new(Mutex::new(Wire::default())),
        }
    }

    /// Plain TCP socket.
    pub fn plain() -> Self {
        Self::with_kind(TransportKind::Tcp, None)
    }

    /// TLS socket whose handshake negotiated `alpn`.
    pub fn tls(alpn: Option<&str>) -> Self {
        Self::with_kind(TransportKind::Tls, alpn)
    }

    pub fn udp() -> Self {
        Self::with_kind(TransportKind::Udp, None)
    }

    /// Queue one read. An empty chunk reads as end-of-file; so does an
    /// exhausted script.
    pub fn push(&self, chunk: impl AsRef<[u8]>) {
        self.wire
            .lock()
            .unwrap()
            .incoming
            .push_back(chunk.as_ref().to_vec());
    }

    pub fn written(&self) -> Vec<u8> {
        self.wire.lock().unwrap().written.clone()
    }

    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    /// Forget what was written so far.
    pub fn clear_written(&self) {
        self.wire.lock().unwrap().written.clear();
    }

    /// Make every following write fail with `BrokenPipe`.
    pub fn break_pipe(&self) {
        self.wire.lock().unwrap().broken = true;
    }

    pub fn is_closed(&self) -> bool {
        self.wire.lock().unwrap().closed
    }

    pub fn boxed(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }
}

impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.wire.lock().unwrap();
        let Some(mut chunk) = wire.incoming.pop_front() else {
            return Ok(0);
        };
        if chunk.len() > buf.len() {
            let rest = chunk.split_off(buf.len());
            wire.incoming.push_front(rest);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn sendall(&mut self, data: &[u8]) -> io::Result<()> {
        let mut wire = self.wire.lock().unwrap();
        if wire.broken {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        wire.written.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) {
        self.wire.lock().unwrap().closed = true;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 1], 443)))
    }

    fn tls_session(&self) -> Option<TlsSessionInfo> {
        (self.kind == TransportKind::Tls).then(|| TlsSessionInfo {
            alpn: self.alpn.clone(),
            cipher: Some("TLS_AES_128_GCM_SHA256".into()),
            version: Some("TLSv1.3".into()),
            peer_certificate: None,
            issuer_certificate: None,
        })
    }
}

/// What the backend asked a [`ScriptedProtocol`] to send.
#[derive(Debug, Default)]
pub struct Submitted {
    pub headers: Vec<(StreamId, HeaderList, bool)>,
    pub data: Vec<(StreamId, Vec<u8>, bool)>,
    pub closed: bool,
}

/// Protocol double releasing one scripted batch of events per read.
pub struct ScriptedProtocol {
    version: HttpVersion,
    batches: VecDeque<Vec<Event>>,
    events: EventQueue,
    next_stream_id: StreamId,
    stream_step: StreamId,
    flow_blocked: bool,
    session_ticket: Option<Vec<u8>>,
    submitted: Arc<Mutex<Submitted>>,
}

impl ScriptedProtocol {
    pub fn new(version: HttpVersion) -> Self {
        let (next_stream_id, stream_step) = match version {
            HttpVersion::Http11 => (1, 0),
            HttpVersion::Http2 => (1, 2),
            HttpVersion::Http3 => (0, 4),
        };
        Self {
            version,
            batches: VecDeque::new(),
            events: EventQueue::new(),
            next_stream_id,
            stream_step,
            flow_blocked: false,
            session_ticket: None,
            submitted: Arc::new(Mutex::new(Submitted::default())),
        }
    }

    /// Events delivered by the next read.
    pub fn batch(mut self, events: Vec<Event>) -> Self {
        self.batches.push_back(events);
        self
    }

    /// The peer's flow-control window never opens.
    pub fn flow_blocked(mut self) -> Self {
        self.flow_blocked = true;
        self
    }

    pub fn with_session_ticket(mut self, ticket: &[u8]) -> Self {
        self.session_ticket = Some(ticket.to_vec());
        self
    }

    pub fn submitted(&self) -> Arc<Mutex<Submitted>> {
        Arc::clone(&self.submitted)
    }

    /// A datagram transport with one read per scripted batch.
    pub fn transport(&self) -> ScriptedTransport {
        let transport = ScriptedTransport::udp();
        for _ in &self.batches {
            transport.push(b"\x00");
        }
        transport
    }
}

impl HttpProtocol for ScriptedProtocol {
    fn http_version(&self) -> HttpVersion {
        self.version
    }

    fn is_available(&self) -> bool {
        true
    }

    fn has_expired(&self) -> bool {
        false
    }

    fn get_available_stream_id(&mut self) -> Result<StreamId> {
        let stream_id = self.next_stream_id;
        self.next_stream_id += self.stream_step;
        Ok(stream_id)
    }

    fn submit_headers(
        &mut self,
        stream_id: StreamId,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<()> {
        self.submitted
            .lock()
            .unwrap()
            .headers
            .push((stream_id, headers.to_vec(), end_stream));
        Ok(())
    }

    fn submit_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) -> Result<()> {
        self.submitted
            .lock()
            .unwrap()
            .data
            .push((stream_id, data.to_vec(), end_stream));
        Ok(())
    }

    fn submit_close(&mut self, _error_code: u64) -> Result<()> {
        self.submitted.lock().unwrap().closed = true;
        Ok(())
    }

    fn bytes_to_send(&mut self) -> Bytes {
        Bytes::new()
    }

    fn bytes_received(&mut self, _data: &[u8]) -> Result<()> {
        if let Some(batch) = self.batches.pop_front() {
            for event in batch {
                self.events.push(event);
            }
        }
        Ok(())
    }

    fn eof_received(&mut self) -> Result<()> {
        self.events.push(Event::ConnectionTerminated {
            error_code: 0,
            message: Some("connection closed".into()),
        });
        Ok(())
    }

    fn next_event(&mut self, stream_id: Option<StreamId>) -> Option<Event> {
        self.events.pop(stream_id)
    }

    fn has_pending_event(&self, stream_id: Option<StreamId>) -> bool {
        self.events.has_pending(stream_id)
    }

    fn reshelve(&mut self, events: Vec<Event>) {
        self.events.reshelve(events);
    }

    fn should_wait_remote_flow_control(&self, _stream_id: StreamId, _amount: usize) -> bool {
        self.flow_blocked
    }

    fn session_ticket(&self) -> Option<Vec<u8>> {
        self.session_ticket.clone()
    }
}

pub fn handshake() -> Event {
    Event::HandshakeCompleted {
        alpn: Some("h3".into()),
    }
}

pub fn head(stream_id: StreamId, fields: &[(&str, &str)], end_stream: bool) -> Event {
    Event::HeadersReceived {
        stream_id,
        headers: fields
            .iter()
            .map(|(n, v)| {
                (
                    Bytes::copy_from_slice(n.as_bytes()),
                    Bytes::copy_from_slice(v.as_bytes()),
                )
            })
            .collect(),
        end_stream,
    }
}

pub fn data(stream_id: StreamId, body: &[u8], end_stream: bool) -> Event {
    Event::DataReceived {
        stream_id,
        data: Bytes::copy_from_slice(body),
        end_stream,
    }
}
