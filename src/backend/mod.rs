//! Blocking connection engine.
//!
//! [`HttpConnection`] owns one socket and one protocol adapter, negotiates
//! which HTTP version runs on it and shuttles bytes between the two:
//!
//! - `connect`: preemptive QUIC, TCP/TLS, ALPN, CONNECT tunnels, Alt-Svc upgrade
//! - `request`: `putrequest` / `endheaders` / `send`
//! - `response`: `getresponse` and body reads
//! - `exchange`: the loop every blocking operation goes through

mod connect;
mod exchange;
mod request;
mod response;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub use request::PendingRequest;

use crate::config::ConnectionConfig;
use crate::conn_info::ConnectionInfo;
use crate::error::{Error, Result};
use crate::headers::HeaderList;
use crate::pool::alt_svc::{Authority, QuicPreemptiveCache};
use crate::promise::{PromiseRegistry, ResponsePromise};
use crate::protocol::{HttpProtocol, StreamId};
use crate::transport::tcp::ConnectTimings;
use crate::transport::Transport;
use crate::version::HttpVersion;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What the connection remembers about the last response head.
#[derive(Debug, Clone)]
struct ResponseMeta {
    authority: String,
    alt_svc: Vec<String>,
}

/// CONNECT target for a proxied connection.
#[derive(Debug, Clone)]
struct TunnelTarget {
    host: String,
    port: u16,
    headers: Vec<(String, String)>,
}

/// Request whose head went out without END_STREAM; `send` completes it.
#[derive(Debug)]
struct Upload {
    stream_id: StreamId,
    headers: HeaderList,
    started: Instant,
}

/// One client connection speaking HTTP/1.1, HTTP/2 or HTTP/3.
///
/// Not thread-safe by itself: one caller drives it at a time. The only
/// state shared with other connections is the optional QUIC cache.
pub struct HttpConnection {
    id: u64,
    config: ConnectionConfig,
    /// Port dialed; an Alt-Svc upgrade moves it to the alternative's port.
    port: u16,
    transport: Option<Box<dyn Transport>>,
    protocol: Option<Box<dyn HttpProtocol>>,
    /// Version in use or scheduled for the next connect. Survives `close`.
    svn: Option<HttpVersion>,
    promises: PromiseRegistry,
    /// Streams whose response head was returned but whose body is unfinished.
    pending_responses: HashSet<StreamId>,
    last_response: Option<ResponseMeta>,
    tunnel: Option<TunnelTarget>,
    quic_cache: Option<Arc<dyn QuicPreemptiveCache>>,
    alt_authority: Option<Authority>,
    quic_session_ticket: Option<Vec<u8>>,
    conn_info: Option<ConnectionInfo>,
    timings: Option<ConnectTimings>,
    upload: Option<Upload>,
    is_verified: bool,
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("id", &self.id)
            .field("host", &self.config.host)
            .field("port", &self.port)
            .field("version", &self.svn)
            .field("connected", &self.transport.is_some())
            .field("promises", &self.promises.len())
            .field("pending_responses", &self.pending_responses.len())
            .finish()
    }
}

impl HttpConnection {
    /// Create an unconnected connection. Nothing happens on the network
    /// until [`connect`](Self::connect) or the first `endheaders`.
    pub fn new(config: ConnectionConfig) -> Self {
        let port = config.effective_port();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            config,
            port,
            transport: None,
            protocol: None,
            svn: None,
            promises: PromiseRegistry::new(),
            pending_responses: HashSet::new(),
            last_response: None,
            tunnel: None,
            quic_cache: None,
            alt_authority: None,
            quic_session_ticket: None,
            conn_info: None,
            timings: None,
            upload: None,
            is_verified: false,
        }
    }

    /// Share a QUIC preemptive cache with other connections.
    pub fn with_quic_cache(mut self, cache: Arc<dyn QuicPreemptiveCache>) -> Self {
        self.quic_cache = Some(cache);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Version negotiated, or the one the next connect will use.
    pub fn http_version(&self) -> Option<HttpVersion> {
        self.svn
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Whether the peer certificate was verified during the TLS handshake.
    pub fn is_verified(&self) -> bool {
        self.is_verified
    }

    pub fn conn_info(&self) -> Option<&ConnectionInfo> {
        self.conn_info.as_ref()
    }

    /// Ticket saved from the last HTTP/3 exchange, reused on reconnect.
    pub fn quic_session_ticket(&self) -> Option<&[u8]> {
        self.quic_session_ticket.as_deref()
    }

    /// Whether no new stream can be opened right now.
    pub fn is_saturated(&self) -> bool {
        self.protocol.as_ref().map_or(true, |p| !p.is_available())
    }

    pub fn is_multiplexed(&self) -> bool {
        self.protocol.as_ref().is_some_and(|p| p.multiplexed())
    }

    /// No request awaiting its response and no response body left to read.
    pub fn is_idle(&self) -> bool {
        self.promises.is_empty() && self.pending_responses.is_empty()
    }

    /// Whether the peer will not accept further streams on this socket.
    pub fn has_expired(&self) -> bool {
        self.protocol.as_ref().is_some_and(|p| p.has_expired())
    }

    /// Number of requests sent whose response head was not read yet.
    pub fn promises_in_flight(&self) -> usize {
        self.promises.len()
    }

    fn h3_disabled(&self) -> bool {
        self.config.disabled_versions.contains(&HttpVersion::Http3)
    }

    /// Mint a promise for `stream_id` and index it.
    fn register_promise(&mut self, stream_id: StreamId, headers: HeaderList) -> ResponsePromise {
        let promise = ResponsePromise::new(self.id, stream_id, headers);
        tracing::trace!(connection = self.id, stream_id, uid = promise.uid(), "promise registered");
        self.promises.register(promise.clone());
        promise
    }

    fn io(&mut self) -> Result<(&mut Box<dyn Transport>, &mut Box<dyn HttpProtocol>)> {
        match (self.transport.as_mut(), self.protocol.as_mut()) {
            (Some(transport), Some(protocol)) => Ok((transport, protocol)),
            _ => Err(Error::state("connection is not established")),
        }
    }

    /// Say goodbye to the peer and drop the socket.
    ///
    /// Every promise and unread body is forgotten. The HTTP version, the
    /// last response metadata and the QUIC session ticket are kept for the
    /// next connect.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Some(protocol) = self.protocol.as_deref_mut() {
                match protocol.submit_close(0) {
                    Ok(()) => {
                        if let Err(e) = exchange::flush(&mut *transport, protocol) {
                            tracing::trace!(connection = self.id, "goodbye not delivered: {}", e);
                        }
                    }
                    Err(e) => tracing::debug!(connection = self.id, "submit_close failed: {}", e),
                }
            }
            transport.close();
            tracing::debug!(connection = self.id, host = %self.config.host, "connection closed");
        }

        self.protocol = None;
        self.promises.clear();
        self.pending_responses.clear();
        self.conn_info = None;
        self.timings = None;
        self.upload = None;
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.close();
    }
}
