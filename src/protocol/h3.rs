//! HTTP/3 adapter over quiche.
//!
//! quiche owns both the QUIC state and the HTTP/3 framing; this wrapper
//! feeds it datagrams, hands back the datagrams it wants sent, and turns
//! `quiche::h3::Event`s into [`Event`]s.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes};
use quiche::h3::NameValue;

use super::events::{Event, EventQueue};
use super::{HttpProtocol, StreamId};
use crate::error::{Error, Result};
use crate::headers::{self, HeaderField, HeaderList};
use crate::transport::quic::{QuicTlsConfig, MAX_DATAGRAM_SIZE};
use crate::version::HttpVersion;

/// H3_NO_ERROR application error code.
const H3_NO_ERROR: u64 = 0x100;

/// Source connection id length.
const SCID_LEN: usize = quiche::MAX_CONN_ID_LEN;

/// Read size when draining a response body out of quiche.
const BODY_CHUNK: usize = 16384;

/// Generate a random connection ID.
fn generate_cid() -> Result<[u8; SCID_LEN]> {
    let mut scid = [0u8; SCID_LEN];
    getrandom::fill(&mut scid)
        .map_err(|e| Error::protocol(format!("Failed to generate connection ID: {}", e)))?;
    Ok(scid)
}

/// HTTP/3 client connection driven by datagrams.
pub struct H3Protocol {
    conn: quiche::Connection,
    h3: Option<quiche::h3::Connection>,
    local: SocketAddr,
    peer: SocketAddr,
    events: EventQueue,
    /// Next request stream id quiche will allocate.
    next_stream_id: u64,
    /// Body bytes quiche had no room for yet.
    pending: HashMap<u64, VecDeque<(Bytes, bool)>>,
    /// Streams whose response head was already reported.
    responding: HashSet<u64>,
    /// Streams whose end was already reported.
    finished: HashSet<u64>,
    goaway: bool,
    terminated: bool,
}

impl std::fmt::Debug for H3Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H3Protocol")
            .field("peer", &self.peer)
            .field("established", &self.conn.is_established())
            .field("next_stream_id", &self.next_stream_id)
            .field("goaway", &self.goaway)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl H3Protocol {
    /// Start a QUIC handshake towards `peer`.
    ///
    /// `server_name` is used for SNI and certificate verification; `None`
    /// skips hostname verification.
    pub fn connect(
        server_name: Option<&str>,
        local: SocketAddr,
        peer: SocketAddr,
        tls: &QuicTlsConfig,
    ) -> Result<Self> {
        let mut config = tls.build_quiche_config()?;
        let scid = generate_cid()?;
        let scid = quiche::ConnectionId::from_ref(&scid);

        let mut conn = quiche::connect(server_name, &scid, local, peer, &mut config)
            .map_err(|e| Error::protocol(format!("Failed to create QUIC connection: {}", e)))?;

        if let Some(ticket) = tls.session_ticket.as_deref() {
            if let Err(e) = conn.set_session(ticket) {
                tracing::debug!("ignoring unusable QUIC session ticket: {}", e);
            }
        }

        tracing::debug!(%peer, ?server_name, "QUIC handshake started");

        Ok(Self {
            conn,
            h3: None,
            local,
            peer,
            events: EventQueue::new(),
            next_stream_id: 0,
            pending: HashMap::new(),
            responding: HashSet::new(),
            finished: HashSet::new(),
            goaway: false,
            terminated: false,
        })
    }

    /// Create the HTTP/3 layer once the QUIC handshake is done.
    fn on_established(&mut self) -> Result<()> {
        if self.h3.is_some() || !self.conn.is_established() {
            return Ok(());
        }
        let config = quiche::h3::Config::new()
            .map_err(|e| Error::protocol(format!("Failed to create HTTP/3 config: {}", e)))?;
        let h3 = quiche::h3::Connection::with_transport(&mut self.conn, &config)
            .map_err(|e| Error::protocol(format!("Failed to create HTTP/3 connection: {}", e)))?;
        self.h3 = Some(h3);

        let alpn = String::from_utf8_lossy(self.conn.application_proto()).into_owned();
        tracing::debug!(peer = %self.peer, %alpn, "QUIC handshake completed");
        self.events.push(Event::HandshakeCompleted {
            alpn: Some(if alpn.is_empty() {
                HttpVersion::Http3.alpn().to_string()
            } else {
                alpn
            }),
        });
        Ok(())
    }

    /// Drain quiche's HTTP/3 events into the queue.
    fn poll(&mut self) -> Result<()> {
        let Some(h3) = self.h3.as_mut() else {
            return Ok(());
        };

        loop {
            match h3.poll(&mut self.conn) {
                Ok((stream_id, quiche::h3::Event::Headers { list, more_frames })) => {
                    if self.responding.insert(stream_id) {
                        let header_list: HeaderList = list
                            .iter()
                            .map(|h| (Bytes::copy_from_slice(h.name()), Bytes::copy_from_slice(h.value())))
                            .collect();
                        if !more_frames {
                            self.finished.insert(stream_id);
                        }
                        self.events.push(Event::HeadersReceived {
                            stream_id,
                            headers: headers::pseudo_first(&header_list),
                            end_stream: !more_frames,
                        });
                    } else if !more_frames && self.finished.insert(stream_id) {
                        // Trailers close the stream.
                        self.events.push(Event::DataReceived {
                            stream_id,
                            data: Bytes::new(),
                            end_stream: true,
                        });
                    }
                }
                Ok((stream_id, quiche::h3::Event::Data)) => {
                    let mut buf = vec![0u8; BODY_CHUNK];
                    loop {
                        match h3.recv_body(&mut self.conn, stream_id, &mut buf) {
                            Ok(0) => break,
                            Ok(n) => self.events.push(Event::DataReceived {
                                stream_id,
                                data: Bytes::copy_from_slice(&buf[..n]),
                                end_stream: false,
                            }),
                            Err(quiche::h3::Error::Done) => break,
                            Err(e) => {
                                return Err(Error::protocol(format!(
                                    "Failed to read HTTP/3 body on stream {}: {}",
                                    stream_id, e
                                )))
                            }
                        }
                    }
                }
                Ok((stream_id, quiche::h3::Event::Finished)) => {
                    if self.finished.insert(stream_id) {
                        self.events.push(Event::DataReceived {
                            stream_id,
                            data: Bytes::new(),
                            end_stream: true,
                        });
                    }
                    self.pending.remove(&stream_id);
                }
                Ok((stream_id, quiche::h3::Event::Reset(error_code))) => {
                    self.pending.remove(&stream_id);
                    self.finished.insert(stream_id);
                    self.events.push(Event::StreamResetReceived {
                        stream_id,
                        error_code,
                    });
                }
                Ok((_, quiche::h3::Event::GoAway)) => {
                    tracing::debug!(peer = %self.peer, "HTTP/3 GOAWAY received");
                    self.goaway = true;
                }
                Ok((_, _)) => {}
                Err(quiche::h3::Error::Done) => break,
                Err(e) => {
                    tracing::debug!("HTTP/3 poll failed: {}", e);
                    let _ = self.conn.close(true, e.to_wire(), b"");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Push buffered body bytes into quiche as stream capacity allows.
    fn flush_pending(&mut self) -> Result<()> {
        let Some(h3) = self.h3.as_mut() else {
            return Ok(());
        };
        let mut ids: Vec<u64> = self.pending.keys().copied().collect();
        ids.sort_unstable();

        for stream_id in ids {
            let Some(queue) = self.pending.get_mut(&stream_id) else {
                continue;
            };
            while let Some((mut data, fin)) = queue.pop_front() {
                let written = match h3.send_body(&mut self.conn, stream_id, &data, fin) {
                    Ok(n) => Some(n),
                    Err(quiche::h3::Error::Done) | Err(quiche::h3::Error::StreamBlocked) => None,
                    Err(e) => {
                        return Err(Error::protocol(format!(
                            "Failed to send HTTP/3 body on stream {}: {}",
                            stream_id, e
                        )))
                    }
                };
                match written {
                    Some(n) if n == data.len() => {}
                    Some(n) => {
                        data.advance(n);
                        queue.push_front((data, fin));
                        break;
                    }
                    None => {
                        queue.push_front((data, fin));
                        break;
                    }
                }
            }
            if queue.is_empty() {
                self.pending.remove(&stream_id);
            }
        }
        Ok(())
    }

    /// Report the end of the connection once quiche has closed it.
    fn check_closed(&mut self) {
        if self.terminated || !self.conn.is_closed() {
            return;
        }
        self.terminated = true;

        let (error_code, message) = match self.conn.peer_error().or(self.conn.local_error()) {
            Some(err) => (
                err.error_code,
                Some(String::from_utf8_lossy(&err.reason).into_owned()).filter(|m| !m.is_empty()),
            ),
            None if self.conn.is_timed_out() => (0, Some("QUIC connection timed out".to_string())),
            None => (0, None),
        };
        tracing::debug!(peer = %self.peer, error_code, ?message, "QUIC connection closed");
        self.events.push(Event::ConnectionTerminated {
            error_code,
            message,
        });
    }
}

impl HttpProtocol for H3Protocol {
    fn http_version(&self) -> HttpVersion {
        HttpVersion::Http3
    }

    fn is_available(&self) -> bool {
        self.h3.is_some() && !self.has_expired() && self.conn.peer_streams_left_bidi() > 0
    }

    fn has_expired(&self) -> bool {
        self.goaway || self.terminated || self.conn.is_closed() || self.conn.is_draining()
    }

    fn get_available_stream_id(&mut self) -> Result<StreamId> {
        if self.h3.is_none() {
            return Err(Error::protocol("HTTP/3 handshake has not completed"));
        }
        if self.has_expired() {
            return Err(Error::protocol("HTTP/3 connection no longer accepts new streams"));
        }
        Ok(self.next_stream_id)
    }

    fn submit_headers(
        &mut self,
        stream_id: StreamId,
        header_list: &[HeaderField],
        end_stream: bool,
    ) -> Result<()> {
        let Some(h3) = self.h3.as_mut() else {
            return Err(Error::protocol("HTTP/3 handshake has not completed"));
        };
        if stream_id != self.next_stream_id {
            return Err(Error::protocol(format!(
                "stream {} was not allocated (next is {})",
                stream_id, self.next_stream_id
            )));
        }

        let quiche_headers: Vec<quiche::h3::Header> = headers::pseudo_first(header_list)
            .iter()
            .map(|(name, value)| quiche::h3::Header::new(&name.to_ascii_lowercase(), value))
            .collect();

        let sent = h3
            .send_request(&mut self.conn, &quiche_headers, end_stream)
            .map_err(|e| Error::protocol(format!("Failed to send HTTP/3 request: {}", e)))?;
        if sent != stream_id {
            return Err(Error::protocol(format!(
                "HTTP/3 opened stream {} instead of {}",
                sent, stream_id
            )));
        }
        self.next_stream_id += 4;
        tracing::trace!(stream_id, end_stream, "h3 request headers queued");
        Ok(())
    }

    fn submit_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) -> Result<()> {
        if self.h3.is_none() {
            return Err(Error::protocol("HTTP/3 handshake has not completed"));
        }
        if stream_id >= self.next_stream_id {
            return Err(Error::protocol(format!("stream {} is not open", stream_id)));
        }
        if data.is_empty() && !end_stream {
            return Ok(());
        }
        self.pending
            .entry(stream_id)
            .or_default()
            .push_back((Bytes::copy_from_slice(data), end_stream));
        self.flush_pending()
    }

    fn submit_close(&mut self, _error_code: u64) -> Result<()> {
        if self.conn.is_closed() {
            return Ok(());
        }
        if let Some(h3) = self.h3.as_mut() {
            let _ = h3.send_goaway(&mut self.conn, 0);
        }
        match self.conn.close(true, H3_NO_ERROR, b"") {
            Ok(()) | Err(quiche::Error::Done) => Ok(()),
            Err(e) => Err(Error::protocol(format!("Failed to close QUIC connection: {}", e))),
        }
    }

    fn bytes_to_send(&mut self) -> Bytes {
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];
        match self.conn.send(&mut out) {
            Ok((len, _info)) => {
                out.truncate(len);
                Bytes::from(out)
            }
            Err(quiche::Error::Done) => Bytes::new(),
            Err(e) => {
                tracing::debug!("QUIC send failed: {}", e);
                self.check_closed();
                Bytes::new()
            }
        }
    }

    fn bytes_received(&mut self, data: &[u8]) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        let mut buf = data.to_vec();
        let info = quiche::RecvInfo {
            from: self.peer,
            to: self.local,
        };
        match self.conn.recv(&mut buf, info) {
            Ok(_) | Err(quiche::Error::Done) => {}
            Err(e) => tracing::debug!("QUIC packet rejected: {}", e),
        }

        self.on_established()?;
        self.poll()?;
        self.flush_pending()?;
        self.check_closed();
        Ok(())
    }

    fn eof_received(&mut self) -> Result<()> {
        if !self.terminated {
            self.terminated = true;
            self.events.push(Event::ConnectionTerminated {
                error_code: 0,
                message: Some("connection closed".into()),
            });
        }
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

    fn should_wait_remote_flow_control(&self, stream_id: StreamId, amount: usize) -> bool {
        if self.pending.get(&stream_id).is_some_and(|q| !q.is_empty()) {
            return true;
        }
        match self.conn.stream_capacity(stream_id) {
            Ok(capacity) => capacity == 0 || capacity < amount.min(MAX_DATAGRAM_SIZE),
            Err(_) => false,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.conn.timeout()
    }

    fn on_timeout(&mut self) {
        self.conn.on_timeout();
        self.check_closed();
    }

    fn peer_certificates(&self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let leaf = self.conn.peer_cert()?.to_vec();
        let issuer = self
            .conn
            .peer_cert_chain()
            .and_then(|chain| chain.get(1).map(|c| c.to_vec()));
        Some((leaf, issuer))
    }

    fn session_ticket(&self) -> Option<Vec<u8>> {
        self.conn.session().map(<[u8]>::to_vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_pair() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:443".parse().unwrap(),
        )
    }

    fn insecure() -> QuicTlsConfig {
        QuicTlsConfig {
            insecure: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_datagram_is_padded() {
        let (local, peer) = local_pair();
        let mut proto = H3Protocol::connect(Some("example.com"), local, peer, &insecure()).unwrap();
        let first = proto.bytes_to_send();
        // Client Initial packets are padded to at least 1200 bytes.
        assert!(first.len() >= 1200);
        assert!(first.len() <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_requests_rejected_before_handshake() {
        let (local, peer) = local_pair();
        let mut proto = H3Protocol::connect(None, local, peer, &insecure()).unwrap();
        assert!(!proto.is_available());
        assert!(proto.get_available_stream_id().is_err());
        assert!(proto.submit_data(0, b"x", true).is_err());
        assert_eq!(proto.http_version(), HttpVersion::Http3);
        assert!(proto.multiplexed());
    }

    #[test]
    fn test_garbage_datagram_is_ignored() {
        let (local, peer) = local_pair();
        let mut proto = H3Protocol::connect(None, local, peer, &insecure()).unwrap();
        proto.bytes_to_send();
        proto.bytes_received(b"definitely not quic").unwrap();
        assert!(!proto.has_pending_event(None));
        assert!(proto.timeout().is_some());
    }

    #[test]
    fn test_eof_terminates_once() {
        let (local, peer) = local_pair();
        let mut proto = H3Protocol::connect(None, local, peer, &insecure()).unwrap();
        proto.eof_received().unwrap();
        proto.eof_received().unwrap();
        assert!(matches!(
            proto.next_event(None),
            Some(Event::ConnectionTerminated { .. })
        ));
        assert!(proto.next_event(None).is_none());
        assert!(proto.has_expired());
    }
}
