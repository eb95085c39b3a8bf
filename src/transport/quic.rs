//! UDP transport for QUIC and the TLS settings handed to the QUIC stack.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use boring::ssl::{SslContextBuilder, SslMethod};

use super::connector::{load_client_certificate, load_trust_anchors};
use super::{Transport, TransportKind};
use crate::error::{Error, Result};

/// Max UDP payload size sent by the QUIC stack.
pub const MAX_DATAGRAM_SIZE: usize = 1350;

/// QUIC idle timeout (milliseconds).
const QUIC_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Initial max data for QUIC flow control.
const INITIAL_MAX_DATA: u64 = 10_000_000;

const INITIAL_MAX_STREAM_DATA: u64 = 1_000_000;

const INITIAL_MAX_STREAMS: u64 = 100;

/// TLS settings for the QUIC handshake.
///
/// Mirrors the TLS-over-TCP parameters, plus a session ticket from a prior
/// handshake for resumption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuicTlsConfig {
    /// Skip peer verification entirely.
    pub insecure: bool,
    pub cafile: Option<PathBuf>,
    pub capath: Option<PathBuf>,
    pub cadata: Option<Vec<u8>>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub keypassword: Option<String>,
    /// Hex digest pin of the leaf certificate.
    pub cert_fingerprint: Option<String>,
    pub verify_hostname: bool,
    /// Name to verify the certificate against instead of the host.
    pub assert_hostname: Option<String>,
    pub session_ticket: Option<Vec<u8>>,
}

impl QuicTlsConfig {
    /// Name given to the QUIC handshake for `host`, or `None` to skip
    /// hostname verification.
    pub fn server_name<'a>(&'a self, host: &'a str) -> Option<&'a str> {
        if self.insecure || !self.verify_hostname {
            return None;
        }
        Some(self.assert_hostname.as_deref().unwrap_or(host))
    }

    /// Build the quiche configuration, HTTP/3 ALPN included.
    pub fn build_quiche_config(&self) -> Result<quiche::Config> {
        let mut ssl_ctx_builder = SslContextBuilder::new(SslMethod::tls_client())
            .map_err(|e| Error::ssl(format!("Failed to create SSL context: {}", e)))?;

        if !self.insecure {
            load_trust_anchors(
                &mut ssl_ctx_builder,
                self.cafile.as_deref(),
                self.capath.as_deref(),
                self.cadata.as_deref(),
            )?;
        }

        if let Some(certfile) = self.certfile.as_deref() {
            load_client_certificate(
                &mut ssl_ctx_builder,
                certfile,
                self.keyfile.as_deref(),
                self.keypassword.as_deref(),
            )?;
        }

        let mut config =
            quiche::Config::with_boring_ssl_ctx_builder(quiche::PROTOCOL_VERSION, ssl_ctx_builder)
                .map_err(|e| Error::ssl(format!("Failed to create QUIC config: {}", e)))?;

        config.verify_peer(!self.insecure);
        config
            .set_application_protos(quiche::h3::APPLICATION_PROTOCOL)
            .map_err(|e| Error::ssl(format!("Failed to set ALPN: {}", e)))?;

        config.set_max_idle_timeout(QUIC_IDLE_TIMEOUT_MS);
        config.set_max_recv_udp_payload_size(65535);
        config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_initial_max_data(INITIAL_MAX_DATA);
        config.set_initial_max_stream_data_bidi_local(INITIAL_MAX_STREAM_DATA);
        config.set_initial_max_stream_data_bidi_remote(INITIAL_MAX_STREAM_DATA);
        config.set_initial_max_stream_data_uni(INITIAL_MAX_STREAM_DATA);
        config.set_initial_max_streams_bidi(INITIAL_MAX_STREAMS);
        config.set_initial_max_streams_uni(INITIAL_MAX_STREAMS);
        config.set_disable_active_migration(true);

        Ok(config)
    }
}

/// Connected UDP socket. One `recv` is one datagram.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    timeout: Option<Duration>,
}

impl UdpTransport {
    /// Wrap a connected socket. `timeout` bounds blocking `recv` calls.
    pub fn new(socket: UdpSocket, timeout: Option<Duration>) -> io::Result<Self> {
        socket.set_read_timeout(timeout)?;
        socket.set_write_timeout(timeout)?;
        Ok(Self { socket, timeout })
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.set_read_timeout(self.timeout)?;
        loop {
            match self.socket.recv(buf) {
                // Empty datagrams are legal but carry nothing for QUIC.
                Ok(0) => continue,
                other => return other,
            }
        }
    }

    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let timeout = match self.timeout {
            Some(limit) => timeout.min(limit),
            None => timeout,
        };
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        loop {
            match self.socket.recv(buf) {
                Ok(0) => continue,
                Ok(n) => return Ok(Some(n)),
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn sendall(&mut self, data: &[u8]) -> io::Result<()> {
        self.socket.send(data).map(|_| ())
    }

    fn close(&mut self) {}

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_selection() {
        let mut tls = QuicTlsConfig {
            verify_hostname: true,
            ..Default::default()
        };
        assert_eq!(tls.server_name("example.com"), Some("example.com"));

        tls.assert_hostname = Some("internal.example".into());
        assert_eq!(tls.server_name("example.com"), Some("internal.example"));

        tls.verify_hostname = false;
        assert_eq!(tls.server_name("example.com"), None);

        let insecure = QuicTlsConfig {
            insecure: true,
            verify_hostname: true,
            ..Default::default()
        };
        assert_eq!(insecure.server_name("example.com"), None);
    }

    #[test]
    fn test_build_quiche_config() {
        let tls = QuicTlsConfig {
            insecure: true,
            ..Default::default()
        };
        assert!(tls.build_quiche_config().is_ok());
    }

    #[test]
    fn test_udp_recv_timeout_elapses() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let socket = crate::transport::tcp::connect_udp(server.local_addr().unwrap(), None).unwrap();
        let mut transport = UdpTransport::new(socket, None).unwrap();

        let mut buf = [0u8; 64];
        let got = transport
            .recv_timeout(&mut buf, Duration::from_millis(20))
            .unwrap();
        assert!(got.is_none());

        transport.sendall(b"ping").unwrap();
        let (n, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.send_to(b"pong", from).unwrap();
        let got = transport
            .recv_timeout(&mut buf, Duration::from_secs(2))
            .unwrap();
        assert_eq!(got, Some(4));
        assert_eq!(&buf[..4], b"pong");
    }
}
