//! Byte transports underneath the protocol adapters.
//!
//! - TCP via socket2 (`tcp`)
//! - TLS over TCP via BoringSSL (`connector`)
//! - UDP datagrams for QUIC, plus the QUIC TLS settings (`quic`)

pub mod connector;
pub mod quic;
pub mod tcp;

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Kind of socket behind a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain TCP, may still be wrapped in TLS.
    Tcp,
    /// TLS over TCP, handshake done.
    Tls,
    /// Connected UDP socket carrying QUIC datagrams.
    Udp,
}

/// Facts about a completed TLS handshake.
#[derive(Debug, Clone, Default)]
pub struct TlsSessionInfo {
    pub alpn: Option<Vec<u8>>,
    pub cipher: Option<String>,
    /// Version string as reported by the TLS stack (`TLSv1.3`).
    pub version: Option<String>,
    pub peer_certificate: Option<Vec<u8>>,
    pub issuer_certificate: Option<Vec<u8>>,
}

/// A connected, blocking socket.
///
/// For UDP each `recv` yields one datagram and each `sendall` sends one.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Read into `buf`. `Ok(0)` means the peer closed the connection.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Read with an upper bound on the wait. `Ok(None)` when it elapsed.
    fn recv_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<Option<usize>> {
        self.recv(buf).map(Some)
    }

    fn sendall(&mut self, data: &[u8]) -> io::Result<()>;

    fn close(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Handshake details, for TLS transports.
    fn tls_session(&self) -> Option<TlsSessionInfo> {
        None
    }

    /// Give up the raw TCP stream so it can be wrapped in TLS.
    fn into_tcp_stream(self: Box<Self>) -> Option<TcpStream> {
        None
    }
}
