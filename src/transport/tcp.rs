//! Plain TCP transport and socket tuning.
//!
//! Socket options are applied through socket2 before connecting, so they are
//! in effect for the handshake itself.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::{Transport, TransportKind};

/// Socket-level options applied to every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
    pub keepalive: bool,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    /// IPv4 TTL.
    pub ttl: Option<u32>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: false,
            recv_buffer_size: None,
            send_buffer_size: None,
            ttl: None,
        }
    }
}

/// Apply `opts` to a not-yet-connected socket.
pub fn configure_tcp_socket(socket: &Socket, opts: &SocketOptions) -> io::Result<()> {
    socket.set_tcp_nodelay(opts.nodelay)?;
    socket.set_keepalive(opts.keepalive)?;

    if let Some(size) = opts.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = opts.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(ttl) = opts.ttl {
        // Not applicable to IPv6 sockets.
        let _ = socket.set_ttl_v4(ttl);
    }

    Ok(())
}

/// Resolution and establishment durations of a connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectTimings {
    pub resolution: Duration,
    pub established: Duration,
}

/// Resolve `host:port`, timing the lookup.
pub fn resolve(host: &str, port: u16) -> io::Result<(Vec<SocketAddr>, Duration)> {
    let started = Instant::now();
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {}:{}", host, port),
        ));
    }
    Ok((addrs, started.elapsed()))
}

/// Connect to the first reachable address.
pub fn connect_tcp(
    addrs: &[SocketAddr],
    source: Option<SocketAddr>,
    timeout: Option<Duration>,
    opts: &SocketOptions,
) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in addrs {
        match connect_one(*addr, source, timeout, opts) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::trace!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no address to connect to")
    }))
}

fn connect_one(
    addr: SocketAddr,
    source: Option<SocketAddr>,
    timeout: Option<Duration>,
    opts: &SocketOptions,
) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    configure_tcp_socket(&socket, opts)?;

    if let Some(source) = source {
        socket.bind(&SockAddr::from(source))?;
    }

    let target = SockAddr::from(addr);
    match timeout {
        Some(timeout) => socket.connect_timeout(&target, timeout)?,
        None => socket.connect(&target)?,
    }

    let stream: TcpStream = socket.into();
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    Ok(stream)
}

/// Bind a UDP socket suitable for reaching `peer` and connect it.
pub fn connect_udp(peer: SocketAddr, source: Option<SocketAddr>) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))?;

    let local = match (source, peer) {
        (Some(source), _) => source,
        (None, SocketAddr::V4(_)) => SocketAddr::from(([0, 0, 0, 0], 0)),
        (None, SocketAddr::V6(_)) => SocketAddr::from(([0u16; 8], 0)),
    };
    socket.bind(&SockAddr::from(local))?;
    socket.connect(&SockAddr::from(peer))?;

    Ok(socket.into())
}

/// Unencrypted TCP stream.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn sendall(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    fn into_tcp_stream(self: Box<Self>) -> Option<TcpStream> {
        Some(self.stream)
    }
}
