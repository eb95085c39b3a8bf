//! HTTP version negotiated on a connection.

/// Wire protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HttpVersion {
    /// HTTP/1.1 over TCP (optionally TLS).
    Http11,
    /// HTTP/2 over TLS, negotiated with ALPN `h2`.
    Http2,
    /// HTTP/3 over QUIC.
    Http3,
}

impl HttpVersion {
    /// Get human-readable version string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http11 => "HTTP/1.1",
            Self::Http2 => "HTTP/2",
            Self::Http3 => "HTTP/3",
        }
    }

    /// ALPN protocol identifier.
    pub fn alpn(&self) -> &'static str {
        match self {
            Self::Http11 => "http/1.1",
            Self::Http2 => "h2",
            Self::Http3 => "h3",
        }
    }

    /// Map an ALPN identifier selected over TLS/TCP.
    ///
    /// A missing ALPN means HTTP/1.1. `h3` is never negotiated over TCP.
    pub fn from_tcp_alpn(alpn: Option<&[u8]>) -> Option<Self> {
        match alpn {
            None | Some(b"http/1.1") => Some(Self::Http11),
            Some(b"h2") => Some(Self::Http2),
            Some(_) => None,
        }
    }

    /// Numeric form (11, 20, 30) used by status-line style consumers.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Http11 => 11,
            Self::Http2 => 20,
            Self::Http3 => 30,
        }
    }

    /// Check if this version supports multiplexing.
    pub fn supports_multiplexing(&self) -> bool {
        !matches!(self, Self::Http11)
    }
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
