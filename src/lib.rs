//! # Trident
//!
//! Blocking HTTP connection engine speaking HTTP/1.1, HTTP/2 and HTTP/3.
//!
//! One [`HttpConnection`] owns one socket. The HTTP version is chosen by ALPN
//! over TLS, or by a previous `Alt-Svc: h3=...` announcement which moves the
//! connection to QUIC. Requests go through the same calls whatever the
//! version: `putrequest`, `putheader`, `endheaders`, `send`, `getresponse`.
//!
//! ```no_run
//! use trident::{ConnectionConfig, HttpConnection, ReadAmount};
//!
//! let mut conn = HttpConnection::new(ConnectionConfig::new("example.com").https());
//! let request = conn
//!     .putrequest("GET", "/", false, false)
//!     .header("user-agent", "trident");
//! let promise = conn.endheaders(request, false)?;
//! let mut response = conn.getresponse(promise.as_ref())?;
//! println!("{} {}", response.status, response.reason);
//! let body = response.read(&mut conn, ReadAmount::All)?;
//! # Ok::<(), trident::Error>(())
//! ```

// Core types
pub mod config;
pub mod conn_info;
pub mod error;
pub mod headers;
pub mod promise;
pub mod response;
pub mod version;

// Sans-IO HTTP/1.1, HTTP/2 and HTTP/3 state machines
pub mod protocol;

// Sockets, TLS and QUIC settings
pub mod transport;

// State shared across connections (Alt-Svc / QUIC cache)
pub mod pool;

// The connection engine
pub mod backend;

// Re-exports
pub use backend::{HttpConnection, PendingRequest};
pub use config::{AssertHostname, CertRequirement, ConnectionConfig, Scheme, TlsConfig};
pub use conn_info::{CertificateInfo, ConnectionInfo, TlsVersion};
pub use error::{Error, Result};
pub use pool::{AltSvcCache, QuicPreemptiveCache};
pub use promise::ResponsePromise;
pub use protocol::{Event, EventKind, HttpProtocol, StreamId};
pub use response::{LowLevelResponse, ReadAmount};
pub use transport::quic::QuicTlsConfig;
pub use transport::Transport;
pub use version::HttpVersion;
