//! Error types for the trident crate.

use std::io;

use crate::promise::ResponsePromise;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a connection.
///
/// Once any variant other than [`Error::EarlyResponse`] is returned the
/// connection should be considered unusable: call
/// [`HttpConnection::close`](crate::HttpConnection::close) and open a new one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wire-level violation or a translated state-machine failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Body shorter than what the peer declared.
    #[error("incomplete read: received {partial} bytes, expected {expected}")]
    IncompleteRead { partial: u64, expected: u64 },

    /// Malformed header rejected while parsing the peer's response.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// TLS failure, including certificate verification over QUIC.
    #[error("TLS error: {0}")]
    Ssl(String),

    /// A response was requested before any request was sent.
    #[error("response not ready")]
    ResponseNotReady,

    /// The peer answered before the request body was fully sent.
    ///
    /// Not a failure: the carried promise can be handed to `getresponse`.
    #[error("response available before the request body was fully sent (stream {})", .0.stream_id())]
    EarlyResponse(ResponsePromise),

    /// The socket broke while sending; the response may still be readable.
    #[error("broken pipe while sending on stream {}: {source}", .promise.stream_id())]
    BrokenPipe {
        promise: ResponsePromise,
        #[source]
        source: io::Error,
    },

    /// The proxy refused the CONNECT tunnel.
    #[error("Tunnel connection failed: {} {reason}", .status.map(|s| s.to_string()).unwrap_or_else(|| "None".into()))]
    TunnelRefused { status: Option<u16>, reason: String },

    /// Feature intentionally not supported.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Operation invalid in the connection's current state.
    #[error("invalid connection state: {0}")]
    State(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create an invalid header error.
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader(message.into())
    }

    /// Create a TLS error.
    pub fn ssl(message: impl Into<String>) -> Self {
        Self::Ssl(message.into())
    }

    /// Create a state error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Promise attached to an early response or broken pipe.
    pub fn promise(&self) -> Option<&ResponsePromise> {
        match self {
            Self::EarlyResponse(promise) | Self::BrokenPipe { promise, .. } => Some(promise),
            _ => None,
        }
    }

    /// Consume the error, returning its promise if it carries one.
    pub fn into_promise(self) -> Option<ResponsePromise> {
        match self {
            Self::EarlyResponse(promise) | Self::BrokenPipe { promise, .. } => Some(promise),
            _ => None,
        }
    }
}

impl From<boring::error::ErrorStack> for Error {
    fn from(e: boring::error::ErrorStack) -> Self {
        Self::Ssl(e.to_string())
    }
}
