//! Response head handed back by `getresponse`, with an explicit body reader.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::backend::HttpConnection;
use crate::error::{Error, Result};
use crate::headers::HeaderField;
use crate::promise::ResponsePromise;
use crate::protocol::StreamId;
use crate::version::HttpVersion;

/// How much body to pull in one [`LowLevelResponse::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAmount {
    /// Everything until end of stream.
    All,
    /// At least this many bytes, fewer only at end of stream.
    Bytes(usize),
    /// Whatever the next data event carries.
    Available,
}

/// Status, headers and a lazily-read body for one stream.
///
/// The body is pulled from the connection that produced the response:
///
/// ```no_run
/// use trident::{ConnectionConfig, HttpConnection, ReadAmount};
///
/// let mut conn = HttpConnection::new(ConnectionConfig::new("example.com"));
/// let request = conn.putrequest("GET", "/", false, false);
/// let promise = conn.endheaders(request, false)?;
/// let mut response = conn.getresponse(promise.as_ref())?;
/// let body = response.read(&mut conn, ReadAmount::All)?;
/// # Ok::<(), trident::Error>(())
/// ```
#[derive(Debug)]
pub struct LowLevelResponse {
    pub method: String,
    pub status: u16,
    pub version: HttpVersion,
    pub reason: String,
    pub headers: HeaderMap,
    /// Host the request was addressed to.
    pub authority: String,
    pub port: u16,
    stream_id: StreamId,
    from_promise: ResponsePromise,
    /// Cleared once the stream reported end of stream.
    body_open: bool,
}

impl LowLevelResponse {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        from_promise: ResponsePromise,
        status: u16,
        version: HttpVersion,
        header_fields: &[HeaderField],
        authority: String,
        port: u16,
        eot: bool,
    ) -> Result<Self> {
        let mut headers = HeaderMap::with_capacity(header_fields.len());
        for (name, value) in header_fields {
            let name = HeaderName::from_bytes(name).map_err(|_| {
                Error::invalid_header(format!(
                    "malformed header name {:?}",
                    String::from_utf8_lossy(name)
                ))
            })?;
            let value = HeaderValue::from_bytes(value).map_err(|_| {
                Error::invalid_header(format!("malformed value for header '{}'", name))
            })?;
            headers.append(name, value);
        }

        let reason = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("Unknown")
            .to_string();

        Ok(Self {
            method: from_promise.method().to_string(),
            status,
            version,
            reason,
            headers,
            authority,
            port,
            stream_id: from_promise.stream_id(),
            from_promise,
            body_open: !eot,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// The promise this response resolved.
    pub fn from_promise(&self) -> &ResponsePromise {
        &self.from_promise
    }

    /// Whether the whole body has been received.
    pub fn is_eot(&self) -> bool {
        !self.body_open
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn get_headers(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// Pull body bytes from `conn`.
    ///
    /// Returns empty bytes once the body is exhausted. `ReadAmount::Bytes(0)`
    /// returns immediately without touching the socket.
    pub fn read(&mut self, conn: &mut HttpConnection, amt: ReadAmount) -> Result<Bytes> {
        if !self.body_open || amt == ReadAmount::Bytes(0) {
            return Ok(Bytes::new());
        }
        if conn.id() != self.from_promise.connection_id() {
            return Err(Error::state(
                "response body must be read from the connection that produced it",
            ));
        }

        match amt {
            ReadAmount::All => {
                let mut body = BytesMut::new();
                while self.body_open {
                    let (data, eot) = conn.read_stream(self.stream_id, ReadAmount::All)?;
                    body.extend_from_slice(&data);
                    self.body_open = !eot;
                }
                Ok(body.freeze())
            }
            amt => {
                let (data, eot) = conn.read_stream(self.stream_id, amt)?;
                self.body_open = !eot;
                Ok(data)
            }
        }
    }
}
