//! RFC 9112 HTTP/1.1 state machine.
//!
//! Uses httparse for response heads. The connection carries one logical
//! stream ([`STREAM_ID`]); a new request may start once the previous
//! response has been fully received.

use bytes::{BufMut, Bytes, BytesMut};

use super::events::{Event, EventQueue};
use super::{HttpProtocol, StreamId};
use crate::error::{Error, Result};
use crate::headers::{self, HeaderField, HeaderList};
use crate::version::HttpVersion;

/// The single stream id used on HTTP/1.1 connections.
pub const STREAM_ID: StreamId = 1;

/// Maximum response header size (64KB).
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse.
const MAX_HEADERS_COUNT: usize = 100;

/// Error code attached to terminations caused by a malformed response head.
const MALFORMED_HEAD: u64 = 400;

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendFraming {
    /// No body (or the body is already complete).
    Closed,
    Length { remaining: u64 },
    Chunked,
    /// Raw bytes after a successful CONNECT.
    Tunnel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data { remaining: usize },
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    /// Waiting for (the rest of) a response head.
    Head,
    Length { expected: u64, received: u64 },
    Chunked(Chunk),
    UntilClose,
    /// CONNECT accepted; further bytes belong to the tunnel.
    Tunnel,
}

/// Sans-IO HTTP/1.1 client connection.
#[derive(Debug)]
pub struct H1Protocol {
    send_buf: BytesMut,
    recv_buf: BytesMut,
    events: EventQueue,
    framing: SendFraming,
    recv_state: RecvState,
    /// Method of the in-flight request, upper-case.
    method: Vec<u8>,
    in_flight: bool,
    keep_alive: bool,
    eof: bool,
    terminated: bool,
}

impl Default for H1Protocol {
    fn default() -> Self {
        Self::new()
    }
}

impl H1Protocol {
    pub fn new() -> Self {
        Self {
            send_buf: BytesMut::with_capacity(1024),
            recv_buf: BytesMut::new(),
            events: EventQueue::new(),
            framing: SendFraming::Closed,
            recv_state: RecvState::Head,
            method: Vec::new(),
            in_flight: false,
            keep_alive: true,
            eof: false,
            terminated: false,
        }
    }

    fn terminate(&mut self, error_code: u64, message: impl Into<String>) {
        let message = message.into();
        tracing::trace!(error_code, %message, "h1 connection terminated");
        self.terminated = true;
        self.keep_alive = false;
        self.events.push(Event::ConnectionTerminated {
            error_code,
            message: Some(message),
        });
    }

    fn response_complete(&mut self) {
        self.recv_state = RecvState::Head;
        self.in_flight = false;
    }

    /// Decode as much of `recv_buf` as possible.
    fn process(&mut self) {
        while !self.terminated {
            let progressed = match self.recv_state {
                RecvState::Head => self.process_head(),
                RecvState::Length { expected, received } => self.process_length(expected, received),
                RecvState::Chunked(chunk) => self.process_chunked(chunk),
                RecvState::UntilClose => {
                    if !self.recv_buf.is_empty() {
                        let data = self.recv_buf.split().freeze();
                        self.push_data(data, false);
                    }
                    false
                }
                RecvState::Tunnel => false,
            };
            if !progressed {
                break;
            }
        }
    }

    fn process_head(&mut self) -> bool {
        if self.recv_buf.is_empty() {
            return false;
        }
        let Some(header_end) = find_header_end(&self.recv_buf) else {
            if self.recv_buf.len() >= MAX_HEADERS_SIZE {
                self.terminate(MALFORMED_HEAD, "invalid response header: response head too large");
            }
            return false;
        };

        let mut parsed_headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
        let mut response = httparse::Response::new(&mut parsed_headers);
        let status = match response.parse(&self.recv_buf[..header_end]) {
            Ok(httparse::Status::Complete(_)) => response.code,
            Ok(httparse::Status::Partial) => None,
            Err(e) => {
                self.terminate(MALFORMED_HEAD, format!("invalid response header: {}", e));
                return false;
            }
        };
        let Some(status) = status else {
            self.terminate(MALFORMED_HEAD, "invalid response header: missing status line");
            return false;
        };
        let minor_version = response.version.unwrap_or(1);

        let mut header_list: HeaderList = Vec::with_capacity(response.headers.len() + 1);
        header_list.push((
            Bytes::from_static(b":status"),
            Bytes::from(status.to_string()),
        ));
        for header in response.headers.iter().filter(|h| !h.name.is_empty()) {
            header_list.push((
                headers::lowercase_name(header.name),
                Bytes::copy_from_slice(header.value),
            ));
        }
        let _ = self.recv_buf.split_to(header_end);

        // Interim responses carry nothing for the caller.
        if (100..200).contains(&status) && status != 101 {
            tracing::trace!(status, "h1 skipping interim response");
            return true;
        }

        let connection = headers::find(&header_list, b"connection")
            .map(|v| String::from_utf8_lossy(v).to_ascii_lowercase());
        match connection.as_deref() {
            Some(c) if c.contains("close") => self.keep_alive = false,
            Some(c) if minor_version == 0 && !c.contains("keep-alive") => self.keep_alive = false,
            None if minor_version == 0 => self.keep_alive = false,
            _ => {}
        }

        let is_head = self.method == b"HEAD";
        let is_connect = self.method == b"CONNECT";

        if is_connect && (200..300).contains(&status) {
            self.recv_state = RecvState::Tunnel;
            self.framing = SendFraming::Tunnel;
            self.events.push(Event::HeadersReceived {
                stream_id: STREAM_ID,
                headers: header_list,
                end_stream: false,
            });
            return false;
        }

        let next = if is_head || matches!(status, 101 | 204 | 304) {
            None
        } else if let Some(te) = headers::find(&header_list, b"transfer-encoding") {
            let chunked = String::from_utf8_lossy(te)
                .split(',')
                .next_back()
                .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
                .unwrap_or(false);
            if chunked {
                Some(RecvState::Chunked(Chunk::Size))
            } else {
                self.keep_alive = false;
                Some(RecvState::UntilClose)
            }
        } else if let Some(cl) = headers::find(&header_list, b"content-length") {
            match headers::parse_content_length(cl) {
                Some(0) => None,
                Some(expected) => Some(RecvState::Length {
                    expected,
                    received: 0,
                }),
                None => {
                    let value = String::from_utf8_lossy(cl).into_owned();
                    self.terminate(
                        MALFORMED_HEAD,
                        format!("invalid content-length header: {:?}", value),
                    );
                    return false;
                }
            }
        } else {
            self.keep_alive = false;
            Some(RecvState::UntilClose)
        };

        self.events.push(Event::HeadersReceived {
            stream_id: STREAM_ID,
            headers: header_list,
            end_stream: next.is_none(),
        });

        match next {
            Some(state) => self.recv_state = state,
            None => self.response_complete(),
        }
        true
    }

    fn process_length(&mut self, expected: u64, received: u64) -> bool {
        if self.recv_buf.is_empty() {
            return false;
        }
        let remaining = expected - received;
        let take = (remaining as usize).min(self.recv_buf.len());
        let data = self.recv_buf.split_to(take).freeze();
        let received = received + take as u64;
        let done = received == expected;

        self.push_data(data, done);
        if done {
            self.response_complete();
        } else {
            self.recv_state = RecvState::Length { expected, received };
        }
        done
    }

    fn process_chunked(&mut self, chunk: Chunk) -> bool {
        match chunk {
            Chunk::Size => {
                let Some(line_end) = find_crlf(&self.recv_buf) else {
                    return false;
                };
                let Some(size) = parse_chunk_size(&self.recv_buf[..line_end]) else {
                    let line = String::from_utf8_lossy(&self.recv_buf[..line_end]).into_owned();
                    self.terminate(0, format!("invalid chunk size line: {:?}", line));
                    return false;
                };
                let _ = self.recv_buf.split_to(line_end + 2);
                self.recv_state = RecvState::Chunked(if size == 0 {
                    Chunk::Trailers
                } else {
                    Chunk::Data { remaining: size }
                });
                true
            }
            Chunk::Data { remaining } => {
                if self.recv_buf.is_empty() {
                    return false;
                }
                let take = remaining.min(self.recv_buf.len());
                let data = self.recv_buf.split_to(take).freeze();
                self.push_data(data, false);
                self.recv_state = RecvState::Chunked(if take == remaining {
                    Chunk::DataEnd
                } else {
                    Chunk::Data {
                        remaining: remaining - take,
                    }
                });
                true
            }
            Chunk::DataEnd => {
                if self.recv_buf.len() < 2 {
                    return false;
                }
                if &self.recv_buf[..2] != b"\r\n" {
                    self.terminate(0, "chunk data not terminated by CRLF");
                    return false;
                }
                let _ = self.recv_buf.split_to(2);
                self.recv_state = RecvState::Chunked(Chunk::Size);
                true
            }
            Chunk::Trailers => {
                // Trailer fields are read and dropped.
                let Some(pos) = find_crlf(&self.recv_buf) else {
                    return false;
                };
                let _ = self.recv_buf.split_to(pos + 2);
                if pos == 0 {
                    self.push_data(Bytes::new(), true);
                    self.response_complete();
                }
                true
            }
        }
    }

    fn push_data(&mut self, data: Bytes, end_stream: bool) {
        self.events.push(Event::DataReceived {
            stream_id: STREAM_ID,
            data,
            end_stream,
        });
    }

    fn write_request_head(&mut self, header_list: &[HeaderField], end_stream: bool) -> Result<()> {
        let pseudo = |name: &[u8]| headers::find(header_list, name).cloned();
        let method = pseudo(b":method")
            .ok_or_else(|| Error::protocol("Request is missing the :method pseudo-header"))?;
        let authority = pseudo(b":authority");
        let path = pseudo(b":path").unwrap_or_else(|| Bytes::from_static(b"/"));

        let is_connect = method.as_ref() == b"CONNECT";
        let target = if is_connect {
            authority
                .clone()
                .ok_or_else(|| Error::protocol("CONNECT requires an authority"))?
        } else {
            path
        };

        let mut has_host = false;
        let mut content_length = None;
        let mut chunked = false;
        for (name, value) in header_list.iter().filter(|(n, _)| !headers::is_pseudo(n)) {
            headers::validate_header_name(name)?;
            headers::validate_header_value(value)?;
            match name.as_ref() {
                b"host" => has_host = true,
                b"content-length" => {
                    content_length = Some(headers::parse_content_length(value).ok_or_else(|| {
                        Error::protocol(format!(
                            "Invalid content-length: {}",
                            String::from_utf8_lossy(value)
                        ))
                    })?)
                }
                b"transfer-encoding" => {
                    chunked = String::from_utf8_lossy(value)
                        .to_ascii_lowercase()
                        .contains("chunked")
                }
                _ => {}
            }
        }

        let buf = &mut self.send_buf;
        buf.put_slice(&method);
        buf.put_u8(b' ');
        buf.put_slice(&target);
        buf.put_slice(b" HTTP/1.1\r\n");

        if !has_host {
            if let Some(authority) = authority.as_ref() {
                buf.put_slice(b"host: ");
                buf.put_slice(authority);
                buf.put_slice(b"\r\n");
            }
        }

        for (name, value) in header_list.iter().filter(|(n, _)| !headers::is_pseudo(n)) {
            buf.put_slice(name);
            buf.put_slice(b": ");
            buf.put_slice(value);
            buf.put_slice(b"\r\n");
        }

        self.framing = if end_stream {
            SendFraming::Closed
        } else if chunked {
            SendFraming::Chunked
        } else if let Some(remaining) = content_length {
            SendFraming::Length { remaining }
        } else {
            buf.put_slice(b"transfer-encoding: chunked\r\n");
            SendFraming::Chunked
        };
        buf.put_slice(b"\r\n");

        self.method = method.to_ascii_uppercase();
        Ok(())
    }
}

impl HttpProtocol for H1Protocol {
    fn http_version(&self) -> HttpVersion {
        HttpVersion::Http11
    }

    fn multiplexed(&self) -> bool {
        false
    }

    fn is_available(&self) -> bool {
        !self.in_flight && !self.has_expired()
    }

    fn has_expired(&self) -> bool {
        !self.keep_alive || self.terminated || self.eof
    }

    fn get_available_stream_id(&mut self) -> Result<StreamId> {
        if self.in_flight {
            return Err(Error::protocol(
                "HTTP/1.1 connection already has a request in flight",
            ));
        }
        if self.has_expired() {
            return Err(Error::protocol("HTTP/1.1 connection is no longer reusable"));
        }
        Ok(STREAM_ID)
    }

    fn submit_headers(
        &mut self,
        stream_id: StreamId,
        header_list: &[HeaderField],
        end_stream: bool,
    ) -> Result<()> {
        if stream_id != STREAM_ID {
            return Err(Error::protocol(format!(
                "HTTP/1.1 has a single stream, got stream {}",
                stream_id
            )));
        }
        self.write_request_head(header_list, end_stream)?;
        self.in_flight = true;
        self.recv_state = RecvState::Head;
        // A response may already be buffered (early answer).
        self.process();
        Ok(())
    }

    fn submit_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) -> Result<()> {
        if stream_id != STREAM_ID {
            return Err(Error::protocol(format!(
                "HTTP/1.1 has a single stream, got stream {}",
                stream_id
            )));
        }

        match self.framing {
            SendFraming::Closed => {
                return Err(Error::protocol("Cannot send data, the request body is complete"))
            }
            SendFraming::Tunnel => self.send_buf.put_slice(data),
            SendFraming::Chunked => {
                if !data.is_empty() {
                    self.send_buf.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
                    self.send_buf.put_slice(data);
                    self.send_buf.put_slice(b"\r\n");
                }
                if end_stream {
                    self.send_buf.put_slice(b"0\r\n\r\n");
                    self.framing = SendFraming::Closed;
                }
            }
            SendFraming::Length { remaining } => {
                let len = data.len() as u64;
                if len > remaining {
                    return Err(Error::protocol("Too much data for declared Content-Length"));
                }
                let remaining = remaining - len;
                if end_stream && remaining > 0 {
                    return Err(Error::protocol("Too little data for declared Content-Length"));
                }
                self.send_buf.put_slice(data);
                self.framing = if end_stream {
                    SendFraming::Closed
                } else {
                    SendFraming::Length { remaining }
                };
            }
        }
        Ok(())
    }

    fn submit_close(&mut self, _error_code: u64) -> Result<()> {
        self.keep_alive = false;
        Ok(())
    }

    fn bytes_to_send(&mut self) -> Bytes {
        self.send_buf.split().freeze()
    }

    fn bytes_received(&mut self, data: &[u8]) -> Result<()> {
        if self.terminated || self.eof {
            return Ok(());
        }
        self.recv_buf.extend_from_slice(data);
        self.process();
        Ok(())
    }

    fn eof_received(&mut self) -> Result<()> {
        if self.eof || self.terminated {
            self.events.push(Event::ConnectionTerminated {
                error_code: 0,
                message: Some("connection closed".into()),
            });
            return Ok(());
        }
        self.eof = true;

        match self.recv_state {
            RecvState::UntilClose => {
                self.push_data(Bytes::new(), true);
                self.response_complete();
            }
            RecvState::Length { expected, received } => self.terminate(
                0,
                format!(
                    "peer closed connection without sending complete message body (received {} bytes, expected {})",
                    received, expected
                ),
            ),
            RecvState::Chunked(_) => self.terminate(
                0,
                "peer closed connection without sending complete message body (incomplete chunked read)",
            ),
            RecvState::Head if self.in_flight && !self.recv_buf.is_empty() => {
                self.terminate(0, "peer closed connection before sending a complete response head")
            }
            RecvState::Head | RecvState::Tunnel => self.terminate(0, "connection closed"),
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

    fn should_wait_remote_flow_control(&self, _stream_id: StreamId, _amount: usize) -> bool {
        false
    }
}

/// Find the end of HTTP headers (\r\n\r\n).
fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Find the first CRLF in a buffer, returning its position.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Parse a chunk-size line, ignoring chunk extensions after `;`.
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next()?.trim();
    if size.is_empty() {
        return None;
    }
    usize::from_str_radix(size, 16).ok()
}
