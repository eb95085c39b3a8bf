//! Sans-IO HTTP/2 client connection.
//!
//! Frames are parsed out of `recv_buf` as soon as they are complete; control
//! frames (SETTINGS, PING, WINDOW_UPDATE) are answered by queueing bytes in
//! `send_buf`. Request bodies are buffered per stream and released as the
//! peer opens its flow-control windows.

use std::collections::{HashMap, VecDeque};

use bytes::{Buf, Bytes, BytesMut};

use super::frame::{
    flags, settings, ContinuationFrame, DataFrame, ErrorCode, FrameHeader, FrameType, GoAwayFrame,
    HeadersFrame, PingFrame, RstStreamFrame, SettingsFrame, WindowUpdateFrame,
    CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE,
    MAX_ALLOWED_FRAME_SIZE, MAX_WINDOW_SIZE,
};
use crate::error::{Error, Result};
use crate::headers::{self, HeaderList};
use crate::protocol::events::{Event, EventQueue};
use crate::protocol::{HttpProtocol, StreamId};
use crate::version::HttpVersion;

/// Stream window we advertise in our SETTINGS.
const LOCAL_INITIAL_WINDOW_SIZE: u32 = 6_291_456;

/// Connection window bump sent right after the preface.
const CONNECTION_WINDOW_UPDATE: u32 = 15_663_105;

const LOCAL_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Largest header block we are willing to buffer across CONTINUATION frames.
const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// Peer's settings (received from server).
#[derive(Debug, Clone)]
struct PeerSettings {
    max_concurrent_streams: u32,
    initial_window_size: u32,
    max_frame_size: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug)]
struct Stream {
    send_window: i64,
    recv_window: i64,
    /// Body chunks waiting for window, with their END_STREAM flag.
    pending: VecDeque<(Bytes, bool)>,
    /// Response to a HEAD request: content-length describes nothing.
    head: bool,
    response_started: bool,
    expected_len: Option<u64>,
    received_len: u64,
    local_closed: bool,
    remote_closed: bool,
}

impl Stream {
    fn new(send_window: u32, head: bool, local_closed: bool) -> Self {
        Self {
            send_window: send_window as i64,
            recv_window: LOCAL_INITIAL_WINDOW_SIZE as i64,
            pending: VecDeque::new(),
            head,
            response_started: false,
            expected_len: None,
            received_len: 0,
            local_closed,
            remote_closed: false,
        }
    }

    fn is_closed(&self) -> bool {
        self.local_closed && self.remote_closed && self.pending.is_empty()
    }
}

/// Header block being reassembled from HEADERS + CONTINUATION.
#[derive(Debug)]
struct PartialHeaders {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
}

/// HTTP/2 client connection state machine.
pub struct H2Protocol {
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    send_buf: BytesMut,
    recv_buf: BytesMut,
    events: EventQueue,
    streams: HashMap<u32, Stream>,
    next_stream_id: u32,
    peer_settings: PeerSettings,
    settings_received: bool,
    conn_send_window: i64,
    conn_recv_window: i64,
    pending_headers: Option<PartialHeaders>,
    /// Peer sent GOAWAY: no new streams.
    expired: bool,
    terminated: bool,
}

impl std::fmt::Debug for H2Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Protocol")
            .field("streams", &self.streams.len())
            .field("next_stream_id", &self.next_stream_id)
            .field("peer_settings", &self.peer_settings)
            .field("conn_send_window", &self.conn_send_window)
            .field("expired", &self.expired)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl Default for H2Protocol {
    fn default() -> Self {
        Self::new()
    }
}

impl H2Protocol {
    /// New connection with the preface, our SETTINGS and a connection
    /// WINDOW_UPDATE already queued for sending.
    pub fn new() -> Self {
        let mut send_buf = BytesMut::with_capacity(128);
        send_buf.extend_from_slice(CONNECTION_PREFACE);
        send_buf.extend_from_slice(
            &SettingsFrame::new()
                .set(settings::ENABLE_PUSH, 0)
                .set(settings::INITIAL_WINDOW_SIZE, LOCAL_INITIAL_WINDOW_SIZE)
                .set(settings::MAX_CONCURRENT_STREAMS, LOCAL_MAX_CONCURRENT_STREAMS)
                .serialize(),
        );
        send_buf.extend_from_slice(&WindowUpdateFrame::new(0, CONNECTION_WINDOW_UPDATE).serialize());

        Self {
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            send_buf,
            recv_buf: BytesMut::with_capacity(16384),
            events: EventQueue::new(),
            streams: HashMap::new(),
            next_stream_id: 1,
            peer_settings: PeerSettings::default(),
            settings_received: false,
            conn_send_window: DEFAULT_INITIAL_WINDOW_SIZE as i64,
            conn_recv_window: (DEFAULT_INITIAL_WINDOW_SIZE + CONNECTION_WINDOW_UPDATE) as i64,
            pending_headers: None,
            expired: false,
            terminated: false,
        }
    }

    fn open_streams(&self) -> usize {
        self.streams.values().filter(|s| !s.is_closed()).count()
    }

    /// Highest stream id handed out so far (0 if none).
    fn last_stream_id(&self) -> u32 {
        self.next_stream_id.saturating_sub(2)
    }

    /// Fail the whole connection: GOAWAY out, ConnectionTerminated in.
    fn terminate(&mut self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(?code, %message, "h2 connection error");
        self.send_buf.extend_from_slice(
            &GoAwayFrame::new(0, code)
                .with_debug_data(Bytes::copy_from_slice(message.as_bytes()))
                .serialize(),
        );
        self.terminated = true;
        self.expired = true;
        self.pending_headers = None;
        self.events.push(Event::ConnectionTerminated {
            error_code: code as u64,
            message: Some(message),
        });
    }

    fn reset_stream(&mut self, stream_id: u32, code: ErrorCode) {
        self.send_buf
            .extend_from_slice(&RstStreamFrame::new(stream_id, code).serialize());
        self.streams.remove(&stream_id);
    }

    fn retire(&mut self, stream_id: u32) {
        if self.streams.get(&stream_id).is_some_and(Stream::is_closed) {
            self.streams.remove(&stream_id);
        }
    }

    /// Decode every complete frame sitting in `recv_buf`.
    fn process(&mut self) -> Result<()> {
        while !self.terminated {
            let Some(header) = FrameHeader::parse(&self.recv_buf) else {
                break;
            };
            if header.length > DEFAULT_MAX_FRAME_SIZE {
                self.terminate(
                    ErrorCode::FrameSizeError,
                    format!("frame of {} bytes exceeds SETTINGS_MAX_FRAME_SIZE", header.length),
                );
                break;
            }
            let total = FRAME_HEADER_SIZE + header.length as usize;
            if self.recv_buf.len() < total {
                break;
            }
            self.recv_buf.advance(FRAME_HEADER_SIZE);
            let payload = self.recv_buf.split_to(header.length as usize).freeze();

            match self.handle_frame(&header, payload) {
                Ok(()) => {}
                Err(Error::Protocol(message)) => {
                    self.terminate(ErrorCode::ProtocolError, message);
                    break;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, header: &FrameHeader, payload: Bytes) -> Result<()> {
        tracing::trace!(frame_type = ?header.frame_type, stream_id = header.stream_id, length = header.length, "h2 frame");

        if let Some(partial) = &self.pending_headers {
            if header.frame_type != FrameType::Continuation || header.stream_id != partial.stream_id {
                return Err(Error::protocol(format!(
                    "expected CONTINUATION for stream {}, got {:?} on stream {}",
                    partial.stream_id, header.frame_type, header.stream_id
                )));
            }
        }

        match header.frame_type {
            FrameType::Data => {
                let frame = DataFrame::parse(header.stream_id, header.flags, payload)?;
                self.on_data(frame, header.length)
            }
            FrameType::Headers => {
                let frame = HeadersFrame::parse(header.stream_id, header.flags, payload)?;
                if frame.end_headers {
                    self.on_header_block(frame.stream_id, frame.header_block, frame.end_stream)
                } else {
                    let mut block = BytesMut::with_capacity(frame.header_block.len() * 2);
                    block.extend_from_slice(&frame.header_block);
                    self.pending_headers = Some(PartialHeaders {
                        stream_id: frame.stream_id,
                        block,
                        end_stream: frame.end_stream,
                    });
                    Ok(())
                }
            }
            FrameType::Continuation => {
                let frame = ContinuationFrame::parse(header.stream_id, header.flags, payload)?;
                let Some(mut partial) = self.pending_headers.take() else {
                    return Err(Error::protocol("CONTINUATION without a preceding HEADERS"));
                };
                partial.block.extend_from_slice(&frame.header_fragment);
                if partial.block.len() > MAX_HEADER_BLOCK_SIZE {
                    self.terminate(ErrorCode::EnhanceYourCalm, "header block too large");
                    return Ok(());
                }
                if frame.end_headers {
                    self.on_header_block(partial.stream_id, partial.block.freeze(), partial.end_stream)
                } else {
                    self.pending_headers = Some(partial);
                    Ok(())
                }
            }
            FrameType::RstStream => {
                let frame = RstStreamFrame::parse(header.stream_id, payload)?;
                if self.streams.remove(&frame.stream_id).is_some() {
                    self.events.push(Event::StreamResetReceived {
                        stream_id: frame.stream_id as StreamId,
                        error_code: frame.error_code as u64,
                    });
                }
                Ok(())
            }
            FrameType::Settings => {
                let frame = SettingsFrame::parse(header.stream_id, header.flags, payload)?;
                if !frame.ack {
                    self.on_settings(&frame);
                }
                Ok(())
            }
            FrameType::PushPromise => {
                self.terminate(
                    ErrorCode::ProtocolError,
                    "received PUSH_PROMISE while push is disabled",
                );
                Ok(())
            }
            FrameType::Ping => {
                let ping = PingFrame::parse(header.flags, &payload)?;
                if !ping.ack {
                    self.send_buf
                        .extend_from_slice(&PingFrame::ack(ping.data).serialize());
                }
                Ok(())
            }
            FrameType::GoAway => {
                if header.stream_id != 0 {
                    return Err(Error::protocol("GOAWAY frame on a non-zero stream"));
                }
                let frame = GoAwayFrame::parse(payload)?;
                self.on_goaway(frame);
                Ok(())
            }
            FrameType::WindowUpdate => {
                let frame = WindowUpdateFrame::parse(header.stream_id, payload)?;
                self.on_window_update(frame);
                Ok(())
            }
            // PRIORITY is advisory; unknown frame types must be ignored.
            FrameType::Priority | FrameType::Unknown(_) => Ok(()),
        }
    }

    fn on_settings(&mut self, frame: &SettingsFrame) {
        for &(id, value) in &frame.settings {
            match id {
                settings::MAX_CONCURRENT_STREAMS => {
                    self.peer_settings.max_concurrent_streams = value;
                }
                settings::INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        self.terminate(
                            ErrorCode::FlowControlError,
                            format!("SETTINGS_INITIAL_WINDOW_SIZE {} exceeds 2^31-1", value),
                        );
                        return;
                    }
                    let delta = value as i64 - self.peer_settings.initial_window_size as i64;
                    self.peer_settings.initial_window_size = value;
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                settings::MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&value) {
                        tracing::warn!(value, "ignoring invalid SETTINGS_MAX_FRAME_SIZE");
                        continue;
                    }
                    self.peer_settings.max_frame_size = value;
                }
                // Header table size is left at the default the encoder assumes.
                _ => {}
            }
        }

        self.send_buf.extend_from_slice(&SettingsFrame::ack().serialize());

        if !self.settings_received {
            self.settings_received = true;
            self.events.push(Event::HandshakeCompleted {
                alpn: Some(HttpVersion::Http2.alpn().to_string()),
            });
        }

        self.flush_all();
    }

    fn on_goaway(&mut self, frame: GoAwayFrame) {
        self.expired = true;

        if frame.error_code != ErrorCode::NoError as u32 {
            let message = if frame.debug_data.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(&frame.debug_data).into_owned())
            };
            tracing::debug!(code = frame.error_code, ?message, "h2 GOAWAY with error");
            self.terminated = true;
            self.events.push(Event::ConnectionTerminated {
                error_code: frame.error_code as u64,
                message,
            });
            return;
        }

        tracing::debug!(last_stream_id = frame.last_stream_id, "h2 graceful GOAWAY");
        let mut refused: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|id| *id > frame.last_stream_id)
            .collect();
        refused.sort_unstable();
        for stream_id in refused {
            self.streams.remove(&stream_id);
            self.events.push(Event::StreamResetReceived {
                stream_id: stream_id as StreamId,
                error_code: ErrorCode::RefusedStream as u64,
            });
        }
    }

    fn on_window_update(&mut self, frame: WindowUpdateFrame) {
        if frame.increment == 0 {
            if frame.stream_id == 0 {
                self.terminate(ErrorCode::ProtocolError, "WINDOW_UPDATE with zero increment");
            } else if self.streams.contains_key(&frame.stream_id) {
                self.reset_stream(frame.stream_id, ErrorCode::ProtocolError);
                self.events.push(Event::StreamResetReceived {
                    stream_id: frame.stream_id as StreamId,
                    error_code: ErrorCode::ProtocolError as u64,
                });
            }
            return;
        }

        let increment = frame.increment as i64;
        if frame.stream_id == 0 {
            if self.conn_send_window + increment > MAX_WINDOW_SIZE as i64 {
                self.terminate(ErrorCode::FlowControlError, "connection window overflow");
                return;
            }
            self.conn_send_window += increment;
            self.flush_all();
        } else if let Some(stream) = self.streams.get_mut(&frame.stream_id) {
            if stream.send_window + increment > MAX_WINDOW_SIZE as i64 {
                self.reset_stream(frame.stream_id, ErrorCode::FlowControlError);
                self.events.push(Event::StreamResetReceived {
                    stream_id: frame.stream_id as StreamId,
                    error_code: ErrorCode::FlowControlError as u64,
                });
                return;
            }
            stream.send_window += increment;
            self.flush_stream(frame.stream_id);
        }
    }

    fn on_data(&mut self, frame: DataFrame, flow_len: u32) -> Result<()> {
        let flow_len = flow_len as i64;
        self.conn_recv_window -= flow_len;
        if self.conn_recv_window < 0 {
            self.terminate(ErrorCode::FlowControlError, "peer overran the connection window");
            return Ok(());
        }
        let conn_target = (DEFAULT_INITIAL_WINDOW_SIZE + CONNECTION_WINDOW_UPDATE) as i64;
        if self.conn_recv_window < conn_target / 2 {
            let increment = conn_target - self.conn_recv_window;
            self.send_buf
                .extend_from_slice(&WindowUpdateFrame::new(0, increment as u32).serialize());
            self.conn_recv_window += increment;
        }

        let stream_id = frame.stream_id;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            if stream_id > self.last_stream_id() {
                return Err(Error::protocol(format!("DATA on idle stream {}", stream_id)));
            }
            self.send_buf
                .extend_from_slice(&RstStreamFrame::new(stream_id, ErrorCode::StreamClosed).serialize());
            return Ok(());
        };

        if stream.remote_closed || !stream.response_started {
            return Err(Error::protocol(format!(
                "DATA received on stream {} outside of a response body",
                stream_id
            )));
        }

        stream.recv_window -= flow_len;
        if stream.recv_window < 0 {
            self.reset_stream(stream_id, ErrorCode::FlowControlError);
            self.events.push(Event::StreamResetReceived {
                stream_id: stream_id as StreamId,
                error_code: ErrorCode::FlowControlError as u64,
            });
            return Ok(());
        }
        if !frame.end_stream && stream.recv_window < LOCAL_INITIAL_WINDOW_SIZE as i64 / 2 {
            let increment = LOCAL_INITIAL_WINDOW_SIZE as i64 - stream.recv_window;
            stream.recv_window += increment;
            self.send_buf.extend_from_slice(
                &WindowUpdateFrame::new(stream_id, increment as u32).serialize(),
            );
        }

        stream.received_len += frame.data.len() as u64;
        if frame.end_stream {
            stream.remote_closed = true;
            if let Some(expected) = stream.expected_len {
                if expected != stream.received_len {
                    return Err(Error::IncompleteRead {
                        partial: stream.received_len,
                        expected,
                    });
                }
            }
        }

        self.events.push(Event::DataReceived {
            stream_id: stream_id as StreamId,
            data: frame.data,
            end_stream: frame.end_stream,
        });
        if frame.end_stream {
            self.retire(stream_id);
        }
        Ok(())
    }

    fn on_header_block(&mut self, stream_id: u32, block: Bytes, end_stream: bool) -> Result<()> {
        let decoded = match self.decoder.decode(&block) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.terminate(
                    ErrorCode::CompressionError,
                    format!("HPACK decoding failed: {:?}", e),
                );
                return Ok(());
            }
        };

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            if stream_id > self.last_stream_id() || stream_id % 2 == 0 {
                return Err(Error::protocol(format!("HEADERS on idle stream {}", stream_id)));
            }
            // Late headers for a stream we already reset.
            return Ok(());
        };
        if stream.remote_closed {
            return Err(Error::protocol(format!(
                "HEADERS received on half-closed stream {}",
                stream_id
            )));
        }

        let header_list: HeaderList = decoded
            .into_iter()
            .map(|(name, value)| (Bytes::from(name), Bytes::from(value)))
            .collect();

        if stream.response_started {
            // Trailers: only their end-of-stream matters to callers.
            if !end_stream {
                return Err(Error::protocol(format!(
                    "trailers on stream {} without END_STREAM",
                    stream_id
                )));
            }
            stream.remote_closed = true;
            self.events.push(Event::DataReceived {
                stream_id: stream_id as StreamId,
                data: Bytes::new(),
                end_stream: true,
            });
            self.retire(stream_id);
            return Ok(());
        }

        let status = match headers::find(&header_list, b":status") {
            Some(status) if status.len() == 3 && status.iter().all(u8::is_ascii_digit) => {
                status.clone()
            }
            Some(status) => {
                return Err(Error::protocol(format!(
                    "invalid :status value '{}'",
                    String::from_utf8_lossy(status)
                )))
            }
            None => return Err(Error::protocol("response header block without :status")),
        };

        // Interim (1xx) responses carry nothing the caller waits for.
        if status[0] == b'1' {
            if end_stream {
                return Err(Error::protocol("informational response with END_STREAM"));
            }
            return Ok(());
        }

        if !stream.head && status.as_ref() != b"204" && status.as_ref() != b"304" {
            if let Some(value) = headers::find(&header_list, b"content-length") {
                match headers::parse_content_length(value) {
                    Some(len) => stream.expected_len = Some(len),
                    None => {
                        return Err(Error::protocol(format!(
                            "invalid content-length header: {}",
                            String::from_utf8_lossy(value)
                        )))
                    }
                }
            }
        }

        stream.response_started = true;
        if end_stream {
            stream.remote_closed = true;
            if let Some(expected) = stream.expected_len.filter(|len| *len > 0) {
                return Err(Error::IncompleteRead {
                    partial: 0,
                    expected,
                });
            }
        }

        self.events.push(Event::HeadersReceived {
            stream_id: stream_id as StreamId,
            headers: headers::pseudo_first(&header_list),
            end_stream,
        });
        if end_stream {
            self.retire(stream_id);
        }
        Ok(())
    }

    /// Release buffered body bytes of `stream_id` that fit the windows.
    fn flush_stream(&mut self, stream_id: u32) {
        let max_frame = self.peer_settings.max_frame_size as i64;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };

        while let Some((data, end_stream)) = stream.pending.pop_front() {
            if data.is_empty() {
                self.send_buf.extend_from_slice(
                    &DataFrame::new(stream_id, data).end_stream(end_stream).serialize(),
                );
                continue;
            }

            let window = self.conn_send_window.min(stream.send_window).min(max_frame);
            if window <= 0 {
                stream.pending.push_front((data, end_stream));
                break;
            }

            let len = data.len().min(window as usize);
            let mut data = data;
            let chunk = data.split_to(len);
            let last = data.is_empty();
            self.send_buf.extend_from_slice(
                &DataFrame::new(stream_id, chunk)
                    .end_stream(last && end_stream)
                    .serialize(),
            );
            self.conn_send_window -= len as i64;
            stream.send_window -= len as i64;

            if !last {
                stream.pending.push_front((data, end_stream));
            }
        }

        self.retire(stream_id);
    }

    fn flush_all(&mut self) {
        let mut ids: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| !s.pending.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        for stream_id in ids {
            self.flush_stream(stream_id);
        }
    }

    fn stream_id_u32(stream_id: StreamId) -> Result<u32> {
        u32::try_from(stream_id)
            .ok()
            .filter(|id| *id != 0 && *id <= MAX_WINDOW_SIZE)
            .ok_or_else(|| Error::protocol(format!("invalid HTTP/2 stream id {}", stream_id)))
    }
}

impl HttpProtocol for H2Protocol {
    fn http_version(&self) -> HttpVersion {
        HttpVersion::Http2
    }

    fn is_available(&self) -> bool {
        !self.has_expired()
            && self.next_stream_id <= MAX_WINDOW_SIZE
            && (self.open_streams() as u64) < self.peer_settings.max_concurrent_streams as u64
    }

    fn has_expired(&self) -> bool {
        self.expired || self.terminated
    }

    fn get_available_stream_id(&mut self) -> Result<StreamId> {
        if self.has_expired() {
            return Err(Error::protocol("HTTP/2 connection no longer accepts new streams"));
        }
        if self.next_stream_id > MAX_WINDOW_SIZE {
            return Err(Error::protocol("HTTP/2 stream ids exhausted"));
        }
        if self.open_streams() as u64 >= self.peer_settings.max_concurrent_streams as u64 {
            return Err(Error::protocol(format!(
                "peer allows at most {} concurrent streams",
                self.peer_settings.max_concurrent_streams
            )));
        }
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        Ok(stream_id as StreamId)
    }

    fn submit_headers(
        &mut self,
        stream_id: StreamId,
        header_list: &[headers::HeaderField],
        end_stream: bool,
    ) -> Result<()> {
        let id = Self::stream_id_u32(stream_id)?;
        if id % 2 == 0 || id > self.last_stream_id() {
            return Err(Error::protocol(format!("stream {} was not allocated", stream_id)));
        }
        if self.streams.contains_key(&id) {
            return Err(Error::protocol(format!("stream {} already has headers", stream_id)));
        }
        if self.terminated {
            return Err(Error::protocol("HTTP/2 connection was terminated"));
        }

        let ordered: HeaderList = headers::pseudo_first(header_list)
            .into_iter()
            .map(|(name, value)| {
                let name = if name.iter().any(u8::is_ascii_uppercase) {
                    Bytes::from(name.to_ascii_lowercase())
                } else {
                    name
                };
                (name, value)
            })
            .collect();
        let head = headers::find(&ordered, b":method").is_some_and(|m| m.as_ref() == b"HEAD");

        let mut block = Bytes::from(
            self.encoder
                .encode(ordered.iter().map(|(n, v)| (n.as_ref(), v.as_ref()))),
        );

        let max_frame = self.peer_settings.max_frame_size as usize;
        let first = block.split_to(block.len().min(max_frame));
        self.send_buf.extend_from_slice(
            &HeadersFrame::new(id, first)
                .end_stream(end_stream)
                .end_headers(block.is_empty())
                .serialize(),
        );
        while !block.is_empty() {
            let fragment = block.split_to(block.len().min(max_frame));
            self.send_buf.extend_from_slice(
                &ContinuationFrame::new(id, fragment, block.is_empty()).serialize(),
            );
        }

        tracing::trace!(stream_id, end_stream, "h2 request headers queued");
        self.streams.insert(
            id,
            Stream::new(self.peer_settings.initial_window_size, head, end_stream),
        );
        Ok(())
    }

    fn submit_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) -> Result<()> {
        let id = Self::stream_id_u32(stream_id)?;
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(Error::protocol(format!("stream {} is closed", stream_id)));
        };
        if stream.local_closed {
            return Err(Error::protocol(format!(
                "stream {} already sent END_STREAM",
                stream_id
            )));
        }
        if data.is_empty() && !end_stream {
            return Ok(());
        }
        stream
            .pending
            .push_back((Bytes::copy_from_slice(data), end_stream));
        stream.local_closed = end_stream;
        self.flush_stream(id);
        Ok(())
    }

    fn submit_close(&mut self, error_code: u64) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        let code = ErrorCode::from_u32(error_code as u32).unwrap_or(ErrorCode::NoError);
        self.send_buf
            .extend_from_slice(&GoAwayFrame::new(0, code).serialize());
        self.expired = true;
        Ok(())
    }

    fn bytes_to_send(&mut self) -> Bytes {
        self.send_buf.split().freeze()
    }

    fn bytes_received(&mut self, data: &[u8]) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.recv_buf.extend_from_slice(data);
        self.process()
    }

    fn eof_received(&mut self) -> Result<()> {
        let was_terminated = self.terminated;
        self.terminated = true;
        self.expired = true;
        if !was_terminated {
            self.events.push(Event::ConnectionTerminated {
                error_code: ErrorCode::NoError as u64,
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
        let Some(stream) = u32::try_from(stream_id)
            .ok()
            .and_then(|id| self.streams.get(&id))
        else {
            return false;
        };
        if !stream.pending.is_empty() {
            return true;
        }
        let window = self.conn_send_window.min(stream.send_window);
        let wanted = amount.min(self.peer_settings.max_frame_size as usize) as i64;
        window <= 0 || window < wanted
    }
}
