//! HTTP/2 frame types and binary serialization (RFC 9113 Section 4 and 6).
//!
//! Public so callers and tests can speak raw HTTP/2 to the adapter.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Frame header size (9 bytes per RFC 9113).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default maximum frame size (16KB per RFC 9113).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Largest SETTINGS_MAX_FRAME_SIZE a peer may announce.
pub const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;

/// Default initial flow-control window (RFC 9113 Section 6.9.2).
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Largest legal flow-control window.
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// HTTP/2 connection preface (client must send this first).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame type identifiers per RFC 9113.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        match ft {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1; // SETTINGS/PING
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// SETTINGS parameter identifiers.
pub mod settings {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// HTTP/2 error codes per RFC 9113 Section 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Map a wire value; unknown codes are `None`.
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => return None,
        })
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse a frame header. `None` if fewer than nine bytes are available.
    ///
    /// The reserved bit of the stream id is ignored on receipt.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fffffff;

        Some(Self {
            length,
            frame_type: FrameType::from(buf[3]),
            flags: buf[4],
            stream_id,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id & 0x7fffffff);
    }
}

fn write_frame(frame_type: FrameType, flags: u8, stream_id: u32, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    FrameHeader {
        length: payload.len() as u32,
        frame_type,
        flags,
        stream_id,
    }
    .serialize(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Strip padding from a PADDED payload.
fn unpad(flags: u8, mut payload: Bytes, frame: &str) -> Result<Bytes> {
    if flags & flags::PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(Error::protocol(format!("PADDED {} frame missing padding length", frame)));
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.len() {
        return Err(Error::protocol("Padding length exceeds payload size"));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}

/// SETTINGS frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsFrame {
    /// (id, value) pairs in wire order.
    pub settings: Vec<(u16, u32)>,
    pub ack: bool,
}

impl SettingsFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ack() -> Self {
        Self {
            settings: Vec::new(),
            ack: true,
        }
    }

    pub fn set(mut self, id: u16, value: u32) -> Self {
        self.settings.push((id, value));
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let mut payload = BytesMut::with_capacity(self.settings.len() * 6);
        if !self.ack {
            for (id, value) in &self.settings {
                payload.put_u16(*id);
                payload.put_u32(*value);
            }
        }
        let frame_flags = if self.ack { flags::ACK } else { 0 };
        write_frame(FrameType::Settings, frame_flags, 0, &payload)
    }

    pub fn parse(stream_id: u32, flags: u8, mut payload: Bytes) -> Result<Self> {
        if stream_id != 0 {
            return Err(Error::protocol("SETTINGS frame on a non-zero stream"));
        }
        let ack = flags & flags::ACK != 0;
        if payload.len() % 6 != 0 || (ack && !payload.is_empty()) {
            return Err(Error::protocol("SETTINGS frame with invalid length"));
        }
        let mut settings = Vec::with_capacity(payload.len() / 6);
        while payload.remaining() >= 6 {
            settings.push((payload.get_u16(), payload.get_u32()));
        }
        Ok(Self { settings, ack })
    }
}

/// WINDOW_UPDATE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, increment: u32) -> Self {
        Self {
            stream_id,
            increment,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        write_frame(
            FrameType::WindowUpdate,
            0,
            self.stream_id,
            &(self.increment & 0x7fffffff).to_be_bytes(),
        )
    }

    /// Parse from payload. A zero increment is returned as-is; the caller
    /// decides whether it is a stream or connection error.
    pub fn parse(stream_id: u32, mut payload: Bytes) -> Result<Self> {
        if payload.len() != 4 {
            return Err(Error::protocol("WINDOW_UPDATE frame with invalid length"));
        }
        Ok(Self {
            stream_id,
            increment: payload.get_u32() & 0x7fffffff,
        })
    }
}

/// HEADERS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, header_block: Bytes) -> Self {
        Self {
            stream_id,
            header_block,
            end_stream: false,
            end_headers: true,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    pub fn end_headers(mut self, end: bool) -> Self {
        self.end_headers = end;
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let mut frame_flags = 0u8;
        if self.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if self.end_headers {
            frame_flags |= flags::END_HEADERS;
        }
        write_frame(FrameType::Headers, frame_flags, self.stream_id, &self.header_block)
    }

    /// Parse, stripping padding and priority data.
    pub fn parse(stream_id: u32, flags: u8, payload: Bytes) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::protocol("HEADERS frame must have non-zero stream ID"));
        }
        let mut block = unpad(flags, payload, "HEADERS")?;
        if flags & flags::PRIORITY != 0 {
            if block.len() < 5 {
                return Err(Error::protocol(
                    "HEADERS frame with PRIORITY flag missing priority data",
                ));
            }
            block.advance(5);
        }
        Ok(Self {
            stream_id,
            header_block: block,
            end_stream: flags & flags::END_STREAM != 0,
            end_headers: flags & flags::END_HEADERS != 0,
        })
    }
}

/// CONTINUATION frame (RFC 9113 Section 6.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: u32,
    pub header_fragment: Bytes,
    pub end_headers: bool,
}

impl ContinuationFrame {
    pub fn new(stream_id: u32, header_fragment: Bytes, end_headers: bool) -> Self {
        Self {
            stream_id,
            header_fragment,
            end_headers,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let frame_flags = if self.end_headers { flags::END_HEADERS } else { 0 };
        write_frame(
            FrameType::Continuation,
            frame_flags,
            self.stream_id,
            &self.header_fragment,
        )
    }

    pub fn parse(stream_id: u32, flags: u8, payload: Bytes) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::protocol("CONTINUATION frame must have non-zero stream ID"));
        }
        Ok(Self {
            stream_id,
            header_fragment: payload,
            end_headers: flags & flags::END_HEADERS != 0,
        })
    }
}

/// DATA frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes) -> Self {
        Self {
            stream_id,
            data,
            end_stream: false,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let frame_flags = if self.end_stream { flags::END_STREAM } else { 0 };
        write_frame(FrameType::Data, frame_flags, self.stream_id, &self.data)
    }

    pub fn parse(stream_id: u32, flags: u8, payload: Bytes) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::protocol("DATA frame must have non-zero stream ID"));
        }
        Ok(Self {
            stream_id,
            data: unpad(flags, payload, "DATA")?,
            end_stream: flags & flags::END_STREAM != 0,
        })
    }
}

/// PING frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        Self { ack: false, data }
    }

    pub fn ack(data: [u8; 8]) -> Self {
        Self { ack: true, data }
    }

    pub fn serialize(&self) -> BytesMut {
        let frame_flags = if self.ack { flags::ACK } else { 0 };
        write_frame(FrameType::Ping, frame_flags, 0, &self.data)
    }

    pub fn parse(flags: u8, payload: &[u8]) -> Result<Self> {
        let data: [u8; 8] = payload
            .try_into()
            .map_err(|_| Error::protocol("PING frame with invalid length"))?;
        Ok(Self {
            ack: flags & flags::ACK != 0,
            data,
        })
    }
}

/// GOAWAY frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    pub last_stream_id: u32,
    /// Raw error code; see [`ErrorCode::from_u32`].
    pub error_code: u32,
    pub debug_data: Bytes,
}

impl GoAwayFrame {
    pub fn new(last_stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            last_stream_id,
            error_code: error_code as u32,
            debug_data: Bytes::new(),
        }
    }

    pub fn with_debug_data(mut self, data: impl Into<Bytes>) -> Self {
        self.debug_data = data.into();
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let mut payload = BytesMut::with_capacity(8 + self.debug_data.len());
        payload.put_u32(self.last_stream_id & 0x7fffffff);
        payload.put_u32(self.error_code);
        payload.extend_from_slice(&self.debug_data);
        write_frame(FrameType::GoAway, 0, 0, &payload)
    }

    pub fn parse(mut payload: Bytes) -> Result<Self> {
        if payload.len() < 8 {
            return Err(Error::protocol("GOAWAY frame payload too short"));
        }
        let last_stream_id = payload.get_u32() & 0x7fffffff;
        let error_code = payload.get_u32();
        Ok(Self {
            last_stream_id,
            error_code,
            debug_data: payload,
        })
    }
}

/// RST_STREAM frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: u32,
}

impl RstStreamFrame {
    pub fn new(stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            stream_id,
            error_code: error_code as u32,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        write_frame(
            FrameType::RstStream,
            0,
            self.stream_id,
            &self.error_code.to_be_bytes(),
        )
    }

    pub fn parse(stream_id: u32, mut payload: Bytes) -> Result<Self> {
        if stream_id == 0 {
            return Err(Error::protocol("RST_STREAM frame must have non-zero stream ID"));
        }
        if payload.len() != 4 {
            return Err(Error::protocol("RST_STREAM frame with invalid length"));
        }
        Ok(Self {
            stream_id,
            error_code: payload.get_u32(),
        })
    }
}
