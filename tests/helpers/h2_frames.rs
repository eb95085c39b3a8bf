//! Server-side HTTP/2 frame builders for scripting an [`H2Protocol`] peer.
//!
//! [`H2Protocol`]: trident::protocol::h2::H2Protocol

use bytes::{Buf, Bytes};
use trident::protocol::h2::frame::{
    DataFrame, ErrorCode, FrameHeader, FrameType, GoAwayFrame, HeadersFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame, CONNECTION_PREFACE, FRAME_HEADER_SIZE,
};

pub struct H2Server {
    encoder: hpack::Encoder<'static>,
}

impl H2Server {
    pub fn new() -> Self {
        Self {
            encoder: hpack::Encoder::new(),
        }
    }

    pub fn settings(&self, values: &[(u16, u32)]) -> Vec<u8> {
        values
            .iter()
            .fold(SettingsFrame::new(), |frame, &(id, value)| frame.set(id, value))
            .serialize()
            .to_vec()
    }

    pub fn headers(&mut self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) -> Vec<u8> {
        let block = self
            .encoder
            .encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        HeadersFrame::new(stream_id, Bytes::from(block))
            .end_stream(end_stream)
            .serialize()
            .to_vec()
    }

    pub fn data(&self, stream_id: u32, body: &[u8], end_stream: bool) -> Vec<u8> {
        DataFrame::new(stream_id, Bytes::copy_from_slice(body))
            .end_stream(end_stream)
            .serialize()
            .to_vec()
    }

    pub fn window_update(&self, stream_id: u32, increment: u32) -> Vec<u8> {
        WindowUpdateFrame::new(stream_id, increment)
            .serialize()
            .to_vec()
    }

    pub fn rst_stream(&self, stream_id: u32, code: ErrorCode) -> Vec<u8> {
        RstStreamFrame::new(stream_id, code).serialize().to_vec()
    }

    pub fn goaway(&self, last_stream_id: u32, code: ErrorCode) -> Vec<u8> {
        GoAwayFrame::new(last_stream_id, code).serialize().to_vec()
    }
}

/// Split what the client wrote into frames, skipping the preface.
pub fn client_frames(bytes: &[u8]) -> Vec<(FrameHeader, Bytes)> {
    let mut buf = Bytes::copy_from_slice(bytes);
    if buf.starts_with(CONNECTION_PREFACE) {
        buf.advance(CONNECTION_PREFACE.len());
    }
    let mut frames = Vec::new();
    while let Some(header) = FrameHeader::parse(&buf) {
        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length as usize);
        frames.push((header, payload));
    }
    frames
}

/// Decoded request header blocks the client sent, in order.
pub fn client_header_blocks(bytes: &[u8]) -> Vec<Vec<(String, String)>> {
    let mut decoder = hpack::Decoder::new();
    client_frames(bytes)
        .into_iter()
        .filter(|(header, _)| header.frame_type == FrameType::Headers)
        .map(|(_, payload)| {
            decoder
                .decode(&payload)
                .unwrap()
                .into_iter()
                .map(|(n, v)| {
                    (
                        String::from_utf8(n).unwrap(),
                        String::from_utf8(v).unwrap(),
                    )
                })
                .collect()
        })
        .collect()
}

/// Body bytes the client sent on `stream_id`.
pub fn client_body(bytes: &[u8], stream_id: u32) -> Vec<u8> {
    client_frames(bytes)
        .into_iter()
        .filter(|(header, _)| header.frame_type == FrameType::Data && header.stream_id == stream_id)
        .flat_map(|(_, payload)| payload.to_vec())
        .collect()
}
