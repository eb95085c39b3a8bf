//! Request submission: head, then optional body chunks.

use std::time::Instant;

use bytes::Bytes;

use super::exchange::{self, flush, is_broken_pipe};
use super::{HttpConnection, Upload};
use crate::error::{Error, Result};
use crate::headers::{self, HeaderField, HeaderList};
use crate::promise::ResponsePromise;
use crate::protocol::{Event, HttpProtocol, StreamId};
use crate::version::HttpVersion;

/// Request head under construction, from `putrequest` to `endheaders`.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    headers: HeaderList,
    started: Instant,
}

impl PendingRequest {
    /// Add one field per value. Names are lower-cased; no values adds nothing.
    pub fn putheader(&mut self, name: &str, values: &[&str]) {
        let name = headers::lowercase_name(name);
        for value in values {
            self.headers
                .push((name.clone(), Bytes::copy_from_slice(value.as_bytes())));
        }
    }

    /// Builder form of [`putheader`](Self::putheader) for a single value.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.putheader(name, &[value]);
        self
    }

    /// Fields gathered so far, pseudo-headers first.
    pub fn headers(&self) -> &[HeaderField] {
        &self.headers
    }
}

/// Drop fields that only mean something on the HTTP/1.1 wire.
fn filter_for_version(headers: HeaderList, version: Option<HttpVersion>) -> HeaderList {
    if version == Some(HttpVersion::Http11) {
        return headers;
    }
    headers
        .into_iter()
        .filter(|(name, value)| match name.as_ref() {
            b"transfer-encoding" => false,
            b"connection" => !value.eq_ignore_ascii_case(b"keep-alive"),
            _ => true,
        })
        .collect()
}

impl HttpConnection {
    /// Start a request.
    ///
    /// `:authority` comes from the tunnel target when one is set, with the
    /// port only when it is not the scheme default.
    pub fn putrequest(
        &mut self,
        method: &str,
        url: &str,
        skip_host: bool,
        skip_accept_encoding: bool,
    ) -> PendingRequest {
        self.upload = None;

        let (host, port) = match &self.tunnel {
            Some(target) => (target.host.as_str(), target.port),
            None => (self.config.host.as_str(), self.port),
        };

        let mut headers: HeaderList = vec![
            (Bytes::from_static(b":method"), Bytes::copy_from_slice(method.as_bytes())),
            (
                Bytes::from_static(b":scheme"),
                Bytes::from_static(self.config.scheme.as_str().as_bytes()),
            ),
            (Bytes::from_static(b":path"), Bytes::copy_from_slice(url.as_bytes())),
        ];

        if !skip_host {
            let authority = if port == self.config.scheme.default_port() {
                host.to_string()
            } else {
                format!("{}:{}", host, port)
            };
            headers.push((Bytes::from_static(b":authority"), Bytes::from(authority)));
        }

        if !skip_accept_encoding {
            headers.push((
                Bytes::from_static(b"accept-encoding"),
                Bytes::from_static(b"identity"),
            ));
        }

        PendingRequest {
            headers,
            started: Instant::now(),
        }
    }

    /// Send the request head, connecting first if needed.
    ///
    /// Without a body the request is complete and its promise is returned.
    /// With `expect_body_afterward` the caller continues with [`send`](Self::send).
    pub fn endheaders(
        &mut self,
        request: PendingRequest,
        expect_body_afterward: bool,
    ) -> Result<Option<ResponsePromise>> {
        if self.transport.is_none() {
            self.connect()?;
        }

        let PendingRequest {
            headers: fields,
            started,
        } = request;
        let mut fields = filter_for_version(fields, self.svn);

        if expect_body_afterward {
            if let Some(value) = headers::find(&fields, b"content-length") {
                if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
                    return Err(Error::protocol(format!(
                        "Invalid content-length set. Given '{}' when only digits are allowed.",
                        String::from_utf8_lossy(value)
                    )));
                }
            }
        }

        if headers::find(&fields, b":authority").is_none() {
            let host = headers::find(&fields, b"host").cloned().ok_or_else(|| {
                Error::protocol(
                    "Requests without a Host header are not supported. They were only permitted in HTTP/1.0 and prior.",
                )
            })?;
            fields.push((Bytes::from_static(b":authority"), host));
        }

        let end_stream = !expect_body_afterward;
        let (transport, protocol) = self.io()?;
        let stream_id = protocol.get_available_stream_id()?;
        protocol.submit_headers(stream_id, &fields, end_stream)?;
        tracing::trace!(stream_id, end_stream, "request head submitted");

        if let Err(source) = flush(&mut **transport, &mut **protocol) {
            if !is_broken_pipe(&source) {
                return Err(source.into());
            }
            let promise = self.register_promise(stream_id, fields);
            return Err(Error::BrokenPipe { promise, source });
        }

        if end_stream {
            self.mark_request_sent(started);
            return Ok(Some(self.register_promise(stream_id, fields)));
        }

        self.upload = Some(Upload {
            stream_id,
            headers: fields,
            started,
        });
        Ok(None)
    }

    /// Send one body chunk; `eot` marks the last one.
    ///
    /// Returns the promise once the body is complete. While the peer's
    /// flow-control window is closed the socket is read, and a response
    /// arriving in the meantime ends the upload with
    /// [`Error::EarlyResponse`].
    pub fn send(&mut self, data: &[u8], eot: bool) -> Result<Option<ResponsePromise>> {
        if self.transport.is_none() || self.protocol.is_none() {
            return Err(Error::state("Trying to send data from a closed connection"));
        }
        let stream_id = self
            .upload
            .as_ref()
            .map(|upload| upload.stream_id)
            .ok_or_else(|| Error::state("No request body is expected on this connection"))?;

        let version = self.svn;
        let mut buf = vec![0u8; self.config.blocksize];
        loop {
            let (transport, protocol) = self.io()?;
            let (transport, protocol) = (&mut **transport, &mut **protocol);
            if !protocol.should_wait_remote_flow_control(stream_id, data.len()) {
                break;
            }

            match exchange::receive(transport, protocol, &mut buf)? {
                Some(0) => protocol.eof_received()?,
                Some(n) => protocol.bytes_received(&buf[..n])?,
                None => {}
            }
            flush(transport, protocol)?;

            if let Some(err) = pending_termination(protocol, stream_id, version) {
                return Err(err);
            }
            if protocol.has_pending_event(Some(stream_id)) {
                tracing::debug!(stream_id, "response arrived before the request body was sent");
                return Err(Error::EarlyResponse(self.finish_upload()?));
            }
        }

        let (transport, protocol) = self.io()?;
        let (transport, protocol) = (&mut **transport, &mut **protocol);
        protocol.submit_data(stream_id, data, eot)?;

        let broken = match flush(transport, protocol) {
            Ok(()) => None,
            Err(e) if is_broken_pipe(&e) => Some(e),
            Err(e) => return Err(e.into()),
        };

        if broken.is_none() && !eot {
            if let Some(err) = pending_termination(protocol, stream_id, version) {
                return Err(err);
            }
        }
        if broken.is_none() && !eot && protocol.has_pending_event(Some(stream_id)) {
            tracing::debug!(stream_id, "response arrived before the request body was sent");
            return Err(Error::EarlyResponse(self.finish_upload()?));
        }

        if !eot && broken.is_none() {
            return Ok(None);
        }

        let promise = self.finish_upload()?;
        match broken {
            Some(source) => Err(Error::BrokenPipe { promise, source }),
            None => Ok(Some(promise)),
        }
    }

    /// Close the upload bookkeeping and mint the request's promise.
    fn finish_upload(&mut self) -> Result<ResponsePromise> {
        let upload = self
            .upload
            .take()
            .ok_or_else(|| Error::state("No request body is expected on this connection"))?;
        self.mark_request_sent(upload.started);
        Ok(self.register_promise(upload.stream_id, upload.headers))
    }

    fn mark_request_sent(&mut self, started: Instant) {
        if let Some(info) = self.conn_info.as_mut() {
            info.request_sent_latency = Some(started.elapsed());
        }
    }
}

/// The connection-level failure waiting at the head of `stream_id`'s queue,
/// if any. The event stays queued for later reads.
fn pending_termination(
    protocol: &mut dyn HttpProtocol,
    stream_id: StreamId,
    version: Option<HttpVersion>,
) -> Option<Error> {
    let event = protocol.next_event(Some(stream_id))?;
    let err = match &event {
        Event::ConnectionTerminated { error_code, message } => {
            tracing::debug!(stream_id, error_code, "connection terminated during upload");
            Some(exchange::termination_error(version, *error_code, message.as_deref()))
        }
        _ => None,
    };
    protocol.reshelve(vec![event]);
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &'static str, value: &'static str) -> HeaderField {
        (Bytes::from_static(name.as_bytes()), Bytes::from_static(value.as_bytes()))
    }

    #[test]
    fn test_h1_keeps_wire_only_fields() {
        let headers = vec![
            field("transfer-encoding", "chunked"),
            field("connection", "keep-alive"),
        ];
        assert_eq!(
            filter_for_version(headers.clone(), Some(HttpVersion::Http11)),
            headers
        );
    }

    #[test]
    fn test_multiplexed_versions_drop_wire_only_fields() {
        let headers = vec![
            field("transfer-encoding", "chunked"),
            field("connection", "Keep-Alive"),
            field("connection", "upgrade"),
            field("x-trace", "1"),
        ];
        for version in [HttpVersion::Http2, HttpVersion::Http3] {
            assert_eq!(
                filter_for_version(headers.clone(), Some(version)),
                vec![field("connection", "upgrade"), field("x-trace", "1")]
            );
        }
    }

    #[test]
    fn test_putheader_lowercases_and_repeats() {
        let mut request = PendingRequest {
            headers: Vec::new(),
            started: Instant::now(),
        };
        request.putheader("X-Multi", &["a", "b"]);
        request.putheader("X-None", &[]);
        assert_eq!(
            request.headers(),
            &[field("x-multi", "a"), field("x-multi", "b")]
        );
    }
}
