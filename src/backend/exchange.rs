//! The blocking loop between the socket and the protocol adapter.

use std::io;

use super::HttpConnection;
use crate::error::{Error, Result};
use crate::protocol::{Event, EventKind, HttpProtocol, StreamId};
use crate::transport::Transport;
use crate::version::HttpVersion;

/// Termination code the HTTP/1.1 adapter uses for unparsable heads.
const MALFORMED_HEADER_CODE: u64 = 400;

/// QUIC CRYPTO_ERROR carrying TLS alert 42 (bad certificate).
const QUIC_BAD_CERTIFICATE: u64 = 298;

/// What to wait for in [`HttpConnection::exchange_until`].
#[derive(Debug, Clone)]
pub(crate) struct Exchange {
    target: EventKind,
    receive_first: bool,
    /// Kinds to return; `None` keeps everything.
    collect: Option<&'static [EventKind]>,
    respect_end_stream: bool,
    max_data: Option<usize>,
    /// Count body bytes from data events instead of raw socket reads.
    count_event_data: bool,
    stream_id: Option<StreamId>,
}

impl Exchange {
    pub(crate) fn until(target: EventKind) -> Self {
        Self {
            target,
            receive_first: false,
            collect: None,
            respect_end_stream: true,
            max_data: None,
            count_event_data: false,
            stream_id: None,
        }
    }

    /// Read before flushing pending output.
    pub(crate) fn receive_first(mut self) -> Self {
        self.receive_first = true;
        self
    }

    pub(crate) fn collect(mut self, kinds: &'static [EventKind]) -> Self {
        self.collect = Some(kinds);
        self
    }

    /// Stop at the first target event even without END_STREAM.
    pub(crate) fn ignore_end_stream(mut self) -> Self {
        self.respect_end_stream = false;
        self
    }

    /// Stop once this many bytes were received.
    pub(crate) fn max_data(mut self, max: usize) -> Self {
        self.max_data = Some(max);
        self
    }

    pub(crate) fn count_event_data(mut self) -> Self {
        self.count_event_data = true;
        self
    }

    pub(crate) fn stream(mut self, stream_id: Option<StreamId>) -> Self {
        self.stream_id = stream_id;
        self
    }

    fn keeps(&self, kind: EventKind) -> bool {
        self.collect.map_or(true, |kinds| kinds.contains(&kind))
    }
}

/// Send everything the protocol has queued.
pub(crate) fn flush(transport: &mut dyn Transport, protocol: &mut dyn HttpProtocol) -> io::Result<()> {
    loop {
        let chunk = protocol.bytes_to_send();
        if chunk.is_empty() {
            return Ok(());
        }
        transport.sendall(&chunk)?;
    }
}

/// One blocking read, bounded by the protocol's timer when it has one.
///
/// `None` means the timer fired and was handed to the protocol.
pub(crate) fn receive(
    transport: &mut dyn Transport,
    protocol: &mut dyn HttpProtocol,
    buf: &mut [u8],
) -> io::Result<Option<usize>> {
    match protocol.timeout() {
        Some(timeout) => match transport.recv_timeout(buf, timeout)? {
            Some(n) => Ok(Some(n)),
            None => {
                protocol.on_timeout();
                Ok(None)
            }
        },
        None => transport.recv(buf).map(Some),
    }
}

/// Whether a write failure means the peer went away mid-request.
pub(crate) fn is_broken_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

/// Map a `ConnectionTerminated` event to the error the caller sees.
pub(crate) fn termination_error(
    version: Option<HttpVersion>,
    error_code: u64,
    message: Option<&str>,
) -> Error {
    let text = message.unwrap_or("");

    if error_code == MALFORMED_HEADER_CODE && text.contains("header") {
        return Error::invalid_header(text);
    }
    if error_code == QUIC_BAD_CERTIFICATE && version == Some(HttpVersion::Http3) {
        return Error::ssl(
            "TLS over QUIC did not succeed (Error 298). Chain certificate verification failed.",
        );
    }
    if let Some((partial, expected)) = parse_incomplete_read(text) {
        return Error::IncompleteRead { partial, expected };
    }

    match message {
        Some(message) => Error::protocol(message),
        None => Error::protocol(format!(
            "connection terminated by peer (error code {:#x})",
            error_code
        )),
    }
}

/// Pull `(received, expected)` out of a truncated-body message.
fn parse_incomplete_read(message: &str) -> Option<(u64, u64)> {
    let (_, counts) = message.split_once("without sending complete message body")?;
    let numbers: Vec<u64> = counts
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    match numbers.as_slice() {
        [partial, expected] => Some((*partial, *expected)),
        _ => None,
    }
}

impl HttpConnection {
    /// Pump the socket until the protocol yields what `exchange` waits for.
    ///
    /// Events of other streams, and of kinds outside the collected set, are
    /// put back on the protocol's queue in order.
    pub(crate) fn exchange_until(&mut self, exchange: Exchange) -> Result<Vec<Event>> {
        if exchange.max_data == Some(0) {
            return Ok(Vec::new());
        }

        let version = self.svn;
        let seen_response = self.last_response.is_some();
        let mut buf = vec![0u8; self.config.blocksize];
        let (transport, protocol) = self.io()?;
        let (transport, protocol) = (&mut **transport, &mut **protocol);

        let mut events = Vec::new();
        let mut reshelve = Vec::new();
        let mut data_in_len = 0usize;

        loop {
            if !protocol.has_pending_event(exchange.stream_id) {
                if !exchange.receive_first {
                    flush(transport, protocol)?;
                }

                match receive(transport, protocol, &mut buf)? {
                    Some(0) => {
                        if events.is_empty() && !seen_response {
                            return Err(Error::protocol(
                                "server unexpectedly closed the connection in-flight (prior-to-response)",
                            ));
                        }
                        protocol.eof_received()?;
                        if !protocol.has_pending_event(exchange.stream_id) {
                            return Err(Error::protocol("server closed the connection"));
                        }
                    }
                    Some(n) => {
                        if !exchange.count_event_data {
                            data_in_len += n;
                        }
                        protocol.bytes_received(&buf[..n])?;
                    }
                    None => {}
                }

                if exchange.receive_first {
                    flush(transport, protocol)?;
                }
            }

            while let Some(event) = protocol.next_event(exchange.stream_id) {
                if let (Some(wanted), Some(actual)) = (exchange.stream_id, event.stream_id()) {
                    if wanted != actual {
                        reshelve.push(event);
                        continue;
                    }
                }

                match &event {
                    Event::ConnectionTerminated {
                        error_code,
                        message,
                    } => {
                        tracing::debug!(error_code, ?message, "connection terminated by peer");
                        return Err(termination_error(version, *error_code, message.as_deref()));
                    }
                    Event::StreamResetReceived {
                        stream_id,
                        error_code,
                    } => {
                        return Err(Error::protocol(format!(
                            "Stream {} was reset by remote peer. Reason: {:#x}.",
                            stream_id, error_code
                        )));
                    }
                    _ => {}
                }

                if exchange.count_event_data {
                    data_in_len += event.data_len();
                }

                let kind = event.kind();
                let end_stream = event.end_stream();
                if exchange.keeps(kind) {
                    events.push(event);
                } else {
                    reshelve.push(event);
                }

                let cap_reached = exchange.max_data.is_some_and(|max| data_in_len >= max);
                if kind != exchange.target && !cap_reached {
                    continue;
                }
                if !cap_reached && exchange.respect_end_stream && end_stream == Some(false) {
                    continue;
                }

                protocol.reshelve(reshelve);
                return Ok(events);
            }
        }
    }
}
