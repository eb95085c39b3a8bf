//! Response retrieval and body reads.

use bytes::{Bytes, BytesMut};

use super::exchange::Exchange;
use super::{HttpConnection, ResponseMeta};
use crate::error::{Error, Result};
use crate::headers::{self, HeaderList};
use crate::promise::ResponsePromise;
use crate::protocol::{Event, EventKind, StreamId};
use crate::response::{LowLevelResponse, ReadAmount};
use crate::version::HttpVersion;

impl HttpConnection {
    /// Wait for the head of a response.
    ///
    /// With `promise` the response of that request is returned, even if
    /// other streams answered first. Without it, the first stream to answer
    /// wins. Each promise resolves once; asking again is
    /// [`Error::ResponseNotReady`].
    pub fn getresponse(&mut self, promise: Option<&ResponsePromise>) -> Result<LowLevelResponse> {
        if self.transport.is_none()
            || self.protocol.is_none()
            || self.svn.is_none()
            || self.promises.is_empty()
        {
            return Err(Error::ResponseNotReady);
        }
        if let Some(promise) = promise {
            if !self.promises.contains(promise.uid()) {
                return Err(Error::ResponseNotReady);
            }
        }

        let events = self.exchange_until(
            Exchange::until(EventKind::HeadersReceived)
                .receive_first()
                .collect(&[EventKind::HeadersReceived])
                .ignore_end_stream()
                .stream(promise.map(ResponsePromise::stream_id)),
        )?;

        let mut status = None;
        let mut fields = HeaderList::new();
        for event in &events {
            let Event::HeadersReceived { headers: block, .. } = event else {
                continue;
            };
            for (name, value) in block {
                if name.as_ref() == b":status" {
                    status = Some(parse_status(value)?);
                } else if headers::is_pseudo(name) {
                    return Err(Error::protocol(format!(
                        "Unhandled special header '{}'",
                        String::from_utf8_lossy(name)
                    )));
                } else {
                    fields.push((name.clone(), value.clone()));
                }
            }
        }

        let last = events
            .last()
            .ok_or_else(|| Error::protocol("No response head received"))?;
        let stream_id = last
            .stream_id()
            .ok_or_else(|| Error::protocol("Response head without a stream"))?;
        let eot = last.end_stream() == Some(true);

        let uid = match promise {
            Some(promise) => promise.uid(),
            None => self
                .promises
                .by_stream(stream_id)
                .map(ResponsePromise::uid)
                .ok_or_else(|| {
                    Error::protocol(format!(
                        "Response received (stream: {}) but no promise in-flight",
                        stream_id
                    ))
                })?,
        };
        let status = status.ok_or_else(|| {
            Error::protocol(format!(
                "Response on stream {} has no :status pseudo-header",
                stream_id
            ))
        })?;
        let promise = self
            .promises
            .remove(uid)
            .ok_or(Error::ResponseNotReady)?;

        let version = self.svn.unwrap_or(HttpVersion::Http11);
        let response = LowLevelResponse::new(
            promise,
            status,
            version,
            &fields,
            self.config.host.clone(),
            self.port,
            eot,
        )?;
        tracing::trace!(stream_id, status, eot, "response head received");

        self.last_response = Some(ResponseMeta {
            authority: self.config.host.clone(),
            alt_svc: response
                .get_headers("alt-svc")
                .into_iter()
                .map(str::to_string)
                .collect(),
        });

        if version == HttpVersion::Http3 {
            if let Some(ticket) = self.protocol.as_ref().and_then(|p| p.session_ticket()) {
                self.quic_session_ticket = Some(ticket);
            }
        }

        if eot {
            self.stream_finished();
        } else {
            self.pending_responses.insert(stream_id);
        }

        Ok(response)
    }

    /// Read body bytes of `stream_id`. Returns the data and whether the
    /// stream ended.
    pub(crate) fn read_stream(&mut self, stream_id: StreamId, amt: ReadAmount) -> Result<(Bytes, bool)> {
        if !self.pending_responses.contains(&stream_id) {
            return Err(Error::state(format!(
                "Stream {} was dropped before its body was fully received",
                stream_id
            )));
        }

        let exchange = Exchange::until(EventKind::DataReceived)
            .receive_first()
            .collect(&[EventKind::DataReceived, EventKind::HeadersReceived])
            .count_event_data()
            .stream(Some(stream_id));
        let exchange = match amt {
            ReadAmount::All => exchange,
            ReadAmount::Bytes(0) => return Ok((Bytes::new(), false)),
            ReadAmount::Bytes(n) => exchange.max_data(n),
            ReadAmount::Available => exchange.ignore_end_stream(),
        };

        let events = self.exchange_until(exchange)?;
        let eot = events.last().and_then(Event::end_stream).unwrap_or(false);

        let mut body = BytesMut::new();
        for event in &events {
            if let Event::DataReceived { data, .. } = event {
                body.extend_from_slice(data);
            }
        }

        if eot {
            self.pending_responses.remove(&stream_id);
            self.stream_finished();
        }

        Ok((body.freeze(), eot))
    }

    /// A stream was fully received. Once nothing else is in flight, try
    /// Alt-Svc and drop the socket if the peer will not take new streams.
    fn stream_finished(&mut self) {
        if !self.is_idle() {
            return;
        }
        self.upgrade();
        if self.has_expired() {
            tracing::debug!(connection = self.id, "protocol expired, closing");
            self.close();
        }
    }
}

fn parse_status(value: &[u8]) -> Result<u16> {
    std::str::from_utf8(value)
        .ok()
        .filter(|s| s.len() == 3)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            Error::protocol(format!(
                "Invalid :status value '{}'",
                String::from_utf8_lossy(value)
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"200").unwrap(), 200);
        assert_eq!(parse_status(b"599").unwrap(), 599);
        assert!(parse_status(b"20").is_err());
        assert!(parse_status(b"abc").is_err());
        assert!(parse_status(b"2000").is_err());
    }
}
