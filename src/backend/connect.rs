//! Connection establishment, version negotiation and Alt-Svc upgrades.

use std::time::{Duration, Instant};

use bytes::Bytes;

use super::exchange::Exchange;
use super::{HttpConnection, TunnelTarget};
use crate::config::{AssertHostname, Scheme};
use crate::conn_info::{ConnectionInfo, TlsVersion};
use crate::error::{Error, Result};
use crate::headers::{self, HeaderList};
use crate::pool::alt_svc::{parse_alt_svc, Authority, DEFAULT_MAX_AGE};
use crate::protocol::h1::H1Protocol;
use crate::protocol::h2::H2Protocol;
use crate::protocol::h3::H3Protocol;
use crate::protocol::{Event, EventKind, HttpProtocol};
use crate::transport::connector::{verify_fingerprint, BoringConnector};
use crate::transport::quic::{QuicTlsConfig, UdpTransport};
use crate::transport::tcp::{self, ConnectTimings, TcpTransport};
use crate::transport::{Transport, TransportKind};
use crate::version::HttpVersion;

impl HttpConnection {
    /// Route the connection through an HTTP/1.1 proxy with CONNECT.
    ///
    /// The configured host and port are the proxy's; `host:port` is the
    /// origin. HTTP/3 is disabled for the lifetime of this connection.
    pub fn set_tunnel(
        &mut self,
        host: impl Into<String>,
        port: u16,
        headers: Vec<(String, String)>,
    ) -> Result<()> {
        if self.transport.is_some() {
            return Err(Error::state(
                "Can't set up tunnel for established connection",
            ));
        }
        self.tunnel = Some(TunnelTarget {
            host: host.into(),
            port,
            headers,
        });
        self.config.disabled_versions.insert(HttpVersion::Http3);
        Ok(())
    }

    /// Open the socket and negotiate the HTTP version. No-op when connected.
    ///
    /// HTTP/3 is used straight away when a previous response announced it
    /// through Alt-Svc, or when the preemptive QUIC cache knows the origin.
    pub fn connect(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        self.pick_quic_alternative();

        let (addrs, resolution) = tcp::resolve(&self.config.host, self.port)?;
        let started = Instant::now();

        if self.svn == Some(HttpVersion::Http3) {
            let peer = addrs
                .first()
                .copied()
                .ok_or_else(|| Error::state("no address to connect to"))?;
            let socket = tcp::connect_udp(peer, self.config.source_address)?;
            let transport = UdpTransport::new(socket, self.config.timeout)?;
            let local = transport
                .local_addr()
                .ok_or_else(|| Error::state("UDP socket has no local address"))?;
            self.timings = Some(ConnectTimings {
                resolution,
                established: started.elapsed(),
            });

            let tls = self.quic_tls_config()?;
            let sni_host = self
                .config
                .tls
                .server_hostname
                .clone()
                .unwrap_or_else(|| self.config.host.clone());
            let protocol = H3Protocol::connect(tls.server_name(&sni_host), local, peer, &tls)?;
            tracing::debug!(connection = self.id, %peer, "connecting over QUIC");
            return self.attach_protocol(Box::new(transport), Box::new(protocol));
        }

        let stream = tcp::connect_tcp(
            &addrs,
            self.config.source_address,
            self.config.timeout,
            &self.config.socket_options,
        )?;
        self.timings = Some(ConnectTimings {
            resolution,
            established: started.elapsed(),
        });
        tracing::debug!(
            connection = self.id,
            host = %self.config.host,
            port = self.port,
            "TCP connection established"
        );
        self.attach(Box::new(TcpTransport::new(stream)))
    }

    /// Use an already-open stream socket.
    ///
    /// Runs the CONNECT tunnel when one is configured, the TLS handshake for
    /// `https` and the ALPN-driven protocol selection.
    pub fn attach(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        if transport.kind() == TransportKind::Udp {
            return Err(Error::state(
                "datagram transports need a protocol, use attach_protocol",
            ));
        }
        let mut transport = transport;

        if let Some(target) = self.tunnel.clone() {
            self.transport = Some(transport);
            self.protocol = Some(Box::new(H1Protocol::new()));
            self.svn = Some(HttpVersion::Http11);
            self.tunnel(&target)?;
            transport = self
                .transport
                .take()
                .ok_or_else(|| Error::state("tunnel left no socket behind"))?;
        }

        let mut tls_handshake = None;
        if self.config.scheme == Scheme::Https && transport.kind() == TransportKind::Tcp {
            let server = match &self.tunnel {
                Some(target) => target.host.clone(),
                None => self.config.host.clone(),
            };
            let stream = transport
                .into_tcp_stream()
                .ok_or_else(|| Error::state("transport cannot be wrapped in TLS"))?;

            let started = Instant::now();
            let connector =
                BoringConnector::new(&self.config.tls, &self.config.tcp_alpn_protocols())?;
            transport = Box::new(connector.connect(&server, stream)?);
            tls_handshake = Some(started.elapsed());
            self.is_verified = !self.config.tls.is_insecure()?;
        }

        self.transport = Some(transport);
        self.post_conn(tls_handshake)
    }

    /// Use an open socket together with a ready protocol adapter.
    ///
    /// Multiplexed protocols run their handshake before this returns.
    pub fn attach_protocol(
        &mut self,
        transport: Box<dyn Transport>,
        protocol: Box<dyn HttpProtocol>,
    ) -> Result<()> {
        let version = protocol.http_version();
        let mut info = self.new_conn_info(version);
        info.destination_address = transport.peer_addr();
        self.transport = Some(transport);
        self.protocol = Some(protocol);
        self.svn = Some(version);

        match version {
            HttpVersion::Http11 => {}
            HttpVersion::Http2 => self.await_handshake()?,
            HttpVersion::Http3 => {
                let started = Instant::now();
                self.await_handshake()?;
                info.tls_handshake_latency = Some(started.elapsed());
                info.tls_version = Some(TlsVersion::Tls1_3);
                self.is_verified = !self.config.tls.is_insecure()?;

                let certificates = self.protocol.as_ref().and_then(|p| p.peer_certificates());
                if let Some((leaf, issuer)) = certificates {
                    if let Some(fingerprint) = self.config.tls.assert_fingerprint.as_deref() {
                        verify_fingerprint(&leaf, fingerprint)?;
                    }
                    info.set_certificates(Some(leaf), issuer);
                }
            }
        }

        tracing::debug!(connection = self.id, %version, "protocol attached");
        self.conn_info = Some(info);
        Ok(())
    }

    /// Pick the protocol from ALPN and fill in the connection info.
    fn post_conn(&mut self, tls_handshake: Option<Duration>) -> Result<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| Error::state("connection is not established"))?;
        let session = transport.tls_session();
        let peer = transport.peer_addr();

        let version = match session.as_ref().and_then(|s| s.alpn.as_deref()) {
            None => HttpVersion::Http11,
            Some(alpn) => HttpVersion::from_tcp_alpn(Some(alpn)).ok_or_else(|| {
                Error::protocol(format!(
                    "Unsupported ALPN '{}' during handshake",
                    String::from_utf8_lossy(alpn)
                ))
            })?,
        };

        let mut info = self.new_conn_info(version);
        info.destination_address = peer;
        if let Some(session) = session {
            info.cipher = session.cipher;
            info.tls_version = session
                .version
                .as_deref()
                .and_then(TlsVersion::from_protocol_str);
            info.tls_handshake_latency = tls_handshake;
            info.set_certificates(session.peer_certificate, session.issuer_certificate);
        }
        tracing::debug!(connection = self.id, %version, "negotiated over TCP");

        let protocol: Box<dyn HttpProtocol> = match version {
            HttpVersion::Http2 => Box::new(H2Protocol::new()),
            _ => Box::new(H1Protocol::new()),
        };
        self.protocol = Some(protocol);
        self.svn = Some(version);
        self.conn_info = Some(info);

        if version == HttpVersion::Http2 {
            self.await_handshake()?;
        }
        Ok(())
    }

    fn new_conn_info(&self, version: HttpVersion) -> ConnectionInfo {
        let mut info = ConnectionInfo {
            http_version: Some(version),
            ..Default::default()
        };
        if let Some(timings) = self.timings {
            info.resolution_latency = Some(timings.resolution);
            info.established_latency = Some(timings.established);
        }
        info
    }

    fn await_handshake(&mut self) -> Result<()> {
        self.exchange_until(Exchange::until(EventKind::HandshakeCompleted))?;
        Ok(())
    }

    /// TLS settings for the QUIC handshake, derived from the TCP ones.
    ///
    /// Verification is off when either the verify mode or the resolved
    /// `cert_reqs` policy says so.
    pub fn quic_tls_config(&self) -> Result<QuicTlsConfig> {
        let tls = &self.config.tls;
        Ok(QuicTlsConfig {
            insecure: tls.is_insecure()?,
            cafile: tls.ca_certs.clone(),
            capath: tls.ca_cert_dir.clone(),
            cadata: tls.ca_cert_data.clone(),
            certfile: tls.cert_file.clone(),
            keyfile: tls.key_file.clone(),
            keypassword: tls.key_password.clone(),
            cert_fingerprint: tls.assert_fingerprint.clone(),
            verify_hostname: tls.assert_hostname != AssertHostname::Disabled,
            assert_hostname: match &tls.assert_hostname {
                AssertHostname::Name(name) => Some(name.clone()),
                _ => None,
            },
            session_ticket: self.quic_session_ticket.clone(),
        })
    }

    /// Switch to HTTP/3 before dialing when the origin is known to serve it.
    ///
    /// Only the cached port is honored; the host always stays ours.
    fn pick_quic_alternative(&mut self) {
        if self.svn.is_none() && !self.h3_disabled() && self.config.scheme == Scheme::Https {
            let origin = (self.config.host.clone(), self.port);
            if let Some(alt) = self.quic_cache.as_ref().and_then(|cache| cache.get(&origin)) {
                tracing::debug!(
                    connection = self.id,
                    host = %self.config.host,
                    port = alt.1,
                    "preemptive QUIC cache hit"
                );
                self.svn = Some(HttpVersion::Http3);
                self.port = alt.1;
                self.alt_authority = Some(alt);
            }
        }

        if self.svn == Some(HttpVersion::Http3) {
            let stale = self.h3_disabled()
                || self
                    .last_response
                    .as_ref()
                    .is_some_and(|last| last.authority != self.config.host);
            if stale {
                tracing::debug!(connection = self.id, "forgetting HTTP/3, falling back to TCP");
                self.svn = None;
                self.port = self.config.effective_port();
                self.alt_authority = None;
            }
        }
    }

    /// First acceptable `h3` alternative from the last response's Alt-Svc.
    ///
    /// Alternatives naming another host are ignored.
    fn h3_probe(&self) -> Option<Authority> {
        let last = self.last_response.as_ref()?;
        last.alt_svc
            .iter()
            .flat_map(|value| parse_alt_svc(value, DEFAULT_MAX_AGE))
            .find(|entry| {
                if !entry.is_h3() {
                    return false;
                }
                if !entry.same_host(&self.config.host) {
                    tracing::warn!(
                        host = %self.config.host,
                        alternative = %entry.host,
                        "ignoring Alt-Svc pointing to another host"
                    );
                    return false;
                }
                true
            })
            .map(|entry| {
                let host = if entry.host.is_empty() {
                    self.config.host.clone()
                } else {
                    entry.host
                };
                (host, entry.port)
            })
    }

    /// Move to HTTP/3 if the idle TLS connection was offered it.
    ///
    /// The socket is closed; the next request dials QUIC.
    pub(crate) fn upgrade(&mut self) {
        let on_tls = self
            .transport
            .as_ref()
            .is_some_and(|t| t.kind() == TransportKind::Tls);
        if !on_tls || self.svn == Some(HttpVersion::Http3) || self.h3_disabled() {
            return;
        }
        let Some(alt) = self.h3_probe() else {
            return;
        };

        if let Some(cache) = self.quic_cache.as_ref() {
            cache.insert((self.config.host.clone(), self.port), alt.clone());
        }
        tracing::debug!(
            connection = self.id,
            host = %self.config.host,
            port = alt.1,
            "Alt-Svc offers HTTP/3, reconnecting over QUIC"
        );
        self.svn = Some(HttpVersion::Http3);
        self.port = alt.1;
        self.alt_authority = Some(alt);
        self.close();
    }

    /// Authority of the HTTP/3 alternative in use, if any.
    pub fn alt_authority(&self) -> Option<&Authority> {
        self.alt_authority.as_ref()
    }

    /// Ask the proxy for a tunnel to `target` over HTTP/1.1.
    fn tunnel(&mut self, target: &TunnelTarget) -> Result<()> {
        if self.svn != Some(HttpVersion::Http11) {
            return Err(Error::NotImplemented(
                "Unable to establish a tunnel using other than HTTP/1.1.".into(),
            ));
        }

        let mut fields: HeaderList = vec![
            (
                Bytes::from_static(b":authority"),
                Bytes::from(format!("{}:{}", target.host, target.port)),
            ),
            (Bytes::from_static(b":method"), Bytes::from_static(b"CONNECT")),
        ];
        for (name, value) in &target.headers {
            fields.push((
                headers::lowercase_name(name),
                Bytes::copy_from_slice(value.as_bytes()),
            ));
        }

        let (_, protocol) = self.io()?;
        let stream_id = protocol.get_available_stream_id()?;
        protocol.submit_headers(stream_id, &fields, true)?;

        let events = self.exchange_until(
            Exchange::until(EventKind::HeadersReceived)
                .collect(&[EventKind::HeadersReceived])
                .ignore_end_stream(),
        )?;

        let status = events.iter().find_map(|event| match event {
            Event::HeadersReceived { headers: block, .. } => headers::find(block, b":status")
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|s| s.parse::<u16>().ok()),
            _ => None,
        });

        if !status.is_some_and(|s| (200..300).contains(&s)) {
            self.close();
            let reason = status
                .and_then(|s| http::StatusCode::from_u16(s).ok())
                .and_then(|code| code.canonical_reason())
                .unwrap_or("Unknown")
                .to_string();
            tracing::debug!(connection = self.id, ?status, "proxy refused the tunnel");
            return Err(Error::TunnelRefused { status, reason });
        }

        tracing::debug!(
            connection = self.id,
            target = %format!("{}:{}", target.host, target.port),
            "tunnel established"
        );
        self.protocol = None;
        self.svn = None;
        Ok(())
    }
}
