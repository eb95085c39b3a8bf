//! Alt-Svc driven moves from TCP to QUIC, and the preemptive QUIC cache.

use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use trident::{
    AltSvcCache, AssertHostname, CertRequirement, ConnectionConfig, Error, HttpConnection,
    HttpVersion, QuicPreemptiveCache, ReadAmount, TlsConfig,
};

mod helpers;
use helpers::scripted::ScriptedTransport;

/// Serve one h1-over-TLS response carrying `alt_svc`, read it fully.
fn exchange_with_alt_svc(conn: &mut HttpConnection, transport: &ScriptedTransport, alt_svc: &str) {
    transport.push(format!(
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nAlt-Svc: {}\r\n\r\nok",
        alt_svc
    ));
    conn.attach(transport.boxed()).unwrap();
    let request = conn.putrequest("GET", "/", false, false);
    conn.endheaders(request, false).unwrap();
    let mut response = conn.getresponse(None).unwrap();
    assert_eq!(response.read(conn, ReadAmount::All).unwrap().as_ref(), b"ok");
}

fn https(host: &str) -> (HttpConnection, Arc<AltSvcCache>) {
    helpers::init_tracing();
    let cache = Arc::new(AltSvcCache::new());
    let conn = HttpConnection::new(ConnectionConfig::new(host).https()).with_quic_cache(cache.clone());
    (conn, cache)
}

#[test]
fn test_same_host_alternative_upgrades() {
    let (mut conn, cache) = https("example.com");
    let transport = ScriptedTransport::tls(None);
    exchange_with_alt_svc(&mut conn, &transport, "h3=\":8443\"; ma=3600");

    assert!(transport.is_closed());
    assert!(!conn.is_connected());
    assert_eq!(conn.http_version(), Some(HttpVersion::Http3));
    assert_eq!(conn.port(), 8443);
    assert_eq!(
        conn.alt_authority(),
        Some(&("example.com".to_string(), 8443))
    );
    assert_eq!(
        cache.get(&("example.com".to_string(), 443)),
        Some(("example.com".to_string(), 8443))
    );
}

#[test]
fn test_alternative_on_other_host_is_ignored() {
    let (mut conn, cache) = https("example.com");
    let transport = ScriptedTransport::tls(None);
    exchange_with_alt_svc(&mut conn, &transport, "h3=\"evil.example:443\"");

    assert!(conn.is_connected());
    assert_eq!(conn.http_version(), Some(HttpVersion::Http11));
    assert_eq!(conn.port(), 443);
    assert!(conn.alt_authority().is_none());
    assert!(cache.is_empty());
}

#[test]
fn test_draft_alternatives_are_ignored() {
    let (mut conn, _) = https("example.com");
    let transport = ScriptedTransport::tls(None);
    exchange_with_alt_svc(&mut conn, &transport, "h3-29=\":443\", h3-Q050=\":443\"");
    assert!(conn.is_connected());
    assert_eq!(conn.http_version(), Some(HttpVersion::Http11));
}

#[test]
fn test_first_acceptable_alternative_wins() {
    let (mut conn, _) = https("example.com");
    let transport = ScriptedTransport::tls(None);
    exchange_with_alt_svc(
        &mut conn,
        &transport,
        "h3=\"mirror.example:443\", h3=\"example.com:9443\", h3=\":8443\"",
    );
    assert_eq!(conn.port(), 9443);
}

#[test]
fn test_disabled_h3_never_upgrades() {
    helpers::init_tracing();
    let mut conn = HttpConnection::new(
        ConnectionConfig::new("example.com")
            .https()
            .disable(HttpVersion::Http3),
    );
    let transport = ScriptedTransport::tls(None);
    exchange_with_alt_svc(&mut conn, &transport, "h3=\":443\"");
    assert!(conn.is_connected());
    assert_eq!(conn.http_version(), Some(HttpVersion::Http11));
}

#[test]
fn test_plain_tcp_never_upgrades() {
    helpers::init_tracing();
    let mut conn = HttpConnection::new(ConnectionConfig::new("example.com"));
    let transport = ScriptedTransport::plain();
    exchange_with_alt_svc(&mut conn, &transport, "h3=\":443\"");
    assert!(conn.is_connected());
    assert_eq!(conn.http_version(), Some(HttpVersion::Http11));
}

#[test]
fn test_preemptive_cache_honors_only_the_port() {
    helpers::init_tracing();
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    server
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let server_port = server.local_addr().unwrap().port();

    // One datagram, then the port goes away so the handshake fails fast.
    let listener = thread::spawn(move || {
        let mut buf = [0u8; 2048];
        server.recv_from(&mut buf).map(|(n, _)| n)
    });

    let cache = Arc::new(AltSvcCache::new());
    cache.insert(
        ("127.0.0.1".to_string(), 443),
        ("evil.example".to_string(), server_port),
    );
    let tls = TlsConfig {
        cert_reqs: Some("CERT_NONE".into()),
        ..Default::default()
    };
    let config = ConnectionConfig::new("127.0.0.1")
        .https()
        .tls(tls)
        .timeout(Duration::from_millis(200));
    let mut conn = HttpConnection::new(config).with_quic_cache(cache);

    assert!(conn.connect().is_err());
    assert_eq!(conn.http_version(), Some(HttpVersion::Http3));
    assert_eq!(conn.port(), server_port);
    assert_eq!(
        conn.alt_authority(),
        Some(&("evil.example".to_string(), server_port))
    );

    // The QUIC Initial reached the origin host on the cached port.
    let received = listener.join().unwrap().unwrap();
    assert!(received >= 1200);
}

#[test]
fn test_preemptive_cache_needs_https() {
    helpers::init_tracing();
    let cache = Arc::new(AltSvcCache::new());
    let server = helpers::mock_server::MockHttpServer::new().unwrap();
    let port = server.port();
    cache.insert(
        ("127.0.0.1".to_string(), port),
        ("127.0.0.1".to_string(), 1),
    );
    let handle = server.serve(vec![b"HTTP/1.1 204 No Content\r\n\r\n".to_vec()]);

    let mut conn =
        HttpConnection::new(ConnectionConfig::new("127.0.0.1").port(port)).with_quic_cache(cache);
    let request = conn.putrequest("GET", "/", false, false);
    conn.endheaders(request, false).unwrap();
    assert_eq!(conn.http_version(), Some(HttpVersion::Http11));
    assert_eq!(conn.getresponse(None).unwrap().status, 204);
    drop(conn);
    handle.join().unwrap();
}

#[test]
fn test_quic_tls_config_derivation() {
    let conn = HttpConnection::new(ConnectionConfig::new("example.com").https());
    let quic = conn.quic_tls_config().unwrap();
    assert!(!quic.insecure);
    assert!(quic.verify_hostname);
    assert!(quic.assert_hostname.is_none());
    assert!(quic.session_ticket.is_none());

    let by_mode = TlsConfig {
        verify_mode: Some(CertRequirement::None),
        ..Default::default()
    };
    let conn = HttpConnection::new(ConnectionConfig::new("example.com").https().tls(by_mode));
    assert!(conn.quic_tls_config().unwrap().insecure);

    let by_policy = TlsConfig {
        cert_reqs: Some("CERT_NONE".into()),
        assert_hostname: AssertHostname::Name("internal.example".into()),
        assert_fingerprint: Some("AA:BB".into()),
        ..Default::default()
    };
    let conn = HttpConnection::new(ConnectionConfig::new("example.com").https().tls(by_policy));
    let quic = conn.quic_tls_config().unwrap();
    assert!(quic.insecure);
    assert!(quic.verify_hostname);
    assert_eq!(quic.assert_hostname.as_deref(), Some("internal.example"));
    assert_eq!(quic.cert_fingerprint.as_deref(), Some("AA:BB"));

    let no_hostname = TlsConfig {
        assert_hostname: AssertHostname::Disabled,
        ..Default::default()
    };
    let conn = HttpConnection::new(ConnectionConfig::new("example.com").https().tls(no_hostname));
    assert!(!conn.quic_tls_config().unwrap().verify_hostname);

    let bogus = TlsConfig {
        cert_reqs: Some("CERT_SOMETIMES".into()),
        ..Default::default()
    };
    let conn = HttpConnection::new(ConnectionConfig::new("example.com").https().tls(bogus));
    assert!(matches!(conn.quic_tls_config(), Err(Error::Config(_))));
}
