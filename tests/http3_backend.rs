//! The backend driving an HTTP/3 adapter, with the QUIC stack replaced by a
//! scripted protocol.

use trident::protocol::Event;
use trident::{ConnectionConfig, Error, HttpConnection, HttpVersion, ReadAmount, TlsVersion};

mod helpers;
use helpers::scripted::{data, handshake, head, ScriptedProtocol};

fn attach(protocol: ScriptedProtocol) -> (HttpConnection, helpers::scripted::ScriptedTransport) {
    helpers::init_tracing();
    let transport = protocol.transport();
    let mut conn = HttpConnection::new(ConnectionConfig::new("example.com").https());
    conn.attach_protocol(transport.boxed(), Box::new(protocol))
        .unwrap();
    (conn, transport)
}

#[test]
fn test_round_trip_saves_session_ticket() {
    let protocol = ScriptedProtocol::new(HttpVersion::Http3)
        .with_session_ticket(b"resume-me")
        .batch(vec![handshake()])
        .batch(vec![
            head(0, &[(":status", "200"), ("content-type", "text/plain")], false),
            data(0, b"hello ", false),
        ])
        .batch(vec![data(0, b"quic", true)]);
    let submitted = protocol.submitted();
    let (mut conn, _transport) = attach(protocol);

    assert_eq!(conn.http_version(), Some(HttpVersion::Http3));
    assert!(conn.is_verified());
    let info = conn.conn_info().unwrap();
    assert_eq!(info.http_version, Some(HttpVersion::Http3));
    assert_eq!(info.tls_version, Some(TlsVersion::Tls1_3));
    assert!(info.tls_handshake_latency.is_some());

    let mut request = conn.putrequest("GET", "/", false, false);
    request.putheader("Connection", &["keep-alive"]);
    request.putheader("Transfer-Encoding", &["chunked"]);
    let promise = conn.endheaders(request, false).unwrap().unwrap();
    assert_eq!(promise.stream_id(), 0);

    {
        let submitted = submitted.lock().unwrap();
        let (stream_id, fields, end_stream) = &submitted.headers[0];
        assert_eq!(*stream_id, 0);
        assert!(*end_stream);
        let names: Vec<&[u8]> = fields.iter().map(|(n, _)| n.as_ref()).collect();
        assert_eq!(
            names,
            vec![
                b":method".as_ref(),
                b":scheme",
                b":path",
                b":authority",
                b"accept-encoding"
            ]
        );
    }

    let mut response = conn.getresponse(Some(&promise)).unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.version, HttpVersion::Http3);
    assert_eq!(response.get_header("content-type"), Some("text/plain"));
    assert_eq!(conn.quic_session_ticket(), Some(b"resume-me".as_ref()));

    assert_eq!(
        response.read(&mut conn, ReadAmount::All).unwrap().as_ref(),
        b"hello quic"
    );
    assert!(conn.is_idle());
    assert!(conn.is_connected());

    // The ticket survives the socket.
    conn.close();
    assert!(submitted.lock().unwrap().closed);
    assert_eq!(
        conn.quic_tls_config().unwrap().session_ticket.as_deref(),
        Some(b"resume-me".as_ref())
    );
}

#[test]
fn test_streams_interleave() {
    let protocol = ScriptedProtocol::new(HttpVersion::Http3)
        .batch(vec![handshake()])
        .batch(vec![
            head(4, &[(":status", "201")], true),
            head(0, &[(":status", "200")], true),
        ]);
    let (mut conn, _transport) = attach(protocol);

    let first = conn.putrequest("GET", "/one", false, false);
    let first = conn.endheaders(first, false).unwrap().unwrap();
    let second = conn.putrequest("GET", "/two", false, false);
    let second = conn.endheaders(second, false).unwrap().unwrap();
    assert_eq!((first.stream_id(), second.stream_id()), (0, 4));

    let response = conn.getresponse(Some(&first)).unwrap();
    assert_eq!(response.status, 200);
    let response = conn.getresponse(None).unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.from_promise().uid(), second.uid());
    assert!(conn.is_idle());
}

#[test]
fn test_early_response_while_flow_blocked() {
    let protocol = ScriptedProtocol::new(HttpVersion::Http3)
        .flow_blocked()
        .batch(vec![handshake()])
        .batch(vec![head(0, &[(":status", "417")], true)]);
    let submitted = protocol.submitted();
    let (mut conn, _transport) = attach(protocol);

    let request = conn
        .putrequest("PUT", "/big", false, false)
        .header("content-length", "1048576");
    assert!(conn.endheaders(request, true).unwrap().is_none());

    let err = conn.send(&[0u8; 1024], false).unwrap_err();
    let promise = match err {
        Error::EarlyResponse(promise) => promise,
        other => panic!("expected an early response, got {other:?}"),
    };
    assert!(submitted.lock().unwrap().data.is_empty());

    let response = conn.getresponse(Some(&promise)).unwrap();
    assert_eq!(response.status, 417);
    assert_eq!(response.method, "PUT");
}

#[test]
fn test_peer_closing_while_flow_blocked_is_a_termination_error() {
    let protocol = ScriptedProtocol::new(HttpVersion::Http3)
        .flow_blocked()
        .batch(vec![handshake()]);
    let submitted = protocol.submitted();
    let (mut conn, _transport) = attach(protocol);

    let request = conn
        .putrequest("PUT", "/big", false, false)
        .header("content-length", "1048576");
    assert!(conn.endheaders(request, true).unwrap().is_none());

    let err = conn.send(&[0u8; 1024], false).unwrap_err();
    assert!(
        matches!(err, Error::Protocol(ref m) if m == "connection closed"),
        "got {err:?}"
    );
    assert!(submitted.lock().unwrap().data.is_empty());
    assert!(matches!(conn.getresponse(None), Err(Error::ResponseNotReady)));
}

#[test]
fn test_bad_certificate_over_quic_is_ssl_error() {
    let protocol = ScriptedProtocol::new(HttpVersion::Http3).batch(vec![
        Event::ConnectionTerminated {
            error_code: 298,
            message: Some("certificate verify failed".into()),
        },
    ]);
    helpers::init_tracing();
    let transport = protocol.transport();
    let mut conn = HttpConnection::new(ConnectionConfig::new("example.com").https());
    let err = conn
        .attach_protocol(transport.boxed(), Box::new(protocol))
        .unwrap_err();
    assert!(matches!(err, Error::Ssl(ref m) if m.contains("Error 298")));
}

#[test]
fn test_stream_reset_is_reported() {
    let protocol = ScriptedProtocol::new(HttpVersion::Http3)
        .batch(vec![handshake()])
        .batch(vec![Event::StreamResetReceived {
            stream_id: 0,
            error_code: 0x10c,
        }]);
    let (mut conn, _transport) = attach(protocol);

    let request = conn.putrequest("GET", "/", false, false);
    conn.endheaders(request, false).unwrap();
    assert!(matches!(
        conn.getresponse(None),
        Err(Error::Protocol(ref m)) if m == "Stream 0 was reset by remote peer. Reason: 0x10c."
    ));
}

#[test]
fn test_unexpected_pseudo_header_is_rejected() {
    let protocol = ScriptedProtocol::new(HttpVersion::Http3)
        .batch(vec![handshake()])
        .batch(vec![head(0, &[(":status", "200"), (":path", "/")], true)]);
    let (mut conn, _transport) = attach(protocol);

    let request = conn.putrequest("GET", "/", false, false);
    conn.endheaders(request, false).unwrap();
    assert!(matches!(
        conn.getresponse(None),
        Err(Error::Protocol(ref m)) if m == "Unhandled special header ':path'"
    ));
}

#[test]
fn test_response_for_unknown_stream_is_rejected() {
    let protocol = ScriptedProtocol::new(HttpVersion::Http3)
        .batch(vec![handshake()])
        .batch(vec![head(8, &[(":status", "200")], true)]);
    let (mut conn, _transport) = attach(protocol);

    let request = conn.putrequest("GET", "/", false, false);
    conn.endheaders(request, false).unwrap();
    assert!(matches!(
        conn.getresponse(None),
        Err(Error::Protocol(ref m)) if m == "Response received (stream: 8) but no promise in-flight"
    ));
}
