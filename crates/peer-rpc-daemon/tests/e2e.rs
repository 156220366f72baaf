//! End-to-end tests for peer-rpc-daemon.
//!
//! Runs real heartbeat servers on loopback sockets and drives them with the
//! WebSocket transport, the client registry and raw WebSocket clients.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use peer_rpc::heartbeat::ping;
use peer_rpc::{
    ClientRegistry, Clock, ConnectionState, HEARTBEAT_METHOD, HeartbeatService, ManualClock,
    OffsetTable, PingRequest, RetryOptions, RpcContext, RpcError, SystemClock, Transport,
};
use peer_rpc_daemon::config::load_tls_config;
use peer_rpc_daemon::{Frame, HeartbeatServer, MAX_FRAME_SIZE, WsTransport};
use rustls::pki_types::PrivateKeyDer;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

/// A heartbeat server running on its own task.
struct TestServer {
    addr: SocketAddr,
    /// Offsets the server recorded from incoming heartbeats
    offsets: Arc<OffsetTable>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(clock: Arc<dyn Clock>) -> Self {
        let listener = HeartbeatServer::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("local addr");
        let offsets = Arc::new(OffsetTable::new());
        let service = Arc::new(HeartbeatService::new(clock, offsets.clone()));
        let task = tokio::spawn(HeartbeatServer::new(service).serve(listener));

        Self {
            addr,
            offsets,
            task,
        }
    }

    /// Start a server that only speaks TLS, with a fresh self-signed
    /// certificate for `localhost`. Returns the server and the PEM path of
    /// that certificate for use as a CA bundle.
    async fn start_tls(clock: Arc<dyn Clock>, dir: &Path) -> (Self, PathBuf) {
        let ca = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("Failed to generate certificate");
        let ca_path = dir.join("ca.pem");
        std::fs::write(&ca_path, ca.cert.pem()).expect("write CA bundle");

        let key = PrivateKeyDer::Pkcs8(ca.key_pair.serialize_der().into());
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_no_client_auth()
            .with_single_cert(vec![ca.cert.der().clone()], key)
            .expect("server config");
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = HeartbeatServer::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("local addr");
        let offsets = Arc::new(OffsetTable::new());
        let service = Arc::new(HeartbeatService::new(clock, offsets.clone()));

        let task = tokio::spawn(serve_tls(listener, acceptor, service));

        let server = Self {
            addr,
            offsets,
            task,
        };
        (server, ca_path)
    }

    /// Stop accepting and drop every open connection.
    async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Accept loop that completes the TLS handshake before handing the stream
/// to the heartbeat server.
async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    service: Arc<HeartbeatService>,
) -> anyhow::Result<()> {
    let mut server = HeartbeatServer::new(service);
    loop {
        let (stream, addr) = listener.accept().await?;
        match acceptor.accept(stream).await {
            Ok(tls_stream) => server.accept_connection(tls_stream, addr),
            Err(e) => eprintln!("TLS accept from {} failed: {}", addr, e),
        }
    }
}

fn registry(interval: Duration) -> (ClientRegistry, Arc<OffsetTable>) {
    let offsets = Arc::new(OffsetTable::new());
    let context = RpcContext::new(
        Arc::new(WsTransport::new()),
        Arc::new(SystemClock),
        offsets.clone(),
    )
    .with_heartbeat_interval(interval);
    (ClientRegistry::new(context), offsets)
}

/// An address nothing listens on.
async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr")
}

type RawClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn send_frame(ws: &mut RawClient, frame: &Frame) {
    let text = frame.to_text().expect("encode");
    ws.send(Message::Text(text.into())).await.expect("send");
}

async fn recv_frame(ws: &mut RawClient) -> Frame {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("Timed out waiting for frame");
        match msg {
            Some(Ok(Message::Text(text))) => {
                return Frame::from_bytes(text.as_bytes()).expect("Expected an envelope");
            }
            Some(Ok(Message::Close(_))) => panic!("Connection closed unexpectedly"),
            Some(Err(e)) => panic!("WebSocket error: {}", e),
            None => panic!("Stream ended unexpectedly"),
            _ => continue,
        }
    }
}

// ============================================================================
// Client lifecycle
// ============================================================================

#[tokio::test]
async fn test_client_becomes_ready_over_websocket() {
    let server = TestServer::start(Arc::new(SystemClock)).await;
    let (registry, offsets) = registry(Duration::from_millis(100));
    let peer = server.addr.to_string();

    let client = registry.get_or_create(&peer, None);
    timeout(WAIT, client.wait_ready())
        .await
        .expect("Timed out waiting for ready")
        .expect("Client closed before ready");

    assert_eq!(client.state(), ConnectionState::Ready);
    assert!(client.is_healthy());

    let local_addr = client.local_addr().expect("local address known");
    assert!(local_addr.starts_with("127.0.0.1:"));

    let offset = offsets.get(&peer).expect("offset recorded for peer");
    assert!(!offset.is_infinite());
    assert!(offset.error >= 0);

    // The first heartbeat carried our address; the server keys its estimate by it
    assert!(server.offsets.get(&local_addr).is_some());

    registry.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_clock_skew_is_measured() {
    let skew = 5_000_000_000;
    let server_clock = Arc::new(ManualClock::new(SystemClock.now() + skew));
    let server = TestServer::start(server_clock).await;
    let (registry, _offsets) = registry(Duration::from_millis(100));

    let client = registry.get_or_create(&server.addr.to_string(), None);
    timeout(WAIT, client.wait_ready())
        .await
        .expect("Timed out waiting for ready")
        .expect("Client closed before ready");

    // The server clock is frozen, so the estimate can only fall behind the skew
    let offset = client.remote_offset();
    assert!(offset.offset <= skew, "offset {} above skew", offset.offset);
    assert!(offset.offset > skew - 1_000_000_000, "offset {}", offset.offset);

    registry.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_server_shutdown_recycles_client() {
    let server = TestServer::start(Arc::new(SystemClock)).await;
    let (registry, _offsets) = registry(Duration::from_millis(100));
    let peer = server.addr.to_string();

    let client = registry.get_or_create(&peer, None);
    timeout(WAIT, client.wait_ready())
        .await
        .expect("Timed out waiting for ready")
        .expect("Client closed before ready");

    server.stop().await;

    timeout(WAIT, client.closed().wait())
        .await
        .expect("Client should close after its peer went away");
    assert!(!client.is_healthy());
    assert!(registry.get(&peer).is_none());

    let replacement = registry.get_or_create(&peer, None);
    assert!(!Arc::ptr_eq(&client, &replacement));
    assert!(!replacement.ready().is_fired());

    registry.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_peer_gives_up() {
    let (registry, _offsets) = registry(Duration::from_millis(100));
    let peer = unused_addr().await.to_string();
    let opts = RetryOptions {
        backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
        max_attempts: 2,
        ..RetryOptions::default()
    };

    let client = registry.get_or_create(&peer, Some(opts));
    timeout(WAIT, client.closed().wait())
        .await
        .expect("Client should give up after two attempts");

    assert!(!client.ready().is_fired());
    assert!(client.wait_ready().await.is_err());
    assert!(registry.get(&peer).is_none());
}

// ============================================================================
// TLS
// ============================================================================

#[tokio::test]
async fn test_client_becomes_ready_over_tls() {
    let dir = tempfile::tempdir().unwrap();
    let (server, ca_path) = TestServer::start_tls(Arc::new(SystemClock), dir.path()).await;
    let tls = load_tls_config(&ca_path).expect("CA bundle");

    let offsets = Arc::new(OffsetTable::new());
    let context = RpcContext::new(
        Arc::new(WsTransport::with_tls(tls)),
        Arc::new(SystemClock),
        offsets.clone(),
    )
    .with_heartbeat_interval(Duration::from_millis(100));
    let registry = ClientRegistry::new(context);
    let peer = format!("localhost:{}", server.addr.port());

    let client = registry.get_or_create(&peer, None);
    timeout(WAIT, client.wait_ready())
        .await
        .expect("Timed out waiting for ready")
        .expect("Client closed before ready");

    assert!(client.is_healthy());
    let local_addr = client.local_addr().expect("local address known over TLS");
    assert!(server.offsets.get(&local_addr).is_some());
    assert!(offsets.get(&peer).is_some());

    registry.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_untrusted_certificate_is_retried_then_given_up() {
    let server_dir = tempfile::tempdir().unwrap();
    let (server, _server_ca) =
        TestServer::start_tls(Arc::new(SystemClock), server_dir.path()).await;

    // A CA that did not sign the server's certificate
    let other_dir = tempfile::tempdir().unwrap();
    let other = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let other_ca = other_dir.path().join("other.pem");
    std::fs::write(&other_ca, other.cert.pem()).unwrap();
    let tls = load_tls_config(&other_ca).expect("CA bundle");

    let context = RpcContext::new(
        Arc::new(WsTransport::with_tls(tls)),
        Arc::new(SystemClock),
        Arc::new(OffsetTable::new()),
    );
    let registry = ClientRegistry::new(context);
    let opts = RetryOptions {
        backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
        max_attempts: 2,
        ..RetryOptions::default()
    };

    let client = registry.get_or_create(&format!("localhost:{}", server.addr.port()), Some(opts));
    timeout(WAIT, client.closed().wait())
        .await
        .expect("Client should give up after two attempts");
    assert!(!client.ready().is_fired());

    server.stop().await;
}

// ============================================================================
// Connection
// ============================================================================

#[tokio::test]
async fn test_ping_over_connection() {
    let server = TestServer::start(Arc::new(ManualClock::new(42))).await;

    let conn = WsTransport::new()
        .dial(&server.addr.to_string())
        .await
        .expect("dial");
    let request = PingRequest {
        ping: "hello".into(),
        addr: "10.0.0.9:26257".into(),
        ..PingRequest::default()
    };
    let response = ping(conn.as_ref(), &request).await.expect("ping");

    assert_eq!(response.pong, "hello");
    assert_eq!(response.server_time, 42);
    assert!(server.offsets.get("10.0.0.9:26257").is_some());

    conn.close();
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_calls_are_multiplexed() {
    let server = TestServer::start(Arc::new(ManualClock::new(7))).await;
    let conn = WsTransport::new()
        .dial(&server.addr.to_string())
        .await
        .expect("dial");

    let calls = (0..8).map(|i| {
        let conn = conn.clone();
        async move {
            let request = PingRequest {
                ping: format!("ping-{}", i),
                ..PingRequest::default()
            };
            ping(conn.as_ref(), &request).await
        }
    });
    let responses = futures::future::join_all(calls).await;

    for (i, response) in responses.into_iter().enumerate() {
        let response = response.expect("ping");
        assert_eq!(response.pong, format!("ping-{}", i));
    }

    conn.close();
    server.stop().await;
}

#[tokio::test]
async fn test_call_fails_after_server_goes_away() {
    let server = TestServer::start(Arc::new(SystemClock)).await;
    let conn = WsTransport::new()
        .dial(&server.addr.to_string())
        .await
        .expect("dial");

    server.stop().await;

    let result = timeout(WAIT, ping(conn.as_ref(), &PingRequest::default()))
        .await
        .expect("Call should fail instead of hanging");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_closed_connection_rejects_calls() {
    let server = TestServer::start(Arc::new(SystemClock)).await;
    let conn = WsTransport::new()
        .dial(&server.addr.to_string())
        .await
        .expect("dial");

    conn.close();
    conn.close();

    let err = ping(conn.as_ref(), &PingRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ConnectionClosed));

    server.stop().await;
}

#[tokio::test]
async fn test_dial_refused() {
    let addr = unused_addr().await.to_string();

    let result = WsTransport::new().dial(&addr).await;
    assert!(result.is_err());
}

// ============================================================================
// Server envelopes
// ============================================================================

#[tokio::test]
async fn test_unknown_method_answers_with_error() {
    let server = TestServer::start(Arc::new(SystemClock)).await;
    let (mut ws, _) = connect_async(format!("ws://{}", server.addr))
        .await
        .expect("Failed to connect");

    send_frame(&mut ws, &Frame::request(1, "Nope.Method", json!({}))).await;

    match recv_frame(&mut ws).await {
        Frame::Response { id, result, error } => {
            assert_eq!(id, 1);
            assert!(result.is_none());
            assert!(error.expect("error message").contains("Nope.Method"));
        }
        other => panic!("Expected response, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_frame_is_dropped() {
    let server = TestServer::start(Arc::new(ManualClock::new(99))).await;
    let (mut ws, _) = connect_async(format!("ws://{}", server.addr))
        .await
        .expect("Failed to connect");

    let padding = "x".repeat(MAX_FRAME_SIZE);
    let oversized = Frame::request(1, HEARTBEAT_METHOD, json!({ "ping": padding }));
    send_frame(&mut ws, &oversized).await;
    let body = serde_json::to_value(PingRequest::default()).expect("encode");
    send_frame(&mut ws, &Frame::request(2, HEARTBEAT_METHOD, body)).await;

    match recv_frame(&mut ws).await {
        Frame::Response { id, result, error } => {
            assert_eq!(id, 2, "oversized request should not be answered");
            assert!(error.is_none());
            assert_eq!(result.expect("result")["server_time"], 99);
        }
        other => panic!("Expected response, got {:?}", other),
    }

    server.stop().await;
}
