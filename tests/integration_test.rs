//! Integration tests driving a real in-process relay server over WebSocket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use push_relay::server::{RelayServer, ServerConfig, ServerError, ServerEvent};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Start a relay server on a free port.
async fn start_server(
    password: &str,
    auth_window: Duration,
) -> (
    RelayServer,
    mpsc::UnboundedReceiver<ServerEvent>,
    String,
) {
    let config = ServerConfig::new("127.0.0.1", 0, password).with_auth_window(auth_window);
    let (server, events) = RelayServer::start(config)
        .await
        .expect("server should start on a free port");
    let url = format!("ws://{}/ws", server.local_addr());
    (server, events, url)
}

async fn connect(url: &str) -> WsClient {
    let (ws, _response) = connect_async(url).await.expect("client should connect");
    ws
}

/// Read the next text frame or panic.
async fn recv_text(ws: &mut WsClient) -> String {
    match timeout(RECV_TIMEOUT, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text.as_str().to_string(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

/// Expect the connection to end without any further text frame.
async fn expect_closed(ws: &mut WsClient) {
    match timeout(RECV_TIMEOUT, ws.next()).await {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {}
        // An abrupt TCP teardown counts as closed too.
        Ok(Some(Err(_))) => {}
        Ok(Some(Ok(other))) => panic!("expected close, got frame {:?}", other),
        Err(_) => panic!("timed out waiting for the connection to close"),
    }
}

/// Expect no frame at all within the given window.
async fn expect_silence(ws: &mut WsClient, window: Duration) {
    if let Ok(frame) = timeout(window, ws.next()).await {
        panic!("expected silence, got {:?}", frame);
    }
}

async fn wait_for_closed_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> u64 {
    match timeout(RECV_TIMEOUT, events.recv()).await {
        Ok(Some(ServerEvent::ConnectionClosed { id })) => id,
        other => panic!("expected ConnectionClosed event, got {:?}", other),
    }
}

/// Connect and complete the handshake with the given password line.
async fn connect_and_authenticate(url: &str, password: &str) -> WsClient {
    let mut ws = connect(url).await;
    assert_eq!(recv_text(&mut ws).await, "ACK");
    ws.send(Message::text(password))
        .await
        .expect("password frame should send");
    assert_eq!(recv_text(&mut ws).await, "READY");
    ws
}

#[tokio::test]
async fn test_correct_password_observes_ack_then_ready() {
    // given:
    let (server, _events, url) = start_server("swordfish", Duration::from_secs(2)).await;

    // when:
    let mut ws = connect(&url).await;
    let first = recv_text(&mut ws).await;
    ws.send(Message::text("swordfish")).await.unwrap();
    let second = recv_text(&mut ws).await;

    // then:
    assert_eq!(first, "ACK");
    assert_eq!(second, "READY");
    assert_eq!(server.authenticated_count().await, 1);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_password_line_with_trailing_newline_is_accepted() {
    // given:
    let (server, _events, url) = start_server("swordfish", Duration::from_secs(2)).await;

    // when:
    let mut ws = connect(&url).await;
    assert_eq!(recv_text(&mut ws).await, "ACK");
    ws.send(Message::text("swordfish\n")).await.unwrap();

    // then:
    assert_eq!(recv_text(&mut ws).await, "READY");
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_observes_ack_then_fail_then_close() {
    // given:
    let (server, mut events, url) = start_server("swordfish", Duration::from_secs(2)).await;

    // when:
    let mut ws = connect(&url).await;
    assert_eq!(recv_text(&mut ws).await, "ACK");
    ws.send(Message::text("wrong")).await.unwrap();

    // then:
    assert_eq!(recv_text(&mut ws).await, "FAIL");
    expect_closed(&mut ws).await;
    wait_for_closed_event(&mut events).await;
    assert_eq!(server.connection_count().await, 0);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_auth_timeout_closes_silently() {
    // given: a short auth window so the test stays fast
    let (server, mut events, url) = start_server("swordfish", Duration::from_millis(200)).await;

    // when: connect and send nothing
    let mut ws = connect(&url).await;
    assert_eq!(recv_text(&mut ws).await, "ACK");

    // then: no READY, no FAIL, just the disconnect
    expect_closed(&mut ws).await;
    wait_for_closed_event(&mut events).await;
    assert_eq!(server.connection_count().await, 0);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_authenticated_connections_only() {
    // given: one authenticated client and one still awaiting auth
    let (server, _events, url) = start_server("swordfish", Duration::from_secs(2)).await;
    let mut authed = connect_and_authenticate(&url, "swordfish").await;
    let mut pending = connect(&url).await;
    assert_eq!(recv_text(&mut pending).await, "ACK");

    // when:
    server.broadcast("update:1").await;

    // then: the authenticated client gets exactly the payload, the pending
    // one gets nothing
    assert_eq!(recv_text(&mut authed).await, "update:1");
    expect_silence(&mut pending, Duration::from_millis(300)).await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broadcasts_arrive_in_call_order() {
    // given:
    let (server, _events, url) = start_server("swordfish", Duration::from_secs(2)).await;
    let mut ws = connect_and_authenticate(&url, "swordfish").await;
    let handle = server.handle();

    // when:
    for i in 0..5 {
        handle.broadcast(format!("update:{}", i)).await;
    }

    // then:
    for i in 0..5 {
        assert_eq!(recv_text(&mut ws).await, format!("update:{}", i));
    }
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_every_authenticated_client() {
    // given:
    let (server, _events, url) = start_server("swordfish", Duration::from_secs(2)).await;
    let mut alice = connect_and_authenticate(&url, "swordfish").await;
    let mut bob = connect_and_authenticate(&url, "swordfish").await;
    let mut carol = connect_and_authenticate(&url, "swordfish").await;
    assert_eq!(server.authenticated_count().await, 3);

    // when:
    server.broadcast("fanout").await;

    // then:
    assert_eq!(recv_text(&mut alice).await, "fanout");
    assert_eq!(recv_text(&mut bob).await, "fanout");
    assert_eq!(recv_text(&mut carol).await, "fanout");
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_all_connections_exactly_once() {
    // given: two authenticated clients
    let (server, mut events, url) = start_server("swordfish", Duration::from_secs(2)).await;
    let mut alice = connect_and_authenticate(&url, "swordfish").await;
    let mut bob = connect_and_authenticate(&url, "swordfish").await;

    // when:
    server.shutdown().await.unwrap();

    // then: both connections end and each termination event fires once
    expect_closed(&mut alice).await;
    expect_closed(&mut bob).await;
    let first = wait_for_closed_event(&mut events).await;
    let second = wait_for_closed_event(&mut events).await;
    assert_ne!(first, second);
    assert!(
        timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err(),
        "no further termination events expected"
    );
}

#[tokio::test]
async fn test_shutdown_stops_a_client_awaiting_auth() {
    // given: a client that connected but never sent the password
    let (server, mut events, url) = start_server("swordfish", Duration::from_secs(30)).await;
    let mut pending = connect(&url).await;
    assert_eq!(recv_text(&mut pending).await, "ACK");

    // when:
    server.shutdown().await.unwrap();

    // then: the handshake does not get to linger for its full window
    expect_closed(&mut pending).await;
    wait_for_closed_event(&mut events).await;
}

#[tokio::test]
async fn test_aborted_upgrade_does_not_leak_a_registry_entry() {
    // given: a short auth window so every teardown path fires quickly
    let (server, _events, _url) = start_server("swordfish", Duration::from_millis(200)).await;
    let addr = server.local_addr();

    // when: a client speaks just enough HTTP to start the upgrade, then
    // tears the socket down without ever driving the WebSocket
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    // let the server register the connection before the abort
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(stream);

    // then: whether the upgrade completed or errored, the entry leaves the
    // registry instead of lingering as a permanent half-open connection
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        if server.connection_count().await == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("registry still holds the aborted connection");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_completes_during_connection_churn() {
    // given: a long auth window (a leaked AwaitingAuth entry would pin the
    // server for the whole window) and a stream of clients connecting while
    // shutdown begins
    let (server, _events, url) = start_server("swordfish", Duration::from_secs(30)).await;
    let churn_url = url.clone();
    let churn = tokio::spawn(async move {
        for _ in 0..50 {
            if let Ok((mut ws, _)) = connect_async(&churn_url).await {
                // ACK, the shutdown close, or the rejection
                let _ = ws.next().await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // when / then: late registrations are either drained or refused, so
    // shutdown never waits on a connection it cannot close
    timeout(Duration::from_secs(5), server.shutdown())
        .await
        .expect("shutdown should not hang on in-flight connections")
        .unwrap();
    churn.await.unwrap();
}

#[tokio::test]
async fn test_bind_failure_is_reported_not_swallowed() {
    // given: a server occupying a port
    let (server, _events, _url) = start_server("swordfish", Duration::from_secs(2)).await;
    let addr = server.local_addr();

    // when: a second server tries the same port
    let config = ServerConfig::new(addr.ip().to_string(), addr.port(), "swordfish");
    let result = RelayServer::start(config).await;

    // then:
    match result {
        Err(ServerError::Bind { .. }) => {}
        other => panic!("expected a bind error, got {:?}", other.map(|_| ())),
    }
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_relay_scenario_with_mixed_clients() {
    // The documented protocol walkthrough: alice logs in with the right
    // password, bob fails, then the application broadcasts an update.

    // given:
    let (server, mut events, url) = start_server("swordfish", Duration::from_secs(2)).await;

    let mut alice = connect(&url).await;
    assert_eq!(recv_text(&mut alice).await, "ACK");
    alice.send(Message::text("swordfish")).await.unwrap();
    assert_eq!(recv_text(&mut alice).await, "READY");

    let mut bob = connect(&url).await;
    assert_eq!(recv_text(&mut bob).await, "ACK");
    bob.send(Message::text("wrong")).await.unwrap();
    assert_eq!(recv_text(&mut bob).await, "FAIL");
    expect_closed(&mut bob).await;
    wait_for_closed_event(&mut events).await;

    // when:
    server.broadcast("update:1").await;

    // then: alice receives the update, bob is long gone
    assert_eq!(recv_text(&mut alice).await, "update:1");
    assert_eq!(server.authenticated_count().await, 1);
    server.shutdown().await.unwrap();
}
