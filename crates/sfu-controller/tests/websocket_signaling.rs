//! End-to-end signaling over a real WebSocket.
//!
//! Binds the signaling router on an ephemeral port and talks to it with a
//! `tokio-tungstenite` client, the way a browser would.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sfu_controller::signaling::{signaling_router, SignalingState};
use sfu_test_utils::{TestSfu, CLIENT_WAIT};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    shutdown: CancellationToken,
    sfu: TestSfu,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_server() -> Server {
    let sfu = TestSfu::new();
    let shutdown = CancellationToken::new();
    let app = signaling_router(SignalingState {
        context: sfu.context.clone(),
        shutdown: shutdown.clone(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .unwrap();
    });

    Server {
        addr,
        shutdown,
        sfu,
    }
}

async fn connect(server: &Server) -> Client {
    let (client, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .expect("websocket handshake failed");
    client
}

async fn send(client: &mut Client, frame: Value) {
    client
        .send(Message::text(frame.to_string()))
        .await
        .unwrap();
}

/// Next JSON text frame from the server.
async fn recv(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(CLIENT_WAIT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if frame.is_text() {
            return serde_json::from_str(frame.to_text().unwrap()).unwrap();
        }
    }
}

/// Read frames until the response to `request_id` arrives.
async fn response(client: &mut Client, request_id: u64) -> Value {
    loop {
        let message = recv(client).await;
        if message["requestId"] == json!(request_id) {
            return message;
        }
    }
}

#[tokio::test]
async fn test_create_and_join_over_websocket() {
    let server = start_server().await;
    let mut client = connect(&server).await;

    send(
        &mut client,
        json!({"requestId": 1, "type": "createRoom", "roomId": "R1"}),
    )
    .await;
    let created = response(&mut client, 1).await;
    assert_eq!(created["type"], "roomCreated");
    assert_eq!(created["roomId"], "R1");

    send(
        &mut client,
        json!({"requestId": 2, "type": "joinRoom", "roomId": "R1", "peerId": "alice"}),
    )
    .await;
    let joined = response(&mut client, 2).await;
    assert_eq!(joined["type"], "roomJoined");
    assert_eq!(joined["peerId"], "alice");
    assert_eq!(joined["peers"], json!([]));
    assert!(joined["sendTransport"]["id"].is_string());
    assert!(joined["recvTransport"]["id"].is_string());
    assert!(!joined["routerRtpCapabilities"]["codecs"]
        .as_array()
        .unwrap()
        .is_empty());

    assert_eq!(server.sfu.rooms().await, vec!["R1".to_string()]);
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_survives() {
    let server = start_server().await;
    let mut client = connect(&server).await;

    client.send(Message::text("{not json")).await.unwrap();
    let error = recv(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "INVALID_MESSAGE");

    send(
        &mut client,
        json!({"requestId": 9, "type": "teleport", "roomId": "R1"}),
    )
    .await;
    let error = recv(&mut client).await;
    assert_eq!(error["code"], "INVALID_MESSAGE");
    assert_eq!(error["requestId"], 9);
    assert_eq!(error["operation"], "teleport");

    // The socket is still usable.
    send(
        &mut client,
        json!({"requestId": 10, "type": "createRoom", "roomId": "after"}),
    )
    .await;
    assert_eq!(response(&mut client, 10).await["type"], "roomCreated");
}

#[tokio::test]
async fn test_room_errors_carry_operation_and_request_id() {
    let server = start_server().await;
    let mut client = connect(&server).await;

    send(
        &mut client,
        json!({"requestId": 4, "type": "joinRoom", "roomId": "missing", "peerId": "c1"}),
    )
    .await;
    let error = response(&mut client, 4).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["operation"], "joinRoom");
    assert_eq!(error["code"], "ROOM_NOT_FOUND");
    assert!(error["message"].is_string());
}

#[tokio::test]
async fn test_second_peer_is_announced_over_websocket() {
    let server = start_server().await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;

    send(
        &mut alice,
        json!({"requestId": 1, "type": "createRoom", "roomId": "call"}),
    )
    .await;
    response(&mut alice, 1).await;
    send(
        &mut alice,
        json!({"requestId": 2, "type": "joinRoom", "roomId": "call", "peerId": "alice"}),
    )
    .await;
    response(&mut alice, 2).await;

    send(
        &mut bob,
        json!({"requestId": 1, "type": "joinRoom", "roomId": "call", "peerId": "bob"}),
    )
    .await;
    let joined = response(&mut bob, 1).await;
    assert_eq!(joined["peers"], json!(["alice"]));

    let announced = recv(&mut alice).await;
    assert_eq!(announced["type"], "newPeer");
    assert_eq!(announced["peerId"], "bob");
}

#[tokio::test]
async fn test_socket_close_tears_down_room() {
    let server = start_server().await;
    let mut client = connect(&server).await;

    send(
        &mut client,
        json!({"requestId": 1, "type": "createRoom", "roomId": "brief"}),
    )
    .await;
    response(&mut client, 1).await;
    send(
        &mut client,
        json!({"requestId": 2, "type": "joinRoom", "roomId": "brief", "peerId": "solo"}),
    )
    .await;
    response(&mut client, 2).await;

    client.close(None).await.unwrap();
    drop(client);

    // Teardown runs on the server after the close frame; poll for it.
    let deadline = tokio::time::Instant::now() + CLIENT_WAIT;
    while !server.sfu.rooms().await.is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "room was not torn down"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(
        server.sfu.engine.loopback().resource_counts().await,
        sfu_controller::media::ResourceCounts::default()
    );
}
