//! Signaling client against a local WebSocket accept loop

mod harness;

use futures_util::{SinkExt, StreamExt};
use harness::wait_until;
use parking_lot::Mutex;
use peerlink::{CloseCode, CommandEnvelope, SignalingClient, SignalingConfig, SignalingState};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

async fn read_envelope(ws: &mut WebSocketStream<TcpStream>) -> CommandEnvelope {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return CommandEnvelope::from_json(&text).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_open_handshake_and_command_delivery() {
    let (listener, url) = bind().await;
    let client = SignalingClient::new(SignalingConfig::new(&url)).unwrap();

    let received = Arc::new(Mutex::new(Vec::<CommandEnvelope>::new()));
    let sink = received.clone();
    client.on_command(move |envelope| sink.lock().push(envelope));

    client.open("alice", "secret").unwrap();
    let mut server = accept(&listener).await;

    // Transport-level open is followed by the authentication command
    let open = read_envelope(&mut server).await;
    assert_eq!(open.command, "open");
    assert_eq!(open.id, None);
    assert_eq!(open.data["id"], "alice");
    assert_eq!(open.data["password"], "secret");

    wait_until("client opened", || client.opened()).await;

    // Server acknowledges with the assigned session id
    let ack = CommandEnvelope::global("open", serde_json::json!({ "session_id": "sess-1" }));
    server
        .send(Message::Text(ack.to_json().unwrap()))
        .await
        .unwrap();
    wait_until("session id recorded", || client.session_id() == "sess-1").await;

    // Inbound per-peer command reaches the single subscriber
    let offer = CommandEnvelope::to_peer(
        "alice",
        "offersdp",
        serde_json::json!({ "sdp": "v=0 remote-offer" }),
    );
    server
        .send(Message::Text(offer.to_json().unwrap()))
        .await
        .unwrap();
    wait_until("command delivered", || received.lock().len() == 2).await;
    assert_eq!(received.lock()[1].command, "offersdp");

    // Outbound per-peer command carries the recipient id
    client
        .send_command("bob", "answersdp", serde_json::json!({ "sdp": "v=0 answer" }))
        .unwrap();
    let answer = read_envelope(&mut server).await;
    assert_eq!(answer.id.as_deref(), Some("bob"));
    assert_eq!(answer.command, "answersdp");

    client.close_sync().await.unwrap();
    assert_eq!(client.state(), SignalingState::Closed);
}

#[tokio::test]
async fn test_reconnects_after_unexpected_drop() {
    let (listener, url) = bind().await;
    let config = SignalingConfig::new(&url)
        .with_reconnect_delay(50)
        .with_reconnect_delay_max(200);
    let client = SignalingClient::new(config).unwrap();

    client.open("alice", "secret").unwrap();

    // First connection: read the open command, then drop without a close
    // handshake
    {
        let mut server = accept(&listener).await;
        let open = read_envelope(&mut server).await;
        assert_eq!(open.command, "open");
    }

    // The client reconnects on its own and re-authenticates
    let mut server = accept(&listener).await;
    let reopen = read_envelope(&mut server).await;
    assert_eq!(reopen.command, "open");
    assert_eq!(reopen.data["id"], "alice");

    wait_until("client opened again", || client.opened()).await;
    client.close_sync().await.unwrap();
}

#[tokio::test]
async fn test_attempt_exhaustion_surfaces_closed() {
    // Reserve a port with nothing listening on it
    let (listener, url) = bind().await;
    drop(listener);

    let config = SignalingConfig::new(&url)
        .with_reconnect_attempts(2)
        .with_reconnect_delay(20)
        .with_reconnect_delay_max(40);
    let client = SignalingClient::new(config).unwrap();

    let closes = Arc::new(Mutex::new(Vec::<CloseCode>::new()));
    let sink = closes.clone();
    client.on_closed(move |code| sink.lock().push(code));

    client.open("alice", "secret").unwrap();

    wait_until("attempt limit reached", || !closes.lock().is_empty()).await;
    assert_eq!(closes.lock()[0], CloseCode::Abnormal);
    assert_eq!(client.state(), SignalingState::Closed);
}

#[tokio::test]
async fn test_explicit_close_cancels_reconnection() {
    let (listener, url) = bind().await;
    let config = SignalingConfig::new(&url)
        .with_reconnect_delay(50)
        .with_reconnect_delay_max(100);
    let client = SignalingClient::new(config).unwrap();

    let closes = Arc::new(Mutex::new(Vec::<CloseCode>::new()));
    let sink = closes.clone();
    client.on_closed(move |code| sink.lock().push(code));

    client.open("alice", "secret").unwrap();
    let mut server = accept(&listener).await;
    let _ = read_envelope(&mut server).await;
    wait_until("client opened", || client.opened()).await;

    client.close_sync().await.unwrap();
    assert_eq!(client.state(), SignalingState::Closed);
    assert_eq!(closes.lock().as_slice(), [CloseCode::Normal]);

    // No reconnection after teardown: the listener sees no new connection
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(client.state(), SignalingState::Closed);
    assert_eq!(closes.lock().len(), 1);
}
