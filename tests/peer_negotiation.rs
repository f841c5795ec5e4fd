//! End-to-end negotiation between two sessions over the loopback engine
//!
//! The control layer is simulated by routing each recorded command to the
//! opposite session by hand, the way the real control layer dispatches
//! inbound signaling commands by recipient id.

mod harness;

use bytes::Bytes;
use harness::{wait_until, RecordingObserver};
use peerlink::engine::mock::MockEngine;
use peerlink::{ChannelConfig, CloseCode, PeerSession, SessionState};
use std::sync::Arc;

#[tokio::test]
async fn test_full_offer_answer_handshake() {
    let alice_observer = Arc::new(RecordingObserver::default());
    let bob_observer = Arc::new(RecordingObserver::default());

    let alice = PeerSession::new("alice", "bob", alice_observer.clone(), ChannelConfig::default());
    let bob = PeerSession::new("bob", "alice", bob_observer.clone(), ChannelConfig::default());

    let alice_engine = MockEngine::new();
    let bob_engine = MockEngine::new();

    alice.initialize(&alice_engine).await.unwrap();
    bob.initialize(&bob_engine).await.unwrap();

    // Alice offers, the "control layer" relays to Bob
    alice.create_offer().await.unwrap();
    assert_eq!(alice.state(), SessionState::Connecting);

    let (_, offer) = alice_observer.take_command("offersdp").unwrap();
    bob.receive_offer_sdp(offer["sdp"].as_str().unwrap().to_string())
        .await
        .unwrap();
    assert_eq!(bob.state(), SessionState::Connecting);

    // Bob's answer travels back
    let (_, answer) = bob_observer.take_command("answersdp").unwrap();
    alice
        .receive_answer_sdp(answer["sdp"].as_str().unwrap().to_string())
        .await
        .unwrap();

    // Candidates discovered on either side cross over
    let alice_handle = alice_engine.last_handle().unwrap();
    let bob_handle = bob_engine.last_handle().unwrap();

    alice_handle.emit(peerlink::EngineEvent::IceCandidate(
        peerlink::IceCandidate {
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
            candidate: "candidate:alice-host".to_string(),
        },
    ));
    wait_until("alice candidate forwarded", || {
        alice_observer
            .commands
            .lock()
            .iter()
            .any(|(_, name, _)| name == "ice_candidate")
    })
    .await;

    let (_, candidate) = alice_observer.take_command("ice_candidate").unwrap();
    bob.add_ice_candidate(
        candidate["sdp_mid"].as_str().unwrap(),
        candidate["sdp_mline_index"].as_u64().unwrap() as u16,
        candidate["candidate"].as_str().unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(bob_handle.candidates().len(), 1);

    // Direct path comes up: each side sees its own channel open plus the
    // remote-initiated one
    alice_handle.channels()[0].open();
    let alice_remote = alice_handle.emit_remote_channel("peer-data-alice");
    bob_handle.channels()[0].open();
    let bob_remote = bob_handle.emit_remote_channel("peer-data-bob");

    alice_remote.open();
    bob_remote.open();

    wait_until("both sessions open", || {
        alice.state() == SessionState::Open && bob.state() == SessionState::Open
    })
    .await;

    assert_eq!(alice_observer.connected.lock().as_slice(), ["bob".to_string()]);
    assert_eq!(bob_observer.connected.lock().as_slice(), ["alice".to_string()]);

    // Data sent by Alice lands in her local transport channel; delivery to
    // Bob is simulated through his remote-initiated channel
    alice.send(Bytes::from_static(b"hello bob")).await.unwrap();
    assert_eq!(alice_handle.channels()[0].sent().len(), 1);

    bob_remote.push_message(Bytes::from_static(b"hello bob"));
    wait_until("bob received the message", || {
        !bob_observer.messages.lock().is_empty()
    })
    .await;
    assert_eq!(
        bob_observer.messages.lock()[0],
        ("alice".to_string(), Bytes::from_static(b"hello bob"))
    );

    // Orderly teardown on both sides, exactly one notification each
    alice.close(CloseCode::Normal).await.unwrap();
    bob.close(CloseCode::Normal).await.unwrap();
    assert_eq!(alice.state(), SessionState::Closed);
    assert_eq!(bob.state(), SessionState::Closed);
    assert!(alice_handle.is_closed());
    assert!(bob_handle.is_closed());
    assert_eq!(alice_observer.closed.lock().len(), 1);
    assert_eq!(bob_observer.closed.lock().len(), 1);
}

#[tokio::test]
async fn test_abnormal_loss_funnels_through_control() {
    let observer = Arc::new(RecordingObserver::default());
    let session = PeerSession::new("alice", "bob", observer.clone(), ChannelConfig::default());
    let engine = MockEngine::new();

    session.initialize(&engine).await.unwrap();
    session.create_offer().await.unwrap();

    let handle = engine.last_handle().unwrap();
    handle.channels()[0].open();
    let remote = handle.emit_remote_channel("peer-data-alice");
    remote.open();
    wait_until("session open", || session.state() == SessionState::Open).await;

    // The transport loses the remote-initiated channel
    remote.set_state(peerlink::ChannelState::Closed);
    wait_until("control asked to close the peer", || {
        !observer.close_requests.lock().is_empty()
    })
    .await;

    let requests = observer.close_requests.lock().clone();
    assert_eq!(requests[0], ("bob".to_string(), CloseCode::GoingAway, true));

    // Control layer reacts by closing; the session reports exactly once
    session.close(CloseCode::GoingAway).await.unwrap();
    assert_eq!(observer.closed.lock().len(), 1);
    assert_eq!(
        observer.closed.lock()[0],
        ("bob".to_string(), CloseCode::GoingAway)
    );
}
