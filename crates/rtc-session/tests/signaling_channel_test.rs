//! Signaling channel behaviour against an in-process relay

mod harness;

use harness::{eventually, MemoryRelay, SESSION_ID};
use rtc_session::peer::{IceCandidate, SessionDescription};
use rtc_session::signaling::SignalingMessage;
use rtc_session::{Error, SignalingChannel, SignalingConfig, SignalingState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn channel(relay: &Arc<MemoryRelay>, user: &str) -> SignalingChannel {
    channel_with(relay, user, |_| {})
}

fn channel_with<F>(relay: &Arc<MemoryRelay>, user: &str, tweak: F) -> SignalingChannel
where
    F: FnOnce(&mut SignalingConfig),
{
    let mut config = SignalingConfig::new("ws://relay.test/signal", SESSION_ID, user);
    config.reconnect_delay_step = Duration::from_millis(100);
    config.ping_interval = None;
    tweak(&mut config);
    SignalingChannel::new(config, Arc::clone(relay) as _)
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

fn candidate_from(from: &str, target: Option<&str>, line: &str) -> SignalingMessage {
    SignalingMessage::IceCandidate {
        from: from.to_string(),
        target: target.map(str::to_string),
        candidate: IceCandidate::new(line),
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_announces_join() {
    let relay = MemoryRelay::new();
    let alice = channel(&relay, "alice");
    let bob = channel(&relay, "bob");

    let (tx, mut joins) = mpsc::unbounded_channel();
    alice
        .on_join(move |user| {
            let _ = tx.send(user);
        })
        .await;

    alice.connect("token").await.unwrap();
    assert_eq!(alice.state(), SignalingState::Connected);
    assert!(alice.is_connected());
    assert_eq!(relay.sent_by("alice", "join").len(), 1);

    bob.connect("token").await.unwrap();
    assert_eq!(recv(&mut joins).await, "bob");
    assert!(alice.participants().contains(&"bob".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_offer_answer_routed_between_participants() {
    let relay = MemoryRelay::new();
    let alice = channel(&relay, "alice");
    let bob = channel(&relay, "bob");

    let (offer_tx, mut offers) = mpsc::unbounded_channel();
    bob.on_offer(move |from, desc| {
        let _ = offer_tx.send((from, desc));
    })
    .await;
    let (answer_tx, mut answers) = mpsc::unbounded_channel();
    alice
        .on_answer(move |from, desc| {
            let _ = answer_tx.send((from, desc));
        })
        .await;

    alice.connect("token").await.unwrap();
    bob.connect("token").await.unwrap();

    let offer = SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
    alice.send_offer(Some("bob"), &offer).unwrap();
    assert_eq!(recv(&mut offers).await, ("alice".to_string(), offer));

    let answer = SessionDescription::answer("v=0\r\n");
    bob.send_answer(Some("alice"), &answer).unwrap();
    assert_eq!(recv(&mut answers).await, ("bob".to_string(), answer));
}

#[tokio::test(start_paused = true)]
async fn test_own_and_misaddressed_messages_are_ignored() {
    let relay = MemoryRelay::new();
    let alice = channel(&relay, "alice");

    let (tx, mut candidates) = mpsc::unbounded_channel();
    alice
        .on_ice_candidate(move |from, candidate| {
            let _ = tx.send((from, candidate.candidate));
        })
        .await;
    alice.connect("token").await.unwrap();

    relay.inject("alice", candidate_from("alice", None, "candidate:echo"));
    relay.inject("alice", candidate_from("bob", Some("carol"), "candidate:carol"));
    relay.inject("alice", candidate_from("bob", Some("alice"), "candidate:mine"));

    let (from, line) = recv(&mut candidates).await;
    assert_eq!(from, "bob");
    assert_eq!(line, "candidate:mine");
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_malformed_messages_are_dropped() {
    let relay = MemoryRelay::new();
    let alice = channel(&relay, "alice");

    let (tx, mut candidates) = mpsc::unbounded_channel();
    alice
        .on_ice_candidate(move |_, candidate| {
            let _ = tx.send(candidate.candidate);
        })
        .await;
    alice.connect("token").await.unwrap();

    relay.inject_raw("alice", r#"{"type":"hello","userId":"bob"}"#);
    relay.inject_raw("alice", "not json at all");
    relay.inject_raw("alice", r#"{"type":"offer","userId":"bob"}"#);
    relay.inject("alice", candidate_from("bob", None, "candidate:after"));

    assert_eq!(recv(&mut candidates).await, "candidate:after");
    assert_eq!(alice.state(), SignalingState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_ping_answered_with_pong() {
    let relay = MemoryRelay::new();
    let alice = channel(&relay, "alice");
    alice.connect("token").await.unwrap();

    relay.inject(
        "alice",
        SignalingMessage::Ping {
            from: "bob".to_string(),
            timestamp: Some(7),
        },
    );

    eventually("pong", || !relay.sent_by("alice", "pong").is_empty()).await;
    assert_eq!(relay.sent_by("alice", "pong")[0].timestamp, Some(7));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_ping_records_pong() {
    let relay = MemoryRelay::new();
    let alice = channel_with(&relay, "alice", |c| {
        c.ping_interval = Some(Duration::from_secs(1));
    });
    alice.connect("token").await.unwrap();
    assert!(alice.last_pong().is_none());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    eventually("keepalive pong", || alice.last_pong().is_some()).await;
    assert!(!relay.sent_by("alice", "ping").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_transport_drop() {
    let relay = MemoryRelay::new();
    let alice = channel(&relay, "alice");

    let (tx, mut states) = mpsc::unbounded_channel();
    alice
        .on_state_change(move |state| {
            let _ = tx.send(state);
        })
        .await;
    alice.connect("token").await.unwrap();
    assert_eq!(recv(&mut states).await, SignalingState::Connecting);
    assert_eq!(recv(&mut states).await, SignalingState::Connected);

    relay.drop_participant("alice");

    assert_eq!(recv(&mut states).await, SignalingState::Disconnected);
    assert_eq!(
        recv(&mut states).await,
        SignalingState::Reconnecting { attempt: 1 }
    );
    assert_eq!(recv(&mut states).await, SignalingState::Connected);
    assert_eq!(relay.connections("alice"), 2);
    eventually("second join", || relay.sent_by("alice", "join").len() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_budget_exhausted() {
    let relay = MemoryRelay::new();
    let alice = channel_with(&relay, "alice", |c| c.max_reconnect_attempts = 2);
    alice.connect("token").await.unwrap();

    relay.refuse(true);
    relay.drop_participant("alice");

    eventually("signaling failed", || {
        alice.state() == SignalingState::Failed
    })
    .await;
    assert_eq!(relay.connections("alice"), 1);

    let err = alice
        .send_ice_candidate(None, &IceCandidate::new("candidate:late"))
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_connect_fails_when_relay_unreachable() {
    let relay = MemoryRelay::new();
    relay.refuse(true);
    let alice = channel_with(&relay, "alice", |c| c.max_reconnect_attempts = 3);

    let err = alice.connect("token").await.unwrap_err();
    assert!(matches!(err, Error::SignalingExhausted(3)));
    assert!(err.is_fatal());
    assert_eq!(alice.state(), SignalingState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_sends_leave_once() {
    let relay = MemoryRelay::new();
    let alice = channel(&relay, "alice");
    let bob = channel(&relay, "bob");

    let (tx, mut leaves) = mpsc::unbounded_channel();
    bob.on_leave(move |user| {
        let _ = tx.send(user);
    })
    .await;

    alice.connect("token").await.unwrap();
    bob.connect("token").await.unwrap();

    alice.disconnect().await;
    alice.disconnect().await;

    assert_eq!(recv(&mut leaves).await, "alice");
    assert_eq!(alice.state(), SignalingState::Closed);
    assert_eq!(relay.sent_by("alice", "leave").len(), 1);
    assert!(alice.participants().is_empty());

    // No reconnect after a deliberate close.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(relay.connections("alice"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_refused_after_disconnect() {
    let relay = MemoryRelay::new();
    let alice = channel(&relay, "alice");

    alice.disconnect().await;
    let err = alice.connect("token").await.unwrap_err();
    assert!(matches!(err, Error::SignalingError(_)));
    assert_eq!(alice.state(), SignalingState::Closed);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(relay.connections("alice"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_relay_error_and_participant_update() {
    let relay = MemoryRelay::new();
    let alice = channel(&relay, "alice");

    let (err_tx, mut errors) = mpsc::unbounded_channel();
    alice
        .on_remote_error(move |from, message| {
            let _ = err_tx.send((from, message));
        })
        .await;
    let (update_tx, mut updates) = mpsc::unbounded_channel();
    alice
        .on_participant_update(move |from, data| {
            let _ = update_tx.send((from, data));
        })
        .await;
    alice.connect("token").await.unwrap();

    relay.inject(
        "alice",
        SignalingMessage::Error {
            from: "relay".to_string(),
            message: "room full".to_string(),
        },
    );
    assert_eq!(
        recv(&mut errors).await,
        ("relay".to_string(), "room full".to_string())
    );

    relay.inject(
        "alice",
        SignalingMessage::ParticipantUpdate {
            from: "bob".to_string(),
            data: serde_json::json!({ "muted": true }),
        },
    );
    let (from, data) = recv(&mut updates).await;
    assert_eq!(from, "bob");
    assert_eq!(data["muted"], true);
}
