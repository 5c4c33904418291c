//! Session test harness
//!
//! Runs real [`SessionController`]s against scripted collaborators:
//! - [`MemoryRelay`]: in-process signaling relay
//! - [`FakePeerFactory`] / [`FakePeer`]: recording peer connections
//! - [`FakeMediaProvider`]: capture that can be told to refuse
//!
//! Tests run on a paused clock, so backoffs and monitor periods elapse
//! instantly while keeping their relative order.

#![allow(dead_code)]

pub mod media;
pub mod peer;
pub mod relay;

pub use media::{FakeMediaProvider, FakeTrack};
pub use peer::{FakeDataChannel, FakePeer, FakePeerFactory};
pub use relay::MemoryRelay;

use rtc_session::peer::IceCandidate;
use rtc_session::{
    SessionConfig, SessionController, SessionEvent, SessionIdentity, SessionOptions, SessionState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const SESSION_ID: &str = "consult-42";

/// Short timings so a whole reconnect cycle fits in a few virtual seconds
pub fn test_config() -> SessionConfig {
    SessionConfig {
        signaling_url: "ws://relay.test/signal".to_string(),
        options: SessionOptions {
            reconnect_backoff_base_ms: 100,
            reconnect_backoff_max_ms: 1000,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_multiplier: 5,
            quality_interval_ms: 1000,
            ice_flush_debounce_ms: 100,
            ice_send_stagger_ms: 10,
            signaling_reconnect_delay_ms: 100,
            signaling_ping_interval_ms: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// `candidate:` line of the given type and priority
pub fn candidate(typ: &str, priority: u32) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{} 1 udp {} 10.0.0.{} {} typ {}",
        priority,
        priority,
        priority % 250,
        40000 + priority % 20000,
        typ
    ))
    .with_mid("0", 0)
}

/// Poll `check` on the paused clock until it holds
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..2000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// One controller plus its scripted collaborators
pub struct TestSession {
    pub controller: Arc<SessionController>,
    pub media: Arc<FakeMediaProvider>,
    pub peers: Arc<FakePeerFactory>,
    pub events: broadcast::Receiver<SessionEvent>,
}

impl TestSession {
    pub fn new(relay: &Arc<MemoryRelay>, user: &str, config: SessionConfig) -> Self {
        Self::with_media(relay, user, config, FakeMediaProvider::default())
    }

    pub fn with_media(
        relay: &Arc<MemoryRelay>,
        user: &str,
        config: SessionConfig,
        media: FakeMediaProvider,
    ) -> Self {
        let media = Arc::new(media);
        let peers = Arc::new(FakePeerFactory::default());
        let controller = SessionController::with_connector(
            config,
            SessionIdentity::new(SESSION_ID, user),
            Arc::clone(&media) as _,
            Arc::clone(&peers) as _,
            Arc::clone(relay) as _,
        )
        .expect("valid test config");
        let events = controller.subscribe();

        Self {
            controller: Arc::new(controller),
            media,
            peers,
            events,
        }
    }

    /// Wait for the first event matching `pred`, skipping the rest
    pub async fn wait_for<F>(&mut self, what: &str, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        let events = &mut self.events;
        let found = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event stream closed while waiting for {}", what)
                    }
                }
            }
        })
        .await;
        found.unwrap_or_else(|_| panic!("timed out waiting for {}", what))
    }

    pub async fn wait_for_state(&mut self, state: SessionState) {
        self.wait_for(&format!("state {}", state), |e| {
            *e == SessionEvent::ConnectionStateChanged(state)
        })
        .await;
    }

    pub async fn wait_for_peers(&self, count: usize) {
        let peers = Arc::clone(&self.peers);
        eventually(&format!("{} peer connections", count), move || {
            peers.count() >= count
        })
        .await;
    }

    /// Drain events already delivered
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}
