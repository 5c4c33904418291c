//! Session-scoped signaling channel
//!
//! Keeps one transport to the relay open for the lifetime of a session,
//! reconnecting with a linearly growing delay when it drops, and routes
//! validated inbound messages to per-type callbacks.

use super::connector::{SignalingConnector, SignalingLink};
use super::protocol::{Envelope, SignalingMessage};
use crate::config::SessionConfig;
use crate::peer::{IceCandidate, SessionDescription};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

/// Callback for join/leave of a remote participant
pub type ParticipantCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Callback for a received offer or answer
pub type DescriptionCallback = Arc<dyn Fn(String, SessionDescription) + Send + Sync>;

/// Callback for a received ICE candidate
pub type CandidateCallback = Arc<dyn Fn(String, IceCandidate) + Send + Sync>;

/// Callback for participant metadata updates
pub type ParticipantUpdateCallback = Arc<dyn Fn(String, Value) + Send + Sync>;

/// Callback for relay/remote error reports (sender, message)
pub type RemoteErrorCallback = Arc<dyn Fn(String, String) + Send + Sync>;

/// Callback for connection state changes
pub type StateCallback = Arc<dyn Fn(SignalingState) + Send + Sync>;

/// Connection state of the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// Not connected
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Transport open
    Connected,
    /// Reconnect attempt in progress
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Reconnect budget exhausted
    Failed,
    /// Closed by [`SignalingChannel::disconnect`]
    Closed,
}

/// Signaling channel settings
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Relay base URL (ws:// or wss://)
    pub url: String,

    /// Session identifier, appended as a path segment
    pub session_id: String,

    /// Local participant identifier
    pub user_id: String,

    /// Reconnect attempts after a drop before giving up
    pub max_reconnect_attempts: u32,

    /// Delay step; attempt k waits `k * step`
    pub reconnect_delay_step: Duration,

    /// Client keepalive ping period (None disables)
    pub ping_interval: Option<Duration>,
}

impl SignalingConfig {
    /// Settings with default budgets
    pub fn new(
        url: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            max_reconnect_attempts: 5,
            reconnect_delay_step: Duration::from_secs(1),
            ping_interval: Some(Duration::from_secs(25)),
        }
    }

    /// Settings derived from a session configuration
    pub fn from_session(config: &SessionConfig, session_id: &str, user_id: &str) -> Self {
        let o = &config.options;
        Self {
            url: config.signaling_url.clone(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            max_reconnect_attempts: o.signaling_max_reconnect_attempts,
            reconnect_delay_step: Duration::from_millis(o.signaling_reconnect_delay_ms),
            ping_interval: (o.signaling_ping_interval_ms > 0)
                .then(|| Duration::from_millis(o.signaling_ping_interval_ms)),
        }
    }

    /// `{url}/{session_id}?userId=..&token=..`
    pub fn connection_url(&self, token: &str) -> Result<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid signaling URL: {}", e)))?;

        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig(format!("Signaling URL {} cannot be a base", self.url)))?
            .pop_if_empty()
            .push(&self.session_id);

        url.query_pairs_mut()
            .append_pair("userId", &self.user_id)
            .append_pair("token", token);

        Ok(url)
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_delay_step * attempt
    }
}

/// Callback handlers for signaling events
#[derive(Default)]
struct SignalingCallbacks {
    on_join: Mutex<Option<ParticipantCallback>>,
    on_leave: Mutex<Option<ParticipantCallback>>,
    on_offer: Mutex<Option<DescriptionCallback>>,
    on_answer: Mutex<Option<DescriptionCallback>>,
    on_ice_candidate: Mutex<Option<CandidateCallback>>,
    on_participant_update: Mutex<Option<ParticipantUpdateCallback>>,
    on_remote_error: Mutex<Option<RemoteErrorCallback>>,
    on_state_change: Mutex<Option<StateCallback>>,
}

/// State shared between the channel handle and its connection task
struct Shared {
    config: SignalingConfig,
    connector: Arc<dyn SignalingConnector>,
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
    state: parking_lot::RwLock<SignalingState>,
    participants: parking_lot::Mutex<HashSet<String>>,
    last_pong: parking_lot::Mutex<Option<Instant>>,
    closing: AtomicBool,
    close_signal: Notify,
    callbacks: SignalingCallbacks,
}

/// Persistent signaling channel for one session
pub struct SignalingChannel {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Create a channel; nothing is opened until [`SignalingChannel::connect`]
    pub fn new(config: SignalingConfig, connector: Arc<dyn SignalingConnector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                outbound: parking_lot::Mutex::new(None),
                state: parking_lot::RwLock::new(SignalingState::Disconnected),
                participants: parking_lot::Mutex::new(HashSet::new()),
                last_pong: parking_lot::Mutex::new(None),
                closing: AtomicBool::new(false),
                close_signal: Notify::new(),
                callbacks: SignalingCallbacks::default(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Open the transport
    ///
    /// Resolves once the transport is open. If it cannot be opened within
    /// the reconnect budget this fails with [`Error::SignalingExhausted`].
    /// After a successful open, later drops are repaired in the background
    /// and reported through the state callback. A channel that has been
    /// disconnected stays closed.
    pub async fn connect(&self, token: &str) -> Result<()> {
        let mut task = self.task.lock().await;
        if self.shared.is_closing() {
            return Err(Error::SignalingError(
                "Signaling channel has been closed".to_string(),
            ));
        }
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return match self.state() {
                    SignalingState::Connected => Ok(()),
                    state => Err(Error::SignalingError(format!(
                        "Connection already in progress ({:?})",
                        state
                    ))),
                };
            }
        }

        let url = self.shared.config.connection_url(token)?;
        info!(
            session_id = %self.shared.config.session_id,
            user_id = %self.shared.config.user_id,
            "Connecting to signaling relay {}{}",
            url.host_str().unwrap_or_default(),
            url.path()
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        *task = Some(tokio::spawn(Arc::clone(&self.shared).run(url, ready_tx)));
        drop(task);

        ready_rx.await.map_err(|_| {
            Error::SignalingError("Signaling task ended before the channel opened".to_string())
        })?
    }

    /// Close the transport and stop reconnecting
    ///
    /// Sends `leave` if the transport is open. Safe to call repeatedly, and
    /// before `connect`: later calls to `connect` are refused.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        shared.closing.store(true, Ordering::SeqCst);

        if shared.outbound.lock().is_some() {
            let leave = SignalingMessage::Leave {
                from: shared.config.user_id.clone(),
            };
            if let Err(e) = shared.send(leave) {
                debug!("Could not send leave: {}", e);
            }
        }
        shared.outbound.lock().take();
        shared.close_signal.notify_one();

        let handle = self.task.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle)
                .await
                .is_err()
            {
                warn!("Signaling task did not stop in time, aborting");
                handle.abort();
            }
        }

        shared.participants.lock().clear();
        shared.set_state(SignalingState::Closed).await;
    }

    /// Current connection state
    pub fn state(&self) -> SignalingState {
        *self.shared.state.read()
    }

    /// True while the transport is open
    pub fn is_connected(&self) -> bool {
        self.state() == SignalingState::Connected
    }

    /// Local participant id
    pub fn user_id(&self) -> &str {
        &self.shared.config.user_id
    }

    /// Session id
    pub fn session_id(&self) -> &str {
        &self.shared.config.session_id
    }

    /// When the last pong arrived
    pub fn last_pong(&self) -> Option<Instant> {
        *self.shared.last_pong.lock()
    }

    /// Participants seen through join/leave, including ourselves
    pub fn participants(&self) -> Vec<String> {
        let mut list: Vec<_> = self.shared.participants.lock().iter().cloned().collect();
        list.sort();
        list
    }

    /// Send an SDP offer
    pub fn send_offer(&self, target: Option<&str>, description: &SessionDescription) -> Result<()> {
        self.shared.send(SignalingMessage::Offer {
            from: self.shared.config.user_id.clone(),
            target: target.map(str::to_string),
            description: description.clone(),
        })
    }

    /// Send an SDP answer
    pub fn send_answer(&self, target: Option<&str>, description: &SessionDescription) -> Result<()> {
        self.shared.send(SignalingMessage::Answer {
            from: self.shared.config.user_id.clone(),
            target: target.map(str::to_string),
            description: description.clone(),
        })
    }

    /// Send one ICE candidate
    pub fn send_ice_candidate(&self, target: Option<&str>, candidate: &IceCandidate) -> Result<()> {
        self.shared.send(SignalingMessage::IceCandidate {
            from: self.shared.config.user_id.clone(),
            target: target.map(str::to_string),
            candidate: candidate.clone(),
        })
    }

    /// Publish participant metadata
    pub fn send_participant_update(&self, data: Value) -> Result<()> {
        self.shared.send(SignalingMessage::ParticipantUpdate {
            from: self.shared.config.user_id.clone(),
            data,
        })
    }

    /// Set callback for remote participant joins
    pub async fn on_join<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        *self.shared.callbacks.on_join.lock().await = Some(Arc::new(callback));
    }

    /// Set callback for remote participant leaves
    pub async fn on_leave<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        *self.shared.callbacks.on_leave.lock().await = Some(Arc::new(callback));
    }

    /// Set callback for received offers
    pub async fn on_offer<F>(&self, callback: F)
    where
        F: Fn(String, SessionDescription) + Send + Sync + 'static,
    {
        *self.shared.callbacks.on_offer.lock().await = Some(Arc::new(callback));
    }

    /// Set callback for received answers
    pub async fn on_answer<F>(&self, callback: F)
    where
        F: Fn(String, SessionDescription) + Send + Sync + 'static,
    {
        *self.shared.callbacks.on_answer.lock().await = Some(Arc::new(callback));
    }

    /// Set callback for received ICE candidates
    pub async fn on_ice_candidate<F>(&self, callback: F)
    where
        F: Fn(String, IceCandidate) + Send + Sync + 'static,
    {
        *self.shared.callbacks.on_ice_candidate.lock().await = Some(Arc::new(callback));
    }

    /// Set callback for participant metadata updates
    pub async fn on_participant_update<F>(&self, callback: F)
    where
        F: Fn(String, Value) + Send + Sync + 'static,
    {
        *self.shared.callbacks.on_participant_update.lock().await = Some(Arc::new(callback));
    }

    /// Set callback for error envelopes
    pub async fn on_remote_error<F>(&self, callback: F)
    where
        F: Fn(String, String) + Send + Sync + 'static,
    {
        *self.shared.callbacks.on_remote_error.lock().await = Some(Arc::new(callback));
    }

    /// Set callback for connection state changes
    pub async fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(SignalingState) + Send + Sync + 'static,
    {
        *self.shared.callbacks.on_state_change.lock().await = Some(Arc::new(callback));
    }
}

impl Shared {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn wait_closing(&self) {
        while !self.is_closing() {
            self.close_signal.notified().await;
        }
    }

    async fn set_state(&self, new_state: SignalingState) {
        {
            let mut state = self.state.write();
            if *state == new_state {
                return;
            }
            debug!("Signaling state {:?} -> {:?}", *state, new_state);
            *state = new_state;
        }

        if let Some(cb) = self.callbacks.on_state_change.lock().await.as_ref() {
            cb(new_state);
        }
    }

    fn send(&self, msg: SignalingMessage) -> Result<()> {
        let kind = msg.message_type();
        let text = msg.into_envelope()?.to_json()?;

        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(Error::NotConnected)?;
        tx.send(text).map_err(|_| Error::NotConnected)?;

        debug!("Sent {} envelope", kind);
        Ok(())
    }

    /// Connection task: connect, pump, reconnect until closed or exhausted
    async fn run(self: Arc<Self>, url: Url, ready: oneshot::Sender<Result<()>>) {
        let mut ready = Some(ready);
        let mut attempt: u32 = 0;
        let max_attempts = self.config.max_reconnect_attempts;

        loop {
            if self.is_closing() {
                break;
            }

            self.set_state(if attempt == 0 {
                SignalingState::Connecting
            } else {
                SignalingState::Reconnecting { attempt }
            })
            .await;

            match self.connector.connect(url.as_str()).await {
                Ok(SignalingLink { outbound, inbound }) => {
                    attempt = 0;
                    *self.outbound.lock() = Some(outbound);
                    self.set_state(SignalingState::Connected).await;
                    info!(session_id = %self.config.session_id, "Signaling channel open");

                    let join = SignalingMessage::Join {
                        from: self.config.user_id.clone(),
                    };
                    if let Err(e) = self.send(join) {
                        warn!("Failed to send join: {}", e);
                    }

                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }

                    self.pump(inbound).await;
                    self.outbound.lock().take();

                    if self.is_closing() {
                        break;
                    }
                    warn!(session_id = %self.config.session_id, "Signaling transport dropped");
                    self.set_state(SignalingState::Disconnected).await;
                }
                Err(e) => {
                    warn!(attempt, "Signaling connection attempt failed: {}", e);
                }
            }

            if self.is_closing() {
                break;
            }

            attempt += 1;
            if attempt > max_attempts {
                error!(
                    session_id = %self.config.session_id,
                    "Signaling reconnection failed after {} attempts", max_attempts
                );
                self.set_state(SignalingState::Failed).await;
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(Error::SignalingExhausted(max_attempts)));
                }
                return;
            }

            let delay = self.config.reconnect_delay(attempt);
            info!(attempt, ?delay, "Scheduling signaling reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wait_closing() => break,
            }
        }

        self.set_state(SignalingState::Closed).await;
        if let Some(tx) = ready.take() {
            let _ = tx.send(Err(Error::SignalingError(
                "Signaling channel closed before it opened".to_string(),
            )));
        }
    }

    /// Process inbound text until the transport drops or the channel closes
    async fn pump(&self, mut inbound: mpsc::UnboundedReceiver<String>) {
        let mut keepalive = self.config.ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(text) => self.handle_text(&text).await,
                    None => return,
                },
                _ = self.wait_closing() => return,
                _ = next_tick(&mut keepalive) => {
                    let ping = SignalingMessage::Ping {
                        from: self.config.user_id.clone(),
                        timestamp: None,
                    };
                    if let Err(e) = self.send(ping) {
                        debug!("Keepalive ping not sent: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping signaling message: {}", e);
                return;
            }
        };

        let me = self.config.user_id.as_str();
        if envelope.is_addressed_elsewhere(me) {
            debug!(
                "Ignoring {} addressed to {:?}",
                envelope.kind, envelope.target_user_id
            );
            return;
        }

        let from_self = envelope.user_id == me;
        let kind = envelope.kind.clone();
        let msg = match SignalingMessage::try_from(envelope) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping signaling message of type '{}': {}", kind, e);
                return;
            }
        };

        if from_self && !msg.is_membership() {
            debug!("Ignoring own {} message", kind);
            return;
        }

        self.dispatch(msg, from_self).await;
    }

    async fn dispatch(&self, msg: SignalingMessage, from_self: bool) {
        let callbacks = &self.callbacks;

        match msg {
            SignalingMessage::Ping { timestamp, .. } => {
                let pong = SignalingMessage::Pong {
                    from: self.config.user_id.clone(),
                    timestamp,
                };
                if let Err(e) = self.send(pong) {
                    debug!("Pong not sent: {}", e);
                }
            }
            SignalingMessage::Pong { .. } => {
                *self.last_pong.lock() = Some(Instant::now());
            }
            SignalingMessage::Join { from } => {
                self.participants.lock().insert(from.clone());
                if from_self {
                    debug!("Join acknowledged by relay");
                    return;
                }
                info!(participant = %from, "Participant joined");
                if let Some(cb) = callbacks.on_join.lock().await.as_ref() {
                    cb(from);
                }
            }
            SignalingMessage::Leave { from } => {
                self.participants.lock().remove(&from);
                if from_self {
                    return;
                }
                info!(participant = %from, "Participant left");
                if let Some(cb) = callbacks.on_leave.lock().await.as_ref() {
                    cb(from);
                }
            }
            SignalingMessage::Offer {
                from, description, ..
            } => {
                if let Some(cb) = callbacks.on_offer.lock().await.as_ref() {
                    cb(from, description);
                }
            }
            SignalingMessage::Answer {
                from, description, ..
            } => {
                if let Some(cb) = callbacks.on_answer.lock().await.as_ref() {
                    cb(from, description);
                }
            }
            SignalingMessage::IceCandidate {
                from, candidate, ..
            } => {
                if let Some(cb) = callbacks.on_ice_candidate.lock().await.as_ref() {
                    cb(from, candidate);
                }
            }
            SignalingMessage::ParticipantUpdate { from, data } => {
                if let Some(cb) = callbacks.on_participant_update.lock().await.as_ref() {
                    cb(from, data);
                }
            }
            SignalingMessage::Error { from, message } => {
                warn!(sender = %from, "Relay reported error: {}", message);
                if let Some(cb) = callbacks.on_remote_error.lock().await.as_ref() {
                    cb(from, message);
                }
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct RefusingConnector;

    #[async_trait]
    impl SignalingConnector for RefusingConnector {
        async fn connect(&self, _url: &str) -> Result<SignalingLink> {
            Err(Error::WebSocketError("connection refused".to_string()))
        }
    }

    #[test]
    fn test_connection_url() {
        let config = SignalingConfig::new("wss://relay.example.com/ws/", "room 1", "alice");
        let url = config.connection_url("t&k").unwrap();
        assert_eq!(url.path(), "/ws/room%201");
        assert_eq!(url.query(), Some("userId=alice&token=t%26k"));
    }

    #[test]
    fn test_connection_url_rejects_garbage() {
        let config = SignalingConfig::new("not a url", "s", "u");
        assert!(config.connection_url("t").unwrap_err().is_config_error());
    }

    #[test]
    fn test_reconnect_delay_linear() {
        let config = SignalingConfig::new("ws://a/ws", "s", "u");
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(3), Duration::from_secs(3));
    }

    #[test]
    fn test_from_session_disables_ping() {
        let mut session = SessionConfig::default();
        session.options.signaling_ping_interval_ms = 0;
        let config = SignalingConfig::from_session(&session, "s", "u");
        assert!(config.ping_interval.is_none());
        assert_eq!(config.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_send_before_connect() {
        let channel = SignalingChannel::new(
            SignalingConfig::new("ws://a/ws", "s", "u"),
            Arc::new(RefusingConnector),
        );
        let err = channel
            .send_offer(None, &SessionDescription::offer("v=0"))
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhausts_budget() {
        let mut config = SignalingConfig::new("ws://a/ws", "s", "u");
        config.max_reconnect_attempts = 2;
        let channel = SignalingChannel::new(config, Arc::new(RefusingConnector));

        let err = channel.connect("token").await.unwrap_err();
        assert!(matches!(err, Error::SignalingExhausted(2)));
        assert_eq!(channel.state(), SignalingState::Failed);

        channel.disconnect().await;
        channel.disconnect().await;
        assert_eq!(channel.state(), SignalingState::Closed);
    }
}
