//! Presentation-layer binding
//!
//! [`SessionHandle`] folds the controller's event stream into a
//! [`SessionSnapshot`] published on a `watch` channel, so a UI can render
//! the latest state without tracking individual events, and forwards
//! commands to the controller.

use crate::media::TrackKind;
use crate::peer::{ConnectionMetricsSample, IceConnectionState};
use crate::session::{QualityTier, SessionController, SessionError, SessionEvent, SessionState};
use crate::signaling::SignalingState;
use crate::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A remote track as shown to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    /// Remote participant
    pub participant_id: String,
    /// Track id
    pub track_id: String,
    /// Media kind
    pub kind: TrackKind,
}

/// Everything a view needs to render a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub ice_state: Option<IceConnectionState>,
    pub signaling_state: SignalingState,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub local_stream_ready: bool,
    pub data_channel_open: bool,
    pub remote_tracks: Vec<RemoteTrackInfo>,
    pub participants: Vec<String>,
    pub last_metrics: Option<ConnectionMetricsSample>,
    pub quality_tier: Option<QualityTier>,
    pub last_error: Option<SessionError>,
    pub reconnect_attempt: u32,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::New,
            ice_state: None,
            signaling_state: SignalingState::Disconnected,
            audio_enabled: true,
            video_enabled: true,
            local_stream_ready: false,
            data_channel_open: false,
            remote_tracks: Vec::new(),
            participants: Vec::new(),
            last_metrics: None,
            quality_tier: None,
            last_error: None,
            reconnect_attempt: 0,
        }
    }
}

impl SessionSnapshot {
    /// Fold one event into the snapshot
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::LocalStreamReady { .. } => self.local_stream_ready = true,
            SessionEvent::RemoteStreamReady {
                participant_id,
                track_id,
                kind,
                ..
            } => {
                self.remote_tracks.retain(|t| &t.track_id != track_id);
                self.remote_tracks.push(RemoteTrackInfo {
                    participant_id: participant_id.clone(),
                    track_id: track_id.clone(),
                    kind: *kind,
                });
            }
            SessionEvent::ConnectionStateChanged(state) => {
                self.state = *state;
                match state {
                    SessionState::Connected => self.reconnect_attempt = 0,
                    SessionState::Reconnecting | SessionState::Disconnected => {
                        self.data_channel_open = false;
                        self.remote_tracks.clear();
                    }
                    SessionState::Closed | SessionState::Failed => {
                        self.data_channel_open = false;
                        self.remote_tracks.clear();
                        self.ice_state = None;
                    }
                    _ => {}
                }
            }
            SessionEvent::IceStateChanged(ice) => self.ice_state = Some(*ice),
            SessionEvent::SignalingStateChanged(state) => self.signaling_state = *state,
            SessionEvent::DataChannelOpen => self.data_channel_open = true,
            SessionEvent::DataChannelMessage(_) => {}
            SessionEvent::Metrics(sample) => self.last_metrics = Some(sample.clone()),
            SessionEvent::QualityChanged(tier) => self.quality_tier = Some(*tier),
            SessionEvent::ReconnectScheduled { attempt, .. } => self.reconnect_attempt = *attempt,
            SessionEvent::ParticipantJoined(id) => {
                if !self.participants.contains(id) {
                    self.participants.push(id.clone());
                }
            }
            SessionEvent::ParticipantLeft(id) => {
                self.participants.retain(|p| p != id);
                self.remote_tracks.retain(|t| &t.participant_id != id);
            }
            SessionEvent::ParticipantUpdated { .. } => {}
            SessionEvent::Error(err) => self.last_error = Some(err.clone()),
        }
    }
}

/// Controller plus a continuously updated snapshot
pub struct SessionHandle {
    controller: Arc<SessionController>,
    snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Start following `controller`
    ///
    /// Must be called before `initialize` to observe every event.
    pub fn new(controller: Arc<SessionController>) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let snapshot_tx = Arc::new(snapshot_tx);
        let task = tokio::spawn(follow(controller.subscribe(), Arc::clone(&snapshot_tx)));

        Self {
            controller,
            snapshot_tx,
            snapshot_rx,
            task,
        }
    }

    /// Underlying controller
    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that is notified on every snapshot change
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Join the session
    pub async fn start(&self, token: &str, is_initiator: bool) -> Result<()> {
        self.controller.initialize(token, is_initiator).await
    }

    /// Send (or resend) an offer
    pub async fn create_offer(&self) -> Result<()> {
        self.controller.create_offer().await
    }

    /// Mute or unmute the microphone
    pub async fn toggle_audio(&self, enabled: bool) {
        self.controller.toggle_audio(enabled).await;
        self.snapshot_tx.send_modify(|s| s.audio_enabled = enabled);
    }

    /// Enable or blank the camera
    pub async fn toggle_video(&self, enabled: bool) {
        self.controller.toggle_video(enabled).await;
        self.snapshot_tx.send_modify(|s| s.video_enabled = enabled);
    }

    /// Send an application message on the data channel
    pub async fn send_data(&self, text: &str) -> Result<()> {
        self.controller.send_data(text).await
    }

    /// Leave the session
    pub async fn hang_up(&self) {
        self.controller.disconnect().await;
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn follow(
    mut events: broadcast::Receiver<SessionEvent>,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
) {
    loop {
        match events.recv().await {
            Ok(event) => snapshot.send_modify(|s| s.apply(&event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Snapshot fell behind by {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Snapshot follower stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_lifecycle() {
        let mut snapshot = SessionSnapshot::default();
        snapshot.apply(&SessionEvent::ConnectionStateChanged(SessionState::Connected));
        snapshot.apply(&SessionEvent::DataChannelOpen);
        snapshot.apply(&SessionEvent::RemoteStreamReady {
            participant_id: "bob".to_string(),
            stream_id: "s".to_string(),
            track_id: "t1".to_string(),
            kind: TrackKind::Video,
        });
        assert!(snapshot.data_channel_open);
        assert_eq!(snapshot.remote_tracks.len(), 1);

        snapshot.apply(&SessionEvent::ConnectionStateChanged(
            SessionState::Disconnected,
        ));
        assert!(!snapshot.data_channel_open);
        assert!(snapshot.remote_tracks.is_empty());

        snapshot.apply(&SessionEvent::ReconnectScheduled {
            attempt: 2,
            delay: std::time::Duration::from_secs(2),
        });
        assert_eq!(snapshot.reconnect_attempt, 2);
        snapshot.apply(&SessionEvent::ConnectionStateChanged(SessionState::Connected));
        assert_eq!(snapshot.reconnect_attempt, 0);
    }

    #[test]
    fn test_fold_participants_and_errors() {
        let mut snapshot = SessionSnapshot::default();
        snapshot.apply(&SessionEvent::ParticipantJoined("bob".to_string()));
        snapshot.apply(&SessionEvent::ParticipantJoined("bob".to_string()));
        assert_eq!(snapshot.participants, vec!["bob".to_string()]);

        snapshot.apply(&SessionEvent::ParticipantLeft("bob".to_string()));
        assert!(snapshot.participants.is_empty());

        snapshot.apply(&SessionEvent::Error(SessionError::fatal("gone")));
        assert_eq!(snapshot.last_error, Some(SessionError::fatal("gone")));
    }

    #[test]
    fn test_fold_quality() {
        let mut snapshot = SessionSnapshot::default();
        snapshot.apply(&SessionEvent::Metrics(ConnectionMetricsSample {
            rtt_ms: 42.0,
            ..Default::default()
        }));
        snapshot.apply(&SessionEvent::QualityChanged(QualityTier::Medium));
        assert_eq!(snapshot.last_metrics.map(|m| m.rtt_ms), Some(42.0));
        assert_eq!(snapshot.quality_tier, Some(QualityTier::Medium));
    }
}
