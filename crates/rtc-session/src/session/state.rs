//! Session lifecycle state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Created, not yet initialized
    New,
    /// Acquiring local media
    GatheringMedia,
    /// Peer connection built, negotiating
    Connecting,
    /// Media path established
    Connected,
    /// Rebuilding the peer connection after a drop
    Reconnecting,
    /// Media path lost; a reconnect may be pending
    Disconnected,
    /// Terminal: a budget was exhausted or setup failed
    Failed,
    /// Terminal: clean shutdown
    Closed,
}

impl SessionState {
    /// True for states the controller never leaves on its own
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    /// True while a peer connection exists and may negotiate
    pub fn has_peer(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::Reconnecting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::New => "new",
            SessionState::GatheringMedia => "gatheringMedia",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Named transitions between session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `initialize` started
    BeginMediaAcquisition,
    /// Local media acquired and the peer connection built
    MediaReady,
    /// Local media refused
    MediaDenied,
    /// Transport reported connected
    PeerConnected,
    /// Transport reported disconnected or closed
    PeerDisconnected,
    /// Transport reported failed
    PeerFailed,
    /// No heartbeat activity within the timeout while connected
    HeartbeatTimeout,
    /// A scheduled reconnect fired
    BeginReconnect,
    /// No reconnect attempts left
    ReconnectExhausted,
    /// Peer connection could not be built during initialization
    SetupFailed,
    /// Signaling reconnect budget exhausted
    SignalingLost,
    /// `disconnect` / `cleanup`
    Close,
}

/// Result of [`SessionState::apply`] for a transition not allowed from a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    /// State the transition was attempted from
    pub from: SessionState,
    /// The rejected transition
    pub transition: Transition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} is not allowed from {}", self.transition, self.from)
    }
}

impl SessionState {
    /// Target state of `transition` from `self`
    ///
    /// Transport failures land in `Disconnected`; only an exhausted budget
    /// (media path or signaling) or a failed setup reaches `Failed`. `Close`
    /// is accepted from every state, including `Closed` itself.
    pub fn apply(self, transition: Transition) -> Result<SessionState, InvalidTransition> {
        use SessionState::*;
        use Transition::*;

        let next = match (self, transition) {
            (_, Close) => Closed,
            (New, BeginMediaAcquisition) => GatheringMedia,
            (GatheringMedia, MediaReady) => Connecting,
            (GatheringMedia, MediaDenied) => Failed,
            (Connecting | Reconnecting, PeerConnected) => Connected,
            (Connecting | Connected | Reconnecting, PeerDisconnected | PeerFailed) => Disconnected,
            (Connected, HeartbeatTimeout) => Disconnected,
            (Disconnected, BeginReconnect) => Reconnecting,
            (Disconnected, ReconnectExhausted) => Failed,
            (GatheringMedia, SetupFailed) => Failed,
            (from, SignalingLost) if !from.is_terminal() => Failed,
            (from, transition) => return Err(InvalidTransition { from, transition }),
        };

        Ok(next)
    }
}
