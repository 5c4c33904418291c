//! Events published to session subscribers

use super::quality::QualityTier;
use super::state::SessionState;
use crate::media::TrackKind;
use crate::peer::{ConnectionMetricsSample, IceConnectionState};
use crate::signaling::SignalingState;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Error delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    /// Human-readable description
    pub message: String,
    /// True if the session will not recover on its own
    pub fatal: bool,
}

impl SessionError {
    /// Terminal error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }

    /// Informational error; the session keeps going
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fatal {
            write!(f, "fatal: {}", self.message)
        } else {
            f.write_str(&self.message)
        }
    }
}

impl From<&crate::Error> for SessionError {
    fn from(err: &crate::Error) -> Self {
        Self {
            message: err.to_string(),
            fatal: err.is_fatal(),
        }
    }
}

/// Something subscribers may want to react to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Local capture acquired
    LocalStreamReady {
        /// Stream id
        stream_id: String,
        /// Number of audio tracks
        audio_tracks: usize,
        /// Number of video tracks
        video_tracks: usize,
    },
    /// A remote track arrived
    RemoteStreamReady {
        /// Remote participant
        participant_id: String,
        /// Remote stream id
        stream_id: String,
        /// Track id
        track_id: String,
        /// Track kind
        kind: TrackKind,
    },
    /// Session lifecycle state changed
    ConnectionStateChanged(SessionState),
    /// ICE agent state changed
    IceStateChanged(IceConnectionState),
    /// Signaling channel state changed
    SignalingStateChanged(SignalingState),
    /// The data channel opened
    DataChannelOpen,
    /// Application message on the data channel
    DataChannelMessage(String),
    /// Periodic transport statistics
    Metrics(ConnectionMetricsSample),
    /// Outgoing video tier changed
    QualityChanged(QualityTier),
    /// A reconnection was scheduled
    ReconnectScheduled {
        /// 1-based attempt number
        attempt: u32,
        /// Backoff before the attempt
        delay: Duration,
    },
    /// Remote participant joined the session
    ParticipantJoined(String),
    /// Remote participant left the session
    ParticipantLeft(String),
    /// Remote participant metadata
    ParticipantUpdated {
        /// Participant id
        participant_id: String,
        /// Opaque metadata
        data: Value,
    },
    /// Error report
    Error(SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_crate_error() {
        let err = SessionError::from(&crate::Error::ReconnectExhausted(3));
        assert!(err.fatal);
        assert_eq!(err.message, "Connection lost after 3 reconnection attempts");

        let err = SessionError::from(&crate::Error::ProtocolError("x".to_string()));
        assert!(!err.fatal);
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionError::fatal("gone").to_string(), "fatal: gone");
        assert_eq!(SessionError::recoverable("meh").to_string(), "meh");
    }
}
