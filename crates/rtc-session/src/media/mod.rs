//! Local and remote media
//!
//! Capture is abstracted behind [`MediaProvider`]; the controller acquires one
//! [`LocalStream`] per session and re-attaches its tracks to every peer
//! connection it builds.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Outgoing video constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoPreset {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub frame_rate: u32,
    /// Target bitrate in kbps
    pub max_bitrate_kbps: u32,
}

impl VideoPreset {
    /// 320x240 @ 15fps, 150 kbps
    pub const LOW: VideoPreset = VideoPreset {
        width: 320,
        height: 240,
        frame_rate: 15,
        max_bitrate_kbps: 150,
    };

    /// 640x480 @ 24fps, 500 kbps
    pub const MEDIUM: VideoPreset = VideoPreset {
        width: 640,
        height: 480,
        frame_rate: 24,
        max_bitrate_kbps: 500,
    };

    /// 1280x720 @ 30fps, 1500 kbps
    pub const HIGH: VideoPreset = VideoPreset {
        width: 1280,
        height: 720,
        frame_rate: 30,
        max_bitrate_kbps: 1500,
    };

    /// Nominal interval between frames
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(1000 / u64::from(self.frame_rate.max(1)))
    }
}

impl Default for VideoPreset {
    fn default() -> Self {
        VideoPreset::HIGH
    }
}

/// What to capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    /// Capture a microphone track
    pub audio: bool,
    /// Capture a camera track
    pub video: bool,
    /// Initial camera preset
    pub video_preset: VideoPreset,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            video_preset: VideoPreset::HIGH,
        }
    }
}

/// A local capture track
pub trait LocalTrack: Send + Sync {
    /// Track identifier
    fn id(&self) -> &str;

    /// Media kind
    fn kind(&self) -> TrackKind;

    /// Mute/unmute without renegotiation
    fn set_enabled(&self, enabled: bool);

    /// Current enabled flag
    fn is_enabled(&self) -> bool;

    /// Stop capture permanently
    fn stop(&self);

    /// True after [`LocalTrack::stop`]
    fn is_stopped(&self) -> bool;

    /// Change the capture preset (video tracks only)
    fn apply_preset(&self, _preset: &VideoPreset) {}

    /// Downcast hook for bindings that need their concrete track type
    fn as_any(&self) -> &dyn Any;
}

/// Acquired local media
#[derive(Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<dyn LocalTrack>>,
}

impl LocalStream {
    /// Wrap acquired tracks
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    /// Tracks of one kind
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Set the enabled flag of every track of `kind`; returns how many changed
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut changed = 0;
        for track in self.tracks_of(kind) {
            if track.is_enabled() != enabled {
                track.set_enabled(enabled);
                changed += 1;
            }
        }
        changed
    }

    /// Stop every track
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field(
                "tracks",
                &self
                    .tracks
                    .iter()
                    .map(|t| (t.id().to_string(), t.kind()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A track received from the remote participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Remote stream the track belongs to
    pub stream_id: String,
    /// Media kind
    pub kind: TrackKind,
}

/// Tracks received from one remote participant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    /// Received tracks
    pub tracks: Vec<RemoteTrack>,
    /// Set once the participant left or the session stopped
    pub ended: bool,
}

impl RemoteStream {
    /// Record a track, replacing one with the same id
    pub fn add_track(&mut self, track: RemoteTrack) {
        self.tracks.retain(|t| t.id != track.id);
        self.tracks.push(track);
        self.ended = false;
    }

    /// Mark the stream ended
    pub fn stop(&mut self) {
        self.ended = true;
    }
}

/// Local capture plus remote streams keyed by participant id
#[derive(Debug, Default)]
pub struct MediaBundle {
    local: Option<LocalStream>,
    remote: HashMap<String, RemoteStream>,
}

impl MediaBundle {
    /// Local stream, if acquired
    pub fn local(&self) -> Option<&LocalStream> {
        self.local.as_ref()
    }

    /// Store the acquired local stream
    pub fn set_local(&mut self, stream: LocalStream) {
        self.local = Some(stream);
    }

    /// Remote stream for a participant
    pub fn remote(&self, participant_id: &str) -> Option<&RemoteStream> {
        self.remote.get(participant_id)
    }

    /// Record a remote track; returns the updated stream
    pub fn add_remote_track(&mut self, participant_id: &str, track: RemoteTrack) -> &RemoteStream {
        let stream = self.remote.entry(participant_id.to_string()).or_default();
        stream.add_track(track);
        stream
    }

    /// Mark a participant's stream ended
    pub fn end_remote(&mut self, participant_id: &str) -> bool {
        match self.remote.get_mut(participant_id) {
            Some(stream) if !stream.ended => {
                stream.stop();
                true
            }
            _ => false,
        }
    }

    /// Drop remote tracks (they belong to a discarded connection)
    pub fn clear_remote(&mut self) {
        self.remote.clear();
    }

    /// Stop local capture and end every remote stream
    pub fn stop_all(&mut self) {
        if let Some(local) = &self.local {
            local.stop();
        }
        for stream in self.remote.values_mut() {
            stream.stop();
        }
    }
}

/// Source of local capture tracks
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Acquire tracks
    ///
    /// A refusal by the user or platform must be reported as
    /// [`crate::Error::PermissionDenied`].
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream>;
}
