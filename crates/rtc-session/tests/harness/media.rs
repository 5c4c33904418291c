//! Scripted local capture

use async_trait::async_trait;
use parking_lot::Mutex;
use rtc_session::media::{
    LocalStream, LocalTrack, MediaConstraints, MediaProvider, TrackKind, VideoPreset,
};
use rtc_session::{Error, Result};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Capture track that only records what was done to it
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    presets: Mutex<Vec<VideoPreset>>,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            presets: Mutex::new(Vec::new()),
        }
    }

    pub fn presets(&self) -> Vec<VideoPreset> {
        self.presets.lock().clone()
    }
}

impl LocalTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn apply_preset(&self, preset: &VideoPreset) {
        if self.kind == TrackKind::Video {
            self.presets.lock().push(*preset);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Media provider handing out [`FakeTrack`]s, or refusing like a denied prompt
#[derive(Default)]
pub struct FakeMediaProvider {
    deny: bool,
    acquisitions: AtomicUsize,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeMediaProvider {
    /// Provider that rejects every request
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Default::default()
        }
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Every track handed out so far
    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().clone()
    }

    pub fn track(&self, kind: TrackKind) -> Arc<FakeTrack> {
        self.tracks()
            .into_iter()
            .find(|t| t.kind() == kind)
            .unwrap_or_else(|| panic!("no {} track acquired", kind))
    }
}

#[async_trait]
impl MediaProvider for FakeMediaProvider {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(Error::PermissionDenied(
                "camera and microphone blocked".to_string(),
            ));
        }

        let mut acquired = Vec::new();
        if constraints.audio {
            acquired.push(Arc::new(FakeTrack::new("mic", TrackKind::Audio)));
        }
        if constraints.video {
            acquired.push(Arc::new(FakeTrack::new("cam", TrackKind::Video)));
        }
        self.tracks.lock().extend(acquired.iter().cloned());

        let tracks = acquired
            .into_iter()
            .map(|t| t as Arc<dyn LocalTrack>)
            .collect();
        Ok(LocalStream::new("local", tracks))
    }
}
