//! Sample-based local tracks
//!
//! Encoded frames are pushed into a [`TrackLocalStaticSample`]; the binding
//! does not capture or encode by itself. [`SampleMediaProvider`] hands out
//! an Opus and a VP8 track and keeps the audio path alive with silence
//! frames so RTCP (and therefore stats) flows before real media does.

use crate::media::{LocalStream, LocalTrack, MediaConstraints, MediaProvider, TrackKind, VideoPreset};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Opus TOC byte for a 20ms silence frame
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Opus frame duration
const OPUS_FRAME: Duration = Duration::from_millis(20);

/// Local track backed by a webrtc-rs static sample track
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    preset: parking_lot::Mutex<VideoPreset>,
}

impl SampleTrack {
    /// Opus audio track
    pub fn audio(stream_id: &str) -> Self {
        let id = format!("audio-{}", uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            stream_id.to_string(),
        ));
        Self::from_parts(id, TrackKind::Audio, track, VideoPreset::default())
    }

    /// VP8 video track
    pub fn video(stream_id: &str, preset: VideoPreset) -> Self {
        let id = format!("video-{}", uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            stream_id.to_string(),
        ));
        Self::from_parts(id, TrackKind::Video, track, preset)
    }

    fn from_parts(
        id: String,
        kind: TrackKind,
        track: Arc<TrackLocalStaticSample>,
        preset: VideoPreset,
    ) -> Self {
        Self {
            id,
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            preset: parking_lot::Mutex::new(preset),
        }
    }

    /// Underlying webrtc-rs track
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    /// Preset the encoder feeding this track should follow
    pub fn preset(&self) -> VideoPreset {
        *self.preset.lock()
    }

    /// Write one encoded frame
    ///
    /// A disabled audio track sends silence in place of the frame; a
    /// disabled video track drops it.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::MediaTrackError(format!("Track {} is stopped", self.id)));
        }

        let data = match (self.is_enabled(), self.kind) {
            (true, _) => data,
            (false, TrackKind::Audio) => Bytes::from_static(&OPUS_SILENCE),
            (false, TrackKind::Video) => return Ok(()),
        };

        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to write sample: {}", e)))
    }
}

impl LocalTrack for SampleTrack {
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
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Track {} stopped", self.id);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn apply_preset(&self, preset: &VideoPreset) {
        if self.kind == TrackKind::Video {
            *self.preset.lock() = *preset;
            debug!(
                "Track {} preset {}x{}@{}",
                self.id, preset.width, preset.height, preset.frame_rate
            );
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Media provider producing [`SampleTrack`]s
#[derive(Debug, Clone)]
pub struct SampleMediaProvider {
    /// Keep the audio track fed with silence until it is stopped
    pub audio_keepalive: bool,
}

impl Default for SampleMediaProvider {
    fn default() -> Self {
        Self {
            audio_keepalive: true,
        }
    }
}

#[async_trait]
impl MediaProvider for SampleMediaProvider {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream> {
        if !constraints.audio && !constraints.video {
            return Err(Error::MediaAcquisition(
                "No audio or video requested".to_string(),
            ));
        }

        let stream_id = format!("stream-{}", uuid::Uuid::new_v4());
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();

        if constraints.audio {
            let audio = Arc::new(SampleTrack::audio(&stream_id));
            if self.audio_keepalive {
                spawn_silence(Arc::clone(&audio));
            }
            tracks.push(audio);
        }
        if constraints.video {
            tracks.push(Arc::new(SampleTrack::video(
                &stream_id,
                constraints.video_preset,
            )));
        }

        info!("Acquired local stream {} ({} tracks)", stream_id, tracks.len());
        Ok(LocalStream::new(stream_id, tracks))
    }
}

fn spawn_silence(track: Arc<SampleTrack>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OPUS_FRAME);
        while !track.is_stopped() {
            ticker.tick().await;
            // Not bound to a connection yet; nothing to report.
            let _ = track
                .write_frame(Bytes::from_static(&OPUS_SILENCE), OPUS_FRAME)
                .await;
        }
    });
}
