//! Quality tier selection from sampled metrics

use crate::media::VideoPreset;
use crate::peer::ConnectionMetricsSample;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Loss fraction above which the low tier is selected
pub const LOW_TIER_LOSS: f64 = 0.05;
/// RTT in ms above which the low tier is selected
pub const LOW_TIER_RTT_MS: f64 = 300.0;
/// Loss fraction above which the medium tier is selected
pub const MEDIUM_TIER_LOSS: f64 = 0.02;
/// RTT in ms above which the medium tier is selected
pub const MEDIUM_TIER_RTT_MS: f64 = 150.0;

/// Outgoing video quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    /// 320x240 @ 15fps
    Low,
    /// 640x480 @ 24fps
    Medium,
    /// 1280x720 @ 30fps
    High,
}

impl QualityTier {
    /// Tier for a loss fraction and round-trip time
    ///
    /// loss > 5% or RTT > 300ms selects low; loss > 2% or RTT > 150ms
    /// selects medium; anything better is high.
    pub fn select(packet_loss: f64, rtt_ms: f64) -> Self {
        if packet_loss > LOW_TIER_LOSS || rtt_ms > LOW_TIER_RTT_MS {
            QualityTier::Low
        } else if packet_loss > MEDIUM_TIER_LOSS || rtt_ms > MEDIUM_TIER_RTT_MS {
            QualityTier::Medium
        } else {
            QualityTier::High
        }
    }

    /// Tier for a metrics sample
    pub fn from_sample(sample: &ConnectionMetricsSample) -> Self {
        Self::select(sample.packet_loss, sample.rtt_ms)
    }

    /// Video preset for this tier
    pub fn preset(&self) -> VideoPreset {
        match self {
            QualityTier::Low => VideoPreset::LOW,
            QualityTier::Medium => VideoPreset::MEDIUM,
            QualityTier::High => VideoPreset::HIGH,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityTier::Low => f.write_str("low"),
            QualityTier::Medium => f.write_str("medium"),
            QualityTier::High => f.write_str("high"),
        }
    }
}

/// Tracks the applied tier and the previous sample
#[derive(Debug, Default)]
pub struct QualityMonitor {
    current: Option<QualityTier>,
    last_sample: Option<ConnectionMetricsSample>,
}

impl QualityMonitor {
    /// Tier currently applied (None before the first sample)
    pub fn current(&self) -> Option<QualityTier> {
        self.current
    }

    /// Most recent sample
    pub fn last_sample(&self) -> Option<&ConnectionMetricsSample> {
        self.last_sample.as_ref()
    }

    /// Record a sample; returns the new tier if it differs from the applied one
    pub fn observe(&mut self, sample: &ConnectionMetricsSample) -> Option<QualityTier> {
        let tier = QualityTier::from_sample(sample);
        self.log_report(sample, tier);
        self.last_sample = Some(sample.clone());

        if self.current == Some(tier) {
            return None;
        }
        if let Some(previous) = self.current {
            info!("Video quality {} -> {}", previous, tier);
        }
        self.current = Some(tier);
        Some(tier)
    }

    /// Forget the applied tier (new connection starts from scratch)
    pub fn reset(&mut self) {
        self.current = None;
        self.last_sample = None;
    }

    fn log_report(&self, sample: &ConnectionMetricsSample, tier: QualityTier) {
        let (sent_delta, received_delta) = match &self.last_sample {
            Some(prev) => (
                sample.bytes_sent.saturating_sub(prev.bytes_sent),
                sample.bytes_received.saturating_sub(prev.bytes_received),
            ),
            None => (sample.bytes_sent, sample.bytes_received),
        };

        debug!(
            rtt_ms = sample.rtt_ms,
            jitter_ms = sample.jitter_ms,
            packet_loss_pct = sample.packet_loss_percent(),
            bytes_sent = sample.bytes_sent,
            bytes_received = sample.bytes_received,
            sent_delta,
            received_delta,
            candidate_type = sample.candidate_type.as_deref().unwrap_or("unknown"),
            protocol = sample.protocol.as_deref().unwrap_or("unknown"),
            codecs = ?sample.codecs,
            %tier,
            "Connection quality report"
        );
    }
}
