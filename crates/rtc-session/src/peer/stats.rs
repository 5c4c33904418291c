//! Connection metrics sampled from the transport

use serde::{Deserialize, Serialize};

/// One sample of transport statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetricsSample {
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,

    /// Jitter in milliseconds (0 when the binding cannot report it)
    pub jitter_ms: f64,

    /// Packet loss as a fraction in [0, 1]
    pub packet_loss: f64,

    /// Cumulative bytes sent on the selected pair
    pub bytes_sent: u64,

    /// Cumulative bytes received on the selected pair
    pub bytes_received: u64,

    /// Negotiated codec identifiers (mime types)
    pub codecs: Vec<String>,

    /// Candidate type of the selected local candidate
    pub candidate_type: Option<String>,

    /// Transport protocol of the selected local candidate
    pub protocol: Option<String>,
}

impl ConnectionMetricsSample {
    /// Packet loss as a percentage
    pub fn packet_loss_percent(&self) -> f64 {
        self.packet_loss * 100.0
    }

    /// True if the selected pair goes through a TURN relay
    pub fn is_relayed(&self) -> bool {
        self.candidate_type.as_deref() == Some("relay")
    }
}
