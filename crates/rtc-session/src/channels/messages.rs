//! Data channel message format

use serde::{Deserialize, Serialize};

/// Maximum text message size accepted for sending (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Control messages the session itself puts on the data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Media-path liveness probe
    Heartbeat {
        /// Sender wall clock, milliseconds since the Unix epoch
        timestamp: i64,
    },
}

impl ChannelMessage {
    /// Heartbeat stamped with the current time
    pub fn heartbeat_now() -> Self {
        ChannelMessage::Heartbeat {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Serialize for transmission
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Classified inbound data channel text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPayload {
    /// Heartbeat from the remote side
    Heartbeat {
        /// Remote timestamp
        timestamp: i64,
    },
    /// Anything else, forwarded untouched
    Application(String),
}

impl InboundPayload {
    /// Classify a received message
    ///
    /// Text that is not a well-formed control message is treated as an
    /// application payload.
    pub fn classify(text: &str) -> Self {
        match serde_json::from_str::<ChannelMessage>(text) {
            Ok(ChannelMessage::Heartbeat { timestamp }) => InboundPayload::Heartbeat { timestamp },
            Err(_) => InboundPayload::Application(text.to_string()),
        }
    }
}
