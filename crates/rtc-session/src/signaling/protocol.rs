//! Signaling envelope format
//!
//! On the wire every message is a flat JSON envelope:
//!
//! ```json
//! { "type": "offer", "userId": "alice", "targetUserId": "bob",
//!   "data": { "type": "offer", "sdp": "v=0..." }, "timestamp": 1700000000000 }
//! ```
//!
//! [`SignalingMessage`] is the validated form the rest of the crate works
//! with; conversion happens once at the channel boundary.

use crate::peer::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Envelope `type` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// Participant joined the session
    Join,
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// Trickled ICE candidate
    IceCandidate,
    /// Participant left the session
    Leave,
    /// Signaling liveness probe
    Ping,
    /// Reply to a ping
    Pong,
    /// Error reported by the relay or the remote participant
    Error,
    /// Participant metadata changed
    ParticipantUpdate,
}

impl MessageType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Join => "join",
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::IceCandidate => "ice-candidate",
            MessageType::Leave => "leave",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::ParticipantUpdate => "participant-update",
        }
    }

    /// Parse a wire name
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "join" => MessageType::Join,
            "offer" => MessageType::Offer,
            "answer" => MessageType::Answer,
            "ice-candidate" => MessageType::IceCandidate,
            "leave" => MessageType::Leave,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "error" => MessageType::Error,
            "participant-update" => MessageType::ParticipantUpdate,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw signaling envelope
///
/// `type` is kept as a string so unknown message types still parse and can
/// be reported instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message type
    #[serde(rename = "type")]
    pub kind: String,

    /// Sender participant id
    #[serde(default)]
    pub user_id: String,

    /// Intended recipient (absent means "the other participant")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,

    /// Type-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Sender wall clock, milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Parse from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::ProtocolError(format!("Malformed envelope: {}", e)))
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Recognized message type, if any
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::parse(&self.kind)
    }

    /// True if the envelope is addressed to someone other than `user_id`
    pub fn is_addressed_elsewhere(&self, user_id: &str) -> bool {
        self.target_user_id
            .as_deref()
            .is_some_and(|target| !target.is_empty() && target != user_id)
    }
}

/// Validated signaling message
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    /// Participant joined
    Join {
        /// Joining participant
        from: String,
    },
    /// Participant left
    Leave {
        /// Leaving participant
        from: String,
    },
    /// SDP offer
    Offer {
        /// Sender
        from: String,
        /// Recipient
        target: Option<String>,
        /// The offer
        description: SessionDescription,
    },
    /// SDP answer
    Answer {
        /// Sender
        from: String,
        /// Recipient
        target: Option<String>,
        /// The answer
        description: SessionDescription,
    },
    /// Trickled candidate
    IceCandidate {
        /// Sender
        from: String,
        /// Recipient
        target: Option<String>,
        /// The candidate
        candidate: IceCandidate,
    },
    /// Liveness probe
    Ping {
        /// Sender
        from: String,
        /// Probe timestamp, echoed in the pong
        timestamp: Option<i64>,
    },
    /// Liveness reply
    Pong {
        /// Sender
        from: String,
        /// Echoed probe timestamp
        timestamp: Option<i64>,
    },
    /// Error report
    Error {
        /// Sender
        from: String,
        /// Human-readable message
        message: String,
    },
    /// Participant metadata
    ParticipantUpdate {
        /// Sender
        from: String,
        /// Opaque metadata
        data: Value,
    },
}

impl SignalingMessage {
    /// Message type
    pub fn message_type(&self) -> MessageType {
        match self {
            SignalingMessage::Join { .. } => MessageType::Join,
            SignalingMessage::Leave { .. } => MessageType::Leave,
            SignalingMessage::Offer { .. } => MessageType::Offer,
            SignalingMessage::Answer { .. } => MessageType::Answer,
            SignalingMessage::IceCandidate { .. } => MessageType::IceCandidate,
            SignalingMessage::Ping { .. } => MessageType::Ping,
            SignalingMessage::Pong { .. } => MessageType::Pong,
            SignalingMessage::Error { .. } => MessageType::Error,
            SignalingMessage::ParticipantUpdate { .. } => MessageType::ParticipantUpdate,
        }
    }

    /// Sender participant id
    pub fn sender(&self) -> &str {
        match self {
            SignalingMessage::Join { from }
            | SignalingMessage::Leave { from }
            | SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::Ping { from, .. }
            | SignalingMessage::Pong { from, .. }
            | SignalingMessage::Error { from, .. }
            | SignalingMessage::ParticipantUpdate { from, .. } => from,
        }
    }

    /// Join and leave are processed even when they echo our own id
    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Join { .. } | SignalingMessage::Leave { .. }
        )
    }

    /// Build the wire envelope, stamped with the current time
    pub fn into_envelope(self) -> Result<Envelope> {
        let kind = self.message_type().as_str().to_string();
        let now = Some(chrono::Utc::now().timestamp_millis());

        let (user_id, target_user_id, data, timestamp) = match self {
            SignalingMessage::Join { from } | SignalingMessage::Leave { from } => {
                (from, None, None, now)
            }
            SignalingMessage::Offer {
                from,
                target,
                description,
            }
            | SignalingMessage::Answer {
                from,
                target,
                description,
            } => (from, target, Some(serde_json::to_value(description)?), now),
            SignalingMessage::IceCandidate {
                from,
                target,
                candidate,
            } => (from, target, Some(serde_json::to_value(candidate)?), now),
            SignalingMessage::Ping { from, timestamp } => (from, None, None, timestamp.or(now)),
            SignalingMessage::Pong { from, timestamp } => (from, None, None, timestamp.or(now)),
            SignalingMessage::Error { from, message } => {
                (from, None, Some(serde_json::json!({ "message": message })), now)
            }
            SignalingMessage::ParticipantUpdate { from, data } => (from, None, Some(data), now),
        };

        Ok(Envelope {
            kind,
            user_id,
            target_user_id,
            data,
            timestamp,
        })
    }
}

fn payload<T: serde::de::DeserializeOwned>(envelope: &Envelope, what: &str) -> Result<T> {
    let data = envelope
        .data
        .clone()
        .ok_or_else(|| Error::ProtocolError(format!("{} envelope without data", what)))?;
    serde_json::from_value(data)
        .map_err(|e| Error::ProtocolError(format!("Invalid {} payload: {}", what, e)))
}

fn description(envelope: &Envelope, expected: SdpType) -> Result<SessionDescription> {
    // Some relays forward a bare SDP string instead of the init object.
    if let Some(Value::String(sdp)) = &envelope.data {
        return Ok(SessionDescription {
            sdp_type: expected,
            sdp: sdp.clone(),
        });
    }

    let desc: SessionDescription = payload(envelope, &envelope.kind)?;
    if desc.sdp_type != expected {
        return Err(Error::ProtocolError(format!(
            "{} envelope carries a {:?} description",
            envelope.kind, desc.sdp_type
        )));
    }
    Ok(desc)
}

impl TryFrom<Envelope> for SignalingMessage {
    type Error = Error;

    fn try_from(envelope: Envelope) -> Result<Self> {
        let kind = envelope.message_type().ok_or_else(|| {
            Error::ProtocolError(format!("Unknown message type: {}", envelope.kind))
        })?;

        let msg = match kind {
            MessageType::Join => SignalingMessage::Join {
                from: envelope.user_id,
            },
            MessageType::Leave => SignalingMessage::Leave {
                from: envelope.user_id,
            },
            MessageType::Offer => SignalingMessage::Offer {
                description: description(&envelope, SdpType::Offer)?,
                from: envelope.user_id,
                target: envelope.target_user_id,
            },
            MessageType::Answer => SignalingMessage::Answer {
                description: description(&envelope, SdpType::Answer)?,
                from: envelope.user_id,
                target: envelope.target_user_id,
            },
            MessageType::IceCandidate => SignalingMessage::IceCandidate {
                candidate: payload(&envelope, "ice-candidate")?,
                from: envelope.user_id,
                target: envelope.target_user_id,
            },
            MessageType::Ping => SignalingMessage::Ping {
                from: envelope.user_id,
                timestamp: envelope.timestamp,
            },
            MessageType::Pong => SignalingMessage::Pong {
                from: envelope.user_id,
                timestamp: envelope.timestamp,
            },
            MessageType::Error => {
                let message = match &envelope.data {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Object(map)) => map
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
                    Some(other) => other.to_string(),
                    None => "unspecified relay error".to_string(),
                };
                SignalingMessage::Error {
                    from: envelope.user_id,
                    message,
                }
            }
            MessageType::ParticipantUpdate => SignalingMessage::ParticipantUpdate {
                data: envelope.data.unwrap_or(Value::Null),
                from: envelope.user_id,
            },
        };

        Ok(msg)
    }
}
