//! Peer connection capability interface
//!
//! The session controller drives a connection only through these traits, so
//! the same state machine runs over webrtc-rs (see [`crate::rtc`]) or any
//! other binding that can produce descriptions, candidates and stats.

use super::ice::IceCandidate;
use super::stats::ConnectionMetricsSample;
use crate::channels::DataChannel;
use crate::config::DataChannelMode;
use crate::media::{LocalTrack, RemoteTrack, VideoPreset};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// STUN/TURN server entry handed to the peer connection factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:`, `turn:` or `turns:`)
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,

    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less STUN entry
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// True if any URL points at a relay
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// `urls` may be a single string or an array on the wire
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
    /// Provisional answer
    Pranswer,
    /// Rollback
    Rollback,
}

/// Session description (`RTCSessionDescriptionInit` on the wire)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// True if the SDP carries an m-line of the given media kind
    pub fn has_media(&self, kind: &str) -> bool {
        self.sdp
            .lines()
            .any(|line| line.starts_with(&format!("m={} ", kind)))
    }
}

/// Offer/answer negotiation state (`RTCSignalingState`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No exchange in progress
    Stable,
    /// Local offer applied, awaiting answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet created
    HaveRemoteOffer,
    /// Local provisional answer applied
    HaveLocalPranswer,
    /// Remote provisional answer applied
    HaveRemotePranswer,
    /// Connection closed
    Closed,
}

impl NegotiationState {
    /// A remote offer can be applied
    ///
    /// An offer arriving while our own offer is outstanding (glare) is not
    /// accepted; the initiator role is assigned externally.
    pub fn accepts_remote_offer(&self) -> bool {
        matches!(self, NegotiationState::Stable)
    }

    /// A remote answer can be applied
    pub fn accepts_remote_answer(&self) -> bool {
        matches!(
            self,
            NegotiationState::HaveLocalOffer | NegotiationState::HaveRemotePranswer
        )
    }
}

/// Aggregate transport state (`RTCPeerConnectionState`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media path up
    Connected,
    /// Temporarily lost
    Disconnected,
    /// Permanently lost
    Failed,
    /// Closed locally
    Closed,
}

/// ICE agent state (`RTCIceConnectionState`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    /// Gathering / waiting for remote candidates
    New,
    /// Checking candidate pairs
    Checking,
    /// A usable pair was found
    Connected,
    /// Checks finished
    Completed,
    /// Connectivity lost
    Disconnected,
    /// No usable pair
    Failed,
    /// Agent shut down
    Closed,
}

/// Options for offer creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    /// Negotiate receiving audio even without a local audio track
    pub receive_audio: bool,
    /// Negotiate receiving video even without a local video track
    pub receive_video: bool,
    /// Restart ICE with fresh credentials
    pub ice_restart: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
            ice_restart: false,
        }
    }
}

/// Events raised by a peer connection binding
pub enum PeerEvent {
    /// Aggregate transport state changed
    ConnectionState(TransportState),
    /// ICE agent state changed
    IceConnectionState(IceConnectionState),
    /// A local candidate was gathered
    IceCandidate(IceCandidate),
    /// Local gathering finished
    IceGatheringComplete,
    /// A remote track arrived
    Track(RemoteTrack),
    /// The remote side opened a data channel
    DataChannel(Arc<dyn DataChannel>),
    /// A data channel became open
    DataChannelOpen {
        /// Channel label
        label: String,
    },
    /// Text received on a data channel
    DataChannelMessage {
        /// Channel label
        label: String,
        /// Message body
        text: String,
    },
    /// A data channel closed
    DataChannelClosed {
        /// Channel label
        label: String,
    },
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            PeerEvent::IceConnectionState(s) => {
                f.debug_tuple("IceConnectionState").field(s).finish()
            }
            PeerEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            PeerEvent::IceGatheringComplete => f.write_str("IceGatheringComplete"),
            PeerEvent::Track(t) => f.debug_tuple("Track").field(t).finish(),
            PeerEvent::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            PeerEvent::DataChannelOpen { label } => {
                f.debug_struct("DataChannelOpen").field("label", label).finish()
            }
            PeerEvent::DataChannelMessage { label, text } => f
                .debug_struct("DataChannelMessage")
                .field("label", label)
                .field("len", &text.len())
                .finish(),
            PeerEvent::DataChannelClosed { label } => {
                f.debug_struct("DataChannelClosed").field("label", label).finish()
            }
        }
    }
}

/// Peer event tagged with the connection generation that produced it
#[derive(Debug)]
pub struct PeerEventEnvelope {
    /// Generation of the emitting connection
    pub generation: u64,
    /// The event
    pub event: PeerEvent,
}

/// Sender half handed to a binding when a connection is created
///
/// Every event is stamped with the generation of the connection it belongs
/// to, so the controller can discard callbacks from a connection it already
/// replaced.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEventEnvelope>,
}

impl PeerEventSink {
    /// Create a sink for one connection generation
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEventEnvelope>) -> Self {
        Self { generation, tx }
    }

    /// Generation this sink stamps on events
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Emit an event; returns false once the controller is gone
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(PeerEventEnvelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// One peer connection instance
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Identifier of this connection instance (for logs)
    fn id(&self) -> &str;

    /// Attach a local capture track
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()>;

    /// Create an offer (does not apply it)
    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer (does not apply it)
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// True once a remote description has been applied
    async fn has_remote_description(&self) -> bool;

    /// Current offer/answer state
    fn negotiation_state(&self) -> NegotiationState;

    /// Current aggregate transport state
    fn transport_state(&self) -> TransportState;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Open a data channel from this side
    async fn create_data_channel(
        &self,
        label: &str,
        mode: DataChannelMode,
    ) -> Result<Arc<dyn DataChannel>>;

    /// Sample transport statistics
    async fn stats(&self) -> Result<ConnectionMetricsSample>;

    /// Constrain outgoing video to a preset
    async fn apply_video_preset(&self, preset: &VideoPreset) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Creates peer connections for a session
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Build a new connection; all of its callbacks go to `events`
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>>;
}
