//! Peer connection capability layer
//!
//! Types and traits the session controller uses to drive a peer connection
//! without depending on a particular WebRTC binding.

pub mod connection;
pub mod ice;
pub mod stats;

pub use connection::{
    IceConnectionState, IceServer, NegotiationState, OfferOptions, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventEnvelope, PeerEventSink, SdpType,
    SessionDescription, TransportState,
};
pub use ice::{sort_for_transmission, CandidateType, IceCandidate};
pub use stats::ConnectionMetricsSample;
