//! Signaling: envelope protocol, transports and the session channel

pub mod client;
pub mod connector;
pub mod protocol;

pub use client::{SignalingChannel, SignalingConfig, SignalingState};
pub use connector::{SignalingConnector, SignalingLink, WebSocketConnector};
pub use protocol::{Envelope, MessageType, SignalingMessage};
