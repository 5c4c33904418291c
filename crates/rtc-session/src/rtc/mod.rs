//! webrtc-rs binding
//!
//! Implements the connection, data channel and media traits on top of the
//! `webrtc` crate. Everything above this module only sees the traits.

pub mod data_channel;
pub mod peer;
pub mod stats;
pub mod tracks;

pub use data_channel::RtcDataChannel;
pub use peer::{WebRtcPeer, WebRtcPeerFactory};
pub use tracks::{SampleMediaProvider, SampleTrack};

use crate::peer::IceServer;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Convert configured servers to webrtc-rs form
pub(crate) fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| {
            #[allow(clippy::needless_update)]
            RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            }
        })
        .collect()
}
