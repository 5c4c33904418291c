//! Two-party WebRTC session controller
//!
//! Establishes and maintains one audio/video session between two
//! participants, exchanging connection setup through a WebSocket relay.
//!
//! # Features
//!
//! - **Offer/answer** driven by an externally assigned initiator
//! - **ICE candidate ordering**: debounced, sorted batches; early remote
//!   candidates queued until a remote description exists
//! - **Reconnection** with exponential backoff and a bounded attempt budget
//! - **Heartbeat** over the data channel to catch silent partitions
//! - **Quality adaptation**: video preset chosen from sampled loss and RTT
//! - **Signaling channel** with its own linear reconnect loop and keepalive
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  SessionHandle (snapshot for a view)          │
//! │  ↓                                            │
//! │  SessionController                            │
//! │  ├─ MediaProvider        (local capture)      │
//! │  ├─ PeerConnectionFactory (webrtc-rs binding) │
//! │  ├─ SignalingChannel ── SignalingConnector    │
//! │  └─ one dispatch task: state machine, timers  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use rtc_session::SessionConfig;
//!
//! let config = SessionConfig {
//!     signaling_url: "wss://relay.example.com/signal".to_string(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.options.max_reconnect_attempts, 3);
//! ```

#![warn(clippy::all)]

pub mod adapter;
pub mod channels;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod rtc;
pub mod session;
pub mod signaling;

pub use adapter::{SessionHandle, SessionSnapshot};
pub use config::{DataChannelMode, SessionConfig, SessionOptions, TurnServerConfig};
pub use error::{Error, Result};
pub use session::{
    QualityTier, Role, SessionController, SessionError, SessionEvent, SessionIdentity,
    SessionState,
};
pub use signaling::{SignalingChannel, SignalingConfig, SignalingState};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
