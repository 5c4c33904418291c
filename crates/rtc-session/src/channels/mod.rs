//! Auxiliary data channel
//!
//! One ordered channel per session carries the media-path heartbeat and
//! opaque application messages.

pub mod messages;

pub use messages::{ChannelMessage, InboundPayload, MAX_MESSAGE_SIZE};

use crate::Result;
use async_trait::async_trait;

/// Label of the session data channel
pub const SESSION_CHANNEL_LABEL: &str = "session";

/// Data channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    /// Channel is being created
    Connecting,
    /// Channel is open and ready for messages
    Open,
    /// Channel is closing
    Closing,
    /// Channel is closed
    Closed,
}

/// A data channel as seen by the session controller
///
/// Bindings report open/message/close through the connection's
/// [`crate::peer::PeerEventSink`]; this trait only covers the outbound side.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Current state
    fn state(&self) -> DataChannelState;

    /// True when messages can be sent
    fn is_open(&self) -> bool {
        self.state() == DataChannelState::Open
    }

    /// Send a text message
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}
