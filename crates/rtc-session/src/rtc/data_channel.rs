//! webrtc-rs data channel

use crate::channels::{DataChannel, DataChannelState, MAX_MESSAGE_SIZE};
use crate::config::DataChannelMode;
use crate::peer::{PeerEvent, PeerEventSink};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

/// Data channel wrapper reporting through a [`PeerEventSink`]
pub struct RtcDataChannel {
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    /// Create a channel on `peer_connection`
    pub async fn create(
        peer_connection: &RTCPeerConnection,
        label: &str,
        mode: DataChannelMode,
        sink: PeerEventSink,
    ) -> Result<Self> {
        let init = RTCDataChannelInit {
            ordered: Some(mode.ordered()),
            max_retransmits: mode.max_retransmits(),
            ..Default::default()
        };

        let rtc_channel = peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        let channel = Self::wrap(rtc_channel);
        channel.bind(sink);
        Ok(channel)
    }

    /// Wrap a channel opened by the remote side
    ///
    /// Handlers are not installed until [`RtcDataChannel::bind`].
    pub fn wrap(rtc_channel: Arc<RTCDataChannel>) -> Self {
        Self {
            label: rtc_channel.label().to_string(),
            rtc_channel,
        }
    }

    /// Route open/message/close to the sink
    pub fn bind(&self, sink: PeerEventSink) {
        let label = self.label.clone();
        let open_sink = sink.clone();
        self.rtc_channel.on_open(Box::new(move || {
            debug!("Data channel '{}' opened", label);
            open_sink.emit(PeerEvent::DataChannelOpen { label });
            Box::pin(async {})
        }));

        let label = self.label.clone();
        let message_sink = sink.clone();
        self.rtc_channel
            .on_message(Box::new(move |msg: DataChannelMessage| {
                if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => {
                            message_sink.emit(PeerEvent::DataChannelMessage {
                                label: label.clone(),
                                text,
                            });
                        }
                        Err(e) => warn!("Invalid UTF-8 on data channel '{}': {}", label, e),
                    }
                } else {
                    debug!("Ignoring binary message on '{}'", label);
                }
                Box::pin(async {})
            }));

        let label = self.label.clone();
        self.rtc_channel.on_close(Box::new(move || {
            debug!("Data channel '{}' closed", label);
            sink.emit(PeerEvent::DataChannelClosed {
                label: label.clone(),
            });
            Box::pin(async {})
        }));

        let label = self.label.clone();
        self.rtc_channel.on_error(Box::new(move |err| {
            error!("Data channel '{}' error: {}", label, err);
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> DataChannelState {
        match self.rtc_channel.ready_state() {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            _ => DataChannelState::Connecting,
        }
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(Error::DataChannelError(format!(
                "Message size {} exceeds maximum {} bytes",
                text.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let state = self.state();
        if state != DataChannelState::Open {
            return Err(Error::DataChannelError(format!(
                "Data channel is not open (state: {:?})",
                state
            )));
        }

        self.rtc_channel
            .send_text(text.to_string())
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send message: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.rtc_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close data channel: {}", e)))
    }
}
