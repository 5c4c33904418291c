//! Signaling transports
//!
//! A connector opens one transport to the relay and exposes it as a pair of
//! text channels. The signaling channel owns reconnection; a connector only
//! knows how to make a single attempt.

use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// An open signaling transport
///
/// Dropping `outbound` closes the transport; `inbound` yields `None` once the
/// remote end is gone.
pub struct SignalingLink {
    /// Text frames to send
    pub outbound: mpsc::UnboundedSender<String>,
    /// Text frames received
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens signaling transports
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Make one connection attempt to `url`
    async fn connect(&self, url: &str) -> Result<SignalingLink>;
}

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Connector with a custom handshake timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Sender task: forwards queued text to the socket, then closes it
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(text) = rx.recv().await {
            if let Err(e) = write.send(Message::Text(text)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        let _ = write.close().await;
        debug!("Sender task terminated");
    }

    /// Receiver task: forwards text frames until the socket closes
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<String>,
    ) {
        while let Some(msg_result) = read.next().await {
            let text = match msg_result {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!("Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    info!("WebSocket connection closed: {:?}", frame);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
            };

            if tx.send(text).is_err() {
                break;
            }
        }

        debug!("Receiver task terminated");
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<SignalingLink> {
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                Error::OperationTimeout(format!(
                    "WebSocket handshake exceeded {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        let (write, read) = ws_stream.split();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::sender_task(write, out_rx));
        tokio::spawn(Self::receiver_task(read, in_tx));

        Ok(SignalingLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 9 (discard) is not expected to run a WebSocket server.
        let connector = WebSocketConnector::new(Duration::from_secs(2));
        let result = connector.connect("ws://127.0.0.1:9/ws").await;
        assert!(result.is_err());
    }
}
