//! Error types for the session controller and signaling client

/// Result type alias using the session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or maintaining a session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Signaling transport is not open
    #[error("Signaling channel is not connected")]
    NotConnected,

    /// Signaling reconnect budget exhausted
    #[error("Signaling reconnection failed after {0} attempts")]
    SignalingExhausted(u32),

    /// Local capture devices refused (permission denial)
    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    /// Local media could not be acquired for a reason other than permission
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Media reconnect budget exhausted
    #[error("Connection lost after {0} reconnection attempts")]
    ReconnectExhausted(u32),

    /// Operation called in a state that does not allow it
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Malformed or unexpected signaling envelope
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// HTTP error (TURN credential endpoint)
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::NotConnected
                | Error::OperationTimeout(_)
                | Error::WebSocketError(_)
                | Error::HttpError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error ends the session without further automatic recovery
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied(_)
                | Error::MediaAcquisition(_)
                | Error::ReconnectExhausted(_)
                | Error::SignalingExhausted(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}
