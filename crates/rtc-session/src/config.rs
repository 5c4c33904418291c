//! Configuration types for the session controller

use crate::peer::IceServer;
use crate::session::reconnect::ReconnectionPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a SessionController
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket signaling relay base URL (ws:// or wss://)
    ///
    /// The session id is appended as a path segment at connect time.
    pub signaling_url: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// Statically configured TURN servers (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Endpoint returning short-lived TURN credentials (optional)
    pub turn_credentials_url: Option<String>,

    /// Data channel mode (default: Reliable)
    pub data_channel_mode: DataChannelMode,

    /// Additional configuration options
    pub options: SessionOptions,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Timing and budget options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Maximum media-path reconnection attempts (default: 3)
    pub max_reconnect_attempts: u32,

    /// Base reconnection backoff in milliseconds (default: 1000)
    pub reconnect_backoff_base_ms: u64,

    /// Maximum reconnection backoff in milliseconds (default: 10000)
    pub reconnect_backoff_max_ms: u64,

    /// Data channel heartbeat period in milliseconds (default: 5000)
    pub heartbeat_interval_ms: u64,

    /// Heartbeat silence tolerated, as a multiple of the interval (default: 6)
    pub heartbeat_timeout_multiplier: u32,

    /// Quality sampling period in milliseconds (default: 5000)
    pub quality_interval_ms: u64,

    /// Enable video preset adaptation from sampled metrics (default: true)
    pub adaptive_quality_enabled: bool,

    /// Debounce window after the first local candidate (default: 1000)
    pub ice_flush_debounce_ms: u64,

    /// Delay between consecutive candidate sends (default: 50)
    pub ice_send_stagger_ms: u64,

    /// Maximum signaling reconnection attempts (default: 5)
    pub signaling_max_reconnect_attempts: u32,

    /// Signaling reconnect delay step in milliseconds, grows linearly (default: 1000)
    pub signaling_reconnect_delay_ms: u64,

    /// Client keepalive ping period in milliseconds, 0 disables (default: 25000)
    pub signaling_ping_interval_ms: u64,
}

/// Data channel mode
///
/// Determines the reliability of message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChannelMode {
    /// Reliable, ordered delivery (default)
    Reliable,
    /// Unreliable, unordered delivery (low latency)
    Unreliable,
}

impl DataChannelMode {
    /// Get the ordered setting for webrtc-rs
    pub fn ordered(&self) -> bool {
        match self {
            DataChannelMode::Reliable => true,
            DataChannelMode::Unreliable => false,
        }
    }

    /// Get the max retransmits setting for webrtc-rs
    pub fn max_retransmits(&self) -> Option<u16> {
        match self {
            DataChannelMode::Reliable => None,
            DataChannelMode::Unreliable => Some(0),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080/ws".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            turn_credentials_url: None,
            data_channel_mode: DataChannelMode::Reliable,
            options: SessionOptions::default(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            reconnect_backoff_base_ms: 1000,
            reconnect_backoff_max_ms: 10000,
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_multiplier: 6,
            quality_interval_ms: 5000,
            adaptive_quality_enabled: true,
            ice_flush_debounce_ms: 1000,
            ice_send_stagger_ms: 50,
            signaling_max_reconnect_attempts: 5,
            signaling_reconnect_delay_ms: 1000,
            signaling_ping_interval_ms: 25000,
        }
    }
}

impl SessionConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a WebSocket URL
    /// - `stun_servers` is empty or contains a non-STUN URL
    /// - `turn_credentials_url` is set but not http(s)
    /// - any interval or budget is zero
    /// - the backoff cap is below the base delay
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if let Some(bad) = self
            .stun_servers
            .iter()
            .find(|s| !s.starts_with("stun:") && !s.starts_with("stuns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "STUN server must start with stun: or stuns:, got {}",
                bad
            )));
        }

        if let Some(bad) = self
            .turn_servers
            .iter()
            .find(|t| !t.url.starts_with("turn:") && !t.url.starts_with("turns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "TURN server must start with turn: or turns:, got {}",
                bad.url
            )));
        }

        if let Some(url) = &self.turn_credentials_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::InvalidConfig(format!(
                    "turn_credentials_url must start with http:// or https://, got {}",
                    url
                )));
            }
        }

        let o = &self.options;

        if o.max_reconnect_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_reconnect_attempts must be at least 1".to_string(),
            ));
        }

        if o.reconnect_backoff_base_ms == 0 || o.reconnect_backoff_max_ms < o.reconnect_backoff_base_ms
        {
            return Err(Error::InvalidConfig(format!(
                "reconnect backoff must satisfy 0 < base <= max, got base={} max={}",
                o.reconnect_backoff_base_ms, o.reconnect_backoff_max_ms
            )));
        }

        if o.heartbeat_interval_ms == 0 || o.heartbeat_timeout_multiplier < 2 {
            return Err(Error::InvalidConfig(format!(
                "heartbeat needs a non-zero interval and a multiplier >= 2, got interval={}ms multiplier={}",
                o.heartbeat_interval_ms, o.heartbeat_timeout_multiplier
            )));
        }

        if o.quality_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "quality_interval_ms must be non-zero".to_string(),
            ));
        }

        if o.signaling_max_reconnect_attempts == 0 {
            return Err(Error::InvalidConfig(
                "signaling_max_reconnect_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse a configuration from TOML text and validate it
    ///
    /// Missing keys fall back to their defaults.
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Create a configuration preset that favours fast recovery
    ///
    /// Shorter heartbeat and a tighter backoff cap detect and repair a
    /// broken media path sooner, at the cost of more signaling traffic.
    ///
    /// # Example
    ///
    /// ```
    /// use rtc_session::config::SessionConfig;
    ///
    /// let config = SessionConfig::low_latency_preset("ws://localhost:8080/ws");
    /// assert_eq!(config.options.heartbeat_interval_ms, 2000);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn low_latency_preset(signaling_url: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            data_channel_mode: DataChannelMode::Unreliable,
            options: SessionOptions {
                reconnect_backoff_base_ms: 500,
                reconnect_backoff_max_ms: 4000,
                heartbeat_interval_ms: 2000,
                quality_interval_ms: 2000,
                ice_flush_debounce_ms: 500,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration preset for lossy or mobile networks
    ///
    /// More reconnection attempts and a more tolerant heartbeat.
    pub fn resilient_preset(signaling_url: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            options: SessionOptions {
                max_reconnect_attempts: 6,
                reconnect_backoff_max_ms: 30000,
                heartbeat_timeout_multiplier: 10,
                signaling_max_reconnect_attempts: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// ICE servers from the static configuration (STUN first, then TURN)
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.stun_servers
            .iter()
            .map(|url| IceServer::stun(url.clone()))
            .chain(self.turn_servers.iter().map(|turn| IceServer {
                urls: vec![turn.url.clone()],
                username: Some(turn.username.clone()),
                credential: Some(turn.credential.clone()),
            }))
            .collect()
    }

    /// Media-path reconnection policy derived from the options
    pub fn reconnection_policy(&self) -> ReconnectionPolicy {
        ReconnectionPolicy {
            max_attempts: self.options.max_reconnect_attempts,
            backoff_initial_ms: self.options.reconnect_backoff_base_ms,
            backoff_max_ms: self.options.reconnect_backoff_max_ms,
            ..Default::default()
        }
    }
}

impl SessionOptions {
    /// Heartbeat period
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat silence that counts as a partition
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_timeout_multiplier
    }

    /// Quality sampling period
    pub fn quality_interval(&self) -> Duration {
        Duration::from_millis(self.quality_interval_ms)
    }

    /// Local candidate debounce window
    pub fn ice_flush_debounce(&self) -> Duration {
        Duration::from_millis(self.ice_flush_debounce_ms)
    }

    /// Spacing between candidate sends
    pub fn ice_send_stagger(&self) -> Duration {
        Duration::from_millis(self.ice_send_stagger_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.options.max_reconnect_attempts, 3);
        assert_eq!(config.options.heartbeat_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_http_signaling_url() {
        let config = SessionConfig {
            signaling_url: "http://localhost:8080".to_string(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_rejects_empty_stun() {
        let config = SessionConfig {
            stun_servers: vec![],
            ..Default::default()
        };
        assert_err!(config.validate());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = SessionConfig::default();
        config.options.reconnect_backoff_max_ms = 500;
        assert_err!(config.validate());
    }

    #[test]
    fn test_rejects_bad_turn_endpoint() {
        let config = SessionConfig {
            turn_credentials_url: Some("ftp://turn.example.com".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ice_servers_order() {
        let config = SessionConfig {
            turn_servers: vec![TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: "u".to_string(),
                credential: "c".to_string(),
            }],
            ..Default::default()
        };
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert!(servers[0].username.is_none());
        assert_eq!(servers[1].username.as_deref(), Some("u"));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = SessionConfig::from_toml_str(
            r#"
            signaling_url = "wss://relay.example.com/ws"

            [options]
            max_reconnect_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.signaling_url, "wss://relay.example.com/ws");
        assert_eq!(config.options.max_reconnect_attempts, 5);
        assert_eq!(config.options.heartbeat_interval_ms, 5000);
    }

    #[test]
    fn test_presets_validate() {
        assert_ok!(SessionConfig::low_latency_preset("ws://a/ws").validate());
        assert_ok!(SessionConfig::resilient_preset("ws://a/ws").validate());
    }

    #[test]
    fn test_reconnection_policy_from_options() {
        let policy = SessionConfig::default().reconnection_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_initial_ms, 1000);
        assert_eq!(policy.backoff_max_ms, 10000);
    }
}
