//! Session client binary
//!
//! Joins one session through the signaling relay using the webrtc-rs binding
//! and sample-fed local tracks, and logs every session event until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Initiator
//! rtc-session --session consult-42 --token "$TOKEN" --initiator
//!
//! # Responder, relay from the environment
//! RTC_SIGNALING_URL="wss://relay.example.com/signal" \
//! rtc-session --session consult-42 --token "$TOKEN"
//!
//! # Settings from a TOML file
//! rtc-session --config session.toml --session consult-42 --token "$TOKEN"
//! ```
//!
//! `RUST_LOG` controls logging (default: `info`).

use anyhow::{Context, Result};
use clap::Parser;
use rtc_session::rtc::{SampleMediaProvider, WebRtcPeerFactory};
use rtc_session::{SessionConfig, SessionController, SessionEvent, SessionIdentity};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rtc-session")]
#[command(about = "Join a two-party WebRTC session", version)]
struct Args {
    /// Session identifier shared with the remote participant
    #[arg(long, env = "RTC_SESSION_ID")]
    session: String,

    /// Bearer token for the relay and the TURN endpoint
    #[arg(long, env = "RTC_TOKEN", hide_env_values = true)]
    token: String,

    /// Create the offer (exactly one side must pass this)
    #[arg(long)]
    initiator: bool,

    /// Local participant id (random when omitted)
    #[arg(long, env = "RTC_USER_ID")]
    user_id: Option<String>,

    /// TOML configuration file
    #[arg(long, env = "RTC_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling relay URL, overrides the file
    #[arg(long, env = "RTC_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Comma-separated STUN servers, overrides the file
    #[arg(long, env = "RTC_STUN_SERVERS", value_delimiter = ',')]
    stun_servers: Vec<String>,

    /// TURN credentials endpoint, overrides the file
    #[arg(long, env = "RTC_TURN_CREDENTIALS_URL")]
    turn_credentials_url: Option<String>,

    /// Disable video preset adaptation
    #[arg(long)]
    no_adaptive_quality: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    info!(version = rtc_session::version(), "rtc-session starting");

    let config = load_config(&args)?;
    info!(
        signaling_url = %config.signaling_url,
        stun_servers = config.stun_servers.len(),
        turn_servers = config.turn_servers.len(),
        turn_endpoint = config.turn_credentials_url.is_some(),
        adaptive_quality = config.options.adaptive_quality_enabled,
        "Configuration loaded"
    );

    let identity = match &args.user_id {
        Some(user_id) => SessionIdentity::new(&args.session, user_id),
        None => SessionIdentity::with_random_user(&args.session),
    };
    info!(session_id = %identity.session_id, user_id = %identity.user_id, "Joining session");

    let controller = Arc::new(SessionController::new(
        config,
        identity,
        Arc::new(SampleMediaProvider::default()),
        Arc::new(WebRtcPeerFactory::new()),
    )?);

    let mut events = controller.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if log_event(&event) {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Dropped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = controller.initialize(&args.token, args.initiator).await {
        error!("Failed to start session: {}", e);
        controller.disconnect().await;
        logger.abort();
        return Err(e).context("session start failed");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            info!("Shutdown signal received, cleaning up...");
        }
        _ = logger => {
            info!("Session ended");
        }
    }

    controller.disconnect().await;
    info!("Session closed");
    Ok(())
}

/// Log one event; returns true once the session reached a terminal state
fn log_event(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::ConnectionStateChanged(state) => {
            info!(%state, "Session state changed");
            return state.is_terminal();
        }
        SessionEvent::Error(err) if err.fatal => error!("{}", err.message),
        SessionEvent::Error(err) => warn!("{}", err.message),
        SessionEvent::Metrics(sample) => info!(
            rtt_ms = sample.rtt_ms,
            packet_loss_pct = sample.packet_loss_percent(),
            relayed = sample.is_relayed(),
            "Metrics"
        ),
        SessionEvent::QualityChanged(tier) => info!(%tier, "Video quality changed"),
        SessionEvent::DataChannelMessage(text) => info!(len = text.len(), "Data channel message"),
        other => info!("{:?}", other),
    }
    false
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if let Some(url) = &args.signaling_url {
        config.signaling_url = url.clone();
    }
    if !args.stun_servers.is_empty() {
        config.stun_servers = args.stun_servers.clone();
    }
    if let Some(url) = &args.turn_credentials_url {
        config.turn_credentials_url = Some(url.clone());
    }
    if args.no_adaptive_quality {
        config.options.adaptive_quality_enabled = false;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

