//! Session lifecycle: controller, state machine and its helpers

pub mod candidates;
pub mod controller;
pub mod events;
pub mod heartbeat;
pub mod quality;
pub mod reconnect;
pub mod state;
pub mod turn;

pub use candidates::IceCandidateBuffer;
pub use controller::SessionController;
pub use events::{SessionError, SessionEvent};
pub use heartbeat::{HeartbeatState, MonitorLoops, MonitorTick};
pub use quality::{QualityMonitor, QualityTier};
pub use reconnect::{ReconnectState, ReconnectionPolicy};
pub use state::{SessionState, Transition};
pub use turn::TurnCredentialsClient;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side creates the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates offers and the data channel
    Initiator,
    /// Answers offers
    Responder,
}

impl Role {
    /// Role from the `is_initiator` flag
    pub fn from_initiator(is_initiator: bool) -> Self {
        if is_initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Who we are in which session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Session identifier shared by both participants
    pub session_id: String,
    /// Local participant identifier
    pub user_id: String,
}

impl SessionIdentity {
    /// Identity from known ids
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Identity with a random participant id
    pub fn with_random_user(session_id: impl Into<String>) -> Self {
        Self::new(session_id, uuid::Uuid::new_v4().to_string())
    }
}
