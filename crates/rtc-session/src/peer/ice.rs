//! ICE candidate model and transmission ordering

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// ICE candidate types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Host candidate (local interface address)
    Host,
    /// Peer reflexive candidate (learned during connectivity checks)
    PeerReflexive,
    /// Server reflexive candidate (STUN)
    ServerReflexive,
    /// Relay candidate (TURN)
    Relay,
    /// Candidate line without a recognizable `typ` field
    Unknown,
}

impl CandidateType {
    /// Parse the `typ` token of a candidate line
    pub fn from_token(token: &str) -> Self {
        match token {
            "host" => CandidateType::Host,
            "prflx" => CandidateType::PeerReflexive,
            "srflx" => CandidateType::ServerReflexive,
            "relay" => CandidateType::Relay,
            _ => CandidateType::Unknown,
        }
    }

    /// Type preference used when ordering candidates for transmission
    ///
    /// host > peer-reflexive > server-reflexive > relay > unknown.
    pub fn type_preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 1,
            CandidateType::Unknown => 0,
        }
    }

    /// Token as it appears after `typ` in SDP
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relay => "relay",
            CandidateType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE candidate as exchanged over signaling
///
/// Field names follow `RTCIceCandidateInit` so browsers on the other end of
/// the relay can consume the payload directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line (`candidate:... typ host ...`)
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,

    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Create a candidate from a bare attribute line
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    /// Attach SDP media identification
    pub fn with_mid(mut self, sdp_mid: impl Into<String>, sdp_m_line_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_m_line_index = Some(sdp_m_line_index);
        self
    }

    fn fields(&self) -> impl Iterator<Item = &str> {
        self.candidate
            .trim_start_matches("a=")
            .trim_start_matches("candidate:")
            .split_whitespace()
    }

    /// Candidate type parsed from the `typ` token
    pub fn candidate_type(&self) -> CandidateType {
        let mut fields = self.fields().skip_while(|f| *f != "typ");
        fields.next();
        fields
            .next()
            .map(CandidateType::from_token)
            .unwrap_or(CandidateType::Unknown)
    }

    /// Numeric priority (fourth field), zero when unparseable
    pub fn priority(&self) -> u32 {
        self.fields()
            .nth(3)
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }

    /// Transport protocol (third field), lowercased
    pub fn protocol(&self) -> String {
        self.fields()
            .nth(2)
            .map(|p| p.to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// True for the empty end-of-candidates marker
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }

    /// Transmission order: higher type preference first, then higher priority
    pub fn transmission_order(&self, other: &Self) -> Ordering {
        let a = (self.candidate_type().type_preference(), self.priority());
        let b = (other.candidate_type().type_preference(), other.priority());
        b.cmp(&a)
    }
}

/// Sort a batch of local candidates into transmission order (stable)
pub fn sort_for_transmission(batch: &mut [IceCandidate]) {
    batch.sort_by(|a, b| a.transmission_order(b));
}
