//! Peer transport abstraction.
//!
//! A [`TransportSession`] is the local end of a peer connection: it produces
//! and consumes session descriptions and ICE candidates, and reports
//! connectivity. Local candidates and connectivity changes are delivered as
//! [`TransportEvent`]s on the channel handed to the [`TransportFactory`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::types::SessionId;

/// An ICE candidate received from or to be sent to a peer.
///
/// The format follows RFC 5245.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate string (e.g., "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    /// SDP media stream identification (e.g., "0" for audio)
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_m_line_index: Option<u16>,
    /// Username fragment for ICE
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }

    /// The `typ` attribute of the candidate line, if present and known.
    pub fn candidate_type(&self) -> Option<CandidateType> {
        let mut fields = self.candidate.split_whitespace();
        fields.find(|field| *field == "typ")?;
        fields.next()?.parse().ok()
    }

    pub fn is_relay(&self) -> bool {
        self.candidate_type() == Some(CandidateType::Relay)
    }
}

/// ICE candidate type (RFC 5245).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Direct host candidate
    Host,
    /// Server reflexive (STUN) candidate
    ServerReflexive,
    /// Peer reflexive candidate
    PeerReflexive,
    /// Relay (TURN) candidate
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl std::str::FromStr for CandidateType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// A session description (SDP) with its role in the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE connectivity of a transport session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub const fn is_established(self) -> bool {
        matches!(self, Self::Connected)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asynchronous output of a transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate was discovered. `None` marks the end of gathering.
    LocalCandidate(Option<IceCandidate>),
    ConnectivityChanged(ConnectivityState),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Local end of a peer connection.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;

    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;

    async fn set_local_description(&self, description: &SessionDescription) -> anyhow::Result<()>;

    async fn set_remote_description(&self, description: &SessionDescription)
    -> anyhow::Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()>;

    fn connectivity_state(&self) -> ConnectivityState;

    async fn close(&self);
}

/// Creates transport sessions for calls.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        session: &SessionId,
        events: TransportEvents,
    ) -> anyhow::Result<Arc<dyn TransportSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_candidate_builder() {
        let candidate = IceCandidate::new("candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0)
            .with_username_fragment("abc123");

        assert!(candidate.candidate.starts_with("candidate:"));
        assert_eq!(candidate.sdp_mid, Some("0".to_string()));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert_eq!(candidate.username_fragment, Some("abc123".to_string()));
    }

    #[test]
    fn test_candidate_type_from_line() {
        let host = IceCandidate::new("candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host");
        assert_eq!(host.candidate_type(), Some(CandidateType::Host));
        assert!(!host.is_relay());

        let relay = IceCandidate::new(
            "candidate:3 1 udp 41885439 203.0.113.7 3478 typ relay raddr 0.0.0.0 rport 0",
        );
        assert!(relay.is_relay());

        let malformed = IceCandidate::new("candidate:4 1 udp 1 10.0.0.1 9 typ");
        assert_eq!(malformed.candidate_type(), None);
        assert!(!malformed.is_relay());
    }

    #[test]
    fn test_candidate_type_parsing() {
        assert_eq!("host".parse(), Ok(CandidateType::Host));
        assert_eq!("srflx".parse(), Ok(CandidateType::ServerReflexive));
        assert_eq!("prflx".parse(), Ok(CandidateType::PeerReflexive));
        assert_eq!("RELAY".parse(), Ok(CandidateType::Relay));
        assert!("unknown".parse::<CandidateType>().is_err());
    }

    #[test]
    fn test_description_serializes_kind_lowercase() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json["kind"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn test_only_connected_is_established() {
        assert!(ConnectivityState::Connected.is_established());
        assert!(!ConnectivityState::Checking.is_established());
        assert!(!ConnectivityState::Failed.is_established());
    }
}
