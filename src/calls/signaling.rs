//! Signaling channel between the two peers of a call.
//!
//! Outbound messages go through a [`SignalingGateway`]. Inbound messages are
//! delivered to a call as [`InboundSignal`]s; the `connection_id` carried by
//! most of them identifies the remote endpoint that sent the message.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::report::NegotiationReport;
use super::transport::{IceCandidate, SessionDescription};
use super::types::SessionId;

/// Outbound side of the signaling channel.
///
/// Sends are fire-and-forget from the negotiation's point of view: a failed
/// send is logged and never retried.
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    async fn send_offer(
        &self,
        session: &SessionId,
        offer: &SessionDescription,
    ) -> anyhow::Result<()>;

    async fn send_answer(
        &self,
        session: &SessionId,
        answer: &SessionDescription,
        peer_connection_id: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Tell the remote side which of its connections won the call.
    async fn send_connected(
        &self,
        session: &SessionId,
        peer_connection_id: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn send_candidate(
        &self,
        session: &SessionId,
        candidate: &IceCandidate,
        peer_connection_id: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn send_terminate(
        &self,
        session: &SessionId,
        peer_connection_id: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn send_report(
        &self,
        session: &SessionId,
        report: &NegotiationReport,
        peer_connection_id: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// A message received from the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundSignal {
    Offer {
        description: SessionDescription,
        connection_id: Option<String>,
    },
    Answer {
        description: SessionDescription,
        connection_id: Option<String>,
    },
    Candidate {
        candidate: IceCandidate,
        connection_id: Option<String>,
    },
    /// The caller picked a winning connection; it may not be ours.
    Connected { connection_id: Option<String> },
    Bye { reason: Option<String> },
}

impl InboundSignal {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Connected { .. } => "connected",
            Self::Bye { .. } => "bye",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_signal_json_shape() {
        let signal: InboundSignal = serde_json::from_str(
            r#"{"type":"bye","reason":"busy"}"#,
        )
        .unwrap();
        assert_eq!(
            signal,
            InboundSignal::Bye {
                reason: Some("busy".to_string())
            }
        );
        assert_eq!(signal.kind(), "bye");

        let offer = InboundSignal::Offer {
            description: SessionDescription::offer("v=0"),
            connection_id: Some("peer-1".to_string()),
        };
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["description"]["kind"], "offer");
        assert_eq!(json["connection_id"], "peer-1");
    }
}
