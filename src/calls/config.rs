//! Negotiation configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::CallError;
use super::timer::TimerKind;

/// Timeouts and connection policy for a single call.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use call_negotiation::calls::NegotiationConfig;
///
/// let config = NegotiationConfig::from_json_str(r#"{ "force_turn": true }"#).unwrap();
/// assert!(config.force_turn);
/// assert_eq!(config.answer_timeout_ms, 10_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Time allowed for the local user to answer once the call is prepared.
    pub answer_timeout_ms: u64,
    /// Time the caller waits for the remote answer after sending its offer.
    pub receive_answer_timeout_ms: u64,
    /// Time allowed for connectivity to establish once both sides agreed.
    pub connection_timeout_ms: u64,
    /// Time allowed for a renegotiation to be accepted.
    pub modify_timeout_ms: u64,
    /// Only relay candidates are exchanged.
    pub force_turn: bool,
    /// Answer without local media; the call connects as soon as it is answered.
    pub receive_only: bool,
    /// Answer with a data connection only. Such a call only moves on from
    /// `preparing` when the answer asks to preview media; without a preview
    /// it waits there until the answer timer ends it.
    pub direct_connection_only: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            answer_timeout_ms: 10_000,
            receive_answer_timeout_ms: 60_000,
            connection_timeout_ms: 10_000,
            modify_timeout_ms: 60_000,
            force_turn: false,
            receive_only: false,
            direct_connection_only: false,
        }
    }
}

impl NegotiationConfig {
    pub fn from_json_str(json: &str) -> Result<Self, CallError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn timeout_for(&self, kind: TimerKind) -> Duration {
        let ms = match kind {
            TimerKind::Answer => self.answer_timeout_ms,
            TimerKind::ReceiveAnswer => self.receive_answer_timeout_ms,
            TimerKind::Connection => self.connection_timeout_ms,
            TimerKind::Modify => self.modify_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}
