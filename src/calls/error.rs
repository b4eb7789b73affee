//! Call-related error types.

use super::media::MediaError;
use super::types::SessionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(SessionId),

    #[error("call already exists: {0}")]
    AlreadyExists(SessionId),

    #[error("too many concurrent calls (limit {0})")]
    TooManyCalls(usize),

    #[error("call {0} is terminated")]
    Terminated(SessionId),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("call task has stopped")]
    Closed,
}

/// Failures surfaced by the negotiation coordinator.
///
/// These are cloned into settled [`Deferred`](super::deferred::Deferred)
/// values, so every payload is owned text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("no transport session has been created")]
    NoSession,

    #[error("caller received an offer")]
    CallerReceivedOffer,

    #[error("could not create session description: {0}")]
    DescriptionCreation(String),

    #[error("could not apply local description: {0}")]
    LocalDescription(String),

    #[error("could not apply remote description: {0}")]
    RemoteDescription(String),

    #[error("remote candidate rejected: {0}")]
    CandidateRejected(String),

    #[error("hung up before approval")]
    HungUpBeforeApproval,

    #[error("negotiation closed")]
    Closed,
}
