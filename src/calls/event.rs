//! Events accepted by the negotiation state machine.

use std::fmt;
use std::sync::Arc;

use super::types::Role;

/// Callback used to grant local media approval without another round trip
/// through the application.
#[derive(Clone)]
pub struct Approver(Arc<dyn Fn() + Send + Sync>);

impl Approver {
    pub fn new(approve: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(approve))
    }

    pub fn approve(&self) {
        (self.0)()
    }
}

impl fmt::Debug for Approver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Approver")
    }
}

/// Parameters of the `answer` event.
#[derive(Debug, Clone, Default)]
pub struct AnswerParams {
    /// The application wants to preview local media before approving it.
    pub preview: bool,
    pub receive_only: bool,
    pub direct_connection_only: bool,
    pub approve: Option<Approver>,
}

impl AnswerParams {
    /// Local capture devices are needed for this call.
    pub fn needs_media(&self) -> bool {
        !self.direct_connection_only && !self.receive_only
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Initiate {
        role: Role,
        acceptor_registered: bool,
    },
    Hangup {
        signal: Option<bool>,
        reason: Option<String>,
    },
    Answer(AnswerParams),
    Approve {
        preview: bool,
    },
    Reject {
        reason: Option<String>,
    },
    ReceiveLocalMedia,
    ReceiveRemoteMedia,
    SentOffer,
    ReceiveAnswer,
    Accept,
    Modify {
        receive: Option<bool>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Initiate { .. } => EventKind::Initiate,
            Event::Hangup { .. } => EventKind::Hangup,
            Event::Answer(_) => EventKind::Answer,
            Event::Approve { .. } => EventKind::Approve,
            Event::Reject { .. } => EventKind::Reject,
            Event::ReceiveLocalMedia => EventKind::ReceiveLocalMedia,
            Event::ReceiveRemoteMedia => EventKind::ReceiveRemoteMedia,
            Event::SentOffer => EventKind::SentOffer,
            Event::ReceiveAnswer => EventKind::ReceiveAnswer,
            Event::Accept => EventKind::Accept,
            Event::Modify { .. } => EventKind::Modify,
        }
    }

    pub fn hangup(reason: impl Into<String>) -> Self {
        Event::Hangup {
            signal: None,
            reason: Some(reason.into()),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Event::Reject {
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Initiate,
    Hangup,
    Answer,
    Approve,
    Reject,
    ReceiveLocalMedia,
    ReceiveRemoteMedia,
    SentOffer,
    ReceiveAnswer,
    Accept,
    Modify,
}

impl EventKind {
    pub const fn name(self) -> &'static str {
        match self {
            EventKind::Initiate => "initiate",
            EventKind::Hangup => "hangup",
            EventKind::Answer => "answer",
            EventKind::Approve => "approve",
            EventKind::Reject => "reject",
            EventKind::ReceiveLocalMedia => "receiveLocalMedia",
            EventKind::ReceiveRemoteMedia => "receiveRemoteMedia",
            EventKind::SentOffer => "sentOffer",
            EventKind::ReceiveAnswer => "receiveAnswer",
            EventKind::Accept => "accept",
            EventKind::Modify => "modify",
        }
    }

    /// Events that routinely leave the state unchanged.
    ///
    /// Any other event that fails to move the machine is logged as suspect.
    pub const fn is_non_transition(self) -> bool {
        matches!(
            self,
            EventKind::ReceiveLocalMedia
                | EventKind::ReceiveRemoteMedia
                | EventKind::Approve
                | EventKind::Answer
                | EventKind::SentOffer
                | EventKind::ReceiveAnswer
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_needs_media() {
        let params = AnswerParams::default();
        assert!(params.needs_media());

        let receive_only = AnswerParams {
            receive_only: true,
            ..Default::default()
        };
        assert!(!receive_only.needs_media());

        let direct = AnswerParams {
            direct_connection_only: true,
            ..Default::default()
        };
        assert!(!direct.needs_media());
    }

    #[test]
    fn test_approver_invokes_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let approver = Approver::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        approver.clone().approve();
        approver.approve();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_non_transition_set() {
        assert!(EventKind::SentOffer.is_non_transition());
        assert!(EventKind::Answer.is_non_transition());
        assert!(!EventKind::Hangup.is_non_transition());
        assert!(!EventKind::Modify.is_non_transition());
        assert_eq!(Event::reject("x").kind(), EventKind::Reject);
    }
}
