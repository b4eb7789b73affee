//! Negotiation states, their hierarchy, and lifecycle notifications.

use serde::Serialize;
use std::fmt;

use super::types::Role;

/// A state of the negotiation machine.
///
/// `Negotiating` and `GettingMedia` are superstates: the machine never rests
/// in them, but events unhandled by their children bubble up to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StateId {
    Idle,
    Negotiating,
    Preparing,
    GettingMedia,
    ApprovingDeviceAccess,
    ApprovingContent,
    Offering,
    Connecting,
    Modifying,
    Connected,
    Terminated,
}

impl StateId {
    pub const ALL: [StateId; 11] = [
        StateId::Idle,
        StateId::Negotiating,
        StateId::Preparing,
        StateId::GettingMedia,
        StateId::ApprovingDeviceAccess,
        StateId::ApprovingContent,
        StateId::Offering,
        StateId::Connecting,
        StateId::Modifying,
        StateId::Connected,
        StateId::Terminated,
    ];

    /// The enclosing superstate, if any.
    pub const fn parent(self) -> Option<StateId> {
        match self {
            StateId::Preparing
            | StateId::GettingMedia
            | StateId::Offering
            | StateId::Connecting => Some(StateId::Negotiating),
            StateId::ApprovingDeviceAccess | StateId::ApprovingContent => {
                Some(StateId::GettingMedia)
            }
            StateId::Idle
            | StateId::Negotiating
            | StateId::Modifying
            | StateId::Connected
            | StateId::Terminated => None,
        }
    }

    pub const fn is_leaf(self) -> bool {
        !matches!(self, StateId::Negotiating | StateId::GettingMedia)
    }

    pub const fn is_final(self) -> bool {
        matches!(self, StateId::Terminated)
    }

    /// Number of superstates above this one.
    pub fn depth(self) -> usize {
        self.ancestors().count() - 1
    }

    /// This state followed by each enclosing superstate, innermost first.
    pub fn ancestors(self) -> impl Iterator<Item = StateId> {
        std::iter::successors(Some(self), |state| state.parent())
    }

    pub fn is_within(self, other: StateId) -> bool {
        self.ancestors().any(|state| state == other)
    }

    /// Innermost state enclosing both `self` and `other`, if they share one.
    pub fn common_ancestor(self, other: StateId) -> Option<StateId> {
        self.ancestors().find(|state| other.is_within(*state))
    }

    /// Name used by [`is_state`](super::machine::CallStateMachine::is_state).
    pub const fn name(self) -> &'static str {
        match self {
            StateId::Idle => "idle",
            StateId::Negotiating => "negotiating",
            StateId::Preparing => "preparing",
            StateId::GettingMedia => "gettingMedia",
            StateId::ApprovingDeviceAccess => "approvingDeviceAccess",
            StateId::ApprovingContent => "approvingContent",
            StateId::Offering => "offering",
            StateId::Connecting => "connecting",
            StateId::Modifying => "modifying",
            StateId::Connected => "connected",
            StateId::Terminated => "terminated",
        }
    }

    /// Kebab-case form used in lifecycle notification names.
    pub const fn notification_name(self) -> &'static str {
        match self {
            StateId::Idle => "idle",
            StateId::Negotiating => "negotiating",
            StateId::Preparing => "preparing",
            StateId::GettingMedia => "getting-media",
            StateId::ApprovingDeviceAccess => "approving-device-access",
            StateId::ApprovingContent => "approving-content",
            StateId::Offering => "offering",
            StateId::Connecting => "connecting",
            StateId::Modifying => "modifying",
            StateId::Connected => "connected",
            StateId::Terminated => "terminated",
        }
    }

    pub fn from_name(name: &str) -> Option<StateId> {
        Self::ALL.into_iter().find(|state| state.name() == name)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Entry,
    Exit,
}

impl Phase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::Entry => "entry",
            Phase::Exit => "exit",
        }
    }
}

/// Emitted whenever a leaf state is entered or exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Lifecycle {
    pub state: StateId,
    pub phase: Phase,
}

impl Lifecycle {
    pub const fn entry(state: StateId) -> Self {
        Self {
            state,
            phase: Phase::Entry,
        }
    }

    pub const fn exit(state: StateId) -> Self {
        Self {
            state,
            phase: Phase::Exit,
        }
    }

    /// Notification name, e.g. `approving-device-access:entry`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.state.notification_name(), self.phase.as_str())
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.state.notification_name(),
            self.phase.as_str()
        )
    }
}

/// Media and approval bookkeeping carried by the state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaFlags {
    pub has_local_media_approval: bool,
    pub has_local_media: bool,
    pub has_remote_media: bool,
    /// Survives renegotiation, unlike the three flags above.
    pub is_media_flowing: bool,
    pub received_bye: bool,
}

impl MediaFlags {
    /// Clear the per-negotiation flags when a new exchange starts.
    pub fn reset_for_negotiation(&mut self) {
        self.has_local_media_approval = false;
        self.has_local_media = false;
        self.has_remote_media = false;
    }
}

/// Read-only view handed to transition guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub state: StateId,
    pub role: Role,
    pub flags: MediaFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_parents() {
        assert_eq!(StateId::Preparing.parent(), Some(StateId::Negotiating));
        assert_eq!(
            StateId::ApprovingContent.parent(),
            Some(StateId::GettingMedia)
        );
        assert_eq!(StateId::GettingMedia.parent(), Some(StateId::Negotiating));
        assert_eq!(StateId::Connected.parent(), None);
        assert_eq!(StateId::Modifying.parent(), None);
        assert_eq!(StateId::ApprovingDeviceAccess.depth(), 2);
        assert_eq!(StateId::Idle.depth(), 0);
    }

    #[test]
    fn test_ancestors_are_innermost_first() {
        let chain: Vec<_> = StateId::ApprovingDeviceAccess.ancestors().collect();
        assert_eq!(
            chain,
            vec![
                StateId::ApprovingDeviceAccess,
                StateId::GettingMedia,
                StateId::Negotiating
            ]
        );
    }

    /// Sibling leaves meet at their shared superstate, unrelated states at nothing.
    #[test]
    fn test_common_ancestor() {
        assert_eq!(
            StateId::ApprovingDeviceAccess.common_ancestor(StateId::ApprovingContent),
            Some(StateId::GettingMedia)
        );
        assert_eq!(
            StateId::ApprovingContent.common_ancestor(StateId::Offering),
            Some(StateId::Negotiating)
        );
        assert_eq!(
            StateId::Connected.common_ancestor(StateId::Preparing),
            None
        );
        assert_eq!(
            StateId::Modifying.common_ancestor(StateId::Preparing),
            None
        );
    }

    #[test]
    fn test_lifecycle_names() {
        assert_eq!(
            Lifecycle::entry(StateId::ApprovingDeviceAccess).name(),
            "approving-device-access:entry"
        );
        assert_eq!(Lifecycle::exit(StateId::Preparing).name(), "preparing:exit");
        assert_eq!(
            Lifecycle::entry(StateId::Terminated).to_string(),
            "terminated:entry"
        );
    }

    #[test]
    fn test_state_names_round_trip_through_lookup() {
        for state in StateId::ALL {
            assert_eq!(StateId::from_name(state.name()), Some(state));
        }
        assert_eq!(StateId::from_name("getting-media"), None);
    }

    #[test]
    fn test_reset_keeps_media_flowing() {
        let mut flags = MediaFlags {
            has_local_media_approval: true,
            has_local_media: true,
            has_remote_media: true,
            is_media_flowing: true,
            received_bye: false,
        };
        flags.reset_for_negotiation();
        assert!(!flags.has_local_media_approval);
        assert!(!flags.has_local_media);
        assert!(!flags.has_remote_media);
        assert!(flags.is_media_flowing);
    }
}
