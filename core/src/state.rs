//! Connection lifecycle states and the transition table.
//!
//! `next_state` is the only place a state change is decided. The manager
//! feeds it a [`Trigger`] and applies whatever it returns; anything the
//! table does not list is refused.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the managed link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    DiscoveringServices,
    Subscribing,
    Ready,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 6] = [
        ConnectionState::Disconnected,
        ConnectionState::Scanning,
        ConnectionState::Connecting,
        ConnectionState::DiscoveringServices,
        ConnectionState::Subscribing,
        ConnectionState::Ready,
    ];

    /// States in which a radio link is open
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            ConnectionState::DiscoveringServices | ConnectionState::Subscribing | ConnectionState::Ready
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Scanning => "Scanning",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::DiscoveringServices => "DiscoveringServices",
            ConnectionState::Subscribing => "Subscribing",
            ConnectionState::Ready => "Ready",
        };
        f.write_str(name)
    }
}

/// Events that can move the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    StartAuthorized,
    StartDenied,
    ScanMatched,
    ScanEnded,
    LinkOpened,
    LinkFailed,
    ServicesResolved,
    ServicesMissing,
    DiscoveryFailed,
    NotifyEnabled,
    NotifyFailed,
    OperationIssued,
    LinkDropped,
    Stopped,
}

/// One row of the transition table; `from: None` matches any state
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: Option<ConnectionState>,
    pub trigger: Trigger,
    pub to: ConnectionState,
}

const fn row(from: ConnectionState, trigger: Trigger, to: ConnectionState) -> Transition {
    Transition {
        from: Some(from),
        trigger,
        to,
    }
}

const fn any(trigger: Trigger, to: ConnectionState) -> Transition {
    Transition {
        from: None,
        trigger,
        to,
    }
}

use ConnectionState::*;

pub static TRANSITIONS: &[Transition] = &[
    row(Disconnected, Trigger::StartAuthorized, Scanning),
    row(Disconnected, Trigger::StartDenied, Disconnected),
    row(Scanning, Trigger::ScanMatched, Connecting),
    row(Scanning, Trigger::ScanEnded, Disconnected),
    row(Connecting, Trigger::LinkOpened, DiscoveringServices),
    row(Connecting, Trigger::LinkFailed, Disconnected),
    row(DiscoveringServices, Trigger::ServicesResolved, Subscribing),
    row(DiscoveringServices, Trigger::ServicesMissing, Disconnected),
    row(DiscoveringServices, Trigger::DiscoveryFailed, Disconnected),
    row(Subscribing, Trigger::NotifyEnabled, Ready),
    // Degraded: reads and writes stay available without notifications
    row(Subscribing, Trigger::NotifyFailed, Ready),
    row(Ready, Trigger::OperationIssued, Ready),
    any(Trigger::LinkDropped, Disconnected),
    any(Trigger::Stopped, Disconnected),
];

/// Look up the state reached from `from` on `trigger`
pub fn next_state(from: ConnectionState, trigger: Trigger) -> Option<ConnectionState> {
    TRANSITIONS
        .iter()
        .find(|t| t.trigger == trigger && t.from.map_or(true, |f| f == from))
        .map(|t| t.to)
}

/// Whether the table contains any row taking `from` to `to`
pub fn is_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    TRANSITIONS
        .iter()
        .any(|t| t.to == to && t.from.map_or(true, |f| f == from))
}

/// A state change as observed by subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = Disconnected;
        for trigger in [
            Trigger::StartAuthorized,
            Trigger::ScanMatched,
            Trigger::LinkOpened,
            Trigger::ServicesResolved,
            Trigger::NotifyEnabled,
        ] {
            state = next_state(state, trigger).expect("happy path row");
        }
        assert_eq!(state, Ready);
        assert_eq!(next_state(state, Trigger::OperationIssued), Some(Ready));
    }

    #[test]
    fn test_degraded_subscription_still_ready() {
        assert_eq!(next_state(Subscribing, Trigger::NotifyFailed), Some(Ready));
    }

    #[test]
    fn test_link_drop_and_stop_from_any_state() {
        for state in ConnectionState::ALL {
            assert_eq!(next_state(state, Trigger::LinkDropped), Some(Disconnected));
            assert_eq!(next_state(state, Trigger::Stopped), Some(Disconnected));
        }
    }

    #[test]
    fn test_rejects_rows_not_in_table() {
        assert_eq!(next_state(Disconnected, Trigger::ScanMatched), None);
        assert_eq!(next_state(Scanning, Trigger::LinkOpened), None);
        assert_eq!(next_state(Connecting, Trigger::OperationIssued), None);
        assert_eq!(next_state(Ready, Trigger::StartAuthorized), None);
    }

    #[test]
    fn test_is_allowed() {
        assert!(is_allowed(Ready, Disconnected));
        assert!(is_allowed(Subscribing, Ready));
        assert!(!is_allowed(Disconnected, Ready));
        assert!(!is_allowed(Scanning, DiscoveringServices));
        assert!(!is_allowed(Ready, Scanning));
    }
}
