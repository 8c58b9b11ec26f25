//! Connection lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of the single link owned by a supervisor.
///
/// ```text
/// Idle → Resolving → Connecting → Connected → Streaming
///                        ▲                        │
///                        └──── Degraded ◀─────────┘
///   any state ──────────────────────────────▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Idle,
    Resolving,
    Connecting,
    Connected,
    Streaming,
    Degraded,
    Closed,
}

impl LinkState {
    /// Returns true if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Resolving)
            | (Resolving, Connecting)
            | (Connecting, Connected)
            | (Connected, Streaming)
            | (Connected, Degraded)
            | (Streaming, Degraded)
            | (Degraded, Connecting) => true,
            _ => false,
        }
    }

    /// True once the link can never be used again.
    pub fn is_terminal(self) -> bool {
        self == LinkState::Closed
    }

    /// True while a transport handle is held.
    pub fn holds_transport(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Streaming)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Resolving => "resolving",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Streaming => "streaming",
            LinkState::Degraded => "degraded",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            LinkState::Idle,
            LinkState::Resolving,
            LinkState::Connecting,
            LinkState::Connected,
            LinkState::Streaming,
            LinkState::Degraded,
            LinkState::Connecting,
        ];
        for pair in path.windows(2) {
            if let [from, to] = pair {
                assert!(from.can_transition_to(*to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_every_live_state_can_close() {
        for state in [
            LinkState::Idle,
            LinkState::Resolving,
            LinkState::Connecting,
            LinkState::Connected,
            LinkState::Streaming,
            LinkState::Degraded,
        ] {
            assert!(state.can_transition_to(LinkState::Closed));
        }
    }

    #[test]
    fn test_closed_is_terminal() {
        assert!(LinkState::Closed.is_terminal());
        assert!(!LinkState::Closed.can_transition_to(LinkState::Connecting));
        assert!(!LinkState::Closed.can_transition_to(LinkState::Closed));
    }

    #[test]
    fn test_illegal_shortcuts() {
        assert!(!LinkState::Idle.can_transition_to(LinkState::Streaming));
        assert!(!LinkState::Degraded.can_transition_to(LinkState::Streaming));
        assert!(!LinkState::Streaming.can_transition_to(LinkState::Connecting));
    }

    #[test]
    fn test_holds_transport() {
        assert!(LinkState::Streaming.holds_transport());
        assert!(!LinkState::Degraded.holds_transport());
        assert!(!LinkState::Idle.holds_transport());
    }
}
