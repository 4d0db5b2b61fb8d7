//! Core types for pushwire.
//!
//! This crate provides the protocol primitives shared by clients, servers and
//! transports: the negotiated version, the handshake response, the frame
//! envelopes, and the connection lifecycle state.

mod message;
mod version;

pub use message::{ClientFrame, NegotiationResponse, ServerFrame};
pub use version::{ProtocolVersion, VersionParseError};

use std::fmt;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected (initial and terminal).
    #[default]
    Disconnected,
    /// Negotiating and starting the transport.
    Connecting,
    /// Normal operation.
    Connected,
    /// Connection lost, transport is trying to recover.
    Reconnecting,
}

impl ConnectionState {
    /// Whether a transition from `self` to `next` is part of the lifecycle.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Connecting | Connected | Reconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// A completed state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn lifecycle_transitions() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        for s in [Connecting, Connected, Reconnecting] {
            assert!(s.can_transition_to(Disconnected));
        }
    }

    #[test]
    fn illegal_transitions() {
        assert!(!Disconnected.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Reconnecting));
        assert!(!Connecting.can_transition_to(Reconnecting));
        assert!(!Reconnecting.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Connecting));
    }

    #[test]
    fn default_is_disconnected() {
        assert_eq!(ConnectionState::default(), Disconnected);
        assert_eq!(Reconnecting.to_string(), "reconnecting");
    }
}
