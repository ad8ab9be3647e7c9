use tokio::time::Instant;
use tracing::{debug, warn};

/// Lifecycle of one connection's socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live socket
    NotConnected,
    /// Outbound connect in progress
    Connecting { started_at: Instant },
    /// Socket is live
    Connected { since: Instant },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::NotConnected)
    }
}

/// Guards the legal transitions of a single connection
#[derive(Debug)]
pub struct ConnectionStateMachine {
    label: String,
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: ConnectionState::NotConnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Try to transition from current state to new state
    /// Returns true if transition succeeded, false if it was invalid
    pub fn try_transition(&mut self, new_state: ConnectionState) -> bool {
        let current = self.state;

        let valid = match (current, new_state) {
            (ConnectionState::NotConnected, ConnectionState::Connecting { .. }) => true,
            (ConnectionState::Connecting { .. }, ConnectionState::Connected { .. }) => true,
            // Accepted sockets are live from the start
            (ConnectionState::NotConnected, ConnectionState::Connected { .. }) => true,
            // Teardown is always allowed
            (_, ConnectionState::NotConnected) => true,
            _ => false,
        };

        if valid {
            self.state = new_state;
            debug!(
                "✅ State transition for {}: {:?} -> {:?}",
                self.label, current, new_state
            );
        } else {
            warn!(
                "❌ Invalid state transition for {}: {:?} -> {:?}",
                self.label, current, new_state
            );
        }
        valid
    }

    pub fn mark_connecting(&mut self) -> bool {
        self.try_transition(ConnectionState::Connecting {
            started_at: Instant::now(),
        })
    }

    pub fn mark_connected(&mut self) -> bool {
        self.try_transition(ConnectionState::Connected {
            since: Instant::now(),
        })
    }

    pub fn mark_disconnected(&mut self) -> bool {
        self.try_transition(ConnectionState::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_transitions() {
        let mut machine = ConnectionStateMachine::new("peer1");
        assert!(machine.mark_connecting());
        assert!(machine.state().is_connecting());
        assert!(machine.mark_connected());
        assert!(machine.state().is_connected());
        assert!(machine.mark_disconnected());
        assert!(machine.state().is_disconnected());
    }

    #[test]
    fn test_accepted_socket_starts_connected() {
        let mut machine = ConnectionStateMachine::new("peer2");
        assert!(machine.mark_connected());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut machine = ConnectionStateMachine::new("peer3");
        assert!(machine.mark_connected());
        // Connected -> Connecting is not allowed
        assert!(!machine.mark_connecting());
        assert!(machine.state().is_connected());
        // Can't connect twice
        assert!(!machine.mark_connected());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut machine = ConnectionStateMachine::new("peer4");
        assert!(machine.mark_disconnected());
        assert!(machine.mark_disconnected());
        assert!(machine.mark_connecting());
        assert!(machine.mark_disconnected());
    }
}
