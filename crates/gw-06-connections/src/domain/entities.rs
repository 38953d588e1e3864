//! State shared by every protocol machine.

use shared_types::{ConnectionId, ConnectionRole, ConnectionState};

/// Identity and lifecycle of one peer connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: ConnectionRole,
    pub state: ConnectionState,
    /// Peer description for logs (address or node id).
    pub peer: String,
}

impl ConnectionInfo {
    /// Creates connection info in the `Connecting` state.
    pub fn new(id: ConnectionId, role: ConnectionRole, peer: impl Into<String>) -> Self {
        Self {
            id,
            role,
            state: ConnectionState::Connecting,
            peer: peer.into(),
        }
    }

    /// True once the handshake completed.
    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }
}
