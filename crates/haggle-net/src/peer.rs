//! Transport-level peer identity, distinct from a `haggle_core::Node`'s
//! content-addressed id: this identifies an endpoint of a connection, not
//! the logical node that may be reachable over several such endpoints.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Opaque transport peer identifier (e.g. a hash of the remote address and
/// interface the connection came in on).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// What this daemon knows about a transport-level peer before or alongside
/// an active connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: Option<SocketAddr>,
    /// Local interface identifier this peer was last seen on
    /// (`haggle_core::Interface::identifier`).
    pub interface_identifier: String,
    pub last_seen: u64,
}

impl PeerInfo {
    pub fn new(id: PeerId, interface_identifier: impl Into<String>) -> Self {
        Self {
            id,
            addr: None,
            interface_identifier: interface_identifier.into(),
            last_seen: 0,
        }
    }

    pub fn touch(&mut self, now_unix_secs: u64) {
        self.last_seen = now_unix_secs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_shows_short_hex() {
        let id = PeerId::from_bytes([0xabu8; 32]);
        assert_eq!(format!("{id}").len(), 16);
    }
}
