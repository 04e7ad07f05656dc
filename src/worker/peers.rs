//! Peer table entries and the connection state machine.

use crate::rays::{TreeletId, WorkerId};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Connection state of a peer. A peer never transitions back from
/// `Connected` to `Connecting`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
}

/// A worker in the routing table, reached over UDP.
#[derive(Debug)]
pub struct Peer {
    /// The peer's worker id; 0 is the coordinator.
    pub id: WorkerId,

    /// The peer's UDP address.
    pub address: SocketAddr,

    /// The peer's session nonce, learned from its `ConnectionResponse`.
    pub seed: u64,

    /// Handshake attempts so far.
    pub tries: u32,

    /// Connection state.
    pub state: PeerState,

    /// Treelets the peer holds.
    pub treelets: HashSet<TreeletId>,
}

impl Peer {
    /// Create a peer in the `Connecting` state.
    ///
    /// * `id`      - The peer's worker id.
    /// * `address` - The peer's UDP address.
    pub fn new(id: WorkerId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            seed: 0,
            tries: 0,
            state: PeerState::Connecting,
            treelets: HashSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_peers_start_connecting_with_no_treelets() {
        let peer = Peer::new(3, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(peer.state, PeerState::Connecting);
        assert_eq!(peer.tries, 0);
        assert!(peer.treelets.is_empty());
    }
}
