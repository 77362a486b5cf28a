//! Struct and implementation of the Node entry in the Kademlia routing table
use std::{
    fmt::{self, Display, Formatter},
    net::SocketAddr,
};

use crate::common::Id;

#[derive(Debug, Clone)]
/// Node entry in Kademlia routing table.
///
/// Two nodes are the same node if they have the same [Id], regardless of address.
pub struct Node {
    pub id: Id,
    pub address: SocketAddr,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Node {
        Node { id, address }
    }

    #[cfg(test)]
    pub fn random() -> Node {
        Node {
            id: Id::random(),
            address: SocketAddr::from(([127, 0, 0, 1], rand::random::<u16>().max(1))),
        }
    }

    #[cfg(test)]
    pub fn with_id(id: Id) -> Node {
        Node {
            id,
            address: SocketAddr::from(([127, 0, 0, 1], rand::random::<u16>().max(1))),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// XOR distance between this node and a target [Id].
    pub fn distance_to(&self, target: &Id) -> Id {
        self.id.xor(target)
    }

    /// Returns true if both nodes live on the same ip and port.
    pub fn same_home_as(&self, address: &SocketAddr) -> bool {
        self.address == *address
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}
