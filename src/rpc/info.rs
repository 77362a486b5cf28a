use std::net::SocketAddr;

use crate::Id;

use super::Rpc;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddr,
    routing_table_size: usize,
    stored_values: usize,
    ongoing_operations: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// Number of nodes in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Number of values in local storage, including expired ones
    /// that weren't dropped yet.
    pub fn stored_values(&self) -> usize {
        self.stored_values
    }
    /// Number of lookups and stores in progress.
    pub fn ongoing_operations(&self) -> usize {
        self.ongoing_operations
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            routing_table_size: rpc.routing_table().size(),
            stored_values: rpc.storage().len(),
            ongoing_operations: rpc.operations_count(),
        }
    }
}
