use std::net::SocketAddr;

use crate::common::Id;

use super::Rpc;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddr,
    routing_table_size: usize,
    running_actions: usize,
    bootstrapped: bool,
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
    /// Lookups that did not finish yet.
    pub fn running_actions(&self) -> usize {
        self.running_actions
    }
    /// Returns `true` once the bootstrap lookup finished, whether or not it found any node.
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            routing_table_size: rpc.routing_table().size(),
            running_actions: rpc.running_actions(),
            bootstrapped: rpc.bootstrapped(),
        }
    }
}
