//! Simplified Kademlia routing table

use std::collections::BTreeMap;

use crate::common::{Id, Node};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 8;

/// Consecutive failures after which a node is dropped from its bucket.
pub const MAX_FAILURES: u8 = 3;

/// What the RPC layer and running actions need from a routing table.
pub trait Routing {
    /// The [Id] of this node, where the distance is measured from.
    fn id(&self) -> &Id;

    /// Learn about a node that answered us or asked us something.
    /// Returns `true` if the node is now in the table.
    fn insert_node(&mut self, node: Node) -> bool;

    /// A request to this node failed.
    fn node_failed(&mut self, node: &Node);

    /// Up to `count` known nodes, closest to `target` first.
    fn closest(&self, target: &Id, count: usize) -> Vec<Node>;
}

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        Self::with_bucket_size(id, MAX_BUCKET_SIZE_K)
    }

    pub fn with_bucket_size(id: Id, k: usize) -> Self {
        RoutingTable {
            id,
            k,
            buckets: BTreeMap::new(),
        }
    }

    // === Public Methods ===

    /// Attempts to add a node to this routing table, and return `true` if it did.
    pub fn add(&mut self, node: Node) -> bool {
        let distance = self.id.distance(&node.id);

        if distance == 0 {
            // Do not add self to the routing_table
            return false;
        }

        self.buckets.entry(distance).or_default().add(node, self.k)
    }

    /// Remove a node from this routing table.
    pub fn remove(&mut self, node_id: &Id) {
        let distance = self.id.distance(node_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(node_id)
        }
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.values().map(KBucket::len).sum()
    }

    /// Returns an iterator over the nodes in this routing table, nearest bucket first.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.entries.iter().map(|entry| &entry.node))
    }

    /// Export an owned vector of nodes from this routing table.
    pub fn to_owned_nodes(&self) -> Vec<Node> {
        self.nodes().cloned().collect()
    }

    pub fn contains(&self, node_id: &Id) -> bool {
        let distance = self.id.distance(node_id);

        self.buckets
            .get(&distance)
            .map(|bucket| bucket.position(node_id).is_some())
            .unwrap_or(false)
    }
}

impl Routing for RoutingTable {
    fn id(&self) -> &Id {
        &self.id
    }

    fn insert_node(&mut self, node: Node) -> bool {
        self.add(node)
    }

    fn node_failed(&mut self, node: &Node) {
        let distance = self.id.distance(&node.id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.failed(node);
        }
    }

    fn closest(&self, target: &Id, count: usize) -> Vec<Node> {
        let mut nodes = self.to_owned_nodes();

        nodes.sort_by(|a, b| Id::cmp_distance(target, &a.id, &b.id));
        nodes.truncate(count);

        nodes
    }
}

#[derive(Debug, Clone)]
struct Entry {
    node: Node,
    failures: u8,
}

/// Kbuckets are similar to LRU caches that evict failing nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    /// Nodes in the k-bucket, sorted by the least recently seen.
    entries: Vec<Entry>,
}

impl KBucket {
    /// Add or refresh a node, returns `true` if the node is in the bucket afterwards.
    pub fn add(&mut self, incoming: Node, k: usize) -> bool {
        // Tokens and value counts belong to a single lookup.
        let entry = Entry {
            node: Node::new(incoming.id, incoming.address),
            failures: 0,
        };

        if let Some(index) = self.position(&incoming.id) {
            // Seen again, possibly on a new port, move it to the end.
            self.entries.remove(index);
            self.entries.push(entry);

            true
        } else if self.entries.len() < k {
            self.entries.push(entry);
            true
        } else if let Some(index) = self.entries.iter().position(|e| e.failures > 0) {
            // Replace the least recently seen failing node
            self.entries.remove(index);
            self.entries.push(entry);

            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, node_id: &Id) {
        self.entries.retain(|entry| entry.node.id != *node_id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn failed(&mut self, node: &Node) {
        if let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.node.same_contact(node))
        {
            let entry = &mut self.entries[index];
            entry.failures = entry.failures.saturating_add(1);

            if entry.failures >= MAX_FAILURES {
                self.entries.remove(index);
            }
        }
    }

    fn position(&self, id: &Id) -> Option<usize> {
        self.entries.iter().position(|entry| entry.node.id == *id)
    }
}
