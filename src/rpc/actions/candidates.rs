//! Nodes discovered by an action, with their order by distance to the target.

use std::collections::HashMap;

use crate::common::{Id, Node};

/// Append only set of found nodes.
///
/// The distance order is recomputed only when the number of found nodes
/// changed since the last sort, which is sound because nodes are never removed.
#[derive(Debug, Clone)]
pub struct Candidates {
    target: Id,
    /// Insertion order.
    found: Vec<Node>,
    index: HashMap<Id, usize>,
    /// Indices into `found`, closest first.
    sorted: Vec<usize>,
    /// `found.len()` when `sorted` was computed.
    sorted_len: usize,
    resorts: usize,
}

impl Candidates {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            found: Vec::new(),
            index: HashMap::new(),
            sorted: Vec::new(),
            sorted_len: 0,
            resorts: 0,
        }
    }

    /// Add a node unless its id was already found, returns `true` if it was added.
    pub fn insert(&mut self, node: Node) -> bool {
        if self.index.contains_key(&node.id) {
            return false;
        }

        self.index.insert(node.id, self.found.len());
        self.found.push(node);

        true
    }

    pub fn get(&self, id: &Id) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.found[i])
    }

    /// Mutable access to update a node's token or value count.
    pub fn get_mut(&mut self, id: &Id) -> Option<&mut Node> {
        self.index.get(id).map(|&i| &mut self.found[i])
    }

    pub fn len(&self) -> usize {
        self.found.len()
    }

    pub fn is_empty(&self) -> bool {
        self.found.is_empty()
    }

    /// The `count` closest nodes, or all of them.
    pub fn closest(&mut self, count: Option<usize>) -> Vec<Node> {
        self.sort();

        let count = count.unwrap_or(self.sorted.len()).min(self.sorted.len());

        self.sorted[..count]
            .iter()
            .map(|&i| self.found[i].clone())
            .collect()
    }

    /// How many times the order was actually recomputed.
    pub fn resorts(&self) -> usize {
        self.resorts
    }

    fn sort(&mut self) {
        if self.sorted_len == self.found.len() {
            return;
        }

        let target = self.target;
        let found = &self.found;

        let mut sorted = (0..found.len()).collect::<Vec<_>>();
        sorted.sort_by(|&a, &b| Id::cmp_distance(&target, &found[a].id, &found[b].id));

        self.sorted = sorted;
        self.sorted_len = self.found.len();
        self.resorts += 1;
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;

    fn node(first_byte: u8) -> Node {
        let mut id = [0; 20];
        id[0] = first_byte;

        Node::new(Id::from(id), SocketAddr::from(([127, 0, 0, 1], first_byte as u16)))
    }

    #[test]
    fn sorted_by_distance() {
        let mut candidates = Candidates::new(Id::from([0; 20]));

        for i in [9, 3, 200, 1, 64] {
            candidates.insert(node(i));
        }

        let order = candidates
            .closest(None)
            .iter()
            .map(|n| n.id.as_bytes()[0])
            .collect::<Vec<_>>();

        assert_eq!(order, vec![1, 3, 9, 64, 200]);
        assert_eq!(candidates.closest(Some(2)).len(), 2);
    }

    #[test]
    fn resort_only_when_grown() {
        let mut candidates = Candidates::new(Id::random());

        candidates.insert(node(1));
        candidates.insert(node(2));

        candidates.closest(None);
        candidates.closest(Some(1));
        assert_eq!(candidates.resorts(), 1);

        // Duplicates do not grow the set.
        assert!(!candidates.insert(node(2)));
        candidates.closest(None);
        assert_eq!(candidates.resorts(), 1);

        candidates.insert(node(3));
        candidates.closest(None);
        assert_eq!(candidates.resorts(), 2);
    }

    #[test]
    fn updates_in_place() {
        let mut candidates = Candidates::new(Id::random());
        let n = node(1);

        candidates.insert(n.clone());
        candidates.get_mut(&n.id).unwrap().update_num_values(3);

        assert_eq!(candidates.get(&n.id).unwrap().num_values, 3);
        assert_eq!(candidates.closest(None)[0].num_values, 3);
    }
}
