//! Scripted network and routing table for action tests.

use std::collections::HashMap;
use std::net::SocketAddr;

use flume::Sender;
use serde::Serialize;

use crate::common::{messages::Dict, Id, Node, Request, Routing};
use crate::rpc::proxy::PendingCall;
use crate::rpc::transactions::{Reply, Response, RpcError};

use super::Network;

/// Records requests, replies are sent by the test.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    pub requests: Vec<(Node, Request)>,
    pending: HashMap<Id, (SocketAddr, Sender<Reply>)>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queried(&self, id: &Id) -> bool {
        self.requests.iter().any(|(node, _)| node.id == *id)
    }

    pub fn request_to(&self, id: &Id) -> Option<&Request> {
        self.requests
            .iter()
            .find(|(node, _)| node.id == *id)
            .map(|(_, request)| request)
    }

    /// Ids with a request waiting for a reply.
    pub fn waiting(&self) -> Vec<Id> {
        let mut waiting = self.pending.keys().copied().collect::<Vec<_>>();
        waiting.sort();
        waiting
    }

    pub fn respond<T: Serialize>(&mut self, id: &Id, payload: &T) {
        let (from, sender) = self.pending.remove(id).expect("no request to this node");

        sender
            .send(Ok(Response {
                from,
                payload: Dict::from_serializable(payload).unwrap(),
            }))
            .unwrap();
    }

    pub fn fail(&mut self, id: &Id, error: RpcError) {
        let (_, sender) = self.pending.remove(id).expect("no request to this node");

        sender.send(Err(error)).unwrap();
    }
}

impl Network for FakeNetwork {
    fn request(&mut self, node: &Node, request: Request) -> PendingCall {
        let (sender, receiver) = flume::bounded(1);

        self.requests.push((node.clone(), request));
        self.pending.insert(node.id, (node.address, sender));

        PendingCall::new(receiver, Some(node.id))
    }
}

#[derive(Debug)]
pub struct FakeRouting {
    pub id: Id,
    pub inserted: Vec<Id>,
    pub failed: Vec<Id>,
}

impl FakeRouting {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            inserted: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl Routing for FakeRouting {
    fn id(&self) -> &Id {
        &self.id
    }

    fn insert_node(&mut self, node: Node) -> bool {
        self.inserted.push(node.id);
        true
    }

    fn node_failed(&mut self, node: &Node) {
        self.failed.push(node.id);
    }

    fn closest(&self, _target: &Id, _count: usize) -> Vec<Node> {
        Vec::new()
    }
}

/// A node whose id starts with `first_byte` and is otherwise zero.
pub fn node(first_byte: u8) -> Node {
    let mut id = [0; 20];
    id[0] = first_byte;

    Node::new(
        Id::from(id),
        SocketAddr::from(([127, 0, 0, 1], 1000 + first_byte as u16)),
    )
}

/// An id starting with `first_byte`, otherwise zero.
pub fn id(first_byte: u8) -> Id {
    node(first_byte).id
}
