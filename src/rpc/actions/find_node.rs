use flume::Sender;

use crate::common::{messages::FindNodeResponse, Node, Request};

use super::{ActionState, Verb};

/// Iteratively find the K closest nodes to the target.
///
/// Tokens handed out by responders are kept on the returned nodes, ready for a store.
#[derive(Debug)]
pub struct FindNode {
    sender: Sender<Vec<Node>>,
}

impl FindNode {
    pub fn new(sender: Sender<Vec<Node>>) -> Self {
        Self { sender }
    }
}

impl Verb for FindNode {
    type Response = FindNodeResponse;

    const RECURSIVE: bool = true;

    fn name(&self) -> &'static str {
        "find_node"
    }

    fn arguments(&self, _node: &Node, state: &ActionState) -> Option<(Request, usize)> {
        Some((
            Request::FindNode {
                target: state.target,
            },
            0,
        ))
    }

    fn process_response(
        &mut self,
        _node: &Node,
        response: FindNodeResponse,
        state: &mut ActionState,
    ) {
        if let Some(responder) = state.candidates.get_mut(&response.id) {
            responder.update_token(response.token);
        }

        for node in response.nodes {
            state.discover(node);
        }
    }

    fn result_count(&self) -> usize {
        0
    }

    fn finish(&mut self, state: &mut ActionState) {
        let _ = self.sender.send(state.candidates.closest(Some(state.k)));
    }
}
