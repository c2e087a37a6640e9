use bytes::Bytes;
use flume::Sender;

use crate::common::{messages::StoreValueResponse, Node, Request};

use super::{ActionState, Verb};

/// Store a value at nodes that previously handed us a token for the key.
///
/// The result is the list of nodes that acknowledged the store.
#[derive(Debug)]
pub struct StoreValue {
    value: Bytes,
    sender: Sender<Vec<Node>>,
    acked: Vec<Node>,
}

impl StoreValue {
    pub fn new(value: Bytes, sender: Sender<Vec<Node>>) -> Self {
        Self {
            value,
            sender,
            acked: Vec::new(),
        }
    }
}

impl Verb for StoreValue {
    type Response = StoreValueResponse;

    const RECURSIVE: bool = false;

    fn name(&self) -> &'static str {
        "store_value"
    }

    fn arguments(&self, node: &Node, state: &ActionState) -> Option<(Request, usize)> {
        let token = node.token.clone()?;

        Some((
            Request::StoreValue {
                key: state.target,
                value: self.value.clone(),
                token,
            },
            1,
        ))
    }

    fn process_response(
        &mut self,
        node: &Node,
        _response: StoreValueResponse,
        _state: &mut ActionState,
    ) {
        self.acked.push(node.clone());
    }

    fn result_count(&self) -> usize {
        self.acked.len()
    }

    fn finish(&mut self, _state: &mut ActionState) {
        let _ = self.sender.send(std::mem::take(&mut self.acked));
    }
}
