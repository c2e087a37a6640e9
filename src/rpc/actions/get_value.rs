use std::collections::HashSet;

use bytes::Bytes;
use flume::Sender;

use crate::common::{messages::GetValueResponse, Node, Request};

use super::{ActionState, Verb};

/// Fetch values for a key from a fixed list of nodes known to hold some.
///
/// New values are streamed in batches as responses arrive, never the same value twice.
/// An empty batch marks the end of the results.
#[derive(Debug)]
pub struct GetValue {
    sender: Sender<Vec<Bytes>>,
    seen: HashSet<Bytes>,
}

impl GetValue {
    /// `local` values are already known to the caller and count as results.
    pub fn new(sender: Sender<Vec<Bytes>>, local: Vec<Bytes>) -> Self {
        Self {
            sender,
            seen: local.into_iter().collect(),
        }
    }
}

impl Verb for GetValue {
    type Response = GetValueResponse;

    const RECURSIVE: bool = false;

    fn name(&self) -> &'static str {
        "get_value"
    }

    fn arguments(&self, node: &Node, state: &ActionState) -> Option<(Request, usize)> {
        if node.num_values == 0 {
            return None;
        }

        let num = match state.termination.budget() {
            // Asking for more than the node has means asking for everything.
            Some(budget) => Some(budget.saturating_sub(self.seen.len()))
                .filter(|num| *num <= node.num_values)
                .unwrap_or(0),
            None => 0,
        };

        Some((
            Request::GetValue {
                key: state.target,
                num,
            },
            node.num_values,
        ))
    }

    fn process_response(
        &mut self,
        _node: &Node,
        response: GetValueResponse,
        _state: &mut ActionState,
    ) {
        let fresh = response
            .values
            .into_iter()
            .filter(|value| self.seen.insert(value.clone()))
            .collect::<Vec<_>>();

        if !fresh.is_empty() {
            let _ = self.sender.send(fresh);
        }
    }

    fn result_count(&self) -> usize {
        self.seen.len()
    }

    fn finish(&mut self, _state: &mut ActionState) {
        let _ = self.sender.send(Vec::new());
    }
}
