use flume::Sender;

use crate::common::{messages::FindValueResponse, Node, Request};

use super::{ActionState, Verb};

/// Iteratively find the nodes closest to a key that hold values for it.
///
/// Each returned node carries the number of values it announced and its token.
#[derive(Debug)]
pub struct FindValue {
    sender: Sender<Vec<Node>>,
}

impl FindValue {
    pub fn new(sender: Sender<Vec<Node>>) -> Self {
        Self { sender }
    }
}

impl Verb for FindValue {
    type Response = FindValueResponse;

    const RECURSIVE: bool = true;

    fn name(&self) -> &'static str {
        "find_value"
    }

    fn arguments(&self, _node: &Node, state: &ActionState) -> Option<(Request, usize)> {
        Some((Request::FindValue { key: state.target }, 0))
    }

    fn process_response(
        &mut self,
        _node: &Node,
        response: FindValueResponse,
        state: &mut ActionState,
    ) {
        if let Some(responder) = state.candidates.get_mut(&response.id) {
            responder.update_num_values(response.num);
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
        let holders = state
            .candidates
            .closest(None)
            .into_iter()
            .filter(|node| node.num_values > 0)
            .collect();

        let _ = self.sender.send(holders);
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use crate::rpc::actions::test_network::{id, node, FakeNetwork, FakeRouting};
    use crate::rpc::actions::{Action, Termination};

    use super::*;

    fn response(from: &Node, nodes: Vec<Node>, num: usize) -> FindValueResponse {
        FindValueResponse {
            id: from.id,
            nodes,
            token: Bytes::from_static(b"token"),
            num,
        }
    }

    #[test]
    fn holders_sorted_by_distance() {
        let (sender, results) = flume::unbounded();
        let mut network = FakeNetwork::new();
        let mut routing = FakeRouting::new(id(0xff));

        let mut action = Action::new(
            FindValue::new(sender),
            ActionState::new(id(0), routing.id, Termination::Exhaustive, 8, 4),
        );

        action.go_with_nodes(vec![node(0x20), node(0x10)], &mut network);

        network.respond(&id(0x10), &response(&node(0x10), vec![node(0x01)], 0));
        network.respond(&id(0x20), &response(&node(0x20), vec![], 2));
        action.tick(&mut network, &mut routing);

        assert_eq!(
            network.request_to(&id(0x01)),
            Some(&Request::FindValue { key: id(0) })
        );

        network.respond(&id(0x01), &response(&node(0x01), vec![], 5));
        action.tick(&mut network, &mut routing);

        assert!(action.is_done());

        let holders = results.try_recv().unwrap();
        let summary = holders
            .iter()
            .map(|n| (n.id.as_bytes()[0], n.num_values))
            .collect::<Vec<_>>();

        assert_eq!(summary, vec![(0x01, 5), (0x20, 2)]);
        assert!(holders
            .iter()
            .all(|n| n.token == Some(Bytes::from_static(b"token"))));
    }

    #[test]
    fn nothing_found() {
        let (sender, results) = flume::unbounded();
        let mut network = FakeNetwork::new();
        let mut routing = FakeRouting::new(id(0xff));

        let mut action = Action::new(
            FindValue::new(sender),
            ActionState::new(id(0), routing.id, Termination::Exhaustive, 8, 4),
        );

        action.go_with_nodes(vec![node(1)], &mut network);
        network.respond(&id(1), &response(&node(1), vec![], 0));
        action.tick(&mut network, &mut routing);

        assert!(action.is_done());
        assert!(results.try_recv().unwrap().is_empty());
    }
}
