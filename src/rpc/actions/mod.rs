//! Long running lookups fanned out over many nodes.
//!
//! An [Action] keeps scheduling requests to the closest unqueried candidates,
//! at most `concurrency` at a time, until its [Termination] condition is met
//! or no request is left outstanding.

mod candidates;
mod find_node;
mod find_value;
mod get_value;
mod store_value;

use std::collections::HashSet;
use std::fmt::Debug;

use tracing::debug;

use crate::common::{messages::ResponsePayload, Id, Node, Request, Routing};

use super::proxy::PendingCall;
use super::transactions::RpcError;

pub use candidates::Candidates;
pub use find_node::FindNode;
pub use find_value::FindValue;
pub use get_value::GetValue;
pub use store_value::StoreValue;

/// When an action stops before running out of candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Run until every candidate worth asking was asked.
    Exhaustive,
    /// Stop once this many results were gathered.
    Results(usize),
    /// Stop once `results` were gathered, or `responders` distinct nodes answered.
    Redundancy { results: usize, responders: usize },
}

impl Termination {
    /// Stop after `count` results, 0 meaning never.
    pub fn results(count: usize) -> Self {
        match count {
            0 => Termination::Exhaustive,
            count => Termination::Results(count),
        }
    }

    /// Result budget, None if unlimited.
    pub fn budget(&self) -> Option<usize> {
        match self {
            Termination::Exhaustive => None,
            Termination::Results(results) | Termination::Redundancy { results, .. } => {
                Some(*results).filter(|results| *results > 0)
            }
        }
    }

    fn is_met(&self, results: usize, answered: usize) -> bool {
        let Some(budget) = self.budget() else {
            return false;
        };

        if results >= budget {
            return true;
        }

        matches!(self, Termination::Redundancy { responders, .. } if answered >= *responders)
    }
}

/// Everything the scheduler knows about one action.
#[derive(Debug)]
pub struct ActionState {
    pub target: Id,
    pub local_id: Id,
    pub candidates: Candidates,
    pub queried: HashSet<Id>,
    pub answered: HashSet<Id>,
    pub termination: Termination,
    /// Requests sent and not yet resolved.
    pub outstanding: usize,
    /// Results expected from the outstanding requests.
    pub outstanding_results: usize,
    pub finished: bool,
    /// How many closest candidates a recursive lookup considers.
    pub k: usize,
    pub concurrency: usize,
}

impl ActionState {
    pub fn new(
        target: Id,
        local_id: Id,
        termination: Termination,
        k: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            target,
            local_id,
            candidates: Candidates::new(target),
            queried: HashSet::new(),
            answered: HashSet::new(),
            termination,
            outstanding: 0,
            outstanding_results: 0,
            finished: false,
            k,
            concurrency: concurrency.max(1),
        }
    }

    /// Add a newly discovered node, ignoring ourselves.
    pub fn discover(&mut self, node: Node) -> bool {
        if node.id == self.local_id {
            return false;
        }

        self.candidates.insert(node)
    }

    /// Results so far plus the ones outstanding requests should bring reach the budget.
    fn budget_reached(&self, results: usize) -> bool {
        self.termination
            .budget()
            .map(|budget| results + self.outstanding_results >= budget)
            .unwrap_or(false)
    }
}

/// The verb specific part of an action.
pub trait Verb {
    /// Decoded response payload.
    type Response: ResponsePayload;

    /// Recursive verbs keep expanding their candidates from responses and
    /// only consider the K closest, flat verbs walk a fixed list.
    const RECURSIVE: bool;

    fn name(&self) -> &'static str;

    /// The request to send to `node` and how many results it should bring,
    /// or None to never ask this node.
    fn arguments(&self, node: &Node, state: &ActionState) -> Option<(Request, usize)>;

    fn process_response(&mut self, node: &Node, response: Self::Response, state: &mut ActionState);

    /// Results gathered so far.
    fn result_count(&self) -> usize;

    /// Deliver the final result.
    fn finish(&mut self, state: &mut ActionState);
}

/// How actions send requests.
pub trait Network {
    fn request(&mut self, node: &Node, request: Request) -> PendingCall;
}

#[derive(Debug)]
struct InFlight {
    node: Node,
    expected_results: usize,
    call: PendingCall,
}

/// One running lookup.
#[derive(Debug)]
pub struct Action<V: Verb> {
    verb: V,
    state: ActionState,
    in_flight: Vec<InFlight>,
}

impl<V: Verb + Debug> Action<V> {
    pub fn new(verb: V, state: ActionState) -> Self {
        Self {
            verb,
            state,
            in_flight: Vec::new(),
        }
    }

    pub fn state(&self) -> &ActionState {
        &self.state
    }

    pub fn verb(&self) -> &V {
        &self.verb
    }

    /// Start with `seeds` as the initial candidates.
    pub fn go_with_nodes(&mut self, seeds: Vec<Node>, network: &mut dyn Network) {
        for node in seeds {
            self.state.discover(node);
        }

        debug!(
            action = self.verb.name(),
            target = ?self.state.target,
            seeds = self.state.candidates.len(),
            "Starting action"
        );

        self.schedule(network);
    }

    /// Collect resolved requests, scheduling more as they come in.
    pub fn tick(&mut self, network: &mut dyn Network, routing: &mut dyn Routing) {
        let mut index = 0;

        while index < self.in_flight.len() {
            match self.in_flight[index].call.poll_as::<V::Response>() {
                None => index += 1,
                Some(result) => {
                    let in_flight = self.in_flight.swap_remove(index);

                    match result {
                        Ok(response) => self.got_response(in_flight, response, network, routing),
                        Err(error) => self.failed(in_flight, error, network, routing),
                    }
                }
            }
        }
    }

    /// Finished, and no late response is left to feed the routing table.
    pub fn is_done(&self) -> bool {
        self.state.finished && self.in_flight.is_empty()
    }

    // === Private Methods ===

    fn schedule(&mut self, network: &mut dyn Network) {
        if !self.state.finished
            && self
                .state
                .termination
                .is_met(self.verb.result_count(), self.state.answered.len())
        {
            self.finish();
        }

        if self.state.finished || self.state.budget_reached(self.verb.result_count()) {
            return;
        }

        let next = if V::RECURSIVE {
            self.state.candidates.closest(Some(self.state.k))
        } else {
            self.state.candidates.closest(None)
        };

        for node in next {
            if !self.state.queried.contains(&node.id) && node.id != self.state.local_id {
                self.state.queried.insert(node.id);

                if let Some((request, expected_results)) = self.verb.arguments(&node, &self.state)
                {
                    let call = network.request(&node, request);

                    self.state.outstanding += 1;
                    self.state.outstanding_results += expected_results;

                    self.in_flight.push(InFlight {
                        node,
                        expected_results,
                        call,
                    });
                }
            }

            if self.state.outstanding >= self.state.concurrency
                || self.state.budget_reached(self.verb.result_count())
            {
                break;
            }
        }

        if self.state.outstanding == 0 {
            self.finish();
        }
    }

    fn got_response(
        &mut self,
        in_flight: InFlight,
        response: V::Response,
        network: &mut dyn Network,
        routing: &mut dyn Routing,
    ) {
        routing.insert_node(in_flight.node.clone());

        if self.state.finished || self.state.answered.contains(&in_flight.node.id) {
            debug!(
                action = self.verb.name(),
                node = ?in_flight.node.address,
                "Late response"
            );
            return;
        }

        self.state.outstanding -= 1;
        self.state.outstanding_results -= in_flight.expected_results;
        self.state.answered.insert(in_flight.node.id);

        self.verb
            .process_response(&in_flight.node, response, &mut self.state);

        self.schedule(network);
    }

    fn failed(
        &mut self,
        in_flight: InFlight,
        error: RpcError,
        network: &mut dyn Network,
        routing: &mut dyn Routing,
    ) {
        debug!(
            action = self.verb.name(),
            node = ?in_flight.node.address,
            ?error,
            "Action request failed"
        );

        routing.node_failed(&in_flight.node);

        if self.state.finished {
            return;
        }

        self.state.outstanding -= 1;
        self.state.outstanding_results -= in_flight.expected_results;

        self.schedule(network);
    }

    fn finish(&mut self) {
        self.state.finished = true;

        debug!(
            action = self.verb.name(),
            target = ?self.state.target,
            queried = self.state.queried.len(),
            answered = self.state.answered.len(),
            results = self.verb.result_count(),
            "Action finished"
        );

        self.verb.finish(&mut self.state);
    }
}

/// An [Action] of any verb.
pub trait RunningAction: Debug + Send {
    fn tick(&mut self, network: &mut dyn Network, routing: &mut dyn Routing);

    fn is_done(&self) -> bool;
}

impl<V: Verb + Debug + Send> RunningAction for Action<V> {
    fn tick(&mut self, network: &mut dyn Network, routing: &mut dyn Routing) {
        Action::tick(self, network, routing)
    }

    fn is_done(&self) -> bool {
        Action::is_done(self)
    }
}

#[cfg(test)]
pub(crate) mod test_network;
