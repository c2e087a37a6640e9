//! K-RPC node: one transport, its sessions and the actions running over them.

pub mod actions;
mod config;
mod info;
mod multiplexer;
mod proxy;
pub mod server;
mod session;
mod socket;
mod transactions;

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Instant;

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, info};

use crate::common::{
    messages::{Dict, PingResponse, RequestSpecific},
    Id, Node, Request, Routing, RoutingTable,
};
use crate::Result;

use actions::{
    Action, ActionState, FindNode, FindValue, GetValue, Network, RunningAction, StoreValue,
    Termination,
};
use server::{DefaultServer, DefaultServerSettings, Server};

pub use config::{Config, DEFAULT_CONCURRENCY, DEFAULT_REQUEST_TIMEOUT, DEFAULT_STORE_REDUNDANCY};
pub use info::Info;
pub use multiplexer::Multiplexer;
pub use proxy::{NodeProxy, PendingCall};
pub use session::{HandlerError, RequestHandler, Session, VERSION};
pub use socket::{Transport, UdpTransport, DEFAULT_PORT};
pub use transactions::{Reply, Response, RpcError};

#[cfg(test)]
pub(crate) use socket::memory;

/// A lookup to run, with the channel its result is delivered on.
#[derive(Debug)]
pub enum Lookup {
    /// The K closest nodes to `target`, with their tokens.
    FindNode {
        target: Id,
        sender: Sender<Vec<Node>>,
    },
    /// The closest nodes holding values for `key`.
    FindValue {
        key: Id,
        sender: Sender<Vec<Node>>,
    },
    /// Batches of new values for `key`, then an empty batch.
    GetValue {
        key: Id,
        termination: Termination,
        sender: Sender<Vec<Bytes>>,
    },
    /// The nodes that acknowledged storing `value`.
    StoreValue {
        key: Id,
        value: Bytes,
        sender: Sender<Vec<Node>>,
    },
}

#[derive(Debug)]
struct Ping {
    address: SocketAddr,
    call: PendingCall,
    /// None for bootstrap pings.
    sender: Option<Sender<Result<Node, RpcError>>>,
}

#[derive(Debug)]
enum Bootstrap {
    /// Waiting for bootstrap nodes to answer pings.
    Pinging,
    /// Looking up our own id.
    Lookup(Receiver<Vec<Node>>),
    Done,
}

/// Internal Rpc called in the Dht thread loop, useful to create your own actor setup.
#[derive(Debug)]
pub struct Rpc {
    id: Id,
    multiplexer: Multiplexer,
    routing_table: RoutingTable,
    server: Box<dyn Server>,

    actions: Vec<Box<dyn RunningAction>>,
    pings: Vec<Ping>,
    bootstrap: Bootstrap,

    /// Time of the latest tick, used for requests sent between ticks.
    clock: Instant,

    // Options
    k: usize,
    concurrency: usize,
    store_redundancy: usize,
}

impl Rpc {
    /// Bind a UDP socket and create a node, pinging the bootstrap nodes.
    pub fn new(config: Config) -> Result<Self> {
        let transport = UdpTransport::bind(config.port)?;

        Ok(Self::with_transport(config, Box::new(transport)))
    }

    /// Create a node over any [Transport].
    pub fn with_transport(config: Config, transport: Box<dyn Transport>) -> Self {
        let id = config.id.unwrap_or_else(Id::random);
        let now = Instant::now();

        let server = config.server.unwrap_or_else(|| {
            Box::new(DefaultServer::new(&DefaultServerSettings {
                k: config.k,
                ..Default::default()
            }))
        });

        let mut rpc = Rpc {
            id,
            multiplexer: Multiplexer::new(
                transport,
                config.request_timeout,
                config.max_packet_size,
            ),
            routing_table: RoutingTable::with_bucket_size(id, config.k),
            server,

            actions: Vec::new(),
            pings: Vec::new(),
            bootstrap: Bootstrap::Pinging,

            clock: now,

            k: config.k,
            concurrency: config.concurrency,
            store_redundancy: config.store_redundancy,
        };

        for address in resolve(&config.bootstrap) {
            let call = rpc.proxy(address, None).ping();

            rpc.pings.push(Ping {
                address,
                call,
                sender: None,
            });
        }

        rpc
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.multiplexer.local_addr()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    /// Returns `true` once the bootstrap lookup finished.
    pub fn bootstrapped(&self) -> bool {
        matches!(self.bootstrap, Bootstrap::Done)
    }

    /// Number of lookups still running.
    pub fn running_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Advance the node using the current time.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now())
    }

    /// Read incoming datagrams, expire overdue requests and advance every running lookup.
    pub fn tick_at(&mut self, now: Instant) {
        self.clock = now;

        let mut handler = InboundHandler {
            server: self.server.as_mut(),
            routing_table: &mut self.routing_table,
        };

        while self.multiplexer.recv(&mut handler) {}

        self.multiplexer.expire(now);

        self.tick_pings();

        let mut network = Requester {
            multiplexer: &mut self.multiplexer,
            local_id: self.id,
            now,
        };

        for action in self.actions.iter_mut() {
            action.tick(&mut network, &mut self.routing_table);
        }

        // Has to happen _after_ ticking actions, a finished action may still
        // be waiting for late responses.
        self.actions.retain(|action| !action.is_done());

        self.tick_bootstrap();
    }

    /// Start a lookup over `seeds`.
    pub fn start_lookup(&mut self, lookup: Lookup, seeds: Vec<Node>) {
        match lookup {
            Lookup::FindNode { target, sender } => {
                let state = self.state(target, Termination::Exhaustive);
                self.start(FindNode::new(sender), state, seeds);
            }
            Lookup::FindValue { key, sender } => {
                let state = self.state(key, Termination::Exhaustive);
                self.start(FindValue::new(sender), state, seeds);
            }
            Lookup::GetValue {
                key,
                termination,
                sender,
            } => {
                let local = self.server.local_values(&key);

                if !local.is_empty() {
                    let _ = sender.send(local.clone());
                }

                let state = self.state(key, termination);
                self.start(GetValue::new(sender, local), state, seeds);
            }
            Lookup::StoreValue { key, value, sender } => {
                let state = self.state(
                    key,
                    Termination::Redundancy {
                        results: self.store_redundancy,
                        responders: self.store_redundancy,
                    },
                );
                self.start(StoreValue::new(value, sender), state, seeds);
            }
        }
    }

    /// Start a lookup seeded with the K closest nodes in the routing table.
    pub fn lookup(&mut self, lookup: Lookup) {
        let target = match &lookup {
            Lookup::FindNode { target, .. } => *target,
            Lookup::FindValue { key, .. }
            | Lookup::GetValue { key, .. }
            | Lookup::StoreValue { key, .. } => *key,
        };

        let seeds = self.routing_table.closest(&target, self.k);
        self.start_lookup(lookup, seeds);
    }

    /// Find the K closest nodes to `target`, starting from the routing table.
    pub fn find_node(&mut self, target: Id) -> Receiver<Vec<Node>> {
        let (sender, receiver) = flume::bounded(1);

        self.lookup(Lookup::FindNode { target, sender });

        receiver
    }

    /// Find the closest nodes holding values for `key`, starting from the routing table.
    pub fn find_value(&mut self, key: Id) -> Receiver<Vec<Node>> {
        let (sender, receiver) = flume::bounded(1);

        self.lookup(Lookup::FindValue { key, sender });

        receiver
    }

    /// Get up to `count` values of `key` from `holders`, 0 for as many as they have.
    ///
    /// Values this node holds are delivered first.
    pub fn get_value(&mut self, key: Id, count: usize, holders: Vec<Node>) -> Receiver<Vec<Bytes>> {
        let (sender, receiver) = flume::unbounded();

        self.start_lookup(
            Lookup::GetValue {
                key,
                termination: Termination::results(count),
                sender,
            },
            holders,
        );

        receiver
    }

    /// Store `value` under `key` at the tokened nodes among `nodes`.
    pub fn store_value(&mut self, key: Id, value: Bytes, nodes: Vec<Node>) -> Receiver<Vec<Node>> {
        let (sender, receiver) = flume::bounded(1);

        self.start_lookup(Lookup::StoreValue { key, value, sender }, nodes);

        receiver
    }

    /// Ping an address, a responding node is added to the routing table.
    pub fn ping(&mut self, address: SocketAddr) -> Receiver<Result<Node, RpcError>> {
        let (sender, receiver) = flume::bounded(1);

        self.ping_with(address, sender);

        receiver
    }

    /// Same as [Rpc::ping], delivering the result on `sender`.
    pub fn ping_with(&mut self, address: SocketAddr, sender: Sender<Result<Node, RpcError>>) {
        let call = self.proxy(address, None).ping();

        self.pings.push(Ping {
            address,
            call,
            sender: Some(sender),
        });
    }

    /// Fail every pending request and forget all sessions.
    pub fn stop(&mut self) {
        self.multiplexer.stop();
    }

    // === Private Methods ===

    fn proxy(&mut self, address: SocketAddr, expected: Option<Id>) -> NodeProxy<'_> {
        NodeProxy::new(&mut self.multiplexer, self.id, address, expected, self.clock)
    }

    fn state(&self, target: Id, termination: Termination) -> ActionState {
        ActionState::new(target, self.id, termination, self.k, self.concurrency)
    }

    fn start<V>(&mut self, verb: V, state: ActionState, seeds: Vec<Node>)
    where
        V: actions::Verb + std::fmt::Debug + Send + 'static,
    {
        let mut action = Action::new(verb, state);

        let mut network = Requester {
            multiplexer: &mut self.multiplexer,
            local_id: self.id,
            now: self.clock,
        };

        action.go_with_nodes(seeds, &mut network);

        if !action.is_done() {
            self.actions.push(Box::new(action));
        }
    }

    fn tick_pings(&mut self) {
        let mut index = 0;

        while index < self.pings.len() {
            let Some(result) = self.pings[index].call.poll_as::<PingResponse>() else {
                index += 1;
                continue;
            };

            let ping = self.pings.swap_remove(index);

            let result = result.map(|response| {
                let node = Node::new(response.id, ping.address);
                self.routing_table.add(node.clone());
                node
            });

            if let Err(error) = &result {
                debug!(address = ?ping.address, ?error, "Ping failed");
            }

            if let Some(sender) = ping.sender {
                let _ = sender.send(result);
            }
        }
    }

    fn tick_bootstrap(&mut self) {
        if let Bootstrap::Pinging = self.bootstrap {
            if self.pings.iter().any(|ping| ping.sender.is_none()) {
                return;
            }

            let receiver = self.find_node(self.id);

            self.bootstrap = Bootstrap::Lookup(receiver);
            return;
        }

        let Bootstrap::Lookup(receiver) = &self.bootstrap else {
            return;
        };

        if receiver.is_empty() && !receiver.is_disconnected() {
            return;
        }

        let table_size = self.routing_table.size();

        if table_size == 0 {
            info!("Could not bootstrap the routing table");
        } else {
            debug!(table_size, "Populated the routing table");
        }

        self.bootstrap = Bootstrap::Done;
    }
}

impl Drop for Rpc {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serves inbound requests and learns about the nodes sending them.
struct InboundHandler<'a> {
    server: &'a mut dyn Server,
    routing_table: &'a mut RoutingTable,
}

impl RequestHandler for InboundHandler<'_> {
    fn handle_request(
        &mut self,
        from: SocketAddr,
        request: &RequestSpecific,
    ) -> Result<Dict, HandlerError> {
        let result = self
            .server
            .handle_request(&*self.routing_table, from, request);

        if let (Ok(_), Some(id)) = (&result, request.arguments.get_id()) {
            self.routing_table.insert_node(Node::new(id, from));
        }

        result
    }
}

/// Sends action requests through the multiplexer, expecting each node to answer with its id.
struct Requester<'a> {
    multiplexer: &'a mut Multiplexer,
    local_id: Id,
    now: Instant,
}

impl Network for Requester<'_> {
    fn request(&mut self, node: &Node, request: Request) -> PendingCall {
        NodeProxy::new(
            self.multiplexer,
            self.local_id,
            node.address,
            Some(node.id),
            self.now,
        )
        .call(request)
    }
}

fn resolve(bootstrap: &[String]) -> Vec<SocketAddr> {
    bootstrap
        .iter()
        .flat_map(|host| match host.to_socket_addrs() {
            Ok(addresses) => addresses.collect::<Vec<_>>(),
            Err(error) => {
                debug!(?host, ?error, "Could not resolve bootstrap node");
                Vec::new()
            }
        })
        .filter(SocketAddr::is_ipv4)
        .collect()
}
