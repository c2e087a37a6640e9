//! Dht node.

use std::net::SocketAddr;
use std::thread;

use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError};
use tracing::debug;

use crate::{
    common::{Id, Node},
    rpc::{actions::Termination, Config, Info, Lookup, Rpc, RpcError, Transport, UdpTransport},
    Result,
};

#[derive(Debug, Clone)]
/// Dht node, running the [Rpc] in its own thread.
///
/// Clones share the same node, which shuts down once every clone is dropped
/// or [Dht::shutdown] is called.
pub struct Dht(pub(crate) Sender<ActorMessage>);

impl Dht {
    /// Bind a UDP socket and start a node with this configuration.
    pub fn new(config: Config) -> Result<Self> {
        let transport = UdpTransport::bind(config.port)?;

        Self::with_transport(config, Box::new(transport))
    }

    /// Start a node over any [Transport].
    pub fn with_transport(config: Config, transport: Box<dyn Transport>) -> Result<Self> {
        let (sender, receiver) = flume::unbounded();

        thread::Builder::new()
            .name("krpc-dht".to_string())
            .spawn(move || Actor::new(Rpc::with_transport(config, transport)).run(receiver))?;

        Ok(Dht(sender))
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.send(ActorMessage::Info(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Turn this node's routing table to a list of bootstraping nodes.
    pub fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<String>>(1);

        self.send(ActorMessage::ToBootstrap(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop, failing every pending request.
    pub fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Wait until the bootstraping lookup is done.
    ///
    /// Returns true if the routing table is not empty afterwards.
    pub fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.send(ActorMessage::Bootstrapped(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Ping an address, adding the responding node to the routing table.
    pub fn ping(&self, address: SocketAddr) -> Result<Node, DhtPingError> {
        let (sender, receiver) = flume::bounded::<Result<Node, RpcError>>(1);

        self.send(ActorMessage::Ping(address, sender))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    // === Lookups ===

    /// The closest nodes to `target`, with the tokens they handed out.
    pub fn find_node(&self, target: Id) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.send(ActorMessage::Lookup(Lookup::FindNode { target, sender }))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// The closest nodes holding values for `key`, with their value counts.
    pub fn find_value(&self, key: Id) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.send(ActorMessage::Lookup(Lookup::FindValue { key, sender }))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Values stored under `key`, up to `count` of them or all if `count` is 0.
    ///
    /// Values are yielded as nodes respond, each value at most once.
    pub fn get_value(
        &self,
        key: Id,
        count: usize,
    ) -> Result<impl Iterator<Item = Bytes>, DhtWasShutdown> {
        // Get requests use unbounded channels to avoid blocking in the run loop.
        let (sender, receiver) = flume::unbounded::<Vec<Bytes>>();

        self.send(ActorMessage::GetValue(key, count, sender))?;

        Ok(values(receiver))
    }

    /// Store `value` under `key` at the closest nodes.
    ///
    /// Returns the nodes that acknowledged it.
    pub fn store_value(&self, key: Id, value: Bytes) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.send(ActorMessage::StoreValue(key, value, sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Private Methods ===

    fn send(&self, message: ActorMessage) -> Result<(), DhtWasShutdown> {
        self.0.send(message).map_err(|_| DhtWasShutdown)
    }
}

/// Flatten value batches until the terminal empty one.
pub(crate) fn values(receiver: Receiver<Vec<Bytes>>) -> impl Iterator<Item = Bytes> {
    receiver
        .into_iter()
        .take_while(|batch| !batch.is_empty())
        .flatten()
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Shutdown(Sender<()>),
    Info(Sender<Info>),
    ToBootstrap(Sender<Vec<String>>),
    Bootstrapped(Sender<bool>),
    Ping(SocketAddr, Sender<Result<Node, RpcError>>),
    Lookup(Lookup),
    GetValue(Id, usize, Sender<Vec<Bytes>>),
    StoreValue(Id, Bytes, Sender<Vec<Node>>),
}

/// A lookup that starts once another one delivered its nodes.
#[derive(Debug)]
enum Chain {
    Get {
        key: Id,
        count: usize,
        holders: Receiver<Vec<Node>>,
        sender: Sender<Vec<Bytes>>,
    },
    Store {
        key: Id,
        value: Bytes,
        nodes: Receiver<Vec<Node>>,
        sender: Sender<Vec<Node>>,
    },
}

impl Chain {
    /// Start the second lookup if the first one is done, returns the chain if it is not.
    fn advance(self, rpc: &mut Rpc) -> Option<Self> {
        match self {
            Chain::Get {
                key,
                count,
                holders,
                sender,
            } => match holders.try_recv() {
                Ok(holders) => {
                    rpc.start_lookup(
                        Lookup::GetValue {
                            key,
                            termination: Termination::results(count),
                            sender,
                        },
                        holders,
                    );
                    None
                }
                Err(TryRecvError::Empty) => Some(Chain::Get {
                    key,
                    count,
                    holders,
                    sender,
                }),
                Err(TryRecvError::Disconnected) => None,
            },
            Chain::Store {
                key,
                value,
                nodes,
                sender,
            } => match nodes.try_recv() {
                Ok(nodes) => {
                    rpc.start_lookup(Lookup::StoreValue { key, value, sender }, nodes);
                    None
                }
                Err(TryRecvError::Empty) => Some(Chain::Store {
                    key,
                    value,
                    nodes,
                    sender,
                }),
                Err(TryRecvError::Disconnected) => None,
            },
        }
    }
}

struct Actor {
    rpc: Rpc,
    chains: Vec<Chain>,
    waiting_bootstrap: Vec<Sender<bool>>,
}

impl Actor {
    fn new(rpc: Rpc) -> Self {
        Self {
            rpc,
            chains: Vec::new(),
            waiting_bootstrap: Vec::new(),
        }
    }

    fn run(mut self, receiver: Receiver<ActorMessage>) {
        let mut shutdown = Vec::new();

        'main: loop {
            loop {
                match receiver.try_recv() {
                    Ok(ActorMessage::Shutdown(sender)) => {
                        shutdown.push(sender);
                        break 'main;
                    }
                    Ok(message) => self.handle(message),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'main,
                }
            }

            self.rpc.tick();

            for chain in std::mem::take(&mut self.chains) {
                if let Some(chain) = chain.advance(&mut self.rpc) {
                    self.chains.push(chain);
                }
            }

            if self.rpc.bootstrapped() && !self.waiting_bootstrap.is_empty() {
                let populated = !self.rpc.routing_table().is_empty();

                for sender in self.waiting_bootstrap.drain(..) {
                    let _ = sender.send(populated);
                }
            }
        }

        let id = *self.rpc.id();

        // Dropping the Rpc fails pending calls and disconnects the lookups' result channels.
        drop(self);

        // Queued requests hold reply senders, the queue outlives this receiver
        // as long as any Dht clone does.
        for message in receiver.drain() {
            if let ActorMessage::Shutdown(sender) = message {
                shutdown.push(sender);
            }
        }
        drop(receiver);

        debug!(?id, "Dht actor stopped");

        for sender in shutdown {
            let _ = sender.send(());
        }
    }

    fn handle(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Shutdown(_) => {}
            ActorMessage::Info(sender) => {
                let _ = sender.send(self.rpc.info());
            }
            ActorMessage::ToBootstrap(sender) => {
                let _ = sender.send(
                    self.rpc
                        .routing_table()
                        .nodes()
                        .map(|node| node.address.to_string())
                        .collect(),
                );
            }
            ActorMessage::Bootstrapped(sender) => self.waiting_bootstrap.push(sender),
            ActorMessage::Ping(address, sender) => self.rpc.ping_with(address, sender),
            ActorMessage::Lookup(lookup) => self.rpc.lookup(lookup),
            ActorMessage::GetValue(key, count, sender) => {
                let holders = self.rpc.find_value(key);

                self.chains.push(Chain::Get {
                    key,
                    count,
                    holders,
                    sender,
                });
            }
            ActorMessage::StoreValue(key, value, sender) => {
                let nodes = self.rpc.find_node(key);

                self.chains.push(Chain::Store {
                    key,
                    value,
                    nodes,
                    sender,
                });
            }
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The Dht was shutdown")]
/// The actor thread is gone.
pub struct DhtWasShutdown;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Dht ping error
pub enum DhtPingError {
    #[error(transparent)]
    /// The node did not answer, or answered with an error.
    Rpc(#[from] RpcError),

    #[error(transparent)]
    DhtWasShutdown(#[from] DhtWasShutdown),
}

/// Create a testnet of Dht nodes to run tests against instead of the real network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Start `count` nodes on loopback, bootstrapped off the first one.
    pub fn new(count: usize) -> Result<Testnet> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            let node = Dht::new(Config {
                port: Some(0),
                bootstrap: bootstrap.clone(),
                ..Default::default()
            })?;

            if i == 0 {
                let info = node.info()?;

                bootstrap.push(format!("127.0.0.1:{}", info.local_addr().port()));
            } else {
                node.bootstrapped()?;
            }

            nodes.push(node)
        }

        Ok(Self { bootstrap, nodes })
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn shutdown() {
        let dht = Dht::new(Config {
            port: Some(0),
            ..Default::default()
        })
        .unwrap();

        let clone = dht.clone();
        thread::spawn(move || clone.shutdown()).join().unwrap();

        assert_eq!(dht.find_node(Id::random()), Err(DhtWasShutdown));
        assert_eq!(dht.info().map(|_| ()), Err(DhtWasShutdown));
    }

    #[test]
    fn calls_after_shutdown_fail() {
        for _ in 0..10 {
            let dht = Dht::new(Config {
                port: Some(0),
                ..Default::default()
            })
            .unwrap();

            dht.shutdown();

            let (sender, receiver) = flume::bounded(1);
            let clone = dht.clone();
            thread::spawn(move || {
                let _ = sender.send(clone.find_node(Id::random()));
            });

            assert_eq!(
                receiver.recv_timeout(Duration::from_secs(3)),
                Ok(Err(DhtWasShutdown))
            );
        }
    }

    #[test]
    fn queued_calls_fail_on_shutdown() {
        let dht = Dht::new(Config {
            port: Some(0),
            ..Default::default()
        })
        .unwrap();

        let (sender, receiver) = flume::unbounded();
        for _ in 0..5 {
            let clone = dht.clone();
            let sender = sender.clone();
            thread::spawn(move || {
                let _ = sender.send(clone.info().map(|_| ()));
            });
        }

        dht.shutdown();

        for _ in 0..5 {
            assert!(receiver.recv_timeout(Duration::from_secs(3)).is_ok());
        }
    }

    #[test]
    fn lone_node_bootstraps_empty() {
        let dht = Dht::new(Config {
            port: Some(0),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(dht.bootstrapped(), Ok(false));
        assert!(dht.info().unwrap().bootstrapped());
        assert!(dht.find_node(Id::random()).unwrap().is_empty());
        assert_eq!(dht.get_value(Id::random(), 0).unwrap().count(), 0);
    }

    #[test]
    fn values_until_terminal_batch() {
        let (sender, receiver) = flume::unbounded();

        sender.send(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]).unwrap();
        sender.send(vec![Bytes::from_static(b"c")]).unwrap();
        sender.send(vec![]).unwrap();
        sender.send(vec![Bytes::from_static(b"late")]).unwrap();

        assert_eq!(values(receiver).count(), 3);
    }
}
