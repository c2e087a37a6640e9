//! AsyncDht node.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::{
    common::{Id, Node},
    dht::{ActorMessage, Dht, DhtPingError, DhtWasShutdown},
    rpc::{Info, Lookup, RpcError},
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.send(ActorMessage::Info(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Turn this node's routing table to a list of bootstraping nodes.
    pub async fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<String>>(1);

        self.send(ActorMessage::ToBootstrap(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0 .0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// Wait until the bootstraping lookup is done.
    ///
    /// Returns true if the routing table is not empty afterwards.
    pub async fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.send(ActorMessage::Bootstrapped(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Ping an address, adding the responding node to the routing table.
    pub async fn ping(&self, address: SocketAddr) -> Result<Node, DhtPingError> {
        let (sender, receiver) = flume::bounded::<Result<Node, RpcError>>(1);

        self.send(ActorMessage::Ping(address, sender))?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }

    // === Lookups ===

    /// Async version of [Dht::find_node].
    pub async fn find_node(&self, target: Id) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.send(ActorMessage::Lookup(Lookup::FindNode { target, sender }))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Async version of [Dht::find_value].
    pub async fn find_value(&self, key: Id) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.send(ActorMessage::Lookup(Lookup::FindValue { key, sender }))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Stream of value batches stored under `key`, up to `count` values or all if `count` is 0.
    ///
    /// Each value shows up at most once, the last batch is always empty.
    pub fn get_value(
        &self,
        key: Id,
        count: usize,
    ) -> Result<flume::r#async::RecvStream<'static, Vec<Bytes>>, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded::<Vec<Bytes>>();

        self.send(ActorMessage::GetValue(key, count, sender))?;

        Ok(receiver.into_stream())
    }

    /// Async version of [Dht::store_value].
    pub async fn store_value(&self, key: Id, value: Bytes) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.send(ActorMessage::StoreValue(key, value, sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    fn send(&self, message: ActorMessage) -> Result<(), DhtWasShutdown> {
        self.0 .0.send(message).map_err(|_| DhtWasShutdown)
    }
}
