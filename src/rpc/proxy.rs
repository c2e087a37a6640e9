//! Typed DHT verbs addressed to a single node.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use flume::{Receiver, TryRecvError};

use crate::common::{messages::ResponsePayload, Id, Request};

use super::multiplexer::Multiplexer;
use super::transactions::{rejected, Reply, Response, RpcError};

/// A remote node as seen through the [Multiplexer].
#[derive(Debug)]
pub struct NodeProxy<'a> {
    multiplexer: &'a mut Multiplexer,
    local_id: Id,
    address: SocketAddr,
    expected: Option<Id>,
    now: Instant,
}

impl<'a> NodeProxy<'a> {
    /// `expected` is the id the node should answer with, None for a
    /// contact we only know the address of.
    pub fn new(
        multiplexer: &'a mut Multiplexer,
        local_id: Id,
        address: SocketAddr,
        expected: Option<Id>,
        now: Instant,
    ) -> Self {
        Self {
            multiplexer,
            local_id,
            address,
            expected,
            now,
        }
    }

    pub fn ping(&mut self) -> PendingCall {
        self.call(Request::Ping)
    }

    pub fn find_node(&mut self, target: Id) -> PendingCall {
        self.call(Request::FindNode { target })
    }

    pub fn find_value(&mut self, key: Id) -> PendingCall {
        self.call(Request::FindValue { key })
    }

    /// Ask for up to `num` values, 0 for all of them.
    pub fn get_value(&mut self, key: Id, num: usize) -> PendingCall {
        self.call(Request::GetValue { key, num })
    }

    pub fn store_value(&mut self, key: Id, value: Bytes, token: Bytes) -> PendingCall {
        self.call(Request::StoreValue { key, value, token })
    }

    pub fn call(&mut self, request: Request) -> PendingCall {
        let receiver = match request.to_arguments(self.local_id) {
            Ok(arguments) => {
                self.multiplexer
                    .request(self.address, request.method(), arguments, self.now)
            }
            Err(error) => rejected(RpcError::Internal(error.to_string())),
        };

        PendingCall::new(receiver, self.expected)
    }
}

/// A request in flight.
///
/// Poll it until it yields `Some`, it must not be polled again after that.
#[derive(Debug)]
pub struct PendingCall {
    receiver: Receiver<Reply>,
    expected: Option<Id>,
}

impl PendingCall {
    pub(crate) fn new(receiver: Receiver<Reply>, expected: Option<Id>) -> Self {
        Self { receiver, expected }
    }

    /// A call that already failed with `error`.
    pub fn failed(error: RpcError) -> Self {
        Self {
            receiver: rejected(error),
            expected: None,
        }
    }

    /// The verified response, or None while still waiting.
    pub fn poll(&self) -> Option<Reply> {
        match self.receiver.try_recv() {
            Ok(reply) => Some(reply.and_then(|response| self.verify(response))),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(RpcError::Stopped)),
        }
    }

    /// Same as [Self::poll], decoding the payload as `T`.
    pub fn poll_as<T: ResponsePayload>(&self) -> Option<Result<T, RpcError>> {
        self.poll().map(|reply| {
            reply.and_then(|response| {
                response
                    .payload
                    .parse::<T>()
                    .map_err(|error| RpcError::MalformedResponse(error.to_string()))
            })
        })
    }

    /// Block until the reply arrives, only useful when another thread drives the [Multiplexer].
    pub fn wait(&self) -> Reply {
        match self.receiver.recv() {
            Ok(reply) => reply.and_then(|response| self.verify(response)),
            Err(_) => Err(RpcError::Stopped),
        }
    }

    fn verify(&self, response: Response) -> Reply {
        let got = response
            .payload
            .get_id()
            .ok_or_else(|| RpcError::MalformedResponse("missing responder id".to_string()))?;

        match self.expected {
            Some(expected) if expected != got => Err(RpcError::IdentityMismatch { expected, got }),
            _ => Ok(response),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use serde_bencode::value::Value;

    use crate::common::messages::{
        Dict, FindNodeResponse, FindValueResponse, PingResponse, RequestSpecific,
    };
    use crate::common::Node;
    use crate::rpc::session::{HandlerError, RequestHandler};
    use crate::rpc::socket::memory::MemoryNetwork;

    use super::*;

    /// Answers every request as `id`.
    struct Responder {
        id: Id,
        nodes: Vec<Node>,
    }

    impl RequestHandler for Responder {
        fn handle_request(
            &mut self,
            _from: SocketAddr,
            request: &RequestSpecific,
        ) -> Result<Dict, HandlerError> {
            Ok(match request.method.as_str() {
                "find_node" => Dict::from_serializable(&FindNodeResponse {
                    id: self.id,
                    nodes: self.nodes.clone(),
                    token: Bytes::from_static(b"tok"),
                })?,
                "find_value" => {
                    let mut payload = Dict::from_serializable(&PingResponse { id: self.id })?;
                    payload.insert("nodes", Value::Int(5));
                    payload
                }
                "get_value" => Dict::new(),
                _ => Dict::from_serializable(&PingResponse { id: self.id })?,
            })
        }
    }

    struct Setup {
        client: Multiplexer,
        server: Multiplexer,
        responder: Responder,
    }

    impl Setup {
        fn new() -> Self {
            let network = MemoryNetwork::new();

            Setup {
                client: Multiplexer::new(Box::new(network.bind(1)), Duration::from_secs(1), 1472),
                server: Multiplexer::new(Box::new(network.bind(2)), Duration::from_secs(1), 1472),
                responder: Responder {
                    id: Id::random(),
                    nodes: vec![Node::random(), Node::random()],
                },
            }
        }

        fn proxy(&mut self, expected: Option<Id>) -> NodeProxy<'_> {
            let address = self.server.local_addr();
            NodeProxy::new(&mut self.client, Id::random(), address, expected, Instant::now())
        }

        fn exchange(&mut self) {
            while self.server.recv(&mut self.responder) {}
            while self.client.recv(&mut self.responder) {}
        }
    }

    #[test]
    fn find_node() {
        let mut setup = Setup::new();
        let id = setup.responder.id;

        let call = setup.proxy(Some(id)).find_node(Id::random());
        assert!(call.poll().is_none());

        setup.exchange();

        let response = call.poll_as::<FindNodeResponse>().unwrap().unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.nodes, setup.responder.nodes);
        assert_eq!(response.token, Bytes::from_static(b"tok"));
    }

    #[test]
    fn unknown_identity_accepted() {
        let mut setup = Setup::new();

        let call = setup.proxy(None).ping();
        setup.exchange();

        let response = call.poll_as::<PingResponse>().unwrap().unwrap();
        assert_eq!(response.id, setup.responder.id);
    }

    #[test]
    fn identity_mismatch() {
        let mut setup = Setup::new();
        let expected = Id::random();

        let call = setup.proxy(Some(expected)).ping();
        setup.exchange();

        assert_eq!(
            call.poll().unwrap(),
            Err(RpcError::IdentityMismatch {
                expected,
                got: setup.responder.id
            })
        );
    }

    #[test]
    fn malformed_response() {
        let mut setup = Setup::new();

        let call = setup.proxy(None).find_value(Id::random());
        setup.exchange();

        assert!(matches!(
            call.poll_as::<FindValueResponse>(),
            Some(Err(RpcError::MalformedResponse(_)))
        ));
    }

    #[test]
    fn missing_responder_id() {
        let mut setup = Setup::new();

        let call = setup.proxy(None).get_value(Id::random(), 0);
        setup.exchange();

        assert!(matches!(
            call.poll(),
            Some(Err(RpcError::MalformedResponse(_)))
        ));
    }

    #[test]
    fn failed_call() {
        let call = PendingCall::failed(RpcError::Stopped);

        assert_eq!(call.poll(), Some(Err(RpcError::Stopped)));
    }
}
