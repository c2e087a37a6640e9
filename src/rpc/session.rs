//! KRPC session with a single remote address.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use flume::Receiver;
use tracing::{debug, trace};

use crate::common::{
    messages::{Dict, RequestSpecific},
    ErrorSpecific, Message, MessageType,
};

use super::socket::Transport;
use super::transactions::{rejected, Reply, Response, RpcError, TransactionTable};

/// Version string sent with every message.
pub const VERSION: [u8; 4] = *b"KD01";
const TRANSACTION_ID_SIZE: usize = 4;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Outcome of a request handler that did not produce a response.
pub enum HandlerError {
    /// Sent back as is.
    #[error("{0}")]
    Protocol(ErrorSpecific),

    /// Sent back as a generic server error.
    #[error("{0}")]
    Other(String),
}

impl From<ErrorSpecific> for HandlerError {
    fn from(error: ErrorSpecific) -> Self {
        HandlerError::Protocol(error)
    }
}

impl From<crate::Error> for HandlerError {
    fn from(error: crate::Error) -> Self {
        HandlerError::Other(error.to_string())
    }
}

/// Handles inbound requests.
pub trait RequestHandler {
    fn handle_request(
        &mut self,
        from: SocketAddr,
        request: &RequestSpecific,
    ) -> Result<Dict, HandlerError>;
}

/// Requests sent to and received from one remote address.
#[derive(Debug)]
pub struct Session {
    address: SocketAddr,
    transactions: TransactionTable,
    stopped: bool,
}

impl Session {
    pub fn new(address: SocketAddr, request_timeout: Duration) -> Self {
        Self {
            address,
            transactions: TransactionTable::new(request_timeout),
            stopped: false,
        }
    }

    // === Getters ===

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Number of transactions waiting for a reply.
    pub fn pending(&self) -> usize {
        self.transactions.len()
    }

    /// No transaction is waiting for a reply.
    pub fn is_idle(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // === Public Methods ===

    /// Send a request, the returned receiver gets exactly one [Reply].
    pub fn request(
        &mut self,
        transport: &dyn Transport,
        method: &str,
        arguments: Dict,
        now: Instant,
    ) -> Receiver<Reply> {
        if self.stopped {
            return rejected(RpcError::Stopped);
        }

        let transaction_id = self.transaction_id();

        let bytes = match Message::request(transaction_id.clone(), method, arguments)
            .with_version(&VERSION)
            .to_bytes()
        {
            Ok(bytes) => bytes,
            Err(error) => return rejected(RpcError::Internal(error.to_string())),
        };

        let receiver = self
            .transactions
            .insert(transaction_id.clone(), method, self.address, now);

        trace!(
            context = "session_request",
            method,
            address = ?self.address,
            length = bytes.len()
        );

        if let Err(error) = transport.send_to(&bytes, self.address) {
            debug!(?error, address = ?self.address, "Error sending request message");

            self.transactions.resolve(
                &transaction_id,
                Err(RpcError::Unreachable(error.to_string())),
            );
        }

        receiver
    }

    /// Handle a decoded message from this session's address.
    pub fn handle_message(
        &mut self,
        transport: &dyn Transport,
        message: Message,
        handler: &mut dyn RequestHandler,
        max_packet_size: usize,
    ) {
        match message.message_type {
            MessageType::Request(request) => {
                let transaction_id = message.transaction_id;

                let reply = match catch_unwind(AssertUnwindSafe(|| {
                    handler.handle_request(self.address, &request)
                })) {
                    Ok(Ok(payload)) => Message::response(transaction_id.clone(), payload),
                    Ok(Err(HandlerError::Protocol(error))) => {
                        Message::error(transaction_id.clone(), error)
                    }
                    Ok(Err(HandlerError::Other(description))) => {
                        debug!(method = %request.method, %description, "Request handler failed");

                        Message::error(
                            transaction_id.clone(),
                            ErrorSpecific::server_error(description),
                        )
                    }
                    Err(_) => {
                        debug!(method = %request.method, "Request handler panicked");

                        Message::error(
                            transaction_id.clone(),
                            ErrorSpecific::server_error("internal error"),
                        )
                    }
                };

                let bytes = match reply
                    .with_version(&VERSION)
                    .to_bytes_within(max_packet_size)
                {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        debug!(?error, "Could not encode reply");

                        match sending_failed(transaction_id).to_bytes() {
                            Ok(bytes) => bytes,
                            Err(error) => {
                                debug!(?error, "Could not encode error reply");
                                return;
                            }
                        }
                    }
                };

                if let Err(error) = transport.send_to(&bytes, self.address) {
                    debug!(?error, address = ?self.address, "Error sending reply");
                }
            }
            MessageType::Response(payload) => {
                let resolved = self.transactions.resolve(
                    &message.transaction_id,
                    Ok(Response {
                        from: self.address,
                        payload,
                    }),
                );

                if !resolved {
                    debug!(
                        address = ?self.address,
                        transaction_id = ?message.transaction_id,
                        "Unexpected or late response"
                    );
                }
            }
            MessageType::Error(error) => {
                let resolved = self
                    .transactions
                    .resolve(&message.transaction_id, Err(RpcError::Remote(error)));

                if !resolved {
                    debug!(
                        address = ?self.address,
                        transaction_id = ?message.transaction_id,
                        "Unexpected or late error"
                    );
                }
            }
            MessageType::Unknown(message_type) => {
                let message_type = String::from_utf8_lossy(&message_type).into_owned();

                let resolved = self.transactions.resolve(
                    &message.transaction_id,
                    Err(RpcError::ReceivedUnknown(message_type.clone())),
                );

                if !resolved {
                    debug!(
                        address = ?self.address,
                        %message_type,
                        "Dropped message of unknown type"
                    );
                }
            }
        }
    }

    /// Time out overdue transactions.
    pub fn expire(&mut self, now: Instant) -> usize {
        self.transactions.expire(now)
    }

    /// Reject every pending transaction, and any later request.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.transactions.stop();
    }

    // === Private Methods ===

    /// A random transaction id not in use in this session.
    fn transaction_id(&self) -> Vec<u8> {
        loop {
            let transaction_id = rand::random::<[u8; TRANSACTION_ID_SIZE]>().to_vec();

            if !self.transactions.contains(&transaction_id) {
                return transaction_id;
            }
        }
    }
}

/// Sent instead of a reply that could not be encoded.
fn sending_failed(transaction_id: Vec<u8>) -> Message {
    Message::error(
        transaction_id,
        ErrorSpecific::server_error("unknown error sending response"),
    )
    .with_version(&VERSION)
}

#[cfg(test)]
mod test {
    use crate::common::{
        messages::{ERROR_METHOD_UNKNOWN, ERROR_RECEIVED_UNKNOWN, ERROR_SERVER},
        Id, Request,
    };
    use crate::rpc::socket::memory::{MemoryNetwork, MemoryTransport};

    use super::*;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle_request(
            &mut self,
            _from: SocketAddr,
            request: &RequestSpecific,
        ) -> Result<Dict, HandlerError> {
            match request.method.as_str() {
                "ping" => Ok(request.arguments.clone()),
                "panic" => panic!("handler bug"),
                "fail" => Err(HandlerError::Other("oops".to_string())),
                method => Err(ErrorSpecific::method_unknown(method).into()),
            }
        }
    }

    fn recv(transport: &mut MemoryTransport) -> Message {
        let mut buf = [0_u8; 2048];
        let (amt, _) = transport.recv_from(&mut buf).unwrap().unwrap();

        Message::from_bytes(&buf[..amt]).unwrap()
    }

    fn pair() -> (MemoryTransport, MemoryTransport) {
        let network = MemoryNetwork::new();
        (network.bind(1), network.bind(2))
    }

    #[test]
    fn request_response() {
        let (mut a, mut b) = pair();

        let mut client = Session::new(b.local_addr(), Duration::from_secs(1));
        let mut server = Session::new(a.local_addr(), Duration::from_secs(1));

        let arguments = Request::Ping.to_arguments(Id::random()).unwrap();
        let receiver = client.request(&a, "ping", arguments.clone(), Instant::now());
        assert_eq!(client.pending(), 1);

        let request = recv(&mut b);
        assert_eq!(request.transaction_id.len(), TRANSACTION_ID_SIZE);
        assert_eq!(request.version, Some(VERSION.to_vec()));

        server.handle_message(&b, request, &mut Echo, 1472);

        let response = recv(&mut a);
        client.handle_message(&a, response, &mut Echo, 1472);

        assert_eq!(client.pending(), 0);
        assert!(client.is_idle());
        assert_eq!(receiver.try_recv().unwrap().unwrap().payload, arguments);
    }

    #[test]
    fn handler_errors() {
        let (a, mut b) = pair();
        let mut server = Session::new(b.local_addr(), Duration::from_secs(1));

        for (method, code) in [
            ("unknown", ERROR_METHOD_UNKNOWN),
            ("fail", ERROR_SERVER),
            ("panic", ERROR_SERVER),
        ] {
            let request = Message::request(vec![1], method, Dict::new());
            server.handle_message(&a, request, &mut Echo, 1472);

            match recv(&mut b).message_type {
                MessageType::Error(error) => assert_eq!(error.code, code),
                _ => panic!("expected an error reply to {}", method),
            }
        }
    }

    #[test]
    fn remote_error() {
        let (mut a, mut b) = pair();

        let mut client = Session::new(b.local_addr(), Duration::from_secs(1));
        let receiver = client.request(&a, "find_node", Dict::new(), Instant::now());

        let request = recv(&mut b);
        let error = Message::error(request.transaction_id, ErrorSpecific::invalid_token());
        b.send_to(&error.to_bytes().unwrap(), a.local_addr()).unwrap();

        let reply = recv(&mut a);
        client.handle_message(&a, reply, &mut Echo, 1472);

        assert_eq!(
            receiver.try_recv().unwrap(),
            Err(RpcError::Remote(ErrorSpecific::invalid_token()))
        );
    }

    #[test]
    fn unknown_message_type() {
        let (mut a, mut b) = pair();

        let mut client = Session::new(b.local_addr(), Duration::from_secs(20));
        let receiver = client.request(&a, "ping", Dict::new(), Instant::now());

        let request = recv(&mut b);
        let unknown = Message {
            transaction_id: request.transaction_id,
            version: None,
            message_type: MessageType::Unknown(b"x".to_vec()),
        };
        b.send_to(&unknown.to_bytes().unwrap(), a.local_addr()).unwrap();

        let reply = recv(&mut a);
        assert_eq!(reply.message_type, MessageType::Unknown(b"x".to_vec()));
        client.handle_message(&a, reply, &mut Echo, 1472);

        assert_eq!(client.pending(), 0);

        let error = receiver.try_recv().unwrap().unwrap_err();
        assert_eq!(error, RpcError::ReceivedUnknown("x".to_string()));
        assert_eq!(error.code(), ERROR_RECEIVED_UNKNOWN);
    }

    #[test]
    fn error_reply_when_encoding_fails() {
        match sending_failed(vec![1, 2]).message_type {
            MessageType::Error(error) => {
                assert_eq!(error.code, ERROR_SERVER);
                assert_eq!(error.description, "unknown error sending response");
            }
            _ => panic!("expected an error"),
        }
    }

    #[test]
    fn unknown_transaction_dropped() {
        let (a, _b) = pair();
        let mut client = Session::new(
            SocketAddr::from(([127, 0, 0, 1], 2)),
            Duration::from_secs(1),
        );

        client.handle_message(
            &a,
            Message::response(vec![9, 9], Dict::new()),
            &mut Echo,
            1472,
        );

        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn unreachable() {
        let (a, _b) = pair();
        let mut client = Session::new(
            SocketAddr::from(([127, 0, 0, 1], 3)),
            Duration::from_secs(1),
        );

        let receiver = client.request(&a, "ping", Dict::new(), Instant::now());

        assert!(matches!(
            receiver.try_recv().unwrap(),
            Err(RpcError::Unreachable(_))
        ));
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn stopped_session() {
        let (a, _b) = pair();
        let mut client = Session::new(
            SocketAddr::from(([127, 0, 0, 1], 2)),
            Duration::from_secs(1),
        );

        let pending = client.request(&a, "ping", Dict::new(), Instant::now());
        client.stop();

        assert_eq!(pending.try_recv().unwrap(), Err(RpcError::Stopped));

        let after = client.request(&a, "ping", Dict::new(), Instant::now());
        assert_eq!(after.try_recv().unwrap(), Err(RpcError::Stopped));
    }

    #[test]
    fn timeout() {
        let (a, _b) = pair();
        let mut client = Session::new(
            SocketAddr::from(([127, 0, 0, 1], 2)),
            Duration::from_secs(1),
        );
        let now = Instant::now();

        let receiver = client.request(&a, "ping", Dict::new(), now);

        assert_eq!(client.expire(now + Duration::from_secs(2)), 1);
        assert!(matches!(
            receiver.try_recv().unwrap(),
            Err(RpcError::Timeout { .. })
        ));
    }
}
