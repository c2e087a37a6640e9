//! Outstanding requests of one session, keyed by transaction id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::trace;

use crate::common::{
    messages::{Dict, ERROR_INTERNAL, ERROR_RECEIVED_UNKNOWN, ERROR_STOPPED, ERROR_TIMEOUT},
    ErrorSpecific, Id,
};

/// The outcome of one request.
pub type Reply = Result<Response, RpcError>;

/// A successful response payload and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub from: SocketAddr,
    pub payload: Dict,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Why a request did not produce a usable response.
pub enum RpcError {
    /// No reply within the request timeout.
    #[error("{method} request to {address} timed out")]
    Timeout { method: String, address: SocketAddr },

    /// The remote node replied with a KRPC error.
    #[error("Remote error: {0}")]
    Remote(ErrorSpecific),

    /// The session was stopped before a reply arrived.
    #[error("Session stopped")]
    Stopped,

    /// The request could not be sent.
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// The responder is not the node we meant to ask.
    #[error("Expected a response from {expected}, got one from {got}")]
    IdentityMismatch { expected: Id, got: Id },

    /// The response payload could not be decoded.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The request targets our own address.
    #[error("Refusing to send a request to our own address {0}")]
    SelfConnection(SocketAddr),

    /// The reply carried an unrecognized message type.
    #[error("Received unknown message type {0:?}")]
    ReceivedUnknown(String),

    /// The request could not be encoded.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// The KRPC error code of this failure, local codes for local failures.
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Remote(error) => error.code,
            RpcError::Timeout { .. } => ERROR_TIMEOUT,
            RpcError::Stopped => ERROR_STOPPED,
            RpcError::ReceivedUnknown(_) => ERROR_RECEIVED_UNKNOWN,
            _ => ERROR_INTERNAL,
        }
    }
}

/// A receiver already holding `error`.
pub(crate) fn rejected(error: RpcError) -> Receiver<Reply> {
    let (sender, receiver) = flume::bounded(1);
    let _ = sender.send(Err(error));

    receiver
}

#[derive(Debug)]
struct Transaction {
    method: String,
    address: SocketAddr,
    deadline: Instant,
    sender: Sender<Reply>,
}

/// Transactions waiting for their reply.
///
/// Removing a transaction from the table is the only way to resolve it,
/// so a response, an error, a timeout and a stop can never both fire.
#[derive(Debug)]
pub struct TransactionTable {
    timeout: Duration,
    transactions: HashMap<Vec<u8>, Transaction>,
}

impl TransactionTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            transactions: HashMap::new(),
        }
    }

    /// Register a transaction sent at `now`.
    pub fn insert(
        &mut self,
        transaction_id: Vec<u8>,
        method: &str,
        address: SocketAddr,
        now: Instant,
    ) -> Receiver<Reply> {
        let (sender, receiver) = flume::bounded(1);

        self.transactions.insert(
            transaction_id,
            Transaction {
                method: method.to_string(),
                address,
                deadline: now + self.timeout,
                sender,
            },
        );

        receiver
    }

    /// Resolve a transaction, returns `false` if it is unknown or already resolved.
    pub fn resolve(&mut self, transaction_id: &[u8], reply: Reply) -> bool {
        match self.transactions.remove(transaction_id) {
            Some(transaction) => {
                // The caller may have lost interest.
                let _ = transaction.sender.send(reply);
                true
            }
            None => false,
        }
    }

    /// Reject every transaction whose deadline passed, returns how many did.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired = self
            .transactions
            .iter()
            .filter(|(_, transaction)| transaction.deadline <= now)
            .map(|(transaction_id, _)| transaction_id.clone())
            .collect::<Vec<_>>();

        for transaction_id in &expired {
            if let Some(transaction) = self.transactions.remove(transaction_id) {
                trace!(
                    context = "transaction_timeout",
                    method = %transaction.method,
                    address = ?transaction.address
                );

                let _ = transaction.sender.send(Err(RpcError::Timeout {
                    method: transaction.method,
                    address: transaction.address,
                }));
            }
        }

        expired.len()
    }

    /// Reject every transaction with [RpcError::Stopped].
    pub fn stop(&mut self) {
        for (_, transaction) in self.transactions.drain() {
            let _ = transaction.sender.send(Err(RpcError::Stopped));
        }
    }

    pub fn contains(&self, transaction_id: &[u8]) -> bool {
        self.transactions.contains_key(transaction_id)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
