//! Demultiplex datagrams of one [Transport] into per address [Session]s.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use flume::Receiver;
use tracing::trace;

use crate::common::{messages::Dict, Message};

use super::session::{RequestHandler, Session};
use super::socket::{Transport, MTU};
use super::transactions::{rejected, Reply, RpcError};

#[derive(Debug)]
pub struct Multiplexer {
    transport: Box<dyn Transport>,
    local_addr: SocketAddr,
    request_timeout: Duration,
    max_packet_size: usize,
    sessions: HashMap<SocketAddr, Session>,
}

impl Multiplexer {
    pub fn new(
        transport: Box<dyn Transport>,
        request_timeout: Duration,
        max_packet_size: usize,
    ) -> Self {
        let local_addr = transport.local_addr();

        Self {
            transport,
            local_addr,
            request_timeout,
            max_packet_size,
            sessions: HashMap::new(),
        }
    }

    // === Getters ===

    /// Returns the address the transport is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of transactions waiting for a reply, over all sessions.
    pub fn pending(&self) -> usize {
        self.sessions.values().map(Session::pending).sum()
    }

    pub fn sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if `address` is this node.
    ///
    /// An unspecified local ip matches any loopback address on the same port.
    pub fn is_self(&self, address: &SocketAddr) -> bool {
        if address.port() != self.local_addr.port() {
            return false;
        }

        if self.local_addr.ip().is_unspecified() {
            return address.ip().is_loopback() || address.ip().is_unspecified();
        }

        address.ip() == self.local_addr.ip()
    }

    // === Public Methods ===

    /// Send a request through the session for `address`, creating it if needed.
    pub fn request(
        &mut self,
        address: SocketAddr,
        method: &str,
        arguments: Dict,
        now: Instant,
    ) -> Receiver<Reply> {
        if self.is_self(&address) {
            return rejected(RpcError::SelfConnection(address));
        }

        let request_timeout = self.request_timeout;

        self.sessions
            .entry(address)
            .or_insert_with(|| Session::new(address, request_timeout))
            .request(self.transport.as_ref(), method, arguments, now)
    }

    /// Read at most one datagram and dispatch it.
    ///
    /// Returns `false` once the transport has nothing left to read.
    pub fn recv(&mut self, handler: &mut dyn RequestHandler) -> bool {
        let mut buf = [0_u8; MTU];

        match self.transport.recv_from(&mut buf) {
            Ok(Some((amt, from))) => {
                self.handle_datagram(&buf[..amt], from, handler);
                true
            }
            Ok(None) => false,
            Err(e) => {
                trace!(context = "socket_error", ?e, "recv_from failed unexpectedly");
                false
            }
        }
    }

    /// Decode a datagram and hand it to the session of its sender.
    pub fn handle_datagram(
        &mut self,
        bytes: &[u8],
        from: SocketAddr,
        handler: &mut dyn RequestHandler,
    ) {
        if from.port() == 0 {
            trace!(context = "socket_validation", message = "Datagram from port 0");
            return;
        }

        if self.is_self(&from) {
            trace!(context = "socket_validation", message = "Datagram from ourselves");
            return;
        }

        let message = match Message::from_bytes(bytes) {
            Ok(message) => message,
            Err(error) => {
                trace!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(bytes),
                    "Received invalid Bencode message."
                );
                return;
            }
        };

        trace!(context = "socket_message_receiving", ?message, ?from);

        let request_timeout = self.request_timeout;

        self.sessions
            .entry(from)
            .or_insert_with(|| Session::new(from, request_timeout))
            .handle_message(
                self.transport.as_ref(),
                message,
                handler,
                self.max_packet_size,
            );
    }

    /// Time out overdue transactions and forget idle sessions.
    pub fn expire(&mut self, now: Instant) {
        for session in self.sessions.values_mut() {
            session.expire(now);
        }

        self.sessions.retain(|_, session| !session.is_idle());
    }

    /// Stop and forget the session with `address`, failing its pending requests.
    pub fn reset(&mut self, address: &SocketAddr) {
        if let Some(mut session) = self.sessions.remove(address) {
            session.stop();
        }
    }

    /// Stop every session.
    pub fn stop(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.stop();
        }
    }
}
