//! Datagram transports the [super::Multiplexer] sends and receives through.

use std::fmt::Debug;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::trace;

pub const DEFAULT_PORT: u16 = 6881;
/// Largest datagram we read.
pub const MTU: usize = 2048;
/// The maximum duration to backoff checking the [UdpSocket] buffer after it is empty.
/// Lower values increases CPU usage, but reduces latency.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// An unreliable datagram transport.
pub trait Transport: Debug + Send {
    /// The address this transport is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Send one datagram.
    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Receive one datagram if any is available, never blocking for long.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// IPv4 UDP transport.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to `port` on all interfaces, or to [DEFAULT_PORT] falling back
    /// to any free port if `port` is None.
    pub fn bind(port: Option<u16>) -> io::Result<Self> {
        let socket = if let Some(port) = port {
            UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?
        } else {
            match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))),
            }?
        };

        Self::from_socket(socket)
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: UdpSocket) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;

        if local_addr.is_ipv6() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IPv6 is not supported",
            ));
        }

        socket.set_nonblocking(true)?;

        Ok(Self { socket, local_addr })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        self.socket.send_to(bytes, to)?;
        Ok(())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((amt, from)) => Ok(Some((amt, from))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
                Ok(None)
            }
            // ICMP port unreachable from an earlier send, surfaces on some platforms.
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                trace!(context = "socket_error", ?e, "Connection reset");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn udp_loopback() {
        let mut a = UdpTransport::bind(Some(0)).unwrap();
        let b = UdpTransport::bind(Some(0)).unwrap();

        let a_addr = SocketAddr::from(([127, 0, 0, 1], a.local_addr().port()));

        b.send_to(b"hello", a_addr).unwrap();

        let mut buf = [0_u8; MTU];
        let mut received = None;

        for _ in 0..100 {
            if let Some(datagram) = a.recv_from(&mut buf).unwrap() {
                received = Some(datagram);
                break;
            }
        }

        let (amt, from) = received.unwrap();
        assert_eq!(&buf[..amt], b"hello");
        assert_eq!(from.port(), b.local_addr().port());
    }

    #[test]
    fn memory_unreachable() {
        let network = memory::MemoryNetwork::new();
        let a = network.bind(1);

        assert!(a
            .send_to(b"hello", SocketAddr::from(([127, 0, 0, 1], 2)))
            .is_err());
    }
}
