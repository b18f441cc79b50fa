//! Datagram transport used by the client agent
//!
//! The agent never creates sockets itself. The owner binds whatever UDP
//! socket its session layer uses and hands it over; the agent only needs
//! non-blocking send and receive.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Non-blocking datagram socket
pub trait Transport {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram if one is queued. Returns `Ok(None)` instead of
    /// blocking.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// The socket must be in non-blocking mode (or have a read timeout).
impl Transport for std::net::UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        std::net::UdpSocket::send_to(self, buf, target)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.recv_from(buf) {
            Ok(v) => Ok(Some(v)),
            Err(e) if would_block(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Transport for mio::net::UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        mio::net::UdpSocket::send_to(self, buf, target)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.recv_from(buf) {
            Ok(v) => Ok(Some(v)),
            Err(e) if would_block(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Resolve a host name and port to the first matching socket address.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", host),
        )
    })
}
