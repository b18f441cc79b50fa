//! Integration test for the Traversal Peer
//!
//! Runs an in-process rendezvous server, spawns the peer binary in host mode
//! and joins it from the test through a traversal client.

use std::cell::RefCell;
use std::net::{SocketAddr, UdpSocket};
use std::process::{Child, Command};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use traversal::{
    is_hole_punch, HostId, Packet, Payload, Transport, TraversalClient, TraversalHandler,
    TraversalServer,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct PeerProcess {
    child: Child,
}

impl PeerProcess {
    fn start(server: SocketAddr) -> Result<Self, Box<dyn std::error::Error>> {
        let child = Command::new(env!("CARGO_BIN_EXE_traversal-peer"))
            .args(["--server", &server.to_string()])
            .env("RUST_LOG", "info")
            .spawn()?;
        Ok(PeerProcess { child })
    }
}

impl Drop for PeerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Rendezvous server driven from the test thread
struct Rendezvous {
    socket: UdpSocket,
    server: TraversalServer,
    /// Host IDs handed out so far
    hosts: Vec<HostId>,
}

impl Rendezvous {
    fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        Rendezvous {
            socket,
            server: TraversalServer::new(),
            hosts: Vec::new(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn pump(&mut self) {
        let mut buf = [0u8; 1500];
        while let Some((len, from)) = self.socket.try_recv_from(&mut buf).unwrap() {
            self.server.handle_datagram(&buf[..len], from, Instant::now());
        }
        self.server.resend_packets(Instant::now());
        while let Some((to, data)) = self.server.poll_transmit() {
            if let Ok(Packet {
                payload: Payload::HelloFromServer { ok: true, host_id, .. },
                ..
            }) = Packet::decode(&data)
            {
                if !self.hosts.contains(&host_id) {
                    self.hosts.push(host_id);
                }
            }
            let _ = Transport::send_to(&self.socket, &data, to);
        }
    }
}

#[derive(Clone, Default)]
struct ReadyAddr(Rc<RefCell<Option<SocketAddr>>>);

impl TraversalHandler for ReadyAddr {
    fn on_connect_ready(&mut self, addr: SocketAddr) {
        *self.0.borrow_mut() = Some(addr);
    }
}

#[test]
fn test_join_host_and_exchange_data() {
    let mut rendezvous = Rendezvous::bind();
    let _peer = PeerProcess::start(rendezvous.addr()).expect("Failed to start peer");

    // Wait for the host to register
    let deadline = Instant::now() + TEST_TIMEOUT;
    while rendezvous.hosts.is_empty() {
        assert!(Instant::now() < deadline, "peer never registered");
        rendezvous.pump();
        thread::sleep(Duration::from_millis(5));
    }
    let host_id = rendezvous.hosts[0];

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_nonblocking(true).unwrap();
    let mut joiner = TraversalClient::new(socket, "127.0.0.1", rendezvous.addr().port());
    let ready = ReadyAddr::default();
    joiner.set_handler(Box::new(ready.clone()));

    let mut requested = false;
    let mut echo = None;
    let mut buf = [0u8; 1500];

    while echo.is_none() {
        assert!(Instant::now() < deadline, "no echo from peer");
        rendezvous.pump();

        while let Some((len, from)) = joiner.transport().try_recv_from(&mut buf).unwrap() {
            let data = buf[..len].to_vec();
            if joiner.test_packet(&data, from) || is_hole_punch(&data) {
                continue;
            }
            echo = Some((String::from_utf8_lossy(&data).into_owned(), from));
        }
        joiner.handle_resends();

        if joiner.is_connected() && !requested {
            joiner.connect_to_client(&host_id.to_string()).unwrap();
            requested = true;
        }
        if let Some(addr) = *ready.0.borrow() {
            joiner.transport().send_to(b"ping", addr).unwrap();
        }

        thread::sleep(Duration::from_millis(20));
    }

    let (text, from) = echo.unwrap();
    assert_eq!(text, "echo: ping");
    assert_eq!(Some(from), *ready.0.borrow());
}
