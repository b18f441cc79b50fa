//! Traversal Peer
//!
//! A UDP peer that:
//! - Registers with a rendezvous server and prints its host ID (host mode)
//! - Or asks the server for an introduction to a host ID (join mode)
//! - Exchanges text datagrams with the other peer over the punched path

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use traversal::{
    is_hole_punch, ClientState, ConnectFailedReason, InetAddress, Transport, TraversalClient,
    TraversalHandler, DEFAULT_PORT, HOLE_PUNCH_GREETING,
};

// ============================================================================
// Constants
// ============================================================================

/// Poll timeout (keeps pings and resends on schedule)
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Delay before starting a new session after a failure
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Interval between greetings to the peer until it answers
const PEER_GREETING_INTERVAL: Duration = Duration::from_secs(1);

/// Receive buffer size
const RECV_BUF_LEN: usize = 1500;

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

// ============================================================================
// Session Events
// ============================================================================

/// Callbacks from the traversal agent, queued for the main loop
#[derive(Debug)]
enum PeerEvent {
    State(ClientState),
    ConnectReady(SocketAddr),
    ConnectFailed(ConnectFailedReason),
}

struct EventQueue(Rc<RefCell<VecDeque<PeerEvent>>>);

impl TraversalHandler for EventQueue {
    fn on_state_changed(&mut self, state: ClientState) {
        self.0.borrow_mut().push_back(PeerEvent::State(state));
    }

    fn on_connect_ready(&mut self, addr: SocketAddr) {
        self.0.borrow_mut().push_back(PeerEvent::ConnectReady(addr));
    }

    fn on_connect_failed(&mut self, reason: ConnectFailedReason) {
        self.0.borrow_mut().push_back(PeerEvent::ConnectFailed(reason));
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --server <host:port>  Rendezvous server
    // --port <u16>          Local UDP port (0 picks one)
    // --connect <hostid>    Join the host with this ID instead of hosting

    let server = parse_arg(&args, "--server")
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_PORT));
    let local_port: u16 = match parse_arg(&args, "--port") {
        Some(p) => p.parse().map_err(|_| "Invalid port")?,
        None => 0,
    };
    let connect_to = parse_arg(&args, "--connect");

    let (server_host, server_port) = split_host_port(&server)?;

    log::info!("Traversal Peer starting...");
    log::info!("  Server: {}:{}", server_host, server_port);
    log::info!(
        "  Mode:   {}",
        match &connect_to {
            Some(id) => format!("join {}", id),
            None => "host".to_string(),
        }
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut peer = Peer::new(local_port, server_host, server_port, connect_to)?;
    peer.run(&shutdown)
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Split "host:port", allowing bracketed IPv6 literals
fn split_host_port(s: &str) -> Result<(String, u16), Box<dyn std::error::Error>> {
    let (host, port) = s.rsplit_once(':').ok_or("Server must be host:port")?;
    let port = port.parse().map_err(|_| "Invalid server port")?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// Wildcard address in the same family as the server
fn bind_addr_for(server: SocketAddr, local_port: u16) -> SocketAddr {
    let ip = match server {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, local_port)
}

/// Whether `from` is the rendezvous server, compared the way the agent does
fn is_from_server(server: Option<SocketAddr>, from: SocketAddr) -> bool {
    server.map_or(false, |s| InetAddress::from(s) == InetAddress::from(from))
}

// ============================================================================
// Peer Structure
// ============================================================================

/// The other end of the punched path
struct RemotePeer {
    addr: SocketAddr,
    /// Whether anything has arrived from it yet
    heard_from: bool,
    last_greeting: Option<Instant>,
}

struct Peer {
    /// mio poll instance
    poll: Poll,
    /// Rendezvous agent (owns the UDP socket)
    client: TraversalClient<UdpSocket>,
    /// Callbacks queued by the agent
    events: Rc<RefCell<VecDeque<PeerEvent>>>,
    /// Host ID to join (None in host mode)
    connect_to: Option<String>,
    /// Whether the introduction was requested in the current session
    connect_requested: bool,
    remote: Option<RemotePeer>,
    failed_at: Option<Instant>,
    /// Receive buffer
    recv_buf: Vec<u8>,
}

impl Peer {
    fn new(
        local_port: u16,
        server_host: String,
        server_port: u16,
        connect_to: Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let poll = Poll::new()?;

        let local_addr = match traversal::transport::resolve(&server_host, server_port) {
            Ok(server) => bind_addr_for(server, local_port),
            Err(e) => {
                // The agent reports the resolve failure itself
                log::warn!("Failed to resolve {}: {}", server_host, e);
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local_port)
            }
        };
        let mut socket = UdpSocket::bind(local_addr)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        log::info!("UDP socket bound to {}", socket.local_addr()?);

        let events = Rc::new(RefCell::new(VecDeque::new()));
        let mut client = TraversalClient::new(socket, server_host, server_port);
        client.set_handler(Box::new(EventQueue(Rc::clone(&events))));

        // The agent said hello before the handler was installed
        events.borrow_mut().push_back(PeerEvent::State(client.state()));

        Ok(Peer {
            poll,
            client,
            events,
            connect_to,
            connect_requested: false,
            remote: None,
            failed_at: None,
            recv_buf: vec![0u8; RECV_BUF_LEN],
        })
    }

    fn run(&mut self, shutdown: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(64);

        while !shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.process_socket()?;
                }
            }

            self.client.handle_resends();
            self.process_events()?;
            self.maybe_greet_remote();
            self.maybe_reconnect();
        }

        log::info!("Shutting down");
        Ok(())
    }

    fn process_socket(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (len, from) = match self.client.transport().try_recv_from(&mut self.recv_buf) {
                Ok(Some(v)) => v,
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    log::debug!("Receive error: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let data = self.recv_buf[..len].to_vec();
            if self.client.test_packet(&data, from) {
                continue;
            }
            if is_from_server(self.client.server_address(), from) {
                log::debug!("Dropping undecodable datagram from server {}", from);
                continue;
            }
            self.handle_peer_datagram(&data, from);
        }
        Ok(())
    }

    fn process_events(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let event = match self.events.borrow_mut().pop_front() {
                Some(event) => event,
                None => break,
            };

            match event {
                PeerEvent::State(ClientState::Connecting) => {
                    log::info!("Connecting to rendezvous server...");
                }
                PeerEvent::State(ClientState::Connected) => {
                    self.failed_at = None;
                    if let (Some(id), Some(addr)) =
                        (self.client.host_id(), self.client.external_address())
                    {
                        log::info!("Registered as host {} (seen as {})", id, addr);
                    }
                    self.maybe_request_connect()?;
                }
                PeerEvent::State(ClientState::Failure(reason)) => {
                    log::warn!("Rendezvous session failed: {}", reason);
                    self.failed_at = Some(Instant::now());
                }
                PeerEvent::ConnectReady(addr) => {
                    log::info!("Peer is ready at {}", addr);
                    self.remote = Some(RemotePeer {
                        addr,
                        heard_from: false,
                        last_greeting: None,
                    });
                }
                PeerEvent::ConnectFailed(reason) => {
                    return Err(format!("Connect failed: {}", reason).into());
                }
            }
        }
        Ok(())
    }

    fn maybe_request_connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.connect_requested {
            return Ok(());
        }
        if let Some(id) = self.connect_to.clone() {
            self.client.connect_to_client(&id)?;
            self.connect_requested = true;
        }
        Ok(())
    }

    /// Keep greeting the remote peer until it answers, so the path opens on
    /// both sides even if the first datagrams are dropped.
    fn maybe_greet_remote(&mut self) {
        let remote = match self.remote.as_mut() {
            Some(remote) if !remote.heard_from => remote,
            _ => return,
        };

        let due = remote
            .last_greeting
            .map_or(true, |t| t.elapsed() >= PEER_GREETING_INTERVAL);
        if !due {
            return;
        }
        remote.last_greeting = Some(Instant::now());

        let message = match self.client.host_id() {
            Some(id) => format!("hello from {}", id),
            None => "hello".to_string(),
        };
        let transport = self.client.transport();
        for payload in [&HOLE_PUNCH_GREETING[..], message.as_bytes()] {
            if let Err(e) = transport.send_to(payload, remote.addr) {
                log::warn!("Failed to send to peer {}: {}", remote.addr, e);
            }
        }
    }

    fn handle_peer_datagram(&mut self, data: &[u8], from: SocketAddr) {
        if is_hole_punch(data) {
            log::info!("Hole punch greeting from {}", from);
            return;
        }

        let text = String::from_utf8_lossy(data);
        log::info!("Received from {}: {}", from, text);

        match self.remote.as_mut() {
            Some(remote) if remote.addr == from => {
                if !remote.heard_from {
                    log::info!("Direct path to {} established", from);
                }
                remote.heard_from = true;
            }
            // Host mode: echo whatever arrives
            _ if self.connect_to.is_none() => {
                let reply = format!("echo: {}", text);
                if let Err(e) = self.client.transport().send_to(reply.as_bytes(), from) {
                    log::warn!("Failed to echo to {}: {}", from, e);
                }
            }
            _ => {}
        }
    }

    fn maybe_reconnect(&mut self) {
        let failed_at = match self.failed_at {
            Some(t) => t,
            None => return,
        };
        if failed_at.elapsed() < RECONNECT_DELAY {
            return;
        }

        self.failed_at = None;
        self.connect_requested = false;
        self.client.reconnect_to_server();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("127.0.0.1:6262").unwrap(),
            ("127.0.0.1".to_string(), 6262)
        );
        assert_eq!(
            split_host_port("rendezvous.example.com:7000").unwrap(),
            ("rendezvous.example.com".to_string(), 7000)
        );
        assert_eq!(
            split_host_port("[::1]:6262").unwrap(),
            ("::1".to_string(), 6262)
        );
    }

    #[test]
    fn test_split_host_port_invalid() {
        assert!(split_host_port("localhost").is_err());
        assert!(split_host_port("localhost:http").is_err());
    }

    #[test]
    fn test_bind_addr_matches_server_family() {
        let v4 = bind_addr_for("203.0.113.1:6262".parse().unwrap(), 0);
        assert_eq!(v4, "0.0.0.0:0".parse::<SocketAddr>().unwrap());

        let v6 = bind_addr_for("[2001:db8::1]:6262".parse().unwrap(), 4000);
        assert_eq!(v6, "[::]:4000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_server_datagrams_recognized() {
        let server: SocketAddr = "127.0.0.1:6262".parse().unwrap();

        assert!(is_from_server(Some(server), server));
        // Dual-stack sockets report the server as v4-mapped
        assert!(is_from_server(Some(server), "[::ffff:127.0.0.1]:6262".parse().unwrap()));
        assert!(!is_from_server(Some(server), "127.0.0.1:6263".parse().unwrap()));
        assert!(!is_from_server(None, server));
    }

    #[test]
    fn test_parse_arg() {
        let args: Vec<String> = ["peer", "--connect", "abcdef01", "--port"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(parse_arg(&args, "--connect"), Some("abcdef01".to_string()));
        assert_eq!(parse_arg(&args, "--port"), None);
        assert_eq!(parse_arg(&args, "--server"), None);
    }
}
