//! Traversal client agent
//!
//! Keeps one session with a rendezvous server: says hello, keeps its host ID
//! alive with pings, retries unacknowledged requests, and asks the server to
//! introduce it to other hosts.
//!
//! # State Machine
//!
//! ```text
//! Connecting ──HelloFromServer(ok)──► Connected
//!     │                                  │
//!     └──────────► Failure(reason) ◄─────┘
//!                      │
//!          reconnect_to_server()
//!                      ▼
//!                 Connecting
//! ```
//!
//! The agent does no work on its own. The owner calls [`TraversalClient::update`]
//! once per tick, or feeds datagrams it received itself through
//! [`TraversalClient::test_packet`] and calls
//! [`TraversalClient::handle_resends`].

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ring::rand::SystemRandom;

use crate::outgoing::{generate_request_id, OutgoingRequest, OutgoingRequests, Resend};
use crate::packet::{
    ConnectFailedReason, HostId, HostIdError, InetAddress, Packet, Payload, HOLE_PUNCH_GREETING,
    PROTOCOL_VERSION,
};
use crate::transport::{self, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Interval between keepalive pings while connected
pub const PING_INTERVAL: Duration = Duration::from_millis(500);

/// Receive buffer size (larger than any traversal packet so oversized
/// datagrams from other sources don't get truncated into false matches)
const RECV_BUF_LEN: usize = 1500;

// ============================================================================
// Client State
// ============================================================================

/// Why the session with the rendezvous server ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Server address could not be resolved
    BadHost,
    /// Server rejected our protocol version
    VersionTooOld,
    /// Server no longer knows our host ID
    ServerForgotAboutUs,
    /// Local socket refused to send
    SocketSendError,
    /// A request was never acknowledged
    ResendTimeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FailureReason::BadHost => "couldn't look up traversal server",
            FailureReason::VersionTooOld => "client is too old for traversal server",
            FailureReason::ServerForgotAboutUs => "traversal server forgot about us",
            FailureReason::SocketSendError => "socket send error",
            FailureReason::ResendTimeout => "traversal server stopped responding",
        };
        f.write_str(msg)
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Failure(FailureReason),
}

/// Callbacks from the agent to its owner. All methods default to no-ops.
pub trait TraversalHandler {
    fn on_state_changed(&mut self, _state: ClientState) {}

    /// The requested host has opened its side; connect to `addr`.
    fn on_connect_ready(&mut self, _addr: SocketAddr) {}

    fn on_connect_failed(&mut self, _reason: ConnectFailedReason) {}
}

// ============================================================================
// Client Structure
// ============================================================================

pub struct TraversalClient<T: Transport> {
    /// Socket shared with the session layer
    transport: T,
    /// Server host name and port as configured
    server_host: String,
    server_port: u16,
    /// Resolved server address (None until resolution succeeds)
    server_addr: Option<SocketAddr>,
    state: ClientState,
    /// Host ID assigned by the server
    host_id: Option<HostId>,
    /// Our address as observed by the server
    external_address: Option<InetAddress>,
    /// Requests awaiting an Ack
    outgoing: OutgoingRequests,
    /// Request ID of the ConnectPlease awaiting ConnectReady/ConnectFailed
    pending_connect: Option<u64>,
    last_ping: Option<Instant>,
    handler: Option<Box<dyn TraversalHandler>>,
    rng: SystemRandom,
    recv_buf: Vec<u8>,
}

impl<T: Transport> TraversalClient<T> {
    /// Create an agent and say hello to the server right away.
    pub fn new(transport: T, server_host: impl Into<String>, server_port: u16) -> Self {
        let mut client = TraversalClient {
            transport,
            server_host: server_host.into(),
            server_port,
            server_addr: None,
            state: ClientState::Connecting,
            host_id: None,
            external_address: None,
            outgoing: OutgoingRequests::new(),
            pending_connect: None,
            last_ping: None,
            handler: None,
            rng: SystemRandom::new(),
            recv_buf: vec![0u8; RECV_BUF_LEN],
        };
        client.reconnect_to_server();
        client
    }

    pub fn set_handler(&mut self, handler: Box<dyn TraversalHandler>) {
        self.handler = Some(handler);
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self.state {
            ClientState::Failure(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn has_failed(&self) -> bool {
        matches!(self.state, ClientState::Failure(_))
    }

    pub fn host_id(&self) -> Option<HostId> {
        self.host_id
    }

    pub fn external_address(&self) -> Option<SocketAddr> {
        self.external_address.and_then(|a| a.to_socket_addr())
    }

    pub fn server_address(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start a fresh session: resolve the server again, drop the old host ID
    /// and anything in flight, and send a new hello.
    pub fn reconnect_to_server(&mut self) {
        self.state = ClientState::Connecting;
        self.host_id = None;
        self.external_address = None;
        self.pending_connect = None;
        self.last_ping = None;
        self.outgoing.clear();

        let addr = match transport::resolve(&self.server_host, self.server_port) {
            Ok(addr) => addr,
            Err(e) => {
                log::error!(
                    "Failed to resolve traversal server {}:{}: {}",
                    self.server_host,
                    self.server_port,
                    e
                );
                self.server_addr = None;
                self.fail(FailureReason::BadHost);
                return;
            }
        };
        self.server_addr = Some(addr);

        log::info!("Connecting to traversal server {}", addr);
        self.send_request(
            Payload::HelloFromClient {
                proto_version: PROTOCOL_VERSION,
            },
            Instant::now(),
        );

        if self.state == ClientState::Connecting {
            self.notify_state_changed();
        }
    }

    /// Ask the server to introduce us to `host`. The outcome arrives through
    /// [`TraversalHandler::on_connect_ready`] or
    /// [`TraversalHandler::on_connect_failed`].
    pub fn connect_to_client(&mut self, host: &str) -> Result<(), HostIdError> {
        let host_id: HostId = host.parse()?;

        log::info!("Requesting connection to host {}", host_id);
        let request_id = self.send_request(Payload::ConnectPlease { host_id }, Instant::now());
        if let Some(request_id) = request_id {
            self.pending_connect = Some(request_id);
        }
        Ok(())
    }

    /// Poll the transport for one datagram, then run resends and pings.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    pub fn update_at(&mut self, now: Instant) {
        let mut buf = std::mem::take(&mut self.recv_buf);
        match self.transport.try_recv_from(&mut buf) {
            Ok(Some((len, from))) => {
                if !self.test_packet(&buf[..len], from) {
                    log::trace!("Ignoring {} byte datagram from {}", len, from);
                }
            }
            Ok(None) => {}
            Err(e) => log::debug!("Receive error: {}", e),
        }
        self.recv_buf = buf;

        self.handle_resends_at(now);
    }

    /// Handle `data` if it came from the rendezvous server. Returns false for
    /// traffic that belongs to someone else.
    pub fn test_packet(&mut self, data: &[u8], from: SocketAddr) -> bool {
        let server = match self.server_addr {
            Some(addr) => addr,
            None => return false,
        };
        if InetAddress::from(from) != InetAddress::from(server) {
            return false;
        }

        match Packet::decode(data) {
            Ok(packet) => {
                self.handle_server_packet(packet);
                true
            }
            Err(e) => {
                log::error!("Received bad packet from traversal server: {}", e);
                false
            }
        }
    }

    /// Resend overdue requests and send a keepalive ping when due.
    pub fn handle_resends(&mut self) {
        self.handle_resends_at(Instant::now());
    }

    pub fn handle_resends_at(&mut self, now: Instant) {
        for action in self.outgoing.due(now) {
            match action {
                Resend::Send { dest, packet } => {
                    log::debug!("Resending {} (id={:#018x})", packet.kind(), packet.request_id);
                    if !self.send_packet(&packet, dest) {
                        return;
                    }
                }
                Resend::Expired(request) => {
                    log::warn!(
                        "{} (id={:#018x}) was never acknowledged",
                        request.packet.kind(),
                        request.request_id()
                    );
                    self.fail(FailureReason::ResendTimeout);
                    return;
                }
            }
        }

        self.handle_ping(now);
    }

    fn handle_ping(&mut self, now: Instant) {
        if !self.is_connected() {
            return;
        }
        let due = self
            .last_ping
            .map_or(true, |t| now.saturating_duration_since(t) >= PING_INTERVAL);
        if !due {
            return;
        }
        if let Some(host_id) = self.host_id {
            self.send_request(Payload::Ping { host_id }, now);
            self.last_ping = Some(now);
        }
    }

    fn handle_server_packet(&mut self, packet: Packet) {
        log::trace!(
            "Traversal packet {} (id={:#018x})",
            packet.kind(),
            packet.request_id
        );

        let mut ok = true;
        match packet.payload {
            Payload::Ack { ok: false } => {
                self.fail(FailureReason::ServerForgotAboutUs);
            }
            Payload::Ack { ok: true } => {
                self.outgoing.remove(packet.request_id);
            }
            Payload::HelloFromServer {
                ok: accepted,
                host_id,
                address,
            } => {
                if self.state == ClientState::Connecting {
                    if accepted {
                        log::info!("Connected to traversal server as {} ({})", host_id, address);
                        self.host_id = Some(host_id);
                        self.external_address = Some(address);
                        self.state = ClientState::Connected;
                        self.notify_state_changed();
                    } else {
                        self.fail(FailureReason::VersionTooOld);
                    }
                }
            }
            Payload::PleaseSendPacket { address } => {
                ok = self.punch(address);
            }
            Payload::ConnectReady {
                request_id,
                address,
            } => {
                if self.take_pending_connect(request_id) {
                    match address.to_socket_addr() {
                        Some(addr) => {
                            log::info!("Connect ready: host is at {}", addr);
                            self.with_handler(|h| h.on_connect_ready(addr));
                        }
                        None => {
                            log::warn!("ConnectReady carried an unusable address");
                            self.with_handler(|h| {
                                h.on_connect_failed(ConnectFailedReason::ClientFailure)
                            });
                        }
                    }
                }
            }
            Payload::ConnectFailed { request_id, reason } => {
                if self.take_pending_connect(request_id) {
                    log::warn!("Connect failed: {}", reason);
                    self.with_handler(|h| h.on_connect_failed(reason));
                }
            }
            Payload::Unknown { tag } => {
                log::warn!("Received unknown packet with type {}", tag);
            }
            Payload::Ping { .. }
            | Payload::HelloFromClient { .. }
            | Payload::ConnectPlease { .. } => {
                log::warn!("Unexpected {} from traversal server", packet.kind());
            }
        }

        if !packet.is_ack() {
            let server = match self.server_addr {
                Some(addr) => addr,
                None => return,
            };
            self.send_packet(&Packet::ack(packet.request_id, ok), server);
        }
    }

    /// Send the hole punch greeting to a peer. Not tracked; the peer is
    /// not expected to answer it.
    fn punch(&mut self, address: InetAddress) -> bool {
        let target = match address.to_socket_addr() {
            Some(addr) => addr,
            None => {
                log::warn!("PleaseSendPacket with unusable address");
                return false;
            }
        };

        match self.transport.send_to(&HOLE_PUNCH_GREETING, target) {
            Ok(_) => {
                log::debug!("Sent hole punch greeting to {}", target);
                true
            }
            Err(e) => {
                log::warn!("Failed to send hole punch greeting to {}: {}", target, e);
                false
            }
        }
    }

    fn take_pending_connect(&mut self, request_id: u64) -> bool {
        if self.pending_connect == Some(request_id) {
            self.pending_connect = None;
            true
        } else {
            false
        }
    }

    /// Send a tracked request to the server. Returns its request ID, or None
    /// if the server is unknown or the send failed.
    fn send_request(&mut self, payload: Payload, now: Instant) -> Option<u64> {
        let server = self.server_addr?;
        let packet = Packet::new(generate_request_id(&self.rng), payload);

        self.outgoing.push(OutgoingRequest::new(packet, server, (), now));
        if self.send_packet(&packet, server) {
            Some(packet.request_id)
        } else {
            None
        }
    }

    /// Any local send error ends the session.
    fn send_packet(&mut self, packet: &Packet, dest: SocketAddr) -> bool {
        match self.transport.send_to(&packet.encode(), dest) {
            Ok(_) => true,
            Err(e) => {
                log::error!("Failed to send {} to {}: {}", packet.kind(), dest, e);
                self.fail(FailureReason::SocketSendError);
                false
            }
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        if self.has_failed() {
            return;
        }
        log::error!("Traversal session failed: {}", reason);
        self.state = ClientState::Failure(reason);
        self.outgoing.clear();
        self.pending_connect = None;
        self.notify_state_changed();
    }

    fn notify_state_changed(&mut self) {
        let state = self.state;
        self.with_handler(|h| h.on_state_changed(state));
    }

    fn with_handler(&mut self, f: impl FnOnce(&mut dyn TraversalHandler)) {
        if let Some(handler) = self.handler.as_deref_mut() {
            f(handler);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
