//! Rendezvous server state machine
//!
//! Hands out host IDs, remembers where each host was last seen, and brokers
//! introductions between hosts. The state machine owns no socket: the
//! caller feeds it datagrams via [`TraversalServer::handle_datagram`], drives
//! retries with [`TraversalServer::resend_packets`], and flushes whatever
//! [`TraversalServer::poll_transmit`] yields.
//!
//! # Introduction Flow
//!
//! ```text
//! A ──ConnectPlease(B)──► server ──PleaseSendPacket(addr A)──► B
//!                                                              │ greeting → A
//! A ◄──ConnectReady(addr B)── server ◄────────Ack──────────────┘
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ring::rand::{SecureRandom, SystemRandom};

use crate::expiring::{ExpiringMap, DEFAULT_TTL};
use crate::outgoing::{generate_request_id, OutgoingRequest, OutgoingRequests, Resend};
use crate::packet::{
    ConnectFailedReason, HostId, InetAddress, Packet, Payload, HOST_ID_LEN, PACKET_SIZE,
    PROTOCOL_VERSION,
};

/// Default UDP port for the rendezvous server
pub const DEFAULT_PORT: u16 = 6262;

// ============================================================================
// Statistics
// ============================================================================

/// Running counters since the server was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub datagrams_received: u64,
    /// Datagrams too short to be a packet
    pub datagrams_dropped: u64,
    pub hosts_registered: u64,
    pub version_rejections: u64,
    pub pings: u64,
    /// Pings for host IDs the server doesn't know
    pub unknown_pings: u64,
    pub connect_requests: u64,
    pub connects_ready: u64,
    pub connects_failed: u64,
    pub resends: u64,
    /// Requests dropped after exhausting their tries
    pub expired_requests: u64,
}

// ============================================================================
// Server Structure
// ============================================================================

/// Outgoing requests remember, for a PleaseSendPacket, the request ID of the
/// ConnectPlease that caused it.
type RequesterId = Option<u64>;

pub struct TraversalServer {
    /// Host ID → last observed address
    hosts: ExpiringMap<HostId, InetAddress>,
    /// Replies awaiting an Ack
    outgoing: OutgoingRequests<RequesterId>,
    /// Encoded packets ready to be sent
    transmit: VecDeque<(SocketAddr, [u8; PACKET_SIZE])>,
    rng: SystemRandom,
    stats: ServerStats,
}

impl TraversalServer {
    pub fn new() -> Self {
        Self::with_host_ttl(DEFAULT_TTL)
    }

    /// Server whose host registrations expire `ttl` after the last ping
    pub fn with_host_ttl(ttl: Duration) -> Self {
        Self {
            hosts: ExpiringMap::with_ttl(ttl),
            outgoing: OutgoingRequests::new(),
            transmit: VecDeque::new(),
            rng: SystemRandom::new(),
            stats: ServerStats::default(),
        }
    }

    /// Number of registered hosts (expired entries are swept on every
    /// lookup and every resend pass)
    pub fn registered_hosts(&self) -> usize {
        self.hosts.len()
    }

    /// Number of sent requests still waiting for an Ack
    pub fn outstanding_requests(&self) -> usize {
        self.outgoing.len()
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Next packet to put on the wire, if any
    pub fn poll_transmit(&mut self) -> Option<(SocketAddr, [u8; PACKET_SIZE])> {
        self.transmit.pop_front()
    }

    /// Decode and handle one received datagram. Short datagrams are dropped.
    pub fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        self.stats.datagrams_received += 1;

        match Packet::decode(data) {
            Ok(packet) => self.handle_packet(packet, from, now),
            Err(e) => {
                self.stats.datagrams_dropped += 1;
                log::debug!("Dropping datagram from {}: {}", from, e);
            }
        }
    }

    pub fn handle_packet(&mut self, packet: Packet, from: SocketAddr, now: Instant) {
        log::trace!(
            "{} from {} (id={:#018x})",
            packet.kind(),
            from,
            packet.request_id
        );

        let mut ok = true;
        match packet.payload {
            Payload::Ack { ok: acked } => {
                self.handle_ack(packet.request_id, acked, from, now);
            }
            Payload::Ping { host_id } => {
                self.stats.pings += 1;
                if self.hosts.find_at(&host_id, true, now).is_none() {
                    log::debug!("Ping from {} for unknown host {}", from, host_id);
                    self.stats.unknown_pings += 1;
                    ok = false;
                }
            }
            Payload::HelloFromClient { proto_version } => {
                self.handle_hello(proto_version, from, now);
            }
            Payload::ConnectPlease { host_id } => {
                self.handle_connect_please(packet.request_id, host_id, from, now);
            }
            Payload::Unknown { tag } => {
                log::warn!("Unknown packet type {} from {}", tag, from);
                ok = false;
            }
            Payload::HelloFromServer { .. }
            | Payload::PleaseSendPacket { .. }
            | Payload::ConnectReady { .. }
            | Payload::ConnectFailed { .. } => {
                log::warn!("Unexpected {} from {}", packet.kind(), from);
                ok = false;
            }
        }

        if !packet.is_ack() {
            self.queue(from, Packet::ack(packet.request_id, ok));
        }
    }

    /// Resend overdue replies. A PleaseSendPacket that is never acknowledged
    /// turns into ConnectFailed(ClientDidntRespond) for the requester.
    pub fn resend_packets(&mut self, now: Instant) {
        for action in self.outgoing.due(now) {
            match action {
                Resend::Send { dest, packet } => {
                    log::debug!(
                        "Resending {} to {} (id={:#018x})",
                        packet.kind(),
                        dest,
                        packet.request_id
                    );
                    self.stats.resends += 1;
                    self.queue(dest, packet);
                }
                Resend::Expired(request) => {
                    self.stats.expired_requests += 1;
                    log::debug!(
                        "{} to {} was never acknowledged",
                        request.packet.kind(),
                        request.dest
                    );
                    if let (Payload::PleaseSendPacket { address }, Some(requester_id)) =
                        (request.packet.payload, request.meta)
                    {
                        self.connect_failed(
                            address,
                            requester_id,
                            ConnectFailedReason::ClientDidntRespond,
                            now,
                        );
                    }
                }
            }
        }

        let purged = self.hosts.purge_expired(now);
        if purged > 0 {
            log::debug!("Expired {} host registration(s)", purged);
        }
    }

    // ========================================================================
    // Packet Handlers
    // ========================================================================

    fn handle_ack(&mut self, request_id: u64, ok: bool, from: SocketAddr, now: Instant) {
        let request = match self.outgoing.remove(request_id) {
            Some(request) => request,
            None => return,
        };

        let (requester, requester_id) = match (request.packet.payload, request.meta) {
            (Payload::PleaseSendPacket { address }, Some(id)) => (address, id),
            _ => return,
        };

        if ok {
            let target = match requester.to_socket_addr() {
                Some(addr) => addr,
                None => return,
            };
            log::info!("Introducing {} to {}", target, from);
            self.stats.connects_ready += 1;
            self.send_request(
                target,
                Payload::ConnectReady {
                    request_id: requester_id,
                    address: InetAddress::from(from),
                },
                None,
                now,
            );
        } else {
            log::info!("{} refused to send a hole punch packet", from);
            self.connect_failed(
                requester,
                requester_id,
                ConnectFailedReason::ClientFailure,
                now,
            );
        }
    }

    fn handle_hello(&mut self, proto_version: u8, from: SocketAddr, now: Instant) {
        let address = InetAddress::from(from);

        let reply = if proto_version <= PROTOCOL_VERSION {
            let host_id = self.generate_host_id(now);
            self.hosts.insert_at(host_id, address, now);
            self.stats.hosts_registered += 1;
            log::info!("Registered host {} at {}", host_id, from);

            Payload::HelloFromServer {
                ok: true,
                host_id,
                address,
            }
        } else {
            log::warn!(
                "Rejecting {} with protocol version {} (ours is {})",
                from,
                proto_version,
                PROTOCOL_VERSION
            );
            self.stats.version_rejections += 1;

            Payload::HelloFromServer {
                ok: false,
                host_id: HostId::default(),
                address,
            }
        };

        self.send_request(from, reply, None, now);
    }

    fn handle_connect_please(
        &mut self,
        request_id: u64,
        host_id: HostId,
        from: SocketAddr,
        now: Instant,
    ) {
        self.stats.connect_requests += 1;
        let requester = InetAddress::from(from);

        let target = self
            .hosts
            .find_at(&host_id, false, now)
            .and_then(|a| a.to_socket_addr());

        match target {
            Some(target) => {
                log::info!("{} wants to connect to {} at {}", from, host_id, target);
                self.send_request(
                    target,
                    Payload::PleaseSendPacket { address: requester },
                    Some(request_id),
                    now,
                );
            }
            None => {
                log::info!("{} asked for unknown host {}", from, host_id);
                self.connect_failed(
                    requester,
                    request_id,
                    ConnectFailedReason::NoSuchClient,
                    now,
                );
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn connect_failed(
        &mut self,
        requester: InetAddress,
        requester_id: u64,
        reason: ConnectFailedReason,
        now: Instant,
    ) {
        let dest = match requester.to_socket_addr() {
            Some(addr) => addr,
            None => return,
        };
        self.stats.connects_failed += 1;
        self.send_request(
            dest,
            Payload::ConnectFailed {
                request_id: requester_id,
                reason,
            },
            None,
            now,
        );
    }

    /// Send a packet that will be retried until acknowledged
    fn send_request(
        &mut self,
        dest: SocketAddr,
        payload: Payload,
        meta: RequesterId,
        now: Instant,
    ) {
        let packet = Packet::new(generate_request_id(&self.rng), payload);
        self.outgoing.push(OutgoingRequest::new(packet, dest, meta, now));
        self.queue(dest, packet);
    }

    fn queue(&mut self, dest: SocketAddr, packet: Packet) {
        self.transmit.push_back((dest, packet.encode()));
    }

    /// Random 8 hex digit host ID not currently registered
    fn generate_host_id(&mut self, now: Instant) -> HostId {
        let rng = self.rng.clone();
        self.unused_host_id(
            || {
                let mut bytes = [0u8; 4];
                match rng.fill(&mut bytes) {
                    Ok(()) => u32::from_be_bytes(bytes),
                    Err(_) => generate_request_id(&rng) as u32,
                }
            },
            now,
        )
    }

    /// Draw tokens from `next` until one is free
    fn unused_host_id(&mut self, mut next: impl FnMut() -> u32, now: Instant) -> HostId {
        loop {
            let host_id = host_id_from_token(next());
            if !self.hosts.contains_key_at(&host_id, now) {
                return host_id;
            }
            log::debug!("Host ID {} already taken, drawing another", host_id);
        }
    }
}

fn host_id_from_token(token: u32) -> HostId {
    let mut id = [0u8; HOST_ID_LEN];
    id.copy_from_slice(format!("{:08x}", token).as_bytes());
    HostId::from_bytes(id)
}

impl Default for TraversalServer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
