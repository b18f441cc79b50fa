//! Retransmission bookkeeping for unacknowledged requests
//!
//! Both the client and the server keep every packet they expect an `Ack`
//! for. A request is resent once `RESEND_INTERVAL × tries` has passed since
//! its last send, so attempts are spaced 300/600/900/1200ms apart and the
//! request gives up 1500ms after the fifth try.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ring::rand::SecureRandom;

use crate::packet::Packet;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of sends per request
pub const MAX_TRIES: u32 = 5;

/// Base resend interval, multiplied by the try count
pub const RESEND_INTERVAL: Duration = Duration::from_millis(300);

// ============================================================================
// Request IDs
// ============================================================================

/// Generate a random request ID
pub fn generate_request_id(rng: &dyn SecureRandom) -> u64 {
    let mut bytes = [0u8; 8];
    if rng.fill(&mut bytes).is_ok() {
        return u64::from_be_bytes(bytes);
    }

    // Timestamp mixed with the process ID if the system RNG is unavailable
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    nanos ^ ((std::process::id() as u64) << 32)
}

// ============================================================================
// Outgoing Request
// ============================================================================

/// A sent packet awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct OutgoingRequest<M = ()> {
    pub packet: Packet,
    pub dest: SocketAddr,
    /// Number of times the packet has been sent
    pub tries: u32,
    pub last_send: Instant,
    /// Owner-specific context (the server keeps the requester's request ID)
    pub meta: M,
}

impl<M> OutgoingRequest<M> {
    /// A request that is being sent for the first time at `now`
    pub fn new(packet: Packet, dest: SocketAddr, meta: M, now: Instant) -> Self {
        Self {
            packet,
            dest,
            tries: 1,
            last_send: now,
            meta,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.packet.request_id
    }

    /// Whether the backoff interval for the current try has elapsed
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_send) >= RESEND_INTERVAL * self.tries
    }
}

/// Outcome of a resend scan for one request
#[derive(Debug)]
pub enum Resend<M> {
    /// Send the packet again
    Send { dest: SocketAddr, packet: Packet },
    /// Tries exhausted; the request has been removed
    Expired(OutgoingRequest<M>),
}

// ============================================================================
// Request Table
// ============================================================================

/// Outstanding requests in the order they were first sent
#[derive(Debug)]
pub struct OutgoingRequests<M = ()> {
    requests: Vec<OutgoingRequest<M>>,
}

impl<M> OutgoingRequests<M> {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
        }
    }

    pub fn push(&mut self, request: OutgoingRequest<M>) {
        self.requests.push(request);
    }

    /// Remove the request matching an acknowledgment
    pub fn remove(&mut self, request_id: u64) -> Option<OutgoingRequest<M>> {
        let index = self
            .requests
            .iter()
            .position(|r| r.request_id() == request_id)?;
        Some(self.requests.remove(index))
    }

    /// Walk every request and collect what is due at `now`.
    ///
    /// Requests that are due get their try count bumped and are returned as
    /// [`Resend::Send`]; requests that already used [`MAX_TRIES`] are removed
    /// and returned as [`Resend::Expired`].
    pub fn due(&mut self, now: Instant) -> Vec<Resend<M>> {
        let mut actions = Vec::new();
        let mut i = 0;

        while i < self.requests.len() {
            let request = &mut self.requests[i];
            if !request.is_due(now) {
                i += 1;
                continue;
            }

            if request.tries >= MAX_TRIES {
                actions.push(Resend::Expired(self.requests.remove(i)));
                continue;
            }

            request.tries += 1;
            request.last_send = now;
            actions.push(Resend::Send {
                dest: request.dest,
                packet: request.packet,
            });
            i += 1;
        }

        actions
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl<M> Default for OutgoingRequests<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Payload;
    use ring::rand::SystemRandom;

    fn request(id: u64, now: Instant) -> OutgoingRequest {
        let packet = Packet::new(id, Payload::HelloFromClient { proto_version: 0 });
        OutgoingRequest::new(packet, "127.0.0.1:6262".parse().unwrap(), (), now)
    }

    fn sends(actions: &[Resend<()>]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Resend::Send { .. }))
            .count()
    }

    #[test]
    fn test_backoff_schedule() {
        let start = Instant::now();
        let mut table = OutgoingRequests::new();
        table.push(request(1, start));

        // Resends at +300, +900, +1800, +3000 (300ms × tries after each send)
        let mut t = start;
        for (step, wait) in [300u64, 600, 900, 1200].iter().enumerate() {
            assert_eq!(sends(&table.due(t + Duration::from_millis(wait - 1))), 0);
            t += Duration::from_millis(*wait);
            assert_eq!(sends(&table.due(t)), 1, "resend {}", step + 2);
        }
        assert_eq!(table.requests[0].tries, MAX_TRIES);

        // Fifth try gets 1500ms before the request is dropped
        assert!(table.due(t + Duration::from_millis(1499)).is_empty());
        let actions = table.due(t + Duration::from_millis(1500));
        assert!(matches!(actions.as_slice(), [Resend::Expired(r)] if r.request_id() == 1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_acknowledged() {
        let now = Instant::now();
        let mut table = OutgoingRequests::new();
        table.push(request(1, now));
        table.push(request(2, now));

        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.due(now + Duration::from_secs(1)).len() == 1);
    }

    #[test]
    fn test_request_ids_differ() {
        let rng = SystemRandom::new();
        let a = generate_request_id(&rng);
        let b = generate_request_id(&rng);
        assert_ne!(a, b);
    }
}
