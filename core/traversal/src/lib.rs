//! UDP rendezvous and hole punching
//!
//! This crate provides both halves of a small rendezvous protocol:
//! - A fixed-size packet codec shared by clients and the server
//! - A client agent that registers with a server, keeps its host ID alive
//!   and requests introductions to other hosts
//! - A socket-free server state machine that assigns host IDs and brokers
//!   hole punching between them
//!
//! Every packet except `Ack` is acknowledged and retried until it is, so the
//! protocol tolerates loss without a connection layer underneath.

// ============================================================================
// Modules
// ============================================================================

pub mod client;
pub mod expiring;
pub mod outgoing;
pub mod packet;
pub mod server;
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{ClientState, FailureReason, TraversalClient, TraversalHandler, PING_INTERVAL};
pub use expiring::ExpiringMap;
pub use packet::{
    is_hole_punch, ConnectFailedReason, DecodeError, HostId, HostIdError, InetAddress, Packet,
    Payload, HOLE_PUNCH_GREETING, PACKET_SIZE, PROTOCOL_VERSION,
};
pub use server::{ServerStats, TraversalServer, DEFAULT_PORT};
pub use transport::Transport;
