//! Traversal packet wire format
//!
//! Every packet exchanged between a client and the rendezvous server has the
//! same fixed size, whatever its type, so the payload is a union sized for
//! its largest variant.
//!
//! # Layout
//!
//! ```text
//! +------+----------------+----------------------------------------+
//! | Type | Request ID     | Payload (union, 28 bytes)              |
//! | (1)  | (8, BE)        |                                        |
//! +------+----------------+----------------------------------------+
//!
//! Address descriptor (19 bytes):
//! +---------+-------------------------------+-------------+
//! | is_ipv6 | Address (16 bytes)            | Port (2,BE) |
//! +---------+-------------------------------+-------------+
//!
//! Total: 37 bytes
//! ```
//!
//! All multi-byte integers are big-endian. IPv4 addresses occupy the first
//! four bytes of the address field and the rest is zero.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version spoken by this crate. The server accepts any client
/// version less than or equal to its own.
pub const PROTOCOL_VERSION: u8 = 0;

/// Length of a host identity token
pub const HOST_ID_LEN: usize = 8;

/// Length of an encoded address descriptor
pub const ADDRESS_LEN: usize = 19;

/// Type byte + request ID
const HEADER_LEN: usize = 9;

/// Size of the payload union (HelloFromServer is the largest variant)
const PAYLOAD_LEN: usize = 1 + HOST_ID_LEN + ADDRESS_LEN;

/// Size of every traversal packet on the wire
pub const PACKET_SIZE: usize = HEADER_LEN + PAYLOAD_LEN;

/// Datagram a client sends straight at a peer to open its own NAT mapping.
pub const HOLE_PUNCH_GREETING: [u8; 1] = [0];

/// Wire tags
const TYPE_ACK: u8 = 0;
const TYPE_PING: u8 = 1;
const TYPE_HELLO_FROM_CLIENT: u8 = 2;
const TYPE_HELLO_FROM_SERVER: u8 = 3;
const TYPE_CONNECT_PLEASE: u8 = 4;
const TYPE_PLEASE_SEND_PACKET: u8 = 5;
const TYPE_CONNECT_READY: u8 = 6;
const TYPE_CONNECT_FAILED: u8 = 7;

/// Returns true if the datagram is a hole punch greeting from a peer.
pub fn is_hole_punch(data: &[u8]) -> bool {
    data == HOLE_PUNCH_GREETING
}

// ============================================================================
// Errors
// ============================================================================

/// Packet decode errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer shorter than [`PACKET_SIZE`] (actual length)
    TooShort(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort(len) => write!(
                f,
                "traversal packet too short: {} bytes (expected {})",
                len, PACKET_SIZE
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Host ID parse errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostIdError {
    /// Token longer than [`HOST_ID_LEN`] bytes (actual length)
    TooLong(usize),
}

impl fmt::Display for HostIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostIdError::TooLong(len) => write!(
                f,
                "host ID is {} bytes, at most {} allowed",
                len, HOST_ID_LEN
            ),
        }
    }
}

impl std::error::Error for HostIdError {}

// ============================================================================
// Host ID
// ============================================================================

/// Short opaque token a client is known by while it keeps pinging the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HostId([u8; HOST_ID_LEN]);

impl HostId {
    pub const fn from_bytes(bytes: [u8; HOST_ID_LEN]) -> Self {
        HostId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HOST_ID_LEN] {
        &self.0
    }
}

impl FromStr for HostId {
    type Err = HostIdError;

    /// Shorter tokens are zero padded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > HOST_ID_LEN {
            return Err(HostIdError::TooLong(s.len()));
        }
        let mut bytes = [0u8; HOST_ID_LEN];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(HostId(bytes))
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(HOST_ID_LEN);
        f.write_str(&String::from_utf8_lossy(&self.0[..end]))
    }
}

// ============================================================================
// Address Descriptor
// ============================================================================

/// Wire representation of a UDP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InetAddress {
    pub is_ipv6: bool,
    pub address: [u8; 16],
    pub port: u16,
}

impl InetAddress {
    /// Convert to a socket address. Port 0 means the descriptor is unusable.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        if self.port == 0 {
            return None;
        }
        let ip = if self.is_ipv6 {
            IpAddr::V6(Ipv6Addr::from(self.address))
        } else {
            let a = &self.address;
            IpAddr::V4(Ipv4Addr::new(a[0], a[1], a[2], a[3]))
        };
        Some(SocketAddr::new(ip, self.port))
    }

    fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = self.is_ipv6 as u8;
        buf[1..17].copy_from_slice(&self.address);
        buf[17..19].copy_from_slice(&self.port.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        let mut address = [0u8; 16];
        address.copy_from_slice(&buf[1..17]);
        InetAddress {
            is_ipv6: buf[0] != 0,
            address,
            port: u16::from_be_bytes([buf[17], buf[18]]),
        }
    }
}

impl From<SocketAddr> for InetAddress {
    /// IPv4-mapped IPv6 addresses (dual-stack sockets) become plain IPv4.
    fn from(addr: SocketAddr) -> Self {
        let v4_bytes = |v4: Ipv4Addr| {
            let mut address = [0u8; 16];
            address[..4].copy_from_slice(&v4.octets());
            address
        };
        let (is_ipv6, address) = match addr.ip() {
            IpAddr::V4(v4) => (false, v4_bytes(v4)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => (false, v4_bytes(v4)),
                None => (true, v6.octets()),
            },
        };
        InetAddress {
            is_ipv6,
            address,
            port: addr.port(),
        }
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("<unresolvable>"),
        }
    }
}

// ============================================================================
// Connect Failure Reasons
// ============================================================================

/// Why the server could not set up a connection to the requested host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailedReason {
    /// Target never acknowledged the hole punch instruction
    ClientDidntRespond,
    /// Target acknowledged with `ok = false`
    ClientFailure,
    /// Host ID unknown to the server
    NoSuchClient,
    /// Reason code this version does not know
    Unknown(u8),
}

impl ConnectFailedReason {
    fn to_wire(self) -> u8 {
        match self {
            ConnectFailedReason::ClientDidntRespond => 0,
            ConnectFailedReason::ClientFailure => 1,
            ConnectFailedReason::NoSuchClient => 2,
            ConnectFailedReason::Unknown(code) => code,
        }
    }

    fn from_wire(code: u8) -> Self {
        match code {
            0 => ConnectFailedReason::ClientDidntRespond,
            1 => ConnectFailedReason::ClientFailure,
            2 => ConnectFailedReason::NoSuchClient,
            other => ConnectFailedReason::Unknown(other),
        }
    }
}

impl fmt::Display for ConnectFailedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailedReason::ClientDidntRespond => {
                f.write_str("traversal server timed out connecting to the host")
            }
            ConnectFailedReason::ClientFailure => {
                f.write_str("host rejected the traversal attempt")
            }
            ConnectFailedReason::NoSuchClient => f.write_str("no such host"),
            ConnectFailedReason::Unknown(code) => write!(f, "unknown error {:#x}", code),
        }
    }
}

// ============================================================================
// Packet
// ============================================================================

/// Type-dependent packet contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    Ack {
        ok: bool,
    },
    Ping {
        host_id: HostId,
    },
    HelloFromClient {
        proto_version: u8,
    },
    HelloFromServer {
        ok: bool,
        host_id: HostId,
        address: InetAddress,
    },
    ConnectPlease {
        host_id: HostId,
    },
    PleaseSendPacket {
        address: InetAddress,
    },
    ConnectReady {
        request_id: u64,
        address: InetAddress,
    },
    ConnectFailed {
        request_id: u64,
        reason: ConnectFailedReason,
    },
    /// Type tag this version does not understand; the payload is ignored.
    Unknown {
        tag: u8,
    },
}

/// A traversal packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub request_id: u64,
    pub payload: Payload,
}

impl Packet {
    pub fn new(request_id: u64, payload: Payload) -> Self {
        Packet {
            request_id,
            payload,
        }
    }

    /// Build the acknowledgment for a received request
    pub fn ack(request_id: u64, ok: bool) -> Self {
        Packet::new(request_id, Payload::Ack { ok })
    }

    pub fn is_ack(&self) -> bool {
        matches!(self.payload, Payload::Ack { .. })
    }

    /// Short type name for logging
    pub fn kind(&self) -> &'static str {
        match self.payload {
            Payload::Ack { .. } => "Ack",
            Payload::Ping { .. } => "Ping",
            Payload::HelloFromClient { .. } => "HelloFromClient",
            Payload::HelloFromServer { .. } => "HelloFromServer",
            Payload::ConnectPlease { .. } => "ConnectPlease",
            Payload::PleaseSendPacket { .. } => "PleaseSendPacket",
            Payload::ConnectReady { .. } => "ConnectReady",
            Payload::ConnectFailed { .. } => "ConnectFailed",
            Payload::Unknown { .. } => "Unknown",
        }
    }

    /// Encode to the fixed wire layout. Unused payload bytes are zero.
    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        buf[1..HEADER_LEN].copy_from_slice(&self.request_id.to_be_bytes());
        let body = &mut buf[HEADER_LEN..];

        let tag = match self.payload {
            Payload::Ack { ok } => {
                body[0] = ok as u8;
                TYPE_ACK
            }
            Payload::Ping { host_id } => {
                body[..HOST_ID_LEN].copy_from_slice(host_id.as_bytes());
                TYPE_PING
            }
            Payload::HelloFromClient { proto_version } => {
                body[0] = proto_version;
                TYPE_HELLO_FROM_CLIENT
            }
            Payload::HelloFromServer {
                ok,
                host_id,
                address,
            } => {
                body[0] = ok as u8;
                body[1..1 + HOST_ID_LEN].copy_from_slice(host_id.as_bytes());
                address.encode_into(&mut body[1 + HOST_ID_LEN..]);
                TYPE_HELLO_FROM_SERVER
            }
            Payload::ConnectPlease { host_id } => {
                body[..HOST_ID_LEN].copy_from_slice(host_id.as_bytes());
                TYPE_CONNECT_PLEASE
            }
            Payload::PleaseSendPacket { address } => {
                address.encode_into(body);
                TYPE_PLEASE_SEND_PACKET
            }
            Payload::ConnectReady {
                request_id,
                address,
            } => {
                body[..8].copy_from_slice(&request_id.to_be_bytes());
                address.encode_into(&mut body[8..]);
                TYPE_CONNECT_READY
            }
            Payload::ConnectFailed { request_id, reason } => {
                body[..8].copy_from_slice(&request_id.to_be_bytes());
                body[8] = reason.to_wire();
                TYPE_CONNECT_FAILED
            }
            Payload::Unknown { tag } => tag,
        };
        buf[0] = tag;

        buf
    }

    /// Decode from a received datagram. Bytes past [`PACKET_SIZE`] are ignored.
    pub fn decode(buf: &[u8]) -> Result<Packet, DecodeError> {
        if buf.len() < PACKET_SIZE {
            return Err(DecodeError::TooShort(buf.len()));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[1..HEADER_LEN]);
        let request_id = u64::from_be_bytes(id);
        let body = &buf[HEADER_LEN..PACKET_SIZE];

        let host_id_at = |offset: usize| {
            let mut bytes = [0u8; HOST_ID_LEN];
            bytes.copy_from_slice(&body[offset..offset + HOST_ID_LEN]);
            HostId::from_bytes(bytes)
        };
        let u64_at = |offset: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&body[offset..offset + 8]);
            u64::from_be_bytes(bytes)
        };

        let payload = match buf[0] {
            TYPE_ACK => Payload::Ack { ok: body[0] != 0 },
            TYPE_PING => Payload::Ping {
                host_id: host_id_at(0),
            },
            TYPE_HELLO_FROM_CLIENT => Payload::HelloFromClient {
                proto_version: body[0],
            },
            TYPE_HELLO_FROM_SERVER => Payload::HelloFromServer {
                ok: body[0] != 0,
                host_id: host_id_at(1),
                address: InetAddress::decode(&body[1 + HOST_ID_LEN..]),
            },
            TYPE_CONNECT_PLEASE => Payload::ConnectPlease {
                host_id: host_id_at(0),
            },
            TYPE_PLEASE_SEND_PACKET => Payload::PleaseSendPacket {
                address: InetAddress::decode(body),
            },
            TYPE_CONNECT_READY => Payload::ConnectReady {
                request_id: u64_at(0),
                address: InetAddress::decode(&body[8..]),
            },
            TYPE_CONNECT_FAILED => Payload::ConnectFailed {
                request_id: u64_at(0),
                reason: ConnectFailedReason::from_wire(body[8]),
            },
            tag => Payload::Unknown { tag },
        };

        Ok(Packet {
            request_id,
            payload,
        })
    }
}
