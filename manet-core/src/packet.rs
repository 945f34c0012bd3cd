//! Relay packet model: addressing, the fixed header, encode/decode and hop accounting.
//!
//! Header layout (big-endian, 19 bytes):
//! `origin u32 | destination u32 | kind u8 | hop_count u8 | flags u8 | time_ms u64`
//! followed by the kind-specific body (see [`crate::protocol`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::{PacketKind, Payload};

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 19;

/// Relays allowed before a packet is dropped.
pub const MAX_HOP_COUNT: u8 = 4;

const FLAG_LOSSY_OK: u8 = 0x01;
const FLAG_HIGH_PERFORMANCE: u8 = 0x02;

/// Node or destination address.
///
/// `0` is unassigned, `u32::MAX` is broadcast. Values with the top bit clear are node
/// addresses; `0x8000_0000 | block` with `block <= 0x7FFF` is a group address covering every
/// node whose upper 16 bits equal `block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u32);

impl Address {
    pub const UNASSIGNED: Address = Address(0);
    pub const BROADCAST: Address = Address(u32::MAX);

    const GROUP_BIT: u32 = 0x8000_0000;
    const MAX_BLOCK: u32 = 0x7FFF;

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// True for an assignable node address (non-zero, not broadcast or group).
    pub fn is_node(self) -> bool {
        self.0 != 0 && self.0 & Self::GROUP_BIT == 0
    }

    pub fn is_group(self) -> bool {
        self.0 & Self::GROUP_BIT != 0 && self.0 & !Self::GROUP_BIT <= Self::MAX_BLOCK
    }

    /// Group address for an explicit block. `None` if the block is out of range.
    pub fn group(block: u16) -> Option<Address> {
        if u32::from(block) > Self::MAX_BLOCK {
            return None;
        }
        Some(Address(Self::GROUP_BIT | u32::from(block)))
    }

    /// Group address covering `node`.
    pub fn group_of(node: Address) -> Address {
        Address(Self::GROUP_BIT | ((node.0 >> 16) & Self::MAX_BLOCK))
    }

    /// Whether a packet sent to `self` should reach `node`.
    pub fn applies_to(self, node: Address) -> bool {
        if self.is_broadcast() {
            return true;
        }
        if !node.is_node() {
            return false;
        }
        if self == node {
            return true;
        }
        self.is_group() && self.0 & !Self::GROUP_BIT == node.0 >> 16
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else if self.is_group() {
            write!(f, "group:{}", self.0 & !Self::GROUP_BIT)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address: {0}")]
pub struct ParseAddressError(String);

/// Accepts the display forms: a node number, `broadcast` or `group:<block>`.
impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = || ParseAddressError(s.to_string());
        if s.eq_ignore_ascii_case("broadcast") {
            return Ok(Address::BROADCAST);
        }
        if let Some(block) = s.strip_prefix("group:") {
            let block = block.parse().map_err(|_| err())?;
            return Address::group(block).ok_or_else(err);
        }
        let node = Address(s.parse().map_err(|_| err())?);
        if node.is_node() {
            Ok(node)
        } else {
            Err(err())
        }
    }
}

/// Fixed packet header. Only `hop_count` changes after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub origin: Address,
    pub destination: Address,
    pub hop_count: u8,
    /// Packet may be skipped on congested links.
    pub lossy_ok: bool,
    /// Packet must not fall back to a slower transport.
    pub high_performance: bool,
    /// Creation time at the origin (unix ms).
    pub time_ms: u64,
}

/// Header plus kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Payload,
}

impl Packet {
    pub fn new(origin: Address, destination: Address, payload: Payload, time_ms: u64) -> Self {
        Self {
            header: PacketHeader {
                origin,
                destination,
                hop_count: 0,
                lossy_ok: false,
                high_performance: false,
                time_ms,
            },
            payload,
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.payload.kind()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + 32);
        out.extend_from_slice(&self.header.origin.0.to_be_bytes());
        out.extend_from_slice(&self.header.destination.0.to_be_bytes());
        out.push(self.kind().as_byte());
        out.push(self.header.hop_count);
        let mut flags = 0u8;
        if self.header.lossy_ok {
            flags |= FLAG_LOSSY_OK;
        }
        if self.header.high_performance {
            flags |= FLAG_HIGH_PERFORMANCE;
        }
        out.push(flags);
        out.extend_from_slice(&self.header.time_ms.to_be_bytes());
        self.payload.encode_body(&mut out);
        out
    }

    /// Decode a packet. Every byte sequence of at least [`HEADER_LEN`] bytes decodes; body
    /// problems degrade the payload instead of failing.
    pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Malformed("truncated header"));
        }
        let origin = Address(read_u32(&bytes[0..4]));
        let destination = Address(read_u32(&bytes[4..8]));
        let kind = PacketKind::from_byte(bytes[8]);
        let hop_count = bytes[9];
        let flags = bytes[10];
        let mut time = [0u8; 8];
        time.copy_from_slice(&bytes[11..HEADER_LEN]);
        Ok(Packet {
            header: PacketHeader {
                origin,
                destination,
                hop_count,
                lossy_ok: flags & FLAG_LOSSY_OK != 0,
                high_performance: flags & FLAG_HIGH_PERFORMANCE != 0,
                time_ms: u64::from_be_bytes(time),
            },
            payload: Payload::decode_body(kind, &bytes[HEADER_LEN..]),
        })
    }

    /// Count one relay hop. Saturates instead of wrapping so the count never decreases.
    pub fn increment_hop(&mut self) {
        self.header.hop_count = self.header.hop_count.saturating_add(1);
    }

    /// True once the packet has been relayed `max_hops` times.
    pub fn exceeds_max_hops(&self, max_hops: u8) -> bool {
        self.header.hop_count >= max_hops
    }

    pub fn is_admin(&self) -> bool {
        self.kind().is_admin()
    }
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Error decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed: {0}")]
    Malformed(&'static str),
    #[error("length {len} outside 1..={max}")]
    SizeOutOfBounds { len: usize, max: usize },
}
