//! Packet kinds and their bodies.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{MacAddress, NodeRole};
use crate::packet::Address;
use crate::transport::TransportKind;

/// Version carried in detailed heartbeats.
pub const PROTOCOL_VERSION: u8 = 1;

/// Ping body value meaning "request, not yet answered".
const PING_REQUEST: u64 = u64::MAX;

/// Wire kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Heartbeat,
    Ping,
    RawBytes,
    ChannelBytes,
    Vpn,
    Disconnecting,
    Unknown(u8),
}

impl PacketKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => PacketKind::Heartbeat,
            1 => PacketKind::Ping,
            2 => PacketKind::RawBytes,
            3 => PacketKind::ChannelBytes,
            4 => PacketKind::Vpn,
            5 => PacketKind::Disconnecting,
            other => PacketKind::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            PacketKind::Heartbeat => 0,
            PacketKind::Ping => 1,
            PacketKind::RawBytes => 2,
            PacketKind::ChannelBytes => 3,
            PacketKind::Vpn => 4,
            PacketKind::Disconnecting => 5,
            PacketKind::Unknown(b) => b,
        }
    }

    /// Mesh housekeeping traffic, never handed to the application.
    pub fn is_admin(self) -> bool {
        matches!(
            self,
            PacketKind::Heartbeat | PacketKind::Ping | PacketKind::Disconnecting
        )
    }
}

/// One entry of a node's relay table as advertised in its heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEntry {
    pub address: Address,
    pub hops: u8,
    pub last_contact_ms: u64,
}

/// Detailed heartbeat body (bincode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatBody {
    pub version: u8,
    pub callsign: Option<String>,
    pub extended_id: Option<Uuid>,
    pub macs: Vec<(TransportKind, MacAddress)>,
    pub roles: Vec<(TransportKind, NodeRole)>,
    pub relays: Vec<RelayEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `None` is a basic heartbeat with no detail.
    Heartbeat(Option<HeartbeatBody>),
    /// `midpoint_ms` is set by the node answering the ping.
    Ping { midpoint_ms: Option<u64> },
    RawBytes(Vec<u8>),
    ChannelBytes {
        channel: Option<String>,
        data: Vec<u8>,
    },
    Vpn(Vec<u8>),
    Disconnecting,
    Unknown { kind: u8, body: Vec<u8> },
}

impl Payload {
    pub fn kind(&self) -> PacketKind {
        match self {
            Payload::Heartbeat(_) => PacketKind::Heartbeat,
            Payload::Ping { .. } => PacketKind::Ping,
            Payload::RawBytes(_) => PacketKind::RawBytes,
            Payload::ChannelBytes { .. } => PacketKind::ChannelBytes,
            Payload::Vpn(_) => PacketKind::Vpn,
            Payload::Disconnecting => PacketKind::Disconnecting,
            Payload::Unknown { kind, .. } => PacketKind::Unknown(*kind),
        }
    }

    pub(crate) fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Payload::Heartbeat(None) | Payload::Disconnecting => {}
            Payload::Heartbeat(Some(body)) => match bincode::serialize(body) {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(e) => tracing::warn!(error = %e, "heartbeat detail not encodable; sending basic"),
            },
            Payload::Ping { midpoint_ms } => {
                out.extend_from_slice(&midpoint_ms.unwrap_or(PING_REQUEST).to_be_bytes());
            }
            Payload::RawBytes(data) | Payload::Vpn(data) => out.extend_from_slice(data),
            Payload::ChannelBytes { channel, data } => {
                let name = channel.as_deref().unwrap_or("").as_bytes();
                out.extend_from_slice(&(name.len() as u32).to_be_bytes());
                out.extend_from_slice(name);
                out.extend_from_slice(data);
            }
            Payload::Unknown { body, .. } => out.extend_from_slice(body),
        }
    }

    pub(crate) fn decode_body(kind: PacketKind, body: &[u8]) -> Payload {
        match kind {
            PacketKind::Heartbeat => {
                if body.is_empty() {
                    return Payload::Heartbeat(None);
                }
                match bincode::deserialize::<HeartbeatBody>(body) {
                    Ok(detail) => Payload::Heartbeat(Some(detail)),
                    Err(e) => {
                        tracing::debug!(error = %e, "unreadable heartbeat detail");
                        Payload::Heartbeat(None)
                    }
                }
            }
            PacketKind::Ping => {
                let midpoint_ms = body
                    .get(..8)
                    .map(|b| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(b);
                        u64::from_be_bytes(raw)
                    })
                    .filter(|&v| v != PING_REQUEST);
                Payload::Ping { midpoint_ms }
            }
            PacketKind::RawBytes => Payload::RawBytes(body.to_vec()),
            PacketKind::ChannelBytes => decode_channel_bytes(body),
            PacketKind::Vpn => Payload::Vpn(body.to_vec()),
            PacketKind::Disconnecting => Payload::Disconnecting,
            PacketKind::Unknown(kind) => Payload::Unknown {
                kind,
                body: body.to_vec(),
            },
        }
    }
}

fn decode_channel_bytes(body: &[u8]) -> Payload {
    let whole = || Payload::ChannelBytes {
        channel: None,
        data: body.to_vec(),
    };
    if body.len() < 4 {
        return whole();
    }
    let len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let rest = &body[4..];
    if len > rest.len() {
        return whole();
    }
    let channel = match std::str::from_utf8(&rest[..len]) {
        Ok(s) if !s.is_empty() => Some(s.to_string()),
        Ok(_) => None,
        Err(_) => return whole(),
    };
    Payload::ChannelBytes {
        channel,
        data: rest[len..].to_vec(),
    }
}
