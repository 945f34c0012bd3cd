//! MANET data plane: packet model, SAR segment codec, identity registry and relay engine.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod config;
pub mod connection;
pub mod core;
pub mod crypto;
pub mod identity;
pub mod listener;
pub mod packet;
pub mod planner;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod segment;
pub mod segmenter;
pub mod serial;
pub mod stream;
pub mod transport;
pub mod wire;

pub use crate::config::{CoreConfig, SdrConfig};
pub use crate::connection::{ConnectionError, ConnectionId, LinkRole, RemoteId};
pub use crate::core::{LocalIdentity, MeshCore, OutboundAction};
pub use crate::crypto::{PassThrough, PassphraseCipher, PayloadCipher};
pub use crate::identity::{Device, DeviceStatus, MacAddress, NodeRole, SavedTeammate};
pub use crate::listener::{MeshError, MeshListener};
pub use crate::packet::{
    Address, DecodeError, Packet, PacketHeader, ParseAddressError, MAX_HOP_COUNT,
};
pub use crate::protocol::{Payload, PROTOCOL_VERSION};
pub use crate::transport::TransportKind;
pub use crate::wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
