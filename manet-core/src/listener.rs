//! Event sink the host injects into the core. All methods default to no-ops.

use crate::connection::{ConnectionError, ConnectionId, RemoteId};
use crate::packet::Packet;
use crate::stream::DropReason;
use crate::transport::TransportKind;

pub trait MeshListener: Send {
    fn on_connected(&mut self, _id: ConnectionId, _transport: TransportKind, _remote: &RemoteId) {}

    fn on_closed(&mut self, _id: ConnectionId, _transport: TransportKind) {}

    /// A packet addressed to this node.
    fn on_packet(&mut self, _packet: &Packet) {}

    fn on_error(&mut self, _id: Option<ConnectionId>, _error: &MeshError) {}

    fn on_packet_dropped(&mut self, _transport: TransportKind, _reason: DropReason) {}

    fn on_high_noise(&mut self, _transport: TransportKind, _good: u64, _bad: u64) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default)]
pub struct NullListener;

impl MeshListener for NullListener {}

/// Errors reported to the listener; none of them stop the core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Identity(#[from] crate::registry::IdentityError),
    #[error(transparent)]
    Decode(#[from] crate::packet::DecodeError),
    #[error(transparent)]
    Frame(#[from] crate::wire::FrameDecodeError),
    #[error(transparent)]
    Cipher(#[from] crate::crypto::CipherError),
}
