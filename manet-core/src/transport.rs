//! Transport capability trait and the per-transport link implementations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::segment::{self, PacketIdCounter, SegmentError};
use crate::serial::{self, Unescaper};
use crate::stream::{DropReason, SegmentStream, StreamEvent};
use crate::wire::{self, FrameDecodeError, FrameEncodeError, FrameReader};

/// The fixed set of transports the relay engine composes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Short-range radio sessions.
    Bluetooth,
    /// Neighbor-awareness data path.
    WifiAware,
    /// Serial link to an external radio peripheral.
    Sdr,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [
        TransportKind::Bluetooth,
        TransportKind::WifiAware,
        TransportKind::Sdr,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::WifiAware => "wifi_aware",
            TransportKind::Sdr => "sdr",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransportKind::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown transport {s:?}"))
    }
}

/// Error turning packet bytes into link frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
}

/// What one transport can do. Each transport implements this on its own.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// May broadcast packets go to connections whose peer is not yet identified?
    fn allows_unresolved_broadcast(&self) -> bool;

    /// Fit for packets flagged high-performance-only.
    fn is_high_performance(&self) -> bool {
        false
    }

    /// One connection reaches every listener on the channel, so it never belongs to a single
    /// peer.
    fn is_shared_medium(&self) -> bool {
        false
    }

    /// Turn encoded packet bytes into the frames to write, in order.
    fn frame(&mut self, packet: &[u8]) -> Result<Vec<Vec<u8>>, FramingError>;

    /// Fresh inbound decoder for a new connection.
    fn decoder(&self) -> InboundDecoder;
}

/// Bluetooth sessions: size-prefixed frames; peers must identify before receiving relays.
#[derive(Debug, Default)]
pub struct BluetoothLink;

impl Transport for BluetoothLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    fn allows_unresolved_broadcast(&self) -> bool {
        false
    }

    fn frame(&mut self, packet: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        Ok(vec![wire::encode_frame(packet)?])
    }

    fn decoder(&self) -> InboundDecoder {
        InboundDecoder::size_prefixed()
    }
}

/// Neighbor-awareness data path: size-prefixed frames over a stream socket.
#[derive(Debug, Default)]
pub struct WifiAwareLink;

impl Transport for WifiAwareLink {
    fn kind(&self) -> TransportKind {
        TransportKind::WifiAware
    }

    fn allows_unresolved_broadcast(&self) -> bool {
        false
    }

    fn is_high_performance(&self) -> bool {
        true
    }

    fn frame(&mut self, packet: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        Ok(vec![wire::encode_frame(packet)?])
    }

    fn decoder(&self) -> InboundDecoder {
        InboundDecoder::size_prefixed()
    }
}

/// Serial link to a radio peripheral: SAR segments, byte-safety escaping, newline per frame.
/// The far side is often a shared channel with unknown listeners, so broadcast goes out even
/// before anyone is identified.
#[derive(Debug)]
pub struct SdrLink {
    max_segment: usize,
    invert_output: bool,
    ids: PacketIdCounter,
}

impl SdrLink {
    pub fn new(max_segment: usize, invert_output: bool) -> Self {
        Self {
            max_segment: max_segment.clamp(1, segment::MAX_SEGMENT_PAYLOAD),
            invert_output,
            ids: PacketIdCounter::new(),
        }
    }
}

impl Default for SdrLink {
    fn default() -> Self {
        Self::new(segment::MAX_SEGMENT_PAYLOAD, false)
    }
}

impl Transport for SdrLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Sdr
    }

    fn allows_unresolved_broadcast(&self) -> bool {
        true
    }

    fn is_shared_medium(&self) -> bool {
        true
    }

    fn frame(&mut self, packet: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        let segments = segment::wrap(packet, self.max_segment, &mut self.ids)?;
        Ok(segments
            .iter()
            .map(|s| {
                let bytes = if self.invert_output {
                    s.to_inverted_bytes()
                } else {
                    s.to_bytes()
                };
                serial::encode_line(&bytes)
            })
            .collect())
    }

    fn decoder(&self) -> InboundDecoder {
        InboundDecoder::Serial {
            unescape: Unescaper::new(),
            stream: SegmentStream::new(self.max_segment),
        }
    }
}

/// Result of feeding bytes to an inbound decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// One complete packet's bytes.
    Packet(Vec<u8>),
    Dropped(DropReason),
    HighNoise { good: u64, bad: u64 },
    /// The stream cannot continue; close the connection.
    Fatal(FrameDecodeError),
}

/// Per-connection inbound decoding state.
#[derive(Debug)]
pub enum InboundDecoder {
    SizePrefixed(FrameReader),
    Serial {
        unescape: Unescaper,
        stream: SegmentStream,
    },
}

impl InboundDecoder {
    pub fn size_prefixed() -> Self {
        InboundDecoder::SizePrefixed(FrameReader::new())
    }

    pub fn push(&mut self, bytes: &[u8], now_ms: u64) -> Vec<InboundEvent> {
        match self {
            InboundDecoder::SizePrefixed(reader) => {
                reader.extend(bytes);
                let mut events = Vec::new();
                loop {
                    match reader.next_frame() {
                        Ok(Some(frame)) => events.push(InboundEvent::Packet(frame)),
                        Ok(None) => break,
                        Err(e) => {
                            events.push(InboundEvent::Fatal(e));
                            break;
                        }
                    }
                }
                events
            }
            InboundDecoder::Serial { unescape, stream } => {
                let mut raw = Vec::with_capacity(bytes.len());
                unescape.push(bytes, &mut raw);
                stream
                    .push(&raw, now_ms)
                    .into_iter()
                    .map(InboundEvent::from)
                    .collect()
            }
        }
    }

    /// Timer-driven housekeeping.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<InboundEvent> {
        match self {
            InboundDecoder::SizePrefixed(_) => Vec::new(),
            InboundDecoder::Serial { stream, .. } => stream
                .sweep(now_ms)
                .into_iter()
                .map(InboundEvent::from)
                .collect(),
        }
    }
}

impl From<StreamEvent> for InboundEvent {
    fn from(e: StreamEvent) -> Self {
        match e {
            StreamEvent::Payload(p) => InboundEvent::Packet(p),
            StreamEvent::Dropped(r) => InboundEvent::Dropped(r),
            StreamEvent::HighNoise { good, bad } => InboundEvent::HighNoise { good, bad },
        }
    }
}
