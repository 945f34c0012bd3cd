//! SAR segments: the resynchronizable wire unit for constrained links.
//!
//! Layout: `[0x66 0x99][length][packet id][final|index][checksum][data; length]`.
//! The whole segment may travel bit-inverted, in which case the magic reads `0x99 0x66`.
//! The checksum covers packet id, index byte and data.

/// Segment magic in normal form.
pub const MAGIC: [u8; 2] = [0x66, 0x99];

/// Bytes before the data: magic, length, packet id, index byte, checksum.
pub const HEADER_LEN: usize = 6;

/// Header bytes that follow the 3-byte search window.
pub const BODY_OVERHEAD: usize = 3;

/// Largest data length a single segment may carry.
pub const MAX_SEGMENT_PAYLOAD: usize = 250;

/// Index space per packet (7-bit index).
pub const MAX_SEGMENTS: usize = 128;

const FINAL_FLAG: u8 = 0x80;
const INDEX_MASK: u8 = 0x7f;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub packet_id: u8,
    pub index: u8,
    /// Last segment of its packet.
    pub is_final: bool,
    pub data: Vec<u8>,
}

impl Segment {
    /// Segment carrying a whole payload on its own.
    pub fn standalone(data: Vec<u8>) -> Self {
        Self {
            packet_id: 0,
            index: 0,
            is_final: true,
            data,
        }
    }

    pub fn is_standalone(&self) -> bool {
        self.is_final && self.index == 0
    }

    fn index_byte(&self) -> u8 {
        let mut b = self.index & INDEX_MASK;
        if self.is_final {
            b |= FINAL_FLAG;
        }
        b
    }

    /// Normal-form wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let index_byte = self.index_byte();
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.extend_from_slice(&MAGIC);
        out.push(self.data.len() as u8);
        out.push(self.packet_id);
        out.push(index_byte);
        out.push(checksum(self.packet_id, index_byte, &self.data));
        out.extend_from_slice(&self.data);
        out
    }

    /// Wire bytes with every bit flipped.
    pub fn to_inverted_bytes(&self) -> Vec<u8> {
        let mut out = self.to_bytes();
        invert(&mut out);
        out
    }

    /// Parse the span after the search window: `[packet id][index][checksum][data]`.
    /// `body` must already be un-inverted and exactly `length + BODY_OVERHEAD` long.
    pub fn parse_body(length: u8, body: &[u8], max_payload: usize) -> Result<Segment, SegmentError> {
        let len = length as usize;
        if len == 0 || len > max_payload.min(MAX_SEGMENT_PAYLOAD) {
            return Err(SegmentError::SizeOutOfBounds {
                len,
                max: max_payload,
            });
        }
        if body.len() != len + BODY_OVERHEAD {
            return Err(SegmentError::BodyLength {
                expected: len + BODY_OVERHEAD,
                actual: body.len(),
            });
        }
        let packet_id = body[0];
        let index_byte = body[1];
        let data = &body[BODY_OVERHEAD..];
        if checksum(packet_id, index_byte, data) != body[2] {
            return Err(SegmentError::Checksum);
        }
        Ok(Segment {
            packet_id,
            index: index_byte & INDEX_MASK,
            is_final: index_byte & FINAL_FLAG != 0,
            data: data.to_vec(),
        })
    }

    /// Parse one complete normal-form segment.
    pub fn parse(bytes: &[u8], max_payload: usize) -> Result<Segment, SegmentError> {
        if bytes.len() < HEADER_LEN || bytes[..2] != MAGIC {
            return Err(SegmentError::BadMagic);
        }
        Segment::parse_body(bytes[2], &bytes[3..], max_payload)
    }
}

/// The valid-header predicate over the 3-byte search window. Returns the data length and
/// whether the segment is inverted.
pub fn match_header(window: [u8; 3], max_payload: usize) -> Option<(u8, bool)> {
    let max = max_payload.min(MAX_SEGMENT_PAYLOAD);
    let valid = |len: u8| len != 0 && (len as usize) <= max;
    if window[0] == MAGIC[0] && window[1] == MAGIC[1] && valid(window[2]) {
        return Some((window[2], false));
    }
    if window[0] == !MAGIC[0] && window[1] == !MAGIC[1] && valid(!window[2]) {
        return Some((!window[2], true));
    }
    None
}

pub fn invert(bytes: &mut [u8]) {
    for b in bytes {
        *b = !*b;
    }
}

/// FNV-1a over the header fields and data, folded to one byte.
pub(crate) fn checksum(packet_id: u8, index_byte: u8, data: &[u8]) -> u8 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut h = OFFSET;
    for &b in [packet_id, index_byte].iter().chain(data) {
        h ^= u32::from(b);
        h = h.wrapping_mul(PRIME);
    }
    (h ^ (h >> 8) ^ (h >> 16) ^ (h >> 24)) as u8
}

/// Per-link packet id source. Multi-segment packets use ids `1..=255`; 0 marks standalone.
#[derive(Debug, Default)]
pub struct PacketIdCounter {
    last: u8,
}

impl PacketIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u8 {
        self.last = if self.last == u8::MAX { 1 } else { self.last + 1 };
        self.last
    }
}

/// Split `payload` into segments of at most `max_segment` bytes, balanced in size.
pub fn wrap(
    payload: &[u8],
    max_segment: usize,
    ids: &mut PacketIdCounter,
) -> Result<Vec<Segment>, SegmentError> {
    if payload.is_empty() {
        return Err(SegmentError::Empty);
    }
    let max = max_segment.clamp(1, MAX_SEGMENT_PAYLOAD);
    if payload.len() <= max {
        return Ok(vec![Segment::standalone(payload.to_vec())]);
    }
    let count = payload.len().div_ceil(max);
    if count > MAX_SEGMENTS {
        return Err(SegmentError::TooLarge {
            len: payload.len(),
            max: MAX_SEGMENTS * max,
        });
    }
    let chunk = payload.len().div_ceil(count);
    let packet_id = ids.next_id();
    let last = count - 1;
    Ok(payload
        .chunks(chunk)
        .enumerate()
        .map(|(i, data)| Segment {
            packet_id,
            index: i as u8,
            is_final: i == last,
            data: data.to_vec(),
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("empty payload")]
    Empty,
    #[error("payload of {len} bytes exceeds {max}")]
    TooLarge { len: usize, max: usize },
    #[error("segment length {len} outside 1..={max}")]
    SizeOutOfBounds { len: usize, max: usize },
    #[error("segment body is {actual} bytes, expected {expected}")]
    BodyLength { expected: usize, actual: usize },
    #[error("segment checksum mismatch")]
    Checksum,
    #[error("missing segment magic")]
    BadMagic,
}
