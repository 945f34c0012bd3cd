//! Resynchronizing SAR stream decoder.
//!
//! Bytes are appended as they arrive. The decoder alternates between two phases:
//! searching for a header with a 3-byte window, and waiting for the body span announced by
//! that header. A body that fails validation rewinds the scan to one byte past the start of
//! the matched header, so a false header never swallows real segments.

use crate::segment::{self, Segment, BODY_OVERHEAD};
use crate::segmenter::Reassembler;

/// Lost bytes per drop event.
pub const LOST_BYTES_PER_DROP: u64 = 100;

/// Interval between stale-segmenter sweeps.
pub const SWEEP_INTERVAL_MS: u64 = 500;

/// Bad segments per good one before the link is reported as noisy.
pub const ACCEPTABLE_BAD_TO_GOOD: u64 = 8;

const WINDOW: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A reassembled payload.
    Payload(Vec<u8>),
    Dropped(DropReason),
    /// Bad segments outnumber good ones beyond the acceptable ratio.
    HighNoise { good: u64, bad: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Another [`LOST_BYTES_PER_DROP`] bytes were skipped while searching.
    LostBytes,
    /// An incomplete packet aged out.
    StaleSegmenter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Searching,
    Body {
        start: usize,
        length: u8,
        inverted: bool,
    },
}

#[derive(Debug)]
pub struct SegmentStream {
    buf: Vec<u8>,
    pos: usize,
    phase: Phase,
    max_payload: usize,
    lost_bytes: u64,
    lost_since_drop: u64,
    good: u64,
    bad: u64,
    reassembler: Reassembler,
    next_sweep_ms: u64,
}

impl SegmentStream {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            phase: Phase::Searching,
            max_payload: max_payload.clamp(1, segment::MAX_SEGMENT_PAYLOAD),
            lost_bytes: 0,
            lost_since_drop: 0,
            good: 0,
            bad: 0,
            reassembler: Reassembler::new(),
            next_sweep_ms: 0,
        }
    }

    /// Append bytes and decode as far as they allow.
    pub fn push(&mut self, bytes: &[u8], now_ms: u64) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        self.scan(now_ms, &mut events);
        self.compact();
        if now_ms >= self.next_sweep_ms {
            events.extend(self.sweep(now_ms));
        }
        events
    }

    /// Remove stale segmenters, one drop event each.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<StreamEvent> {
        self.next_sweep_ms = now_ms.saturating_add(SWEEP_INTERVAL_MS);
        let removed = self.reassembler.sweep(now_ms);
        (0..removed)
            .map(|_| StreamEvent::Dropped(DropReason::StaleSegmenter))
            .collect()
    }

    /// Total bytes skipped while searching for headers.
    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes
    }

    pub fn good_segments(&self) -> u64 {
        self.good
    }

    pub fn bad_segments(&self) -> u64 {
        self.bad
    }

    pub fn pending_packets(&self) -> usize {
        self.reassembler.pending()
    }

    fn scan(&mut self, now_ms: u64, events: &mut Vec<StreamEvent>) {
        loop {
            match self.phase {
                Phase::Searching => {
                    if self.buf.len() < self.pos + WINDOW {
                        return;
                    }
                    let window = [
                        self.buf[self.pos],
                        self.buf[self.pos + 1],
                        self.buf[self.pos + 2],
                    ];
                    match segment::match_header(window, self.max_payload) {
                        Some((length, inverted)) => {
                            self.phase = Phase::Body {
                                start: self.pos,
                                length,
                                inverted,
                            };
                        }
                        None => {
                            self.pos += 1;
                            self.count_lost(events);
                        }
                    }
                }
                Phase::Body {
                    start,
                    length,
                    inverted,
                } => {
                    let body_start = start + WINDOW;
                    let body_end = body_start + length as usize + BODY_OVERHEAD;
                    if self.buf.len() < body_end {
                        return;
                    }
                    let mut body = self.buf[body_start..body_end].to_vec();
                    if inverted {
                        segment::invert(&mut body);
                    }
                    self.phase = Phase::Searching;
                    match Segment::parse_body(length, &body, self.max_payload) {
                        Ok(seg) => {
                            self.good += 1;
                            self.pos = body_end;
                            if let Some(payload) = self.reassembler.accept(seg, now_ms) {
                                events.push(StreamEvent::Payload(payload));
                            }
                        }
                        Err(e) => {
                            tracing::trace!(error = %e, "false segment header, rescanning");
                            self.bad += 1;
                            self.pos = start + 1;
                            self.count_lost(events);
                            self.check_noise(events);
                        }
                    }
                }
            }
        }
    }

    fn count_lost(&mut self, events: &mut Vec<StreamEvent>) {
        self.lost_bytes += 1;
        self.lost_since_drop += 1;
        if self.lost_since_drop >= LOST_BYTES_PER_DROP {
            self.lost_since_drop = 0;
            events.push(StreamEvent::Dropped(DropReason::LostBytes));
        }
    }

    fn check_noise(&self, events: &mut Vec<StreamEvent>) {
        if self.bad >= ACCEPTABLE_BAD_TO_GOOD && self.bad > self.good * ACCEPTABLE_BAD_TO_GOOD {
            events.push(StreamEvent::HighNoise {
                good: self.good,
                bad: self.bad,
            });
        }
    }

    /// Release bytes that can no longer be part of a segment.
    fn compact(&mut self) {
        let keep_from = match self.phase {
            Phase::Searching => self.pos,
            Phase::Body { start, .. } => start,
        };
        if keep_from == 0 {
            return;
        }
        self.buf.drain(..keep_from);
        self.pos -= keep_from;
        if let Phase::Body { start, .. } = &mut self.phase {
            *start -= keep_from;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{checksum, wrap, PacketIdCounter, MAGIC};
    use rand::{Rng, SeedableRng};

    fn payloads(events: &[StreamEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Payload(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    fn encode(payload: &[u8], ids: &mut PacketIdCounter, inverted: bool) -> Vec<u8> {
        wrap(payload, 250, ids)
            .unwrap()
            .iter()
            .flat_map(|s| {
                if inverted {
                    s.to_inverted_bytes()
                } else {
                    s.to_bytes()
                }
            })
            .collect()
    }

    #[test]
    fn clean_stream_byte_by_byte() {
        let data: Vec<u8> = (0..700).map(|i| (i % 251) as u8).collect();
        let bytes = encode(&data, &mut PacketIdCounter::new(), false);
        let mut s = SegmentStream::new(250);
        let mut events = Vec::new();
        for b in &bytes {
            events.extend(s.push(std::slice::from_ref(b), 0));
        }
        assert_eq!(payloads(&events), vec![data]);
        assert_eq!(s.lost_bytes(), 0);
    }

    #[test]
    fn inverted_stream_decodes() {
        let data = vec![0x66u8; 300];
        let bytes = encode(&data, &mut PacketIdCounter::new(), true);
        let mut s = SegmentStream::new(250);
        assert_eq!(payloads(&s.push(&bytes, 0)), vec![data]);
    }

    #[test]
    fn garbage_between_segments_is_counted_exactly() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut ids = PacketIdCounter::new();
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        let mut garbage_total = 0u64;
        for round in 0..40 {
            let len = rng.gen_range(1..900);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            stream.extend(encode(&data, &mut ids, round % 3 == 0));
            expected.push(data);
            let junk = rng.gen_range(0..300);
            for _ in 0..junk {
                // magic bytes excluded so no header can form inside the junk
                let b: u8 = loop {
                    let b = rng.gen();
                    if b != MAGIC[0] && b != MAGIC[1] {
                        break b;
                    }
                };
                stream.push(b);
            }
            garbage_total += junk;
        }
        // two bytes of padding let the trailing junk slide fully out of the window
        stream.extend_from_slice(&[0u8; 2]);

        let mut s = SegmentStream::new(250);
        let mut events = Vec::new();
        for chunk in stream.chunks(37) {
            events.extend(s.push(chunk, 0));
        }
        assert_eq!(payloads(&events), expected);
        assert_eq!(s.lost_bytes(), garbage_total);
        let drops = events
            .iter()
            .filter(|e| **e == StreamEvent::Dropped(DropReason::LostBytes))
            .count() as u64;
        assert_eq!(drops, garbage_total / LOST_BYTES_PER_DROP);
    }

    #[test]
    fn false_header_rewinds_without_losing_next_segment() {
        let mut ids = PacketIdCounter::new();
        let real = encode(b"after the trap", &mut ids, false);
        let mut tail = real.clone();
        tail.extend_from_slice(&[0u8; 40]);

        // a header whose claimed body swallows the real segment, with a checksum that
        // cannot match and cannot itself start an inverted header
        let (len, bad_ck) = (30u8..50)
            .map(|len| {
                let ck = checksum(1, 0, &tail[..len as usize]).wrapping_add(1);
                (len, ck)
            })
            .find(|&(_, ck)| ck != MAGIC[0] && ck != MAGIC[1])
            .unwrap();
        let mut stream = vec![MAGIC[0], MAGIC[1], len, 1, 0, bad_ck];
        stream.extend_from_slice(&tail);

        let mut s = SegmentStream::new(250);
        let events = s.push(&stream, 0);
        assert_eq!(payloads(&events), vec![b"after the trap".to_vec()]);
        assert_eq!(s.bad_segments(), 1);
        assert_eq!(s.good_segments(), 1);
        assert_eq!(s.lost_bytes(), 6);
    }

    #[test]
    fn out_of_range_lengths_resync() {
        let mut ids = PacketIdCounter::new();
        let mut stream = vec![MAGIC[0], MAGIC[1], 0, MAGIC[0], MAGIC[1], 251];
        stream.extend(encode(b"ok", &mut ids, false));
        let mut s = SegmentStream::new(250);
        assert_eq!(payloads(&s.push(&stream, 0)), vec![b"ok".to_vec()]);
        assert_eq!(s.lost_bytes(), 6);
    }

    #[test]
    fn incomplete_packet_swept_with_drop_event() {
        let data = vec![5u8; 600];
        let segs = wrap(&data, 250, &mut PacketIdCounter::new()).unwrap();
        let mut s = SegmentStream::new(250);
        let mut events = s.push(&segs[0].to_bytes(), 1_000);
        events.extend(s.push(&segs[1].to_bytes(), 1_100));
        assert!(payloads(&events).is_empty());
        assert_eq!(s.pending_packets(), 1);
        let swept = s.sweep(20_000);
        assert_eq!(swept, vec![StreamEvent::Dropped(DropReason::StaleSegmenter)]);
        assert_eq!(s.pending_packets(), 0);
    }

    #[test]
    fn persistent_noise_is_reported() {
        let mut s = SegmentStream::new(250);
        let mut noisy = Vec::new();
        let bad_ck = checksum(0, 0, &[0]).wrapping_add(1);
        for _ in 0..ACCEPTABLE_BAD_TO_GOOD {
            noisy.extend_from_slice(&[MAGIC[0], MAGIC[1], 1, 0, 0, bad_ck, 0]);
        }
        let events = s.push(&noisy, 0);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::HighNoise { good: 0, .. })));
    }
}
