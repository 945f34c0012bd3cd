//! Reassembly: collect segments per packet id, concatenate in index order when complete.

use std::collections::{BTreeMap, HashMap};

use crate::segment::Segment;

/// Age after which an incomplete packet is abandoned.
pub const STALE_AFTER_MS: u64 = 10_000;

/// Reassembly buffer for one packet id.
#[derive(Debug)]
pub struct Segmenter {
    packet_id: u8,
    created_ms: u64,
    parts: BTreeMap<u8, Vec<u8>>,
    final_index: Option<u8>,
}

impl Segmenter {
    pub fn new(packet_id: u8, now_ms: u64) -> Self {
        Self {
            packet_id,
            created_ms: now_ms,
            parts: BTreeMap::new(),
            final_index: None,
        }
    }

    pub fn packet_id(&self) -> u8 {
        self.packet_id
    }

    /// Store a segment. Returns false for duplicates and indices past the final one.
    pub fn add(&mut self, segment: Segment) -> bool {
        if let Some(last) = self.final_index {
            if segment.index > last {
                return false;
            }
        }
        if self.parts.contains_key(&segment.index) {
            return false;
        }
        if segment.is_final {
            self.final_index = Some(segment.index);
            let last = segment.index;
            self.parts.retain(|&i, _| i <= last);
        }
        self.parts.insert(segment.index, segment.data);
        true
    }

    pub fn is_complete(&self) -> bool {
        match self.final_index {
            Some(last) => self.parts.len() == last as usize + 1,
            None => false,
        }
    }

    /// Concatenate parts in index order. Call only when `is_complete()`.
    pub fn reassemble(&self) -> Vec<u8> {
        let total = self.parts.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for part in self.parts.values() {
            out.extend_from_slice(part);
        }
        out
    }

    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_ms) > STALE_AFTER_MS
    }
}

/// All in-progress packets of one inbound link, keyed by packet id.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<u8, Segmenter>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one segment. Returns the payload once its packet is complete.
    /// Standalone segments bypass reassembly.
    pub fn accept(&mut self, segment: Segment, now_ms: u64) -> Option<Vec<u8>> {
        if segment.is_standalone() {
            return Some(segment.data);
        }
        let id = segment.packet_id;
        let segmenter = self
            .pending
            .entry(id)
            .or_insert_with(|| Segmenter::new(id, now_ms));
        if !segmenter.add(segment) {
            tracing::trace!(packet_id = id, "duplicate segment ignored");
            return None;
        }
        if !segmenter.is_complete() {
            return None;
        }
        self.pending.remove(&id).map(|s| s.reassemble())
    }

    /// Drop stale segmenters. Returns how many were removed.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|id, s| {
            let keep = !s.is_stale(now_ms);
            if !keep {
                tracing::debug!(packet_id = id, "stale segmenter dropped");
            }
            keep
        });
        before - self.pending.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{wrap, PacketIdCounter};

    fn payload(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 7) as u8).collect()
    }

    #[test]
    fn any_order_reassembles() {
        let data = payload(600);
        let segs = wrap(&data, 250, &mut PacketIdCounter::new()).unwrap();
        for order in [[0, 1, 2], [2, 1, 0], [1, 2, 0], [2, 0, 1]] {
            let mut r = Reassembler::new();
            let mut out = None;
            for &i in &order {
                out = r.accept(segs[i].clone(), 0);
            }
            assert_eq!(out.as_deref(), Some(&data[..]));
            assert_eq!(r.pending(), 0);
        }
    }

    #[test]
    fn two_of_three_then_sweep() {
        let segs = wrap(&payload(600), 250, &mut PacketIdCounter::new()).unwrap();
        let mut r = Reassembler::new();
        assert!(r.accept(segs[0].clone(), 1_000).is_none());
        assert!(r.accept(segs[2].clone(), 1_200).is_none());
        assert_eq!(r.sweep(1_000 + STALE_AFTER_MS), 0);
        assert_eq!(r.sweep(1_001 + STALE_AFTER_MS), 1);
        // the late third segment starts a fresh, incomplete buffer
        assert!(r.accept(segs[1].clone(), 20_000).is_none());
        assert_eq!(r.pending(), 1);
    }

    #[test]
    fn duplicates_do_not_complete_early() {
        let segs = wrap(&payload(300), 100, &mut PacketIdCounter::new()).unwrap();
        let mut r = Reassembler::new();
        assert!(r.accept(segs[0].clone(), 0).is_none());
        assert!(r.accept(segs[0].clone(), 0).is_none());
        assert!(r.accept(segs[2].clone(), 0).is_none());
        assert!(r.accept(segs[1].clone(), 0).is_some());
    }

    #[test]
    fn standalone_bypasses_buffer() {
        let mut r = Reassembler::new();
        assert_eq!(
            r.accept(Segment::standalone(b"x".to_vec()), 0),
            Some(b"x".to_vec())
        );
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn interleaved_packets() {
        let mut ids = PacketIdCounter::new();
        let a = wrap(&payload(400), 250, &mut ids).unwrap();
        let b = wrap(&vec![9u8; 400], 250, &mut ids).unwrap();
        let mut r = Reassembler::new();
        assert!(r.accept(a[0].clone(), 0).is_none());
        assert!(r.accept(b[1].clone(), 0).is_none());
        assert!(r.accept(b[0].clone(), 0) == Some(vec![9u8; 400]));
        assert_eq!(r.accept(a[1].clone(), 0), Some(payload(400)));
    }
}
