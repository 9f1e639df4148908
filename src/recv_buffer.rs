//! Gap-tolerant receive reassembly.
//!
//! A buffer holds disjoint (offset, data) regions. The contiguous prefix up
//! to `delivered` has been consumed by the application; bytes between
//! `delivered` and the first gap are readable. Overlapping retransmissions
//! keep the first copy seen, and any overlapping bytes must match it.

use crate::error::TransportError;
use std::collections::BTreeMap;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecvBuffer {
    /// Disjoint regions keyed by start offset. Never extends below
    /// `delivered`.
    regions: BTreeMap<u64, Vec<u8>>,
    /// Everything below this offset has been handed to the application.
    delivered: u64,
    /// Highest offset+1 seen, for flow-control accounting.
    highest: u64,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered_offset(&self) -> u64 {
        self.delivered
    }

    /// Highest byte offset observed (exclusive end).
    pub fn highest_offset(&self) -> u64 {
        self.highest
    }

    /// Bytes currently buffered (for memory accounting).
    pub fn buffered_bytes(&self) -> usize {
        self.regions.values().map(Vec::len).sum()
    }

    /// Insert a fragment. Bytes already consumed are clipped; bytes that
    /// overlap buffered regions must be identical to the first copy.
    /// Returns the count of newly buffered bytes.
    pub fn insert(&mut self, offset: u64, data: &[u8]) -> Result<u64, TransportError> {
        let mut start = offset;
        let mut end = offset + data.len() as u64;
        self.highest = self.highest.max(end);
        if start < self.delivered {
            // Already consumed; nothing left to compare against.
            start = self.delivered;
        }
        if start >= end {
            return Ok(0);
        }

        let mut added = 0u64;
        // Walk the uncovered gaps of [start, end), verifying every overlap
        // with an existing region.
        while start < end {
            // Region beginning at or before `start`.
            let covering = self
                .regions
                .range(..=start)
                .next_back()
                .map(|(&rstart, rdata)| (rstart, rstart + rdata.len() as u64));
            if let Some((rstart, rend)) = covering
                && rend > start
            {
                // Overlap with an earlier region: verify and skip past it.
                let overlap_end = rend.min(end);
                let existing = &self.regions[&rstart]
                    [(start - rstart) as usize..(overlap_end - rstart) as usize];
                let incoming = &data[(start - offset) as usize..(overlap_end - offset) as usize];
                if existing != incoming {
                    return Err(TransportError::ProtocolViolation("stream data mismatch"));
                }
                start = overlap_end;
                continue;
            }

            // Gap runs to the next region's start (or to `end`).
            let gap_end = self
                .regions
                .range(start..)
                .next()
                .map(|(&rstart, _)| rstart.min(end))
                .unwrap_or(end);
            let segment = &data[(start - offset) as usize..(gap_end - offset) as usize];
            self.regions.insert(start, segment.to_vec());
            added += segment.len() as u64;
            start = gap_end;
        }
        Ok(added)
    }

    /// Bytes readable from the contiguous prefix.
    pub fn readable(&self) -> u64 {
        let mut cursor = self.delivered;
        for (&start, data) in self.regions.range(self.delivered..) {
            if start != cursor {
                break;
            }
            cursor += data.len() as u64;
        }
        cursor - self.delivered
    }

    /// Copy the contiguous prefix without consuming it. Used to indicate
    /// data to the application before it commits to a consumed count.
    pub fn peek(&self, max: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cursor = self.delivered;
        for (&start, data) in self.regions.range(self.delivered..) {
            if start != cursor || out.len() >= max {
                break;
            }
            let want = (max - out.len()).min(data.len());
            out.extend_from_slice(&data[..want]);
            cursor += want as u64;
        }
        out
    }

    /// Consume up to `max` contiguous bytes, advancing the delivered
    /// offset. Partially consumed regions are split and retained.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some((&start, _)) = self.regions.range(self.delivered..).next() else {
                break;
            };
            if start != self.delivered {
                break;
            }
            let mut data = self.regions.remove(&start).unwrap();
            let want = max - out.len();
            if data.len() > want {
                let rest = data.split_off(want);
                self.regions.insert(start + want as u64, rest);
            }
            self.delivered += data.len() as u64;
            out.extend_from_slice(&data);
        }
        out
    }

    /// Drop everything buffered beyond the delivered prefix (RESET_STREAM).
    pub fn discard_pending(&mut self) {
        self.regions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn in_order_delivery() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"hello ").unwrap();
        buf.insert(6, b"world").unwrap();
        assert_eq!(buf.readable(), 11);
        assert_eq!(buf.read(64), b"hello world");
        assert_eq!(buf.delivered_offset(), 11);
    }

    #[test]
    fn gap_blocks_delivery() {
        let mut buf = RecvBuffer::new();
        buf.insert(6, b"world").unwrap();
        assert_eq!(buf.readable(), 0);
        buf.insert(0, b"hello ").unwrap();
        assert_eq!(buf.readable(), 11);
    }

    #[test]
    fn partial_read_withholds_rest() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"abcdef").unwrap();
        assert_eq!(buf.read(4), b"abcd");
        assert_eq!(buf.readable(), 2);
        assert_eq!(buf.read(10), b"ef");
    }

    #[test]
    fn exact_duplicate_is_noop() {
        let mut buf = RecvBuffer::new();
        assert_eq!(buf.insert(0, b"data").unwrap(), 4);
        assert_eq!(buf.insert(0, b"data").unwrap(), 0);
        assert_eq!(buf.insert(2, b"ta").unwrap(), 0);
    }

    #[test]
    fn mismatched_overlap_rejected() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"data").unwrap();
        assert_eq!(
            buf.insert(2, b"XX"),
            Err(TransportError::ProtocolViolation("stream data mismatch"))
        );
    }

    #[test]
    fn overlap_straddling_regions() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"ab").unwrap();
        buf.insert(4, b"ef").unwrap();
        // Covers the gap plus both neighbors.
        assert_eq!(buf.insert(0, b"abcdef").unwrap(), 2);
        assert_eq!(buf.read(10), b"abcdef");
    }

    #[test]
    fn consumed_bytes_clipped() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"abcd").unwrap();
        buf.read(4);
        // Retransmission of consumed data disappears quietly, even when the
        // payload no longer matches what was read.
        assert_eq!(buf.insert(0, b"XXcd").unwrap(), 0);
        assert_eq!(buf.readable(), 0);
    }

    /// Random overlapping fragments covering [0, N) always reproduce the
    /// original bytes in order.
    #[test]
    fn random_fragments_reassemble() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x51cf);
        for _ in 0..50 {
            let total: usize = rng.gen_range(64..512);
            let source: Vec<u8> = (0..total).map(|_| rng.r#gen()).collect();

            let mut fragments = Vec::new();
            let mut at = 0usize;
            while at < total {
                let len = rng.gen_range(1..48).min(total - at);
                // Extend some fragments backwards to force overlaps.
                let back = rng.gen_range(0..=at.min(16));
                fragments.push((at - back, source[at - back..at + len].to_vec()));
                at += len;
            }
            fragments.shuffle(&mut rng);

            let mut buf = RecvBuffer::new();
            for (offset, data) in fragments {
                buf.insert(offset as u64, &data).unwrap();
            }
            assert_eq!(buf.readable(), total as u64);
            assert_eq!(buf.read(total), source);
        }
    }
}
