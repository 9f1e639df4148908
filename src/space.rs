//! Per-epoch packet-number bookkeeping: PN allocation, the received ACK
//! range set, and delayed-ACK scheduling (RFC 9000 §13.2).

use crate::error::TransportError;
use crate::frame::{AckFrame, EcnCounts};
use crate::types::Epoch;
use crate::varint;
use std::time::{Duration, Instant};

/// Received packets are acknowledged immediately once this many
/// ack-eliciting packets arrive without an ACK going out.
const ACK_ELICITING_THRESHOLD: u32 = 2;

/// Ordered, disjoint, inclusive PN ranges.
#[derive(Debug, Default, Clone)]
pub struct AckRanges {
    // Ascending by start; merged on insert.
    ranges: Vec<(u64, u64)>,
}

impl AckRanges {
    /// Insert one PN, merging adjacent ranges. Returns false on duplicates.
    pub fn insert(&mut self, pn: u64) -> bool {
        let idx = self.ranges.partition_point(|&(start, _)| start <= pn);
        if idx > 0 {
            let (start, end) = self.ranges[idx - 1];
            if pn >= start && pn <= end {
                return false;
            }
            if pn == end + 1 {
                self.ranges[idx - 1].1 = pn;
                // May now touch the next range.
                if idx < self.ranges.len() && self.ranges[idx].0 == pn + 1 {
                    self.ranges[idx - 1].1 = self.ranges[idx].1;
                    self.ranges.remove(idx);
                }
                return true;
            }
        }
        if idx < self.ranges.len() && self.ranges[idx].0 == pn + 1 {
            self.ranges[idx].0 = pn;
            return true;
        }
        self.ranges.insert(idx, (pn, pn));
        true
    }

    pub fn contains(&self, pn: u64) -> bool {
        self.ranges.iter().any(|&(start, end)| pn >= start && pn <= end)
    }

    pub fn largest(&self) -> Option<u64> {
        self.ranges.last().map(|&(_, end)| end)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }

    /// Drop all ranges entirely below `pn` (acknowledged state the peer has
    /// confirmed seeing, so it never needs re-advertising).
    pub fn drop_below(&mut self, pn: u64) {
        self.ranges.retain_mut(|range| {
            if range.1 < pn {
                return false;
            }
            if range.0 < pn {
                range.0 = pn;
            }
            true
        });
    }
}

/// One packet-number space.
pub struct PacketSpace {
    pub epoch: Epoch,
    /// Next PN to assign. Monotonic for the life of the space, including
    /// across key updates in AppData.
    next_pn: u64,
    /// Largest PN successfully removed from protection and decrypted.
    pub largest_received: Option<u64>,
    /// Arrival time of the largest received ack-eliciting packet, for the
    /// ACK delay field.
    pub largest_received_time: Option<Instant>,
    pub ack_ranges: AckRanges,
    /// Largest of our PNs the peer has acknowledged.
    pub largest_acked: Option<u64>,
    ack_eliciting_since_ack: u32,
    /// Deadline for sending a delayed ACK.
    pub ack_deadline: Option<Instant>,
    ack_immediate: bool,
    /// ECN counts observed on received packets, echoed in ACK_ECN.
    pub ecn: EcnCounts,
    /// Received-and-dropped duplicate/stale counter.
    pub dropped_stale: u64,
}

impl PacketSpace {
    pub fn new(epoch: Epoch) -> Self {
        PacketSpace {
            epoch,
            next_pn: 0,
            largest_received: None,
            largest_received_time: None,
            ack_ranges: AckRanges::default(),
            largest_acked: None,
            ack_eliciting_since_ack: 0,
            ack_deadline: None,
            ack_immediate: false,
            ecn: EcnCounts::default(),
            dropped_stale: 0,
        }
    }

    /// Allocate the next PN to send. Never reused or reordered.
    pub fn alloc_pn(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    pub fn next_pn(&self) -> u64 {
        self.next_pn
    }

    /// Whether a decrypted packet with this PN is acceptable: it must exceed
    /// every PN previously accepted in this space. Anything else is a stale
    /// duplicate and is dropped without closing the connection.
    pub fn accepts(&self, pn: u64) -> bool {
        self.largest_received.is_none_or(|largest| pn > largest)
    }

    /// Record an accepted packet. Arms or resets the delayed-ACK machinery
    /// when the packet was ack-eliciting.
    pub fn on_packet_received(
        &mut self,
        pn: u64,
        ack_eliciting: bool,
        now: Instant,
        max_ack_delay: Duration,
    ) -> Result<(), TransportError> {
        if !self.ack_ranges.insert(pn) {
            return Err(TransportError::InternalError("duplicate pn accepted"));
        }
        self.largest_received = Some(pn);
        if ack_eliciting {
            self.largest_received_time = Some(now);
            self.ack_eliciting_since_ack += 1;
            if self.ack_eliciting_since_ack >= ACK_ELICITING_THRESHOLD
                || self.epoch != Epoch::AppData
            {
                // Initial and Handshake packets are acked immediately to
                // keep the handshake moving.
                self.ack_immediate = true;
                self.ack_deadline = None;
            } else if self.ack_deadline.is_none() {
                self.ack_deadline = Some(now + max_ack_delay);
            }
        }
        Ok(())
    }

    /// True when an ACK should go out now.
    pub fn ack_due(&self, now: Instant) -> bool {
        if self.ack_ranges.is_empty() || self.ack_eliciting_since_ack == 0 {
            return false;
        }
        self.ack_immediate || self.ack_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Any ACK state pending (for timer computation).
    pub fn ack_timer(&self) -> Option<Instant> {
        if self.ack_immediate { None } else { self.ack_deadline }
    }

    /// Build the ACK frame: largest first, then descending gap/length pairs,
    /// stopping at `budget` encoded bytes. ECN counts ride along when any
    /// marks were seen.
    pub fn build_ack(&self, now: Instant, ack_delay_exponent: u64, budget: usize) -> Option<AckFrame> {
        let largest = self.ack_ranges.largest()?;
        let delay_micros = self
            .largest_received_time
            .map(|t| now.saturating_duration_since(t).as_micros() as u64)
            .unwrap_or(0);
        let delay = delay_micros >> ack_delay_exponent;

        let mut iter = self.ack_ranges.iter().rev();
        let (first_start, first_end) = iter.next()?;
        debug_assert_eq!(first_end, largest);
        let mut ack = AckFrame {
            largest,
            delay,
            first_range: first_end - first_start,
            ranges: Vec::new(),
            ecn: (self.ecn != EcnCounts::default()).then_some(self.ecn),
        };

        let mut prev_start = first_start;
        let mut used = ack.wire_size();
        for (start, end) in iter {
            let gap = prev_start - end - 2;
            let len = end - start;
            let pair = varint::size(gap) + varint::size(len);
            if used + pair > budget {
                break;
            }
            used += pair;
            ack.ranges.push((gap, len));
            prev_start = start;
        }
        Some(ack)
    }

    /// Reset delayed-ACK state after an ACK frame was emitted.
    pub fn on_ack_sent(&mut self) {
        self.ack_eliciting_since_ack = 0;
        self.ack_immediate = false;
        self.ack_deadline = None;
    }

    /// Note the peer acknowledged our ACK up to `largest`: ranges at or
    /// below it no longer need advertising.
    pub fn on_ack_range_confirmed(&mut self, largest: u64) {
        self.ack_ranges.drop_below(largest.saturating_sub(u64::from(u8::MAX)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_merge() {
        let mut ranges = AckRanges::default();
        assert!(ranges.insert(5));
        assert!(ranges.insert(3));
        assert!(ranges.insert(4));
        assert_eq!(ranges.iter().collect::<Vec<_>>(), vec![(3, 5)]);
        assert!(ranges.insert(7));
        assert_eq!(ranges.len(), 2);
        assert!(ranges.insert(6));
        assert_eq!(ranges.iter().collect::<Vec<_>>(), vec![(3, 7)]);
        assert!(!ranges.insert(4));
    }

    #[test]
    fn random_insertion_matches_set() {
        use rand::seq::SliceRandom;
        let mut pns: Vec<u64> = (0..200).collect();
        pns.shuffle(&mut rand::thread_rng());
        let mut ranges = AckRanges::default();
        for pn in &pns {
            assert!(ranges.insert(*pn));
        }
        assert_eq!(ranges.iter().collect::<Vec<_>>(), vec![(0, 199)]);
        for pn in pns {
            assert!(ranges.contains(pn));
            assert!(!ranges.insert(pn));
        }
    }

    #[test]
    fn monotonic_acceptance() {
        let mut space = PacketSpace::new(Epoch::AppData);
        let now = Instant::now();
        assert!(space.accepts(0));
        space.on_packet_received(0, true, now, Duration::from_millis(25)).unwrap();
        assert!(space.accepts(5));
        space.on_packet_received(5, true, now, Duration::from_millis(25)).unwrap();
        // Reordered arrivals below the largest are stale.
        assert!(!space.accepts(3));
        assert!(!space.accepts(5));
    }

    #[test]
    fn second_ack_eliciting_forces_immediate_ack() {
        let mut space = PacketSpace::new(Epoch::AppData);
        let now = Instant::now();
        let delay = Duration::from_millis(25);
        space.on_packet_received(0, true, now, delay).unwrap();
        assert!(!space.ack_due(now));
        assert!(space.ack_timer().is_some());
        space.on_packet_received(1, true, now, delay).unwrap();
        assert!(space.ack_due(now));
    }

    #[test]
    fn handshake_packets_acked_immediately() {
        let mut space = PacketSpace::new(Epoch::Handshake);
        let now = Instant::now();
        space.on_packet_received(0, true, now, Duration::from_millis(25)).unwrap();
        assert!(space.ack_due(now));
    }

    #[test]
    fn ack_frame_descends() {
        let mut space = PacketSpace::new(Epoch::AppData);
        let now = Instant::now();
        for pn in [0u64, 1, 2, 5, 6, 9] {
            space.on_packet_received(pn, true, now, Duration::from_millis(25)).unwrap();
        }
        let ack = space.build_ack(now, 3, 1200).unwrap();
        assert_eq!(ack.largest, 9);
        assert_eq!(ack.first_range, 0);
        let expanded = ack.iter_ranges().unwrap();
        assert_eq!(expanded, vec![(9, 9), (5, 6), (0, 2)]);
    }

    #[test]
    fn ack_frame_respects_budget() {
        let mut space = PacketSpace::new(Epoch::AppData);
        let now = Instant::now();
        for pn in (0..100).step_by(3) {
            space.on_packet_received(pn, true, now, Duration::from_millis(25)).unwrap();
        }
        let full = space.build_ack(now, 3, 4096).unwrap();
        let capped = space.build_ack(now, 3, 16).unwrap();
        assert!(capped.ranges.len() < full.ranges.len());
        assert!(capped.wire_size() <= 16);
    }

    #[test]
    fn pn_allocation_is_monotonic() {
        let mut space = PacketSpace::new(Epoch::Initial);
        let first = space.alloc_pn();
        let second = space.alloc_pn();
        assert!(second > first);
    }
}
