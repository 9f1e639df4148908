//! Send buffering and the per-stream send queue.
//!
//! Buffering means copying a posted send and completing it to the
//! application immediately, up to the connection's ideal byte target;
//! beyond that, completion waits until every byte of the request is
//! acknowledged. The ideal target grows exponentially whenever observed
//! bytes-in-flight gets close enough to be limited by it.

use std::collections::VecDeque;

/// Starting ideal buffer size.
pub const DEFAULT_IDEAL_BYTES: u64 = 0x20000;

/// Ideal buffer growth cap.
pub const MAX_IDEAL_BYTES: u64 = 0x800_0000;

/// Connection-wide buffering state.
#[derive(Debug)]
pub struct SendBuffer {
    pub ideal_bytes: u64,
    pub buffered_bytes: u64,
}

impl SendBuffer {
    pub fn new() -> Self {
        SendBuffer { ideal_bytes: DEFAULT_IDEAL_BYTES, buffered_bytes: 0 }
    }

    pub fn has_space(&self) -> bool {
        self.buffered_bytes < self.ideal_bytes
    }

    /// Grow the target when the observed in-flight maximum crosses 2/3 of
    /// it. Returns true when the target changed, so per-stream indications
    /// can be refreshed. The target never shrinks.
    pub fn adjust(&mut self, bytes_in_flight_max: u64) -> bool {
        if self.ideal_bytes >= MAX_IDEAL_BYTES {
            return false;
        }
        if bytes_in_flight_max > self.ideal_bytes * 2 / 3 {
            self.ideal_bytes = (2 * bytes_in_flight_max).clamp(self.ideal_bytes, MAX_IDEAL_BYTES);
            return true;
        }
        false
    }

    /// Per-stream value to indicate: the connection target capped by what
    /// the stream's flow-control window can use.
    pub fn stream_ideal(&self, send_window: u64) -> u64 {
        self.ideal_bytes.min(send_window)
    }
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Has a newly indicated ideal value moved enough to re-signal? Only 2×
/// changes in either direction are worth an event.
pub fn ideal_changed(last: u64, current: u64) -> bool {
    current <= last / 2 || current >= last.saturating_mul(2)
}

/// Sorted, disjoint ranges of acknowledged stream bytes.
#[derive(Debug, Default, PartialEq, Eq)]
struct RangeSet {
    ranges: Vec<(u64, u64)>, // [start, end) ascending
}

impl RangeSet {
    fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut new = (start, end);
        let mut idx = 0;
        while idx < self.ranges.len() {
            let (s, e) = self.ranges[idx];
            if e < new.0 {
                idx += 1;
                continue;
            }
            if s > new.1 {
                break;
            }
            new.0 = new.0.min(s);
            new.1 = new.1.max(e);
            self.ranges.remove(idx);
        }
        self.ranges.insert(idx, new);
    }

    /// End of the range containing `at`, if any.
    fn contiguous_from(&self, at: u64) -> Option<u64> {
        self.ranges
            .iter()
            .find(|&&(s, e)| s <= at && at < e)
            .map(|&(_, e)| e)
    }

    fn covers(&self, start: u64, end: u64) -> bool {
        self.ranges.iter().any(|&(s, e)| s <= start && end <= e)
    }
}

/// One posted send awaiting completion.
#[derive(Debug, PartialEq, Eq)]
struct SendRequest {
    /// Exclusive end offset of the request's last byte.
    end: u64,
    /// Completed to the app at post time (copied within the ideal budget).
    buffered: bool,
}

/// Per-stream send queue: one contiguous byte buffer above the lowest
/// unacknowledged offset, plus the pending/acked range bookkeeping.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SendQueue {
    /// Stream bytes from `base` upward that are not yet fully acked.
    data: Vec<u8>,
    /// Offset of `data[0]`; everything below is acknowledged and released.
    base: u64,
    /// Total bytes posted so far (the stream's write frontier).
    frontier: u64,
    /// Ranges needing (re)transmission, ascending, disjoint.
    pending: Vec<(u64, u64)>,
    acked: RangeSet,
    requests: VecDeque<SendRequest>,
    fin_queued: bool,
    /// FIN has been sent at least once and not yet declared lost.
    fin_in_flight: bool,
    fin_acked: bool,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn fin_queued(&self) -> bool {
        self.fin_queued
    }

    pub fn fin_acked(&self) -> bool {
        self.fin_acked
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    /// Post bytes at the write frontier. `buffered` records whether the
    /// request was completed immediately. Returns the request's offset.
    pub fn write(&mut self, bytes: &[u8], fin: bool, buffered: bool) -> u64 {
        debug_assert!(!self.fin_queued, "write after fin");
        let offset = self.frontier;
        self.data.extend_from_slice(bytes);
        self.frontier += bytes.len() as u64;
        if !bytes.is_empty() {
            self.push_pending(offset, self.frontier);
        }
        self.requests.push_back(SendRequest { end: self.frontier, buffered });
        if fin {
            self.fin_queued = true;
        }
        offset
    }

    fn push_pending(&mut self, start: u64, end: u64) {
        // Pending ranges stay sorted; retransmissions land back in offset
        // order, which puts them ahead of fresh data automatically.
        let mut new = (start, end);
        let mut idx = 0;
        while idx < self.pending.len() {
            let (s, e) = self.pending[idx];
            if e < new.0 {
                idx += 1;
                continue;
            }
            if s > new.1 {
                break;
            }
            new.0 = new.0.min(s);
            new.1 = new.1.max(e);
            self.pending.remove(idx);
        }
        self.pending.insert(idx, new);
    }

    /// Is there anything to put on the wire below `flow_limit`?
    pub fn has_sendable(&self, flow_limit: u64) -> bool {
        if let Some(&(start, _)) = self.pending.first()
            && start < flow_limit
        {
            return true;
        }
        self.fin_queued && !self.fin_in_flight && !self.fin_acked
    }

    /// Lowest pending offset (for STREAM_DATA_BLOCKED decisions).
    pub fn next_offset(&self) -> Option<u64> {
        self.pending.first().map(|&(s, _)| s)
    }

    /// Dequeue up to `max_len` bytes below `flow_limit` for transmission.
    /// The range leaves the pending set; the caller records it in the sent
    /// ledger so loss can restore it. Returns (offset, bytes, fin).
    pub fn dequeue(&mut self, max_len: usize, flow_limit: u64) -> Option<(u64, Vec<u8>, bool)> {
        let (start, end) = *self.pending.first()?;
        if start >= flow_limit {
            return None;
        }
        let take_end = end.min(flow_limit).min(start + max_len as u64);
        if take_end == end {
            self.pending.remove(0);
        } else {
            self.pending[0].0 = take_end;
        }
        let bytes =
            self.data[(start - self.base) as usize..(take_end - self.base) as usize].to_vec();
        let fin = self.fin_queued
            && !self.fin_acked
            && take_end == self.frontier;
        if fin {
            self.fin_in_flight = true;
        }
        Some((start, bytes, fin))
    }

    /// A bare FIN (no data pending) still needs a frame.
    pub fn dequeue_fin(&mut self) -> Option<u64> {
        if self.fin_queued && !self.fin_in_flight && !self.fin_acked && self.pending.is_empty() {
            self.fin_in_flight = true;
            return Some(self.frontier);
        }
        None
    }

    /// Acknowledge a sent range. Returns completion events: offsets of
    /// requests whose deferred completion is now due.
    pub fn on_ack(&mut self, offset: u64, len: u64, fin: bool) -> AckSummary {
        self.acked.insert(offset, offset + len);
        if fin {
            self.fin_acked = true;
        }

        let mut summary = AckSummary::default();
        // Release the acked prefix.
        if let Some(end) = self.acked.contiguous_from(self.base) {
            let advance = (end - self.base) as usize;
            self.data.drain(..advance.min(self.data.len()));
            self.base = end;
            summary.released = advance as u64;
        }
        while let Some(req) = self.requests.front() {
            if req.end > self.base {
                break;
            }
            let req = self.requests.pop_front().unwrap();
            if !req.buffered {
                summary.deferred_completions += 1;
            }
        }
        summary.all_acked = self.all_acked();
        summary
    }

    /// Return a lost range to the pending set.
    pub fn on_loss(&mut self, offset: u64, len: u64, fin: bool) {
        if fin {
            self.fin_in_flight = false;
        }
        if len == 0 {
            return;
        }
        let end = offset + len;
        if self.acked.covers(offset, end) {
            return; // spuriously declared lost, already acked
        }
        let start = offset.max(self.base);
        if start < end {
            self.push_pending(start, end);
        }
    }

    /// Everything posted (including FIN, if queued) confirmed by the peer.
    pub fn all_acked(&self) -> bool {
        self.base == self.frontier && (!self.fin_queued || self.fin_acked)
    }

    /// Put every unacknowledged byte back on the pending list (a client
    /// restarting its Initial flight after Retry).
    pub fn retransmit_unacked(&mut self) {
        if self.base < self.frontier {
            self.push_pending(self.base, self.frontier);
        }
        if self.fin_queued && !self.fin_acked {
            self.fin_in_flight = false;
        }
    }

    /// Abandon all queued data (RESET_STREAM sent).
    pub fn abandon(&mut self) {
        self.data.clear();
        self.pending.clear();
        self.requests.clear();
        self.base = self.frontier;
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AckSummary {
    /// Buffered bytes released by the advancing acked prefix.
    pub released: u64,
    /// Requests whose deferred completion fires now.
    pub deferred_completions: u32,
    pub all_acked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ideal_bytes_doubling() {
        let mut buffer = SendBuffer::new();
        assert!(!buffer.adjust(DEFAULT_IDEAL_BYTES / 2));
        assert_eq!(buffer.ideal_bytes, DEFAULT_IDEAL_BYTES);
        // Crossing 2/3 doubles (to twice the observed max).
        assert!(buffer.adjust(DEFAULT_IDEAL_BYTES));
        assert_eq!(buffer.ideal_bytes, DEFAULT_IDEAL_BYTES * 2);
        // Capped.
        assert!(buffer.adjust(MAX_IDEAL_BYTES));
        assert_eq!(buffer.ideal_bytes, MAX_IDEAL_BYTES);
        assert!(!buffer.adjust(MAX_IDEAL_BYTES * 2));
    }

    #[test]
    fn ideal_indication_dedup() {
        assert!(!ideal_changed(1000, 1500));
        assert!(ideal_changed(1000, 2000));
        assert!(ideal_changed(1000, 400));
    }

    #[test]
    fn dequeue_respects_flow_limit() {
        let mut queue = SendQueue::new();
        queue.write(&[0xaa; 100], false, true);
        let (offset, bytes, fin) = queue.dequeue(1000, 60).unwrap();
        assert_eq!((offset, bytes.len(), fin), (0, 60, false));
        // Remainder is blocked by the limit.
        assert!(queue.dequeue(1000, 60).is_none());
        assert!(!queue.has_sendable(60));
        let (offset, bytes, _) = queue.dequeue(1000, 100).unwrap();
        assert_eq!((offset, bytes.len()), (60, 40));
    }

    #[test]
    fn loss_requeues_at_head() {
        let mut queue = SendQueue::new();
        queue.write(&[1; 50], false, true);
        queue.write(&[2; 50], false, true);
        let (first, ..) = queue.dequeue(50, 1000).unwrap();
        assert_eq!(first, 0);
        queue.on_loss(0, 50, false);
        // Lost range comes back before fresh data.
        let (retx, bytes, _) = queue.dequeue(1000, 1000).unwrap();
        assert_eq!(retx, 0);
        assert_eq!(bytes.len(), 100); // merged with the fresh range
    }

    #[test]
    fn ack_releases_prefix_and_completes() {
        let mut queue = SendQueue::new();
        queue.write(&[1; 40], false, true); // completed at post
        queue.write(&[2; 40], true, false); // deferred
        queue.dequeue(1000, 1000).unwrap();

        // Ack out of order: tail first.
        let summary = queue.on_ack(40, 40, true);
        assert_eq!(summary.released, 0);
        assert_eq!(summary.deferred_completions, 0);

        let summary = queue.on_ack(0, 40, false);
        assert_eq!(summary.released, 80);
        assert_eq!(summary.deferred_completions, 1);
        assert!(summary.all_acked);
        assert_eq!(queue.buffered_bytes(), 0);
    }

    #[test]
    fn spurious_loss_after_ack_ignored() {
        let mut queue = SendQueue::new();
        queue.write(&[7; 30], false, true);
        queue.dequeue(1000, 1000).unwrap();
        queue.on_ack(0, 30, false);
        queue.on_loss(0, 30, false);
        assert!(queue.dequeue(1000, 1000).is_none());
    }

    #[test]
    fn bare_fin() {
        let mut queue = SendQueue::new();
        queue.write(&[], true, true);
        assert!(queue.has_sendable(0));
        assert_eq!(queue.dequeue_fin(), Some(0));
        assert_eq!(queue.dequeue_fin(), None);
        queue.on_loss(0, 0, true);
        assert_eq!(queue.dequeue_fin(), Some(0));
        queue.on_ack(0, 0, true);
        assert!(queue.all_acked());
    }
}
