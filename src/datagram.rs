//! Unreliable datagram extension (RFC 9221).
//!
//! Available only when both peers advertise max_datagram_frame_size. Each
//! send becomes exactly one DATAGRAM frame in exactly one packet; datagrams
//! are never fragmented, retransmitted or flow controlled.

use crate::error::ApiError;
use crate::varint;
use std::collections::VecDeque;

/// Queued sends beyond this are canceled oldest-first; unreliable data has
/// no business aging in a buffer.
const MAX_QUEUED_SENDS: usize = 64;

/// Lifecycle of one datagram send, reported through
/// DatagramSendStateChanged events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramState {
    /// Put on the wire in some packet.
    Sent,
    /// The carrying packet was acknowledged.
    Acked,
    /// The carrying packet was declared lost; the datagram is gone.
    Lost,
    /// Never transmitted: queue overflow, shutdown, or it could not fit
    /// before abandonment.
    Canceled,
}

#[derive(Debug)]
struct PendingSend {
    id: u64,
    data: Vec<u8>,
}

/// Send-side queue. Receives need no state: they are delivered to the
/// application synchronously as they arrive.
#[derive(Debug, Default)]
pub struct DatagramQueue {
    sends: VecDeque<PendingSend>,
    next_id: u64,
    /// (id, state) transitions waiting to be surfaced as events.
    pub state_changes: Vec<(u64, DatagramState)>,
}

impl DatagramQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a send. `max_frame_size` is the peer's advertised limit on the
    /// entire frame, so the payload budget subtracts the frame overhead.
    pub fn enqueue(&mut self, data: Vec<u8>, max_frame_size: u64) -> Result<u64, ApiError> {
        if max_frame_size == 0 {
            return Err(ApiError::DatagramsDisabled);
        }
        let overhead = 1 + varint::size(data.len() as u64) as u64;
        if data.len() as u64 + overhead > max_frame_size {
            return Err(ApiError::InvalidParameter("datagram exceeds peer limit"));
        }
        if self.sends.len() >= MAX_QUEUED_SENDS {
            let dropped = self.sends.pop_front().unwrap();
            self.state_changes.push((dropped.id, DatagramState::Canceled));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.sends.push_back(PendingSend { id, data });
        Ok(id)
    }

    pub fn has_pending(&self) -> bool {
        !self.sends.is_empty()
    }

    /// Frame overhead + payload size of the next queued datagram.
    pub fn next_frame_size(&self) -> Option<usize> {
        self.sends
            .front()
            .map(|send| 1 + varint::size(send.data.len() as u64) + send.data.len())
    }

    /// Take the head datagram if its frame fits in `budget` bytes. A head
    /// that cannot fit stays queued for a roomier packet.
    pub fn dequeue(&mut self, budget: usize) -> Option<(u64, Vec<u8>)> {
        let size = self.next_frame_size()?;
        if size > budget {
            return None;
        }
        let send = self.sends.pop_front().unwrap();
        self.state_changes.push((send.id, DatagramState::Sent));
        Some((send.id, send.data))
    }

    pub fn on_acked(&mut self, id: u64) {
        self.state_changes.push((id, DatagramState::Acked));
    }

    pub fn on_lost(&mut self, id: u64) {
        self.state_changes.push((id, DatagramState::Lost));
    }

    /// Cancel everything still queued (shutdown path).
    pub fn cancel_all(&mut self) {
        while let Some(send) = self.sends.pop_front() {
            self.state_changes.push((send.id, DatagramState::Canceled));
        }
    }

    pub fn take_state_changes(&mut self) -> Vec<(u64, DatagramState)> {
        std::mem::take(&mut self.state_changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_and_disabled() {
        let mut q = DatagramQueue::new();
        assert_eq!(q.enqueue(vec![0; 10], 0), Err(ApiError::DatagramsDisabled));
        assert!(q.enqueue(vec![0; 100], 50).is_err());
        assert!(q.enqueue(vec![0; 40], 50).is_ok());
    }

    #[test]
    fn head_that_does_not_fit_waits() {
        let mut q = DatagramQueue::new();
        q.enqueue(vec![1; 100], 1200).unwrap();
        assert!(q.dequeue(50).is_none());
        let (id, data) = q.dequeue(200).unwrap();
        assert_eq!(id, 0);
        assert_eq!(data.len(), 100);
        assert_eq!(q.take_state_changes(), vec![(0, DatagramState::Sent)]);
    }

    #[test]
    fn overflow_cancels_oldest() {
        let mut q = DatagramQueue::new();
        for _ in 0..MAX_QUEUED_SENDS + 1 {
            q.enqueue(vec![0; 8], 1200).unwrap();
        }
        let changes = q.take_state_changes();
        assert_eq!(changes, vec![(0, DatagramState::Canceled)]);
    }
}
