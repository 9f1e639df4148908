//! Stream half-state machines, the stream table, and stream/connection
//! flow control (RFC 9000 §2–§4).

use crate::error::TransportError;
use crate::frame::Frame;
use crate::recv_buffer::RecvBuffer;
use crate::send_buffer::SendQueue;
use crate::types::{Dir, Side, StreamId, VARINT_MAX};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Send-half states (RFC 9000 §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Ready,
    Send,
    DataSent,
    DataRecvd,
    ResetSent,
    ResetRecvd,
}

impl SendState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SendState::DataRecvd | SendState::ResetRecvd)
    }

    fn is_reset(self) -> bool {
        matches!(self, SendState::ResetSent | SendState::ResetRecvd)
    }
}

/// Receive-half states (RFC 9000 §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Recv,
    SizeKnown,
    DataRecvd,
    DataRead,
    ResetRecvd,
    ResetRead,
}

impl RecvState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecvState::DataRead | RecvState::ResetRead)
    }

    fn is_reset(self) -> bool {
        matches!(self, RecvState::ResetRecvd | RecvState::ResetRead)
    }
}

/// Something the application should hear about, surfaced by the connection
/// as events after the current operation completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamNotice {
    Opened(StreamId),
    Readable(StreamId),
    /// Peer reset its send half with this code.
    ResetReceived(StreamId, u64),
    /// Peer asked us to stop sending with this code.
    StopRequested(StreamId, u64),
    /// Deferred send completions now due (count).
    SendComplete(StreamId, u32),
    /// Both halves terminal; stream is gone once the app releases it.
    Closed(StreamId),
}

#[derive(Debug, PartialEq, Eq)]
pub struct SendHalf {
    pub state: SendState,
    pub queue: SendQueue,
    /// Peer's flow-control limit for this stream.
    pub max_stream_data: u64,
    /// Highest offset+len handed to the packet builder; bytes below this
    /// don't consume connection credit again on retransmission.
    pub max_sent: u64,
    /// STREAM_DATA_BLOCKED already sent at this limit.
    blocked_sent_at: Option<u64>,
    /// Error code for RESET_STREAM, set when entering ResetSent.
    pub reset_code: Option<u64>,
    reset_needs_send: bool,
    /// Last ideal-send-buffer value indicated to the app.
    pub last_ideal: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RecvHalf {
    pub state: RecvState,
    pub buffer: RecvBuffer,
    /// Our advertised limit for the peer.
    pub max_stream_data: u64,
    /// Receive window size; the limit advances by this ahead of consumption.
    window: u64,
    pub final_size: Option<u64>,
    /// Code from the peer's RESET_STREAM.
    pub reset_code: Option<u64>,
    /// MAX_STREAM_DATA update queued.
    needs_max_update: bool,
    /// STOP_SENDING requested by the app with this code, not yet sent.
    pub stop_sending: Option<u64>,
    stop_sending_sent: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Stream {
    pub id: StreamId,
    pub send: SendHalf,
    pub recv: RecvHalf,
    /// Application has released its handle; the table may reap the stream
    /// once both halves are terminal.
    pub released: bool,
}

impl Stream {
    fn new(id: StreamId, side: Side, send_limit: u64, recv_limit: u64) -> Self {
        // A half that this side can never use starts terminal.
        let sendable = id.sendable_by(side);
        let receivable = id.receivable_by(side);
        Stream {
            id,
            send: SendHalf {
                state: if sendable { SendState::Ready } else { SendState::DataRecvd },
                queue: SendQueue::new(),
                max_stream_data: send_limit,
                max_sent: 0,
                blocked_sent_at: None,
                reset_code: None,
                reset_needs_send: false,
                last_ideal: 0,
            },
            recv: RecvHalf {
                state: if receivable { RecvState::Recv } else { RecvState::DataRead },
                buffer: RecvBuffer::new(),
                max_stream_data: recv_limit,
                window: recv_limit,
                final_size: None,
                reset_code: None,
                needs_max_update: false,
                stop_sending: None,
                stop_sending_sent: false,
            },
            released: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.send.state.is_terminal() && self.recv.state.is_terminal()
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Apply a STREAM frame. Returns newly readable byte count (0 when the
    /// frame filled no gap at the front).
    pub fn on_stream_frame(
        &mut self,
        offset: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<u64, TransportError> {
        if self.recv.state.is_reset() {
            // Data after reset is discarded.
            return Ok(0);
        }
        let end = offset + data.len() as u64;
        if end > VARINT_MAX {
            return Err(TransportError::FlowControlError("stream offset overflow"));
        }

        if let Some(final_size) = self.recv.final_size {
            // Any byte at or past the final size, or a FIN moving it.
            if end > final_size || (fin && end != final_size) {
                return Err(TransportError::FinalSizeError);
            }
        }
        if fin {
            if self.recv.buffer.highest_offset() > end {
                return Err(TransportError::FinalSizeError);
            }
            self.recv.final_size = Some(end);
            if self.recv.state == RecvState::Recv {
                self.recv.state = RecvState::SizeKnown;
            }
        }
        if end > self.recv.max_stream_data {
            return Err(TransportError::FlowControlError("stream data past limit"));
        }

        let before = self.recv.buffer.readable();
        self.recv.buffer.insert(offset, data)?;
        let readable = self.recv.buffer.readable();

        if self.recv.state == RecvState::SizeKnown
            && let Some(final_size) = self.recv.final_size
            && self.recv.buffer.delivered_offset() + readable == final_size
        {
            self.recv.state = RecvState::DataRecvd;
        }
        Ok(readable - before)
    }

    /// Apply RESET_STREAM: drop buffered data past the delivered prefix and
    /// surface the code.
    pub fn on_reset_stream(&mut self, code: u64, final_size: u64) -> Result<bool, TransportError> {
        if let Some(known) = self.recv.final_size
            && known != final_size
        {
            return Err(TransportError::FinalSizeError);
        }
        if final_size < self.recv.buffer.highest_offset() {
            return Err(TransportError::FinalSizeError);
        }
        if self.recv.state.is_reset() || self.recv.state == RecvState::DataRead {
            return Ok(false);
        }
        self.recv.final_size = Some(final_size);
        self.recv.state = RecvState::ResetRecvd;
        self.recv.reset_code = Some(code);
        self.recv.buffer.discard_pending();
        Ok(true)
    }

    /// Peer told us to stop sending: respond with RESET_STREAM carrying the
    /// requested code. Idempotent.
    pub fn on_stop_sending(&mut self, code: u64) -> bool {
        if self.send.state.is_reset() || self.send.state == SendState::DataRecvd {
            return false;
        }
        self.reset(code);
        true
    }

    pub fn on_max_stream_data(&mut self, limit: u64) -> bool {
        if limit > self.send.max_stream_data {
            self.send.max_stream_data = limit;
            self.send.blocked_sent_at = None;
            return true;
        }
        false
    }

    /// Application reads up to `max` bytes. Advances flow-control credit.
    pub fn read(&mut self, max: usize) -> (Vec<u8>, bool) {
        let data = self.recv.buffer.read(max);
        let at_end = self
            .recv
            .final_size
            .is_some_and(|fs| self.recv.buffer.delivered_offset() == fs);
        if at_end && self.recv.state == RecvState::DataRecvd {
            self.recv.state = RecvState::DataRead;
        }
        // Advance the window once half of it is consumed.
        if !self.recv.state.is_reset() && self.recv.final_size.is_none() {
            let target = self.recv.buffer.delivered_offset() + self.recv.window;
            if target >= self.recv.max_stream_data + self.recv.window / 2 {
                self.recv.max_stream_data = target;
                self.recv.needs_max_update = true;
            }
        }
        (data, at_end)
    }

    /// App finished with a reset stream.
    pub fn acknowledge_reset(&mut self) {
        if self.recv.state == RecvState::ResetRecvd {
            self.recv.state = RecvState::ResetRead;
        }
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    pub fn writable_by_flow(&self) -> bool {
        self.send.queue.frontier() < self.send.max_stream_data
    }

    /// Post application data.
    pub fn write(&mut self, data: &[u8], fin: bool, buffered: bool) -> Result<(), TransportError> {
        match self.send.state {
            SendState::Ready | SendState::Send => {}
            _ => return Err(TransportError::StreamStateError("write on closed send half")),
        }
        self.send.queue.write(data, fin, buffered);
        self.send.state = SendState::Send;
        Ok(())
    }

    /// App-initiated abrupt close of the send half.
    pub fn reset(&mut self, code: u64) {
        if self.send.state.is_reset() || self.send.state == SendState::DataRecvd {
            return;
        }
        self.send.state = SendState::ResetSent;
        self.send.reset_code = Some(code);
        self.send.reset_needs_send = true;
        self.send.queue.abandon();
    }

    /// RESET_STREAM frame to emit, if one is due.
    pub fn take_reset_frame(&mut self) -> Option<Frame> {
        if !self.send.reset_needs_send {
            return None;
        }
        self.send.reset_needs_send = false;
        Some(Frame::ResetStream {
            stream_id: self.id,
            error_code: self.send.reset_code.unwrap_or(0),
            final_size: self.send.queue.frontier(),
        })
    }

    /// Peer acked our RESET_STREAM.
    pub fn on_reset_acked(&mut self) {
        if self.send.state == SendState::ResetSent {
            self.send.state = SendState::ResetRecvd;
        }
    }

    pub fn on_reset_lost(&mut self) {
        if self.send.state == SendState::ResetSent {
            self.send.reset_needs_send = true;
        }
    }

    /// All stream bytes + FIN acknowledged.
    pub fn on_all_data_acked(&mut self) {
        if matches!(self.send.state, SendState::Send | SendState::DataSent)
            && self.send.queue.all_acked()
            && self.send.queue.fin_queued()
        {
            self.send.state = SendState::DataRecvd;
        }
    }

    pub fn on_fin_sent(&mut self) {
        if self.send.state == SendState::Send && self.send.queue.fin_queued() {
            self.send.state = SendState::DataSent;
        }
    }

    /// STREAM_DATA_BLOCKED, at most once per limit value.
    pub fn take_blocked_frame(&mut self) -> Option<Frame> {
        if self.send.state != SendState::Send && self.send.state != SendState::Ready {
            return None;
        }
        let limit = self.send.max_stream_data;
        if self.send.queue.frontier() < limit
            || !self.send.queue.has_sendable(u64::MAX)
            || self.send.blocked_sent_at == Some(limit)
        {
            return None;
        }
        self.send.blocked_sent_at = Some(limit);
        trace!(stream = %self.id, limit, "stream blocked on flow control");
        Some(Frame::StreamDataBlocked { stream_id: self.id, limit })
    }

    /// MAX_STREAM_DATA update, if the window advanced.
    pub fn take_max_stream_data_frame(&mut self) -> Option<Frame> {
        if !self.recv.needs_max_update || self.recv.state.is_reset() {
            return None;
        }
        self.recv.needs_max_update = false;
        Some(Frame::MaxStreamData { stream_id: self.id, limit: self.recv.max_stream_data })
    }

    /// The packet carrying our MAX_STREAM_DATA was lost.
    pub fn rearm_max_stream_data(&mut self) {
        if !self.recv.state.is_reset() {
            self.recv.needs_max_update = true;
        }
    }

    /// The packet carrying our STOP_SENDING was lost.
    pub fn rearm_stop_sending(&mut self) {
        self.recv.stop_sending_sent = false;
    }

    /// STOP_SENDING, once.
    pub fn take_stop_sending_frame(&mut self) -> Option<Frame> {
        let code = self.recv.stop_sending?;
        if self.recv.stop_sending_sent || self.recv.state.is_reset() {
            return None;
        }
        self.recv.stop_sending_sent = true;
        Some(Frame::StopSending { stream_id: self.id, error_code: code })
    }
}

// =============================================================================
// STREAM TABLE
// =============================================================================

/// Per-direction pair: [bidi, uni].
type PerDir<T> = [T; 2];

fn dir_index(dir: Dir) -> usize {
    match dir {
        Dir::Bi => 0,
        Dir::Uni => 1,
    }
}

/// The connection's stream collection plus stream-count and connection-level
/// flow control. The connection owns its streams outright: the table maps
/// IDs to records, and records are reaped when terminal and released.
pub struct StreamTable {
    side: Side,
    streams: HashMap<StreamId, Stream>,

    // Limits we place on peer-opened streams (counts).
    max_streams_local: PerDir<u64>,
    streams_window: PerDir<u64>,
    /// Count of peer streams created so far.
    opened_peer: PerDir<u64>,
    /// Count of peer streams fully closed and reaped.
    closed_peer: PerDir<u64>,
    needs_max_streams: PerDir<bool>,

    // Limits the peer places on us.
    max_streams_peer: PerDir<u64>,
    opened_local: PerDir<u64>,
    streams_blocked_sent: PerDir<bool>,

    // Connection-level flow control.
    /// Our advertised MAX_DATA.
    pub max_data_local: u64,
    max_data_window: u64,
    needs_max_data: bool,
    /// Sum of highest received offsets across all streams.
    pub rx_highest: u64,
    /// Sum of bytes consumed by the application.
    pub rx_consumed: u64,
    /// Peer's MAX_DATA.
    pub max_data_peer: u64,
    /// New stream bytes counted against the peer's MAX_DATA.
    pub tx_flow_sent: u64,
    data_blocked_sent_at: Option<u64>,

    // Initial per-stream limits from transport parameters.
    send_limit_bidi_local: u64,
    send_limit_bidi_remote: u64,
    send_limit_uni: u64,
    recv_limit_bidi_local: u64,
    recv_limit_bidi_remote: u64,
    recv_limit_uni: u64,
}

/// Initial limits taken from both sides' transport parameters.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub local_max_data: u64,
    pub peer_max_data: u64,
    pub local_max_streams: PerDir<u64>,
    pub peer_max_streams: PerDir<u64>,
    /// What the peer lets us send on each stream kind.
    pub peer_stream_data_bidi_local: u64,
    pub peer_stream_data_bidi_remote: u64,
    pub peer_stream_data_uni: u64,
    /// What we let the peer send.
    pub local_stream_data_bidi_local: u64,
    pub local_stream_data_bidi_remote: u64,
    pub local_stream_data_uni: u64,
}

impl StreamTable {
    pub fn new(side: Side, limits: StreamLimits) -> Self {
        StreamTable {
            side,
            streams: HashMap::new(),
            max_streams_local: limits.local_max_streams,
            streams_window: limits.local_max_streams,
            opened_peer: [0, 0],
            closed_peer: [0, 0],
            needs_max_streams: [false, false],
            max_streams_peer: limits.peer_max_streams,
            opened_local: [0, 0],
            streams_blocked_sent: [false, false],
            max_data_local: limits.local_max_data,
            max_data_window: limits.local_max_data,
            needs_max_data: false,
            rx_highest: 0,
            rx_consumed: 0,
            max_data_peer: limits.peer_max_data,
            tx_flow_sent: 0,
            data_blocked_sent_at: None,
            send_limit_bidi_local: limits.peer_stream_data_bidi_remote,
            send_limit_bidi_remote: limits.peer_stream_data_bidi_local,
            send_limit_uni: limits.peer_stream_data_uni,
            recv_limit_bidi_local: limits.local_stream_data_bidi_local,
            recv_limit_bidi_remote: limits.local_stream_data_bidi_remote,
            recv_limit_uni: limits.local_stream_data_uni,
        }
    }

    /// Refresh peer-derived limits once transport parameters arrive (streams
    /// can exist earlier, during 0-RTT or an unfinished handshake).
    pub fn apply_peer_limits(&mut self, limits: &StreamLimits) {
        self.max_data_peer = self.max_data_peer.max(limits.peer_max_data);
        for dir in [Dir::Bi, Dir::Uni] {
            let i = dir_index(dir);
            self.max_streams_peer[i] = self.max_streams_peer[i].max(limits.peer_max_streams[i]);
        }
        self.send_limit_bidi_local = limits.peer_stream_data_bidi_remote;
        self.send_limit_bidi_remote = limits.peer_stream_data_bidi_local;
        self.send_limit_uni = limits.peer_stream_data_uni;
    }

    fn initial_limits_for(&self, id: StreamId) -> (u64, u64) {
        // (what we may send, what the peer may send)
        let local_initiated = id.initiator() == self.side;
        match (id.dir(), local_initiated) {
            (Dir::Bi, true) => (self.send_limit_bidi_local, self.recv_limit_bidi_local),
            (Dir::Bi, false) => (self.send_limit_bidi_remote, self.recv_limit_bidi_remote),
            (Dir::Uni, true) => (self.send_limit_uni, 0),
            (Dir::Uni, false) => (0, self.recv_limit_uni),
        }
    }

    /// Open a locally initiated stream. Fails against the peer's stream
    /// limit; the caller may queue STREAMS_BLOCKED.
    pub fn open_local(&mut self, dir: Dir) -> Result<StreamId, TransportError> {
        let i = dir_index(dir);
        if self.opened_local[i] >= self.max_streams_peer[i] {
            return Err(TransportError::StreamLimitError);
        }
        let id = StreamId::new(self.side, dir, self.opened_local[i]);
        self.opened_local[i] += 1;
        let (send_limit, recv_limit) = self.initial_limits_for(id);
        self.streams.insert(id, Stream::new(id, self.side, send_limit, recv_limit));
        trace!(stream = %id, "opened local stream");
        Ok(id)
    }

    /// Look up a stream referenced by an incoming frame, creating it (and
    /// any lower-numbered peers of the same kind) implicitly when the peer
    /// is entitled to open it.
    pub fn get_or_create(
        &mut self,
        id: StreamId,
        notices: &mut Vec<StreamNotice>,
    ) -> Result<&mut Stream, TransportError> {
        if self.streams.contains_key(&id) {
            return Ok(self.streams.get_mut(&id).unwrap());
        }
        if id.initiator() == self.side {
            // A frame for a local stream we never opened (or already reaped).
            if id.index() >= self.opened_local[dir_index(id.dir())] {
                return Err(TransportError::StreamStateError("peer used unopened local stream"));
            }
            return Err(TransportError::StreamStateError("stream already closed"));
        }

        let i = dir_index(id.dir());
        if id.index() >= self.max_streams_local[i] {
            debug!(stream = %id, limit = self.max_streams_local[i], "peer exceeded stream limit");
            return Err(TransportError::StreamLimitError);
        }
        if id.index() < self.opened_peer[i] {
            // Previously created and since reaped.
            return Err(TransportError::StreamStateError("stream already closed"));
        }
        for index in self.opened_peer[i]..=id.index() {
            let new_id = StreamId::new(self.side.peer(), id.dir(), index);
            let (send_limit, recv_limit) = self.initial_limits_for(new_id);
            self.streams.insert(new_id, Stream::new(new_id, self.side, send_limit, recv_limit));
            notices.push(StreamNotice::Opened(new_id));
        }
        self.opened_peer[i] = id.index() + 1;
        Ok(self.streams.get_mut(&id).unwrap())
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// Connection-level receive accounting for newly covered offsets.
    /// `new_highest` is the stream's highest offset after the frame.
    pub fn account_rx(&mut self, old_highest: u64, new_highest: u64) -> Result<(), TransportError> {
        if new_highest <= old_highest {
            return Ok(());
        }
        self.rx_highest += new_highest - old_highest;
        if self.rx_highest > self.max_data_local {
            return Err(TransportError::FlowControlError("connection data past MAX_DATA"));
        }
        Ok(())
    }

    /// Application consumed `n` bytes: advance MAX_DATA when half the
    /// window is used up.
    pub fn account_consumed(&mut self, n: u64) {
        self.rx_consumed += n;
        let target = self.rx_consumed + self.max_data_window;
        if target >= self.max_data_local + self.max_data_window / 2 {
            self.max_data_local = target;
            self.needs_max_data = true;
        }
    }

    /// Connection-level send credit still available for new bytes.
    pub fn tx_credit(&self) -> u64 {
        self.max_data_peer.saturating_sub(self.tx_flow_sent)
    }

    pub fn consume_tx_credit(&mut self, n: u64) {
        debug_assert!(n <= self.tx_credit());
        self.tx_flow_sent += n;
    }

    pub fn on_max_data(&mut self, limit: u64) {
        if limit > self.max_data_peer {
            self.max_data_peer = limit;
            self.data_blocked_sent_at = None;
        }
    }

    pub fn on_max_streams(&mut self, dir: Dir, limit: u64) {
        let i = dir_index(dir);
        if limit > self.max_streams_peer[i] {
            self.max_streams_peer[i] = limit;
            self.streams_blocked_sent[i] = false;
        }
    }

    /// MAX_DATA update frame, if due.
    pub fn take_max_data_frame(&mut self) -> Option<Frame> {
        if !self.needs_max_data {
            return None;
        }
        self.needs_max_data = false;
        Some(Frame::MaxData(self.max_data_local))
    }

    /// DATA_BLOCKED, at most once per limit value.
    pub fn take_data_blocked_frame(&mut self) -> Option<Frame> {
        if self.tx_credit() > 0 || self.data_blocked_sent_at == Some(self.max_data_peer) {
            return None;
        }
        let any_waiting = self
            .streams
            .values()
            .any(|s| s.send.queue.has_sendable(s.send.max_stream_data));
        if !any_waiting {
            return None;
        }
        self.data_blocked_sent_at = Some(self.max_data_peer);
        Some(Frame::DataBlocked(self.max_data_peer))
    }

    /// STREAMS_BLOCKED when a local open failed against the peer limit.
    pub fn take_streams_blocked_frame(&mut self, dir: Dir) -> Option<Frame> {
        let i = dir_index(dir);
        if self.streams_blocked_sent[i] {
            return None;
        }
        self.streams_blocked_sent[i] = true;
        Some(Frame::StreamsBlocked { dir, limit: self.max_streams_peer[i] })
    }

    /// MAX_STREAMS updates for the peer, if the window advanced.
    pub fn take_max_streams_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        for dir in [Dir::Bi, Dir::Uni] {
            let i = dir_index(dir);
            if self.needs_max_streams[i] {
                self.needs_max_streams[i] = false;
                frames.push(Frame::MaxStreams { dir, limit: self.max_streams_local[i] });
            }
        }
        frames
    }

    /// Reap terminal, released streams; returns notices and advances the
    /// peer's stream windows.
    pub fn reap(&mut self, notices: &mut Vec<StreamNotice>) {
        let dead: Vec<StreamId> = self
            .streams
            .values()
            .filter(|s| s.is_terminal() && s.released)
            .map(|s| s.id)
            .collect();
        for id in dead {
            self.streams.remove(&id);
            notices.push(StreamNotice::Closed(id));
            if id.initiator() != self.side {
                let i = dir_index(id.dir());
                self.closed_peer[i] += 1;
                let target = self.closed_peer[i] + self.streams_window[i];
                if target >= self.max_streams_local[i] + self.streams_window[i] / 2 {
                    self.max_streams_local[i] = target;
                    self.needs_max_streams[i] = true;
                }
            }
        }
    }

    /// Force MAX_STREAMS advertisement (handshake confirmation).
    pub fn advertise_stream_limits(&mut self) {
        self.needs_max_streams = [true, true];
    }

    /// The packet carrying MAX_DATA was lost.
    pub fn rearm_max_data(&mut self) {
        self.needs_max_data = true;
    }

    /// The packet carrying MAX_STREAMS was lost.
    pub fn rearm_max_streams(&mut self, dir: Dir) {
        self.needs_max_streams[dir_index(dir)] = true;
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> StreamLimits {
        StreamLimits {
            local_max_data: 10_000,
            peer_max_data: 10_000,
            local_max_streams: [4, 4],
            peer_max_streams: [4, 4],
            peer_stream_data_bidi_local: 1000,
            peer_stream_data_bidi_remote: 1000,
            peer_stream_data_uni: 1000,
            local_stream_data_bidi_local: 1000,
            local_stream_data_bidi_remote: 1000,
            local_stream_data_uni: 1000,
        }
    }

    fn table(side: Side) -> StreamTable {
        StreamTable::new(side, limits())
    }

    #[test]
    fn implicit_creation_up_to_index() {
        let mut t = table(Side::Server);
        let mut notices = Vec::new();
        let id = StreamId::new(Side::Client, Dir::Bi, 2);
        t.get_or_create(id, &mut notices).unwrap();
        // Streams 0, 1, 2 all exist now.
        assert_eq!(t.len(), 3);
        assert_eq!(notices.len(), 3);
    }

    #[test]
    fn stream_limit_enforced() {
        let mut t = table(Side::Server);
        let mut notices = Vec::new();
        let id = StreamId::new(Side::Client, Dir::Uni, 4);
        assert_eq!(
            t.get_or_create(id, &mut notices),
            Err(TransportError::StreamLimitError)
        );
    }

    #[test]
    fn local_open_against_peer_limit() {
        let mut t = table(Side::Client);
        for _ in 0..4 {
            t.open_local(Dir::Bi).unwrap();
        }
        assert_eq!(t.open_local(Dir::Bi), Err(TransportError::StreamLimitError));
        let blocked = t.take_streams_blocked_frame(Dir::Bi).unwrap();
        assert_eq!(blocked, Frame::StreamsBlocked { dir: Dir::Bi, limit: 4 });
        // Only once.
        assert!(t.take_streams_blocked_frame(Dir::Bi).is_none());
    }

    #[test]
    fn fin_fixes_final_size() {
        let mut t = table(Side::Server);
        let mut notices = Vec::new();
        let id = StreamId::new(Side::Client, Dir::Bi, 0);
        let s = t.get_or_create(id, &mut notices).unwrap();
        s.on_stream_frame(0, b"hello", true).unwrap();
        assert_eq!(s.recv.state, RecvState::DataRecvd);
        // Byte past the final size.
        assert_eq!(s.on_stream_frame(5, b"x", false), Err(TransportError::FinalSizeError));
        // FIN at a different size.
        assert_eq!(s.on_stream_frame(0, b"hello!", true), Err(TransportError::FinalSizeError));
    }

    #[test]
    fn stream_flow_limit_enforced() {
        let mut t = table(Side::Server);
        let mut notices = Vec::new();
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        let s = t.get_or_create(id, &mut notices).unwrap();
        let much = vec![0u8; 1001];
        assert!(matches!(
            s.on_stream_frame(0, &much, false),
            Err(TransportError::FlowControlError(_))
        ));
    }

    #[test]
    fn window_advances_at_half() {
        let mut t = table(Side::Server);
        let mut notices = Vec::new();
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        let s = t.get_or_create(id, &mut notices).unwrap();
        s.on_stream_frame(0, &vec![0u8; 600], false).unwrap();
        let (data, _) = s.read(600);
        assert_eq!(data.len(), 600);
        let frame = s.take_max_stream_data_frame().unwrap();
        assert_eq!(frame, Frame::MaxStreamData { stream_id: id, limit: 1600 });
        assert!(s.take_max_stream_data_frame().is_none());
    }

    #[test]
    fn reset_discards_undelivered() {
        let mut t = table(Side::Client);
        let mut notices = Vec::new();
        let id = StreamId::new(Side::Server, Dir::Uni, 0);
        let s = t.get_or_create(id, &mut notices).unwrap();
        s.on_stream_frame(0, &vec![1u8; 40], false).unwrap();
        s.read(40);
        assert!(s.on_reset_stream(7, 100).unwrap());
        assert_eq!(s.recv.state, RecvState::ResetRecvd);
        assert_eq!(s.recv.reset_code, Some(7));
        assert_eq!(s.recv.buffer.readable(), 0);
        // Re-delivery of the same reset is a no-op.
        assert!(!s.on_reset_stream(7, 100).unwrap());
        // Conflicting final size is fatal.
        assert_eq!(s.on_reset_stream(7, 90), Err(TransportError::FinalSizeError));
    }

    #[test]
    fn stop_sending_triggers_reset() {
        let mut t = table(Side::Client);
        t.open_local(Dir::Bi).unwrap();
        let id = StreamId::new(Side::Client, Dir::Bi, 0);
        let s = t.get_mut(id).unwrap();
        s.write(b"data", false, true).unwrap();
        assert!(s.on_stop_sending(9));
        assert_eq!(s.send.state, SendState::ResetSent);
        let frame = s.take_reset_frame().unwrap();
        assert_eq!(
            frame,
            Frame::ResetStream { stream_id: id, error_code: 9, final_size: 4 }
        );
        // Idempotent.
        assert!(!s.on_stop_sending(9));
        assert!(s.take_reset_frame().is_none());
    }

    #[test]
    fn blocked_frame_once_per_window() {
        let mut t = table(Side::Client);
        t.open_local(Dir::Uni).unwrap();
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        let s = t.get_mut(id).unwrap();
        s.write(&vec![0u8; 1000], false, true).unwrap();
        // Drain to the limit.
        let (_, bytes, _) = s.send.queue.dequeue(2000, 1000).unwrap();
        assert_eq!(bytes.len(), 1000);
        s.write(&vec![0u8; 10], false, true).unwrap();
        assert!(s.take_blocked_frame().is_some());
        assert!(s.take_blocked_frame().is_none());
        // A higher limit rearms the frame.
        assert!(s.on_max_stream_data(1500));
        let (_, bytes, _) = s.send.queue.dequeue(2000, 1500).unwrap();
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn connection_flow_accounting() {
        let mut t = table(Side::Server);
        assert!(t.account_rx(0, 4000).is_ok());
        assert!(t.account_rx(0, 7000).is_err()); // 11000 > 10000

        t.account_consumed(6000);
        let frame = t.take_max_data_frame().unwrap();
        assert_eq!(frame, Frame::MaxData(16_000));
    }

    #[test]
    fn reap_advances_stream_window() {
        let mut t = table(Side::Server);
        let mut notices = Vec::new();
        for index in 0..2 {
            let id = StreamId::new(Side::Client, Dir::Uni, index);
            let s = t.get_or_create(id, &mut notices).unwrap();
            s.on_stream_frame(0, b"x", true).unwrap();
            s.read(1);
            s.released = true;
            assert!(s.is_terminal());
        }
        let mut notices = Vec::new();
        t.reap(&mut notices);
        assert_eq!(
            notices.iter().filter(|n| matches!(n, StreamNotice::Closed(_))).count(),
            2
        );
        assert_eq!(t.len(), 0);
        // Closing half the window (2 of 4) advances the advertised limit.
        let frames = t.take_max_streams_frames();
        assert_eq!(frames, vec![Frame::MaxStreams { dir: Dir::Uni, limit: 6 }]);
        // Reopening a reaped stream ID fails.
        let mut notices = Vec::new();
        assert!(t.get_or_create(StreamId::new(Side::Client, Dir::Uni, 0), &mut notices).is_err());
    }
}
