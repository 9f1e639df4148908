//! The per-connection protocol engine: operation processing, handshake
//! progression, frame handling, key updates, and the send build loop.
//!
//! A connection is owned by exactly one worker and mutated only there.
//! Stimuli arrive as [`Op`]s drained in FIFO order; after each op a flush
//! runs loss detection and build passes until the send allowance is gone.

use crate::builder::{BuiltPacket, DatagramBuilder, Pacer};
use crate::cid::{Cid, DestCidList, SourceCidList};
use crate::config::{Settings, TransportParams};
use crate::congestion::Controller;
use crate::crypto::EpochKeys;
use crate::datagram::{DatagramQueue, DatagramState};
use crate::datapath::{Datagram, Transmit};
use crate::error::{ApiError, CloseReason, TransportError};
use crate::frame::Frame;
use crate::loss::{LossDetection, SentFrame, SentPacket};
use crate::packet::{self, HeaderForm, PartialPacket};
use crate::path::{Path, PathValidReason, port_change_only};
use crate::recv_buffer::RecvBuffer;
use crate::send_buffer::{SendBuffer, SendQueue, ideal_changed};
use crate::space::PacketSpace;
use crate::stream::{StreamLimits, StreamNotice, StreamTable};
use crate::tls::{TlsEvent, TlsSession};
use crate::types::{
    CLOSE_PTO_COUNT, Dir, Epoch, EPOCH_COUNT, MAX_HANDSHAKE_PTO_COUNT, MAX_PATHS,
    MIN_INITIAL_DATAGRAM, QUIC_VERSION_1, RESET_TOKEN_LEN, Side, StreamId, TAG_LEN,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Issues and retires source CIDs in the binding's lookup on behalf of a
/// connection. Returns None when eight fresh CIDs in a row collided.
pub trait CidAuthority: Send + Sync {
    fn issue_cid(&self, partition: u8) -> Option<(Cid, [u8; RESET_TOKEN_LEN])>;
    fn retire_cid(&self, cid: &Cid);
}

/// How the application wants a stream closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// FIN after queued data.
    Graceful,
    /// RESET_STREAM with this code.
    AbortSend(u64),
    /// STOP_SENDING with this code.
    AbortReceive(u64),
    /// Both directions.
    Abort(u64),
}

/// Settable per-connection parameters.
#[derive(Debug, Clone, Copy)]
pub enum Param {
    IdleTimeout(Duration),
    KeepAlive(Option<Duration>),
}

/// API operations, enqueued from any thread.
pub enum ApiOp {
    StreamOpen { dir: Dir, reply: oneshot::Sender<Result<StreamId, ApiError>> },
    StreamSend { id: StreamId, data: Vec<u8>, fin: bool },
    /// Grant receive credit after a StreamData event.
    ReceiveComplete { id: StreamId, consumed: usize },
    StreamShutdown { id: StreamId, kind: ShutdownKind },
    /// The application is done with the stream handle.
    StreamRelease { id: StreamId },
    DatagramSend { data: Vec<u8>, reply: oneshot::Sender<Result<u64, ApiError>> },
    KeyUpdate,
    Shutdown { code: u64 },
    SetParam(Param),
    GetStats { reply: oneshot::Sender<ConnStats> },
}

/// Everything a connection reacts to.
pub enum Op {
    Receive(Datagram),
    Api(ApiOp),
    Timer,
}

/// Events surfaced to the application.
#[derive(Debug)]
pub enum Event {
    Connected { alpn: Option<Vec<u8>> },
    StreamOpened { id: StreamId },
    /// Readable bytes, indicated without being consumed; answer with
    /// ReceiveComplete carrying the consumed count.
    StreamData { id: StreamId, data: Vec<u8>, fin: bool },
    /// Deferred send completions that became final.
    SendComplete { id: StreamId, count: u32 },
    /// A stream half was shut down by the peer.
    StreamShutdown { id: StreamId, send_closed: bool, recv_closed: bool, code: u64 },
    StreamClosed { id: StreamId },
    IdealSendBuffer { id: StreamId, bytes: u64 },
    DatagramReceived { data: Vec<u8> },
    DatagramSendState { id: u64, state: DatagramState },
    NewToken { token: Vec<u8> },
    ResumptionTicket { ticket: Vec<u8> },
    ShutdownByTransport { code: u64, reason: String },
    ShutdownByPeer { code: u64 },
    ShutdownComplete { reason: CloseReason },
}

/// Counters surfaced through GetStats.
#[derive(Debug, Clone, Default)]
pub struct ConnStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub decrypt_failures: u64,
    pub stale_packets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub lost_bytes: u64,
    pub congestion_events: u64,
    pub key_updates: u64,
    pub ptos: u64,
    pub smoothed_rtt: Duration,
    pub cwnd: u64,
    pub congestion_algorithm: &'static str,
}

#[derive(Debug)]
enum ConnState {
    Handshaking,
    Connected,
    /// We sent (or are about to send) CONNECTION_CLOSE.
    Closing { code: u64, application: bool, reason: Vec<u8>, drain_until: Instant },
    /// Peer closed; we only wait out the drain period.
    Draining { until: Instant },
    Closed,
}

/// Send flags not owned by a substructure.
#[derive(Debug, Default)]
struct Pending {
    handshake_done: bool,
    ping: [bool; EPOCH_COUNT],
    /// Token to (re)send in NEW_TOKEN, cleared on ack.
    new_token: Option<Vec<u8>>,
    /// NEW_CONNECTION_ID retransmissions by sequence.
    new_cid_seqs: Vec<u64>,
    /// CONNECTION_CLOSE wants (re)sending.
    close: bool,
    close_resends: u32,
    /// STREAMS_BLOCKED to emit after a refused local open.
    streams_blocked: [bool; 2],
}

pub struct Connection {
    side: Side,
    state: ConnState,
    version: u32,
    settings: Settings,
    partition: u8,
    tls: Box<dyn TlsSession>,
    cid_authority: Arc<dyn CidAuthority>,

    keys: [Option<EpochKeys>; EPOCH_COUNT],
    /// Phase bit on 1-RTT packets we send.
    key_phase: bool,
    /// Phase of the current remote read key.
    remote_key_phase: bool,
    /// We initiated an update and the peer has not followed yet.
    local_update_pending: bool,
    prev_remote_key: Option<(Box<dyn crate::crypto::PacketKey>, Instant)>,

    spaces: [PacketSpace; EPOCH_COUNT],
    crypto_recv: [RecvBuffer; EPOCH_COUNT],
    crypto_send: [SendQueue; EPOCH_COUNT],
    loss: LossDetection,
    cc: Controller,
    pacer: Pacer,

    paths: Vec<Path>,
    next_path_id: u8,
    source_cids: SourceCidList,
    dest_cids: DestCidList,
    streams: StreamTable,
    datagrams: DatagramQueue,
    send_buffer: SendBuffer,

    peer_params: Option<TransportParams>,
    events: mpsc::UnboundedSender<Event>,
    pend: Pending,
    /// Streams with an outstanding StreamData indication.
    awaiting_receive: HashSet<StreamId>,

    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    keep_alive_deadline: Option<Instant>,

    original_dcid: Cid,
    retry_scid: Option<Cid>,
    /// Token to put in Initial packets (client).
    token: Vec<u8>,

    handshake_complete: bool,
    handshake_confirmed: bool,
    cids_issued: bool,
    spin: bool,
    /// Highest CE count the peer has reported per space.
    ce_reported: [u64; EPOCH_COUNT],
    pub stats: ConnStats,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    fn new(
        side: Side,
        settings: Settings,
        tls: Box<dyn TlsSession>,
        cid_authority: Arc<dyn CidAuthority>,
        local: SocketAddr,
        remote: SocketAddr,
        partition: u8,
        events: mpsc::UnboundedSender<Event>,
        now: Instant,
    ) -> Self {
        let idle_timeout =
            (settings.idle_timeout > Duration::ZERO).then_some(settings.idle_timeout);
        let limits = StreamLimits {
            local_max_data: settings.max_data,
            peer_max_data: 0,
            local_max_streams: [settings.max_streams_bidi, settings.max_streams_uni],
            peer_max_streams: [0, 0],
            peer_stream_data_bidi_local: 0,
            peer_stream_data_bidi_remote: 0,
            peer_stream_data_uni: 0,
            local_stream_data_bidi_local: settings.stream_data_bidi_local,
            local_stream_data_bidi_remote: settings.stream_data_bidi_remote,
            local_stream_data_uni: settings.stream_data_uni,
        };
        let mut conn = Connection {
            side,
            state: ConnState::Handshaking,
            version: QUIC_VERSION_1,
            partition,
            tls,
            cid_authority,
            keys: [None, None, None],
            key_phase: false,
            remote_key_phase: false,
            local_update_pending: false,
            prev_remote_key: None,
            spaces: [
                PacketSpace::new(Epoch::Initial),
                PacketSpace::new(Epoch::Handshake),
                PacketSpace::new(Epoch::AppData),
            ],
            crypto_recv: Default::default(),
            crypto_send: Default::default(),
            loss: LossDetection::new(),
            cc: Controller::new(settings.congestion, 1200, now),
            pacer: Pacer::new(),
            paths: vec![Path::new(0, local, remote, Cid::EMPTY)],
            next_path_id: 1,
            source_cids: SourceCidList::default(),
            dest_cids: DestCidList::default(),
            streams: StreamTable::new(side, limits),
            datagrams: DatagramQueue::new(),
            send_buffer: SendBuffer::new(),
            peer_params: None,
            events,
            pend: Pending::default(),
            awaiting_receive: HashSet::new(),
            idle_timeout,
            idle_deadline: idle_timeout.map(|t| now + t),
            keep_alive_deadline: settings.keep_alive.map(|k| now + k),
            original_dcid: Cid::EMPTY,
            retry_scid: None,
            token: Vec::new(),
            handshake_complete: false,
            handshake_confirmed: false,
            cids_issued: false,
            spin: false,
            ce_reported: [0; EPOCH_COUNT],
            stats: ConnStats::default(),
            settings,
        };
        conn.paths[0].is_active = true;
        conn.stats.congestion_algorithm = conn.cc.name();
        conn
    }

    /// Client side. The TLS session must already carry our transport
    /// parameters. `token` is a stored NEW_TOKEN from a prior connection.
    #[allow(clippy::too_many_arguments)]
    pub fn new_client(
        settings: Settings,
        tls: Box<dyn TlsSession>,
        cid_authority: Arc<dyn CidAuthority>,
        local: SocketAddr,
        remote: SocketAddr,
        partition: u8,
        token: Vec<u8>,
        events: mpsc::UnboundedSender<Event>,
        now: Instant,
    ) -> Result<(Self, Cid), TransportError> {
        let mut conn = Connection::new(
            Side::Client,
            settings,
            tls,
            cid_authority,
            local,
            remote,
            partition,
            events,
            now,
        );
        // The first destination CID is random; the server replaces it.
        let original_dcid = Cid::random(8);
        conn.original_dcid = original_dcid;
        conn.dest_cids.seed(0, original_dcid, None);
        conn.paths[0].dcid = original_dcid;
        // Clients learn their address works by completing the handshake.
        conn.paths[0].validated = true;
        conn.token = token;
        conn.keys[Epoch::Initial.index()] = Some(EpochKeys::initial(&original_dcid, true));

        let (scid, reset_token) = conn
            .cid_authority
            .issue_cid(partition)
            .ok_or(TransportError::InternalError("cid collisions"))?;
        conn.source_cids.push(scid, reset_token);
        let params = TransportParams::from_settings(&conn.settings, scid, None, None, None);
        conn.tls.set_transport_params(params.encode());
        info!(%original_dcid, %scid, "client connection start");
        Ok((conn, scid))
    }

    /// Server side, from a validated (or fresh) Initial. `odcid` is the
    /// DCID of the client's very first Initial; `retry_scid` the CID our
    /// Retry told the client to use; `validated` when a retry token proved
    /// the address.
    #[allow(clippy::too_many_arguments)]
    pub fn new_server(
        settings: Settings,
        tls: Box<dyn TlsSession>,
        cid_authority: Arc<dyn CidAuthority>,
        local: SocketAddr,
        remote: SocketAddr,
        partition: u8,
        odcid: Cid,
        client_scid: Cid,
        retry_scid: Option<Cid>,
        validated: bool,
        events: mpsc::UnboundedSender<Event>,
        now: Instant,
    ) -> Result<(Self, Cid), TransportError> {
        let mut conn = Connection::new(
            Side::Server,
            settings,
            tls,
            cid_authority,
            local,
            remote,
            partition,
            events,
            now,
        );
        conn.original_dcid = odcid;
        conn.retry_scid = retry_scid;
        conn.dest_cids.seed(0, client_scid, None);
        conn.paths[0].dcid = client_scid;
        if validated {
            conn.paths[0].set_valid(PathValidReason::InitialToken);
        }
        // Initial keys bind to the DCID the client is currently targeting:
        // the retry CID after a retry, the original otherwise.
        let initial_dcid = retry_scid.unwrap_or(odcid);
        conn.keys[Epoch::Initial.index()] = Some(EpochKeys::initial(&initial_dcid, false));

        let (scid, reset_token) = conn
            .cid_authority
            .issue_cid(partition)
            .ok_or(TransportError::InternalError("cid collisions"))?;
        conn.source_cids.push(scid, reset_token);
        let params = TransportParams::from_settings(
            &conn.settings,
            scid,
            Some(odcid),
            retry_scid,
            Some(reset_token),
        );
        conn.tls.set_transport_params(params.encode());
        info!(%odcid, %scid, "server connection accepted");
        Ok((conn, scid))
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_handshake_confirmed(&self) -> bool {
        self.handshake_confirmed
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.cc.bytes_in_flight()
    }

    pub fn congestion_window(&self) -> u64 {
        self.cc.window()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed)
    }

    /// The worker drops the connection once this reports true.
    pub fn is_drained(&self, now: Instant) -> bool {
        match &self.state {
            ConnState::Closed => true,
            ConnState::Closing { drain_until, .. } => now >= *drain_until,
            ConnState::Draining { until } => now >= *until,
            _ => false,
        }
    }

    /// Source CIDs the binding should still route to us.
    pub fn active_source_cids(&self) -> Vec<Cid> {
        self.source_cids.iter().filter(|c| !c.retired).map(|c| c.cid).collect()
    }

    // ==================================================================
    // OPERATION DISPATCH
    // ==================================================================

    pub fn handle_op(&mut self, op: Op, now: Instant) {
        match op {
            Op::Receive(datagram) => self.on_datagram(datagram, now),
            Op::Api(api) => self.on_api(api, now),
            Op::Timer => self.on_timer(now),
        }
    }

    fn on_api(&mut self, op: ApiOp, now: Instant) {
        match op {
            ApiOp::StreamOpen { dir, reply } => {
                let result = if self.conn_usable() {
                    match self.streams.open_local(dir) {
                        Ok(id) => Ok(id),
                        Err(_) => {
                            // Tell the peer we want more streams.
                            self.pend.streams_blocked[dir_index(dir)] = true;
                            Err(ApiError::InvalidState)
                        }
                    }
                } else {
                    Err(ApiError::Aborted)
                };
                let _ = reply.send(result);
            }
            ApiOp::StreamSend { id, data, fin } => self.api_stream_send(id, data, fin),
            ApiOp::ReceiveComplete { id, consumed } => self.api_receive_complete(id, consumed),
            ApiOp::StreamShutdown { id, kind } => self.api_stream_shutdown(id, kind),
            ApiOp::StreamRelease { id } => {
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.released = true;
                }
                self.reap_streams();
            }
            ApiOp::DatagramSend { data, reply } => {
                let limit = self.datagram_limit();
                let result = if self.conn_usable() {
                    self.datagrams.enqueue(data, limit)
                } else {
                    Err(ApiError::Aborted)
                };
                let _ = reply.send(result);
            }
            ApiOp::KeyUpdate => {
                if let Err(error) = self.initiate_key_update() {
                    debug!(%error, "key update refused");
                }
            }
            ApiOp::Shutdown { code } => {
                self.close_application(code, now);
            }
            ApiOp::SetParam(param) => match param {
                Param::IdleTimeout(timeout) => {
                    self.idle_timeout = (timeout > Duration::ZERO).then_some(timeout);
                    self.idle_deadline = self.idle_timeout.map(|t| now + t);
                }
                Param::KeepAlive(interval) => {
                    self.settings.keep_alive = interval;
                    self.keep_alive_deadline = interval.map(|k| now + k);
                }
            },
            ApiOp::GetStats { reply } => {
                let mut stats = self.stats.clone();
                stats.smoothed_rtt = self.paths[0].rtt.smoothed;
                stats.cwnd = self.cc.window();
                let _ = reply.send(stats);
            }
        }
    }

    fn conn_usable(&self) -> bool {
        matches!(self.state, ConnState::Handshaking | ConnState::Connected)
    }

    fn datagram_limit(&self) -> u64 {
        if self.settings.max_datagram_frame_size == 0 {
            return 0;
        }
        self.peer_params.as_ref().map(|p| p.max_datagram_frame_size).unwrap_or(0)
    }

    fn api_stream_send(&mut self, id: StreamId, data: Vec<u8>, fin: bool) {
        if !self.conn_usable() {
            return;
        }
        let buffering = self.settings.send_buffering && self.send_buffer.has_space();
        let Some(stream) = self.streams.get_mut(id) else {
            debug!(stream = %id, "send on unknown stream");
            return;
        };
        let len = data.len() as u64;
        match stream.write(&data, fin, buffering) {
            Ok(()) => {
                if buffering {
                    self.send_buffer.buffered_bytes += len;
                    // Copied and done: complete to the app immediately.
                    self.send_event(Event::SendComplete { id, count: 1 });
                }
            }
            Err(error) => debug!(stream = %id, %error, "send rejected"),
        }
    }

    fn api_receive_complete(&mut self, id: StreamId, consumed: usize) {
        self.awaiting_receive.remove(&id);
        let Some(stream) = self.streams.get_mut(id) else { return };
        let (data, _at_end) = stream.read(consumed);
        let consumed = data.len() as u64;
        if stream.recv.state == crate::stream::RecvState::ResetRecvd {
            stream.acknowledge_reset();
        }
        self.streams.account_consumed(consumed);
        self.indicate_readable(id);
        self.reap_streams();
    }

    fn api_stream_shutdown(&mut self, id: StreamId, kind: ShutdownKind) {
        let Some(stream) = self.streams.get_mut(id) else { return };
        match kind {
            ShutdownKind::Graceful => {
                if !stream.send.queue.fin_queued() {
                    let _ = stream.write(&[], true, true);
                }
            }
            ShutdownKind::AbortSend(code) => stream.reset(code),
            ShutdownKind::AbortReceive(code) => {
                stream.recv.stop_sending = Some(code);
            }
            ShutdownKind::Abort(code) => {
                stream.reset(code);
                stream.recv.stop_sending = Some(code);
            }
        }
    }

    // ==================================================================
    // RECEIVE PATH
    // ==================================================================

    fn on_datagram(&mut self, datagram: Datagram, now: Instant) {
        if matches!(self.state, ConnState::Closed) {
            return;
        }
        if let ConnState::Draining { .. } = self.state {
            // Nothing is sent or processed while draining.
            return;
        }
        self.stats.bytes_received += datagram.payload.len() as u64;

        let Some(path_index) = self.path_for(&datagram, now) else {
            self.stats.packets_dropped += 1;
            return;
        };
        self.paths[path_index].on_bytes_received(datagram.payload.len());

        let payload = datagram.payload;
        let mut offset = 0;
        let mut non_probing_on_path = false;
        while offset < payload.len() {
            let local_cid_len = self.source_cids.iter().next().map(|c| c.cid.len()).unwrap_or(0);
            let (partial, next) = match PartialPacket::decode(&payload, offset, local_cid_len) {
                Ok(v) => v,
                Err(error) => {
                    trace!(%error, "undecodable packet remainder dropped");
                    self.stats.packets_dropped += 1;
                    break;
                }
            };
            offset = next;
            match self.on_packet(&partial, path_index, now) {
                Ok(non_probing) => non_probing_on_path |= non_probing,
                Err(error) => {
                    self.close_transport(error, now);
                    return;
                }
            }
        }

        // A validated non-active path carrying real data becomes active.
        if non_probing_on_path && path_index != 0 && self.paths[path_index].validated {
            self.promote_path(path_index, now);
        }

        if let Some(timeout) = self.idle_timeout {
            self.idle_deadline = Some(now + timeout);
        }
    }

    /// Find or create the path this datagram belongs to. New tuples are
    /// only tracked once the handshake is confirmed.
    fn path_for(&mut self, datagram: &Datagram, now: Instant) -> Option<usize> {
        if let Some(index) =
            self.paths.iter().position(|p| p.matches(&datagram.local, &datagram.remote))
        {
            return Some(index);
        }
        if !self.handshake_confirmed {
            return None;
        }
        if self
            .peer_params
            .as_ref()
            .is_some_and(|p| p.disable_active_migration)
        {
            debug!("datagram from new tuple with migration disabled");
            return None;
        }
        if self.paths.len() == MAX_PATHS {
            // Replace the previous probing path.
            self.paths.pop();
        }
        let dcid = self.dest_cids.claim_for_path().unwrap_or(self.paths[0].dcid);
        let mut path = Path::new(self.next_path_id, datagram.local, datagram.remote, dcid);
        self.next_path_id = self.next_path_id.wrapping_add(1);
        path.start_challenge(now);
        info!(remote = %datagram.remote, "new path, probing");
        self.paths.push(path);
        Some(self.paths.len() - 1)
    }

    /// Swap the active path. The congestion controller resets only when
    /// the remote IP actually changed, not for a pure port rebind.
    fn promote_path(&mut self, index: usize, now: Instant) {
        let rebind_only = port_change_only(&self.paths[0].remote, &self.paths[index].remote);
        self.paths.swap(0, index);
        self.paths[0].is_active = true;
        self.paths[index].is_active = false;
        info!(remote = %self.paths[0].remote, rebind_only, "path promoted to active");
        if !rebind_only {
            self.cc.reset(now);
        }
    }

    /// Returns whether the packet contained non-probing frames.
    fn on_packet(
        &mut self,
        partial: &PartialPacket<'_>,
        path_index: usize,
        now: Instant,
    ) -> Result<bool, TransportError> {
        // Stateless-shaped packets first.
        if let Some(versions) = &partial.versions {
            self.on_version_negotiation(versions, now);
            return Ok(false);
        }
        if let Some((token, tag)) = partial.retry {
            self.on_retry(partial, token, tag, now);
            return Ok(false);
        }
        if partial.is_long() && partial.version != self.version {
            self.stats.packets_dropped += 1;
            return Ok(false);
        }

        let epoch = partial.epoch();
        let Some(keys) = &self.keys[epoch.index()] else {
            self.stats.packets_dropped += 1;
            return Ok(false);
        };

        let largest = self.spaces[epoch.index()].largest_received;
        let un = match partial.unprotect(keys.remote.header.as_ref(), largest) {
            Ok(un) => un,
            Err(_) => {
                self.stats.decrypt_failures += 1;
                return Ok(false);
            }
        };

        // 1-RTT packets may ride a key update; earlier epochs use the
        // epoch keys directly.
        let plain = if epoch == Epoch::AppData && !partial.is_long() {
            match self.open_1rtt(&un, now) {
                Some(plain) => plain,
                None => {
                    self.check_stateless_reset(partial.raw(), now);
                    self.stats.decrypt_failures += 1;
                    return Ok(false);
                }
            }
        } else {
            match un.open(keys.remote.packet.as_ref()) {
                Ok(plain) => plain,
                Err(_) => {
                    self.stats.decrypt_failures += 1;
                    return Ok(false);
                }
            }
        };

        if !self.spaces[epoch.index()].accepts(un.pn) {
            // Stale or duplicate PN; decrypted fine but out of order.
            self.stats.stale_packets += 1;
            return Ok(false);
        }

        // Server: a client Handshake packet proves the address.
        if self.side == Side::Server && epoch == Epoch::Handshake {
            self.paths[path_index].set_valid(PathValidReason::HandshakePacket);
        }
        // Client: adopt the server's source CID while handshaking.
        if self.side == Side::Client
            && epoch == Epoch::Initial
            && let Some(scid) = partial.scid
        {
            self.dest_cids.update_initial(scid);
            self.paths[0].dcid = scid;
        }
        if !partial.is_long() {
            // Spin bit: server echoes, client inverts (RFC 9000 §17.4).
            self.spin = if self.side == Side::Server { un.spin() } else { !un.spin() };
        }

        self.stats.packets_received += 1;

        let mut r = crate::varint::Reader::new(&plain);
        let mut ack_eliciting = false;
        let mut non_probing = false;
        while !r.is_empty() {
            let frame = Frame::decode(&mut r)?;
            if partial.is_long() && !frame.allowed_pre_1rtt() && epoch != Epoch::AppData {
                return Err(TransportError::ProtocolViolation("frame not allowed in epoch"));
            }
            ack_eliciting |= frame.is_ack_eliciting();
            non_probing |= !matches!(
                frame,
                Frame::PathChallenge(_) | Frame::PathResponse(_) | Frame::Padding(_)
                    | Frame::NewConnectionId { .. }
            );
            self.on_frame(frame, epoch, path_index, now)?;
        }

        if let ConnState::Closing { .. } = self.state {
            // Peer keeps talking: remind it we closed, a bounded number of
            // times.
            if self.pend.close_resends < 3 {
                self.pend.close = true;
                self.pend.close_resends += 1;
            }
            return Ok(false);
        }

        let max_ack_delay = self.settings.max_ack_delay;
        self.spaces[epoch.index()].on_packet_received(un.pn, ack_eliciting, now, max_ack_delay)?;
        Ok(non_probing)
    }

    /// Open a short-header payload, handling key-phase transitions.
    fn open_1rtt(&mut self, un: &packet::Unprotected<'_>, now: Instant) -> Option<Vec<u8>> {
        let keys = self.keys[Epoch::AppData.index()].as_ref()?;
        if un.key_phase() == self.remote_key_phase {
            return un.open(keys.remote.packet.as_ref()).ok();
        }
        // Try the previous key first: a straggler from before our last
        // update also has a flipped bit.
        if let Some((prev, _)) = &self.prev_remote_key
            && let Ok(plain) = un.open(prev.as_ref())
        {
            return Some(plain);
        }
        // Next phase: the peer updated.
        let next = keys.remote.packet.next();
        let plain = un.open(next.as_ref()).ok()?;
        let discard_at = now + self.key_discard_delay();
        let keys = self.keys[Epoch::AppData.index()].as_mut().unwrap();
        let old = std::mem::replace(&mut keys.remote.packet, next);
        self.prev_remote_key = Some((old, discard_at));
        self.remote_key_phase = un.key_phase();
        if self.local_update_pending {
            // We initiated; the peer just followed.
            self.local_update_pending = false;
        } else {
            // Peer initiated: roll our write keys to match.
            keys.local.packet = keys.local.packet.next();
            self.key_phase = !self.key_phase;
        }
        self.stats.key_updates += 1;
        info!(phase = self.remote_key_phase, "key update");
        Some(plain)
    }

    fn key_discard_delay(&self) -> Duration {
        self.paths[0].rtt.pto_base() * CLOSE_PTO_COUNT
    }

    fn initiate_key_update(&mut self) -> Result<(), TransportError> {
        if !self.handshake_confirmed || self.local_update_pending {
            return Err(TransportError::KeyUpdateError);
        }
        let keys = self.keys[Epoch::AppData.index()]
            .as_mut()
            .ok_or(TransportError::KeyUpdateError)?;
        keys.local.packet = keys.local.packet.next();
        self.key_phase = !self.key_phase;
        self.local_update_pending = true;
        self.stats.key_updates += 1;
        info!(phase = self.key_phase, "local key update initiated");
        Ok(())
    }

    /// A failed 1-RTT decrypt may actually be a stateless reset: check the
    /// trailing 16 bytes against the peer's published tokens.
    fn check_stateless_reset(&mut self, raw: &[u8], now: Instant) {
        if raw.len() < RESET_TOKEN_LEN + 5 {
            return;
        }
        let trailer: [u8; RESET_TOKEN_LEN] =
            raw[raw.len() - RESET_TOKEN_LEN..].try_into().unwrap();
        if self.dest_cids.reset_tokens().any(|token| *token == trailer) {
            warn!("stateless reset received");
            self.send_event(Event::ShutdownComplete { reason: CloseReason::StatelessReset });
            self.state = ConnState::Closed;
            let _ = now;
        }
    }

    fn on_version_negotiation(&mut self, versions: &[u32], now: Instant) {
        // Only meaningful before any server packet arrived.
        if self.side != Side::Client
            || self.spaces[Epoch::Initial.index()].largest_received.is_some()
            || self.handshake_complete
        {
            return;
        }
        if versions.contains(&self.version) {
            // Spurious: the peer does support our version.
            return;
        }
        debug!(?versions, "version negotiation with no overlap");
        self.close_transport(TransportError::VersionNegotiationError, now);
    }

    fn on_retry(&mut self, partial: &PartialPacket<'_>, token: &[u8], tag: [u8; TAG_LEN], now: Instant) {
        if self.side != Side::Client
            || !self.token.is_empty()
            || token.is_empty()
            || self.spaces[Epoch::Initial.index()].largest_received.is_some()
        {
            self.stats.packets_dropped += 1;
            return;
        }
        let raw = partial.raw();
        if packet::retry_tag(&self.original_dcid, &raw[..raw.len() - TAG_LEN]) != tag {
            debug!("retry integrity tag mismatch");
            self.stats.packets_dropped += 1;
            return;
        }
        let Some(scid) = partial.scid else { return };
        info!(new_dcid = %scid, "retry accepted");
        self.token = token.to_vec();
        self.retry_scid = Some(scid);
        self.dest_cids.update_initial(scid);
        self.paths[0].dcid = scid;
        // Initial protection re-keys on the new DCID, and the whole
        // Initial flight goes again. PNs continue, they are never reused.
        self.keys[Epoch::Initial.index()] = Some(EpochKeys::initial(&scid, true));
        let freed = self.loss.discard_epoch(Epoch::Initial);
        self.cc.discard_in_flight(freed);
        self.crypto_send[Epoch::Initial.index()].retransmit_unacked();
        let _ = now;
    }

    // ==================================================================
    // FRAME HANDLING
    // ==================================================================

    fn on_frame(
        &mut self,
        frame: Frame,
        epoch: Epoch,
        path_index: usize,
        now: Instant,
    ) -> Result<(), TransportError> {
        match frame {
            Frame::Padding(_) | Frame::Ping => {}
            Frame::Ack(ack) => self.on_ack_frame(ack, epoch, now)?,
            Frame::Crypto { offset, data } => self.on_crypto_frame(epoch, offset, &data, now)?,
            Frame::Stream { stream_id, offset, data, fin } => {
                self.on_stream_frame(stream_id, offset, &data, fin)?
            }
            Frame::ResetStream { stream_id, error_code, final_size } => {
                self.on_reset_frame(stream_id, error_code, final_size)?
            }
            Frame::StopSending { stream_id, error_code } => {
                self.on_stop_sending_frame(stream_id, error_code)?
            }
            Frame::MaxData(limit) => self.streams.on_max_data(limit),
            Frame::MaxStreamData { stream_id, limit } => {
                if stream_id.sendable_by(self.side) {
                    let mut notices = Vec::new();
                    if let Ok(stream) = self.streams.get_or_create(stream_id, &mut notices) {
                        stream.on_max_stream_data(limit);
                    }
                    self.surface_notices(notices);
                }
            }
            Frame::MaxStreams { dir, limit } => self.streams.on_max_streams(dir, limit),
            Frame::DataBlocked(limit) => trace!(limit, "peer data blocked"),
            Frame::StreamDataBlocked { stream_id, limit } => {
                trace!(stream = %stream_id, limit, "peer stream blocked")
            }
            Frame::StreamsBlocked { dir, limit } => trace!(?dir, limit, "peer streams blocked"),
            Frame::NewConnectionId { sequence, retire_prior_to, cid, reset_token } => {
                let limit = self.settings.active_cid_limit;
                self.dest_cids.on_new_cid(
                    sequence,
                    retire_prior_to,
                    Cid::from_slice(&cid),
                    reset_token,
                    limit,
                )?;
            }
            Frame::RetireConnectionId { sequence } => {
                // Retiring the CID the frame arrived on is illegal, but we
                // can only approximate that check: reject retiring our only
                // active CID.
                if let Some(cid) = self.source_cids.retire(sequence)? {
                    self.cid_authority.retire_cid(&cid);
                    self.replenish_cids();
                }
            }
            Frame::PathChallenge(payload) => {
                self.paths[path_index].response_pending = Some(payload);
            }
            Frame::PathResponse(payload) => {
                // Only the path that carried the challenge may validate.
                self.paths[path_index].on_path_response(payload);
            }
            Frame::NewToken { token } => {
                if self.side == Side::Server {
                    return Err(TransportError::ProtocolViolation("NEW_TOKEN from client"));
                }
                self.send_event(Event::NewToken { token });
            }
            Frame::ConnectionClose { error_code, frame_type, reason } => {
                self.on_peer_close(error_code, frame_type.is_none(), reason, now);
            }
            Frame::HandshakeDone => {
                if self.side == Side::Server {
                    return Err(TransportError::ProtocolViolation("HANDSHAKE_DONE from client"));
                }
                self.confirm_handshake(now);
            }
            Frame::Datagram { data } => {
                if self.settings.max_datagram_frame_size == 0 {
                    return Err(TransportError::ProtocolViolation("datagram not negotiated"));
                }
                self.send_event(Event::DatagramReceived { data });
            }
        }
        Ok(())
    }

    fn on_ack_frame(
        &mut self,
        ack: crate::frame::AckFrame,
        epoch: Epoch,
        now: Instant,
    ) -> Result<(), TransportError> {
        let ranges = ack.iter_ranges()?;
        if ranges[0].1 >= self.spaces[epoch.index()].next_pn() {
            return Err(TransportError::ProtocolViolation("ack of unsent packet"));
        }
        let inclusive: Vec<(u64, u64)> = ranges.iter().rev().copied().collect();
        let max_ack_delay = self
            .peer_params
            .as_ref()
            .map(|p| p.max_ack_delay())
            .unwrap_or(Duration::from_millis(25));
        let outcome = {
            let rtt = &self.paths[0].rtt;
            self.loss.on_ack_received(epoch, &inclusive, rtt, max_ack_delay, now)
        };

        // RTT sample only when the largest acked is newly acked and the
        // ack elicited.
        if let Some((pn, sent_at)) = outcome.largest_newly_acked
            && pn == ranges[0].1
            && outcome.ack_eliciting_acked
        {
            let exponent = self
                .peer_params
                .as_ref()
                .map(|p| p.ack_delay_exponent)
                .unwrap_or(3);
            let micros = ack.delay.saturating_mul(1u64 << exponent.min(20));
            let delay = Duration::from_micros(micros).min(max_ack_delay);
            self.paths[0].rtt.update(now.saturating_duration_since(sent_at), delay);
        }

        if let Some(ecn) = ack.ecn
            && ecn.ce > self.ce_reported[epoch.index()]
        {
            self.ce_reported[epoch.index()] = ecn.ce;
            if let Some((_, sent_at)) = outcome.largest_newly_acked {
                self.cc.on_ecn_ce(sent_at, now);
                self.stats.congestion_events += 1;
            }
        }

        let acked_in_flight: u64 =
            outcome.newly_acked.iter().filter(|p| p.in_flight).map(|p| p.bytes).sum();
        if acked_in_flight > 0
            && let Some((_, sent_at)) = outcome.largest_newly_acked
        {
            let rtt = self.paths[0].rtt.clone();
            self.cc.on_packets_acked(acked_in_flight, sent_at, &rtt, now);
        }

        for packet in &outcome.newly_acked {
            self.on_packet_acked(packet, epoch);
        }
        let lost_in_flight: u64 =
            outcome.lost.iter().filter(|p| p.in_flight).map(|p| p.bytes).sum();
        if !outcome.lost.is_empty() {
            self.stats.lost_bytes += lost_in_flight;
            self.stats.congestion_events += 1;
            let largest_lost_at =
                outcome.lost.iter().map(|p| p.time_sent).max().unwrap_or(now);
            if lost_in_flight > 0 {
                self.cc.on_packets_lost(lost_in_flight, largest_lost_at, now);
            }
            if outcome.persistent_congestion {
                warn!("persistent congestion");
                self.cc.on_persistent_congestion();
            }
            let lost = outcome.lost;
            for packet in &lost {
                self.on_packet_lost(packet, epoch);
            }
        }

        // Key discard schedule: our Handshake packet acked kills Initial
        // keys; a 1-RTT ack kills Handshake keys.
        if epoch == Epoch::Handshake && self.keys[Epoch::Initial.index()].is_some() {
            self.discard_epoch(Epoch::Initial);
        }
        if epoch == Epoch::AppData
            && self.handshake_complete
            && self.keys[Epoch::Handshake.index()].is_some()
        {
            self.discard_epoch(Epoch::Handshake);
        }

        // Ideal send buffer tracks the observed in-flight peak.
        if self.send_buffer.adjust(self.cc.bytes_in_flight_max()) {
            self.indicate_ideal_buffers();
        }
        Ok(())
    }

    fn on_packet_acked(&mut self, packet: &SentPacket, epoch: Epoch) {
        for frame in &packet.frames {
            match frame {
                SentFrame::Ack { largest } => {
                    self.spaces[epoch.index()].on_ack_range_confirmed(*largest);
                }
                SentFrame::Crypto { offset, len } => {
                    self.crypto_send[epoch.index()].on_ack(*offset, *len, false);
                }
                SentFrame::Stream { id, offset, len, fin } => {
                    if let Some(stream) = self.streams.get_mut(*id) {
                        let summary = stream.send.queue.on_ack(*offset, *len, *fin);
                        stream.on_all_data_acked();
                        self.send_buffer.buffered_bytes =
                            self.send_buffer.buffered_bytes.saturating_sub(summary.released);
                        if summary.deferred_completions > 0 {
                            self.send_event(Event::SendComplete {
                                id: *id,
                                count: summary.deferred_completions,
                            });
                        }
                    }
                }
                SentFrame::ResetStream { id } => {
                    if let Some(stream) = self.streams.get_mut(*id) {
                        stream.on_reset_acked();
                    }
                }
                SentFrame::Datagram { id } => self.datagrams.on_acked(*id),
                SentFrame::NewToken => self.pend.new_token = None,
                _ => {}
            }
        }
        self.flush_datagram_states();
        self.reap_streams();
    }

    fn on_packet_lost(&mut self, packet: &SentPacket, epoch: Epoch) {
        for frame in &packet.frames {
            match frame {
                SentFrame::Ack { .. } => {}
                SentFrame::Crypto { offset, len } => {
                    self.crypto_send[epoch.index()].on_loss(*offset, *len, false);
                }
                SentFrame::Stream { id, offset, len, fin } => {
                    if let Some(stream) = self.streams.get_mut(*id) {
                        stream.send.queue.on_loss(*offset, *len, *fin);
                    }
                }
                SentFrame::ResetStream { id } => {
                    if let Some(stream) = self.streams.get_mut(*id) {
                        stream.on_reset_lost();
                    }
                }
                SentFrame::StopSending { id } => {
                    if let Some(stream) = self.streams.get_mut(*id) {
                        stream.rearm_stop_sending();
                    }
                }
                SentFrame::MaxData => self.streams.rearm_max_data(),
                SentFrame::MaxStreamData { id } => {
                    if let Some(stream) = self.streams.get_mut(*id) {
                        stream.rearm_max_stream_data();
                    }
                }
                SentFrame::MaxStreams { dir } => self.streams.rearm_max_streams(*dir),
                SentFrame::NewCid { sequence } => self.pend.new_cid_seqs.push(*sequence),
                SentFrame::RetireCid { sequence } => {
                    self.dest_cids.pending_retirement.push(*sequence)
                }
                SentFrame::PathChallenge { path_id } => {
                    if let Some(path) = self.paths.iter_mut().find(|p| p.id == *path_id) {
                        path.challenge_pending = path.challenge.is_some();
                    }
                }
                SentFrame::PathResponse => {}
                SentFrame::HandshakeDone => self.pend.handshake_done = true,
                SentFrame::NewToken => {} // still held in pend until acked
                SentFrame::Ping => {}
                SentFrame::Datagram { id } => self.datagrams.on_lost(*id),
            }
        }
        self.flush_datagram_states();
    }

    fn on_crypto_frame(
        &mut self,
        epoch: Epoch,
        offset: u64,
        data: &[u8],
        now: Instant,
    ) -> Result<(), TransportError> {
        self.crypto_recv[epoch.index()].insert(offset, data)?;
        let readable = self.crypto_recv[epoch.index()].readable();
        if readable > 0 {
            let chunk = self.crypto_recv[epoch.index()].read(readable as usize);
            self.tls.write_handshake(epoch, &chunk)?;
        }
        self.pump_tls(now)
    }

    fn on_stream_frame(
        &mut self,
        id: StreamId,
        offset: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<(), TransportError> {
        if !id.receivable_by(self.side) {
            return Err(TransportError::StreamStateError("stream frame on send-only stream"));
        }
        let mut notices = Vec::new();
        let (old_highest, new_highest) = {
            let stream = match self.streams.get_or_create(id, &mut notices) {
                Ok(stream) => stream,
                // Late retransmission for a reaped stream.
                Err(TransportError::StreamStateError("stream already closed")) => return Ok(()),
                Err(error) => return Err(error),
            };
            let old = stream.recv.buffer.highest_offset();
            stream.on_stream_frame(offset, data, fin)?;
            (old, stream.recv.buffer.highest_offset())
        };
        self.streams.account_rx(old_highest, new_highest)?;
        self.surface_notices(notices);
        self.indicate_readable(id);
        Ok(())
    }

    fn on_reset_frame(
        &mut self,
        id: StreamId,
        code: u64,
        final_size: u64,
    ) -> Result<(), TransportError> {
        if !id.receivable_by(self.side) {
            return Err(TransportError::StreamStateError("reset on send-only stream"));
        }
        let mut notices = Vec::new();
        let (old_highest, changed) = {
            let stream = match self.streams.get_or_create(id, &mut notices) {
                Ok(stream) => stream,
                Err(TransportError::StreamStateError("stream already closed")) => return Ok(()),
                Err(error) => return Err(error),
            };
            let old = stream.recv.buffer.highest_offset();
            (old, stream.on_reset_stream(code, final_size)?)
        };
        // The final size claims all bytes up to it for flow control.
        self.streams.account_rx(old_highest, final_size)?;
        self.surface_notices(notices);
        if changed {
            self.awaiting_receive.remove(&id);
            self.send_event(Event::StreamShutdown {
                id,
                send_closed: false,
                recv_closed: true,
                code,
            });
        }
        Ok(())
    }

    fn on_stop_sending_frame(&mut self, id: StreamId, code: u64) -> Result<(), TransportError> {
        if !id.sendable_by(self.side) {
            return Err(TransportError::StreamStateError("stop_sending on recv-only stream"));
        }
        let mut notices = Vec::new();
        let stream = match self.streams.get_or_create(id, &mut notices) {
            Ok(stream) => stream,
            Err(TransportError::StreamStateError("stream already closed")) => return Ok(()),
            Err(error) => return Err(error),
        };
        let changed = stream.on_stop_sending(code);
        self.surface_notices(notices);
        if changed {
            self.send_event(Event::StreamShutdown {
                id,
                send_closed: true,
                recv_closed: false,
                code,
            });
        }
        Ok(())
    }

    // ==================================================================
    // TLS PROGRESSION
    // ==================================================================

    fn pump_tls(&mut self, now: Instant) -> Result<(), TransportError> {
        while let Some(event) = self.tls.poll_event() {
            match event {
                TlsEvent::Keys { epoch, keys } => {
                    debug!(epoch = epoch.label(), "keys installed");
                    self.keys[epoch.index()] = Some(keys);
                }
                TlsEvent::HandshakeComplete { peer_params, alpn } => {
                    self.on_handshake_complete(&peer_params, alpn, now)?;
                }
                TlsEvent::Alert(code) => return Err(TransportError::CryptoError(code)),
                TlsEvent::Ticket(ticket) => {
                    self.send_event(Event::ResumptionTicket { ticket });
                }
            }
        }
        // Collect outbound handshake bytes into the CRYPTO send queues.
        for epoch in Epoch::ALL {
            while let Some(bytes) = self.tls.read_handshake(epoch) {
                self.crypto_send[epoch.index()].write(&bytes, false, true);
            }
        }
        Ok(())
    }

    fn on_handshake_complete(
        &mut self,
        raw_params: &[u8],
        alpn: Option<Vec<u8>>,
        now: Instant,
    ) -> Result<(), TransportError> {
        let params = TransportParams::decode(raw_params)?;
        self.validate_peer_params(&params)?;

        self.streams
            .apply_peer_limits(&TransportParams::stream_limits(&self.settings, &params));
        if let Some(token) = params.stateless_reset_token {
            self.dest_cids.set_reset_token(0, token);
        }
        // The negotiated idle timeout is the smaller nonzero one.
        let peer_idle = params.idle_timeout();
        self.idle_timeout = match (self.idle_timeout, peer_idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.idle_deadline = self.idle_timeout.map(|t| now + t);

        self.peer_params = Some(params);
        self.handshake_complete = true;
        self.state = ConnState::Connected;
        info!(side = %self.side, "handshake complete");
        self.send_event(Event::Connected { alpn });

        if self.side == Side::Server {
            self.pend.handshake_done = true;
            self.confirm_handshake(now);
        }
        Ok(())
    }

    fn validate_peer_params(&self, params: &TransportParams) -> Result<(), TransportError> {
        if self.side == Side::Client {
            if params.original_dcid != Some(self.original_dcid) {
                return Err(TransportError::TransportParameterError("original_dcid mismatch"));
            }
            if params.retry_source_cid != self.retry_scid {
                return Err(TransportError::TransportParameterError("retry_source_cid mismatch"));
            }
        }
        let expected_scid = self.dest_cids.active().map(|e| e.cid);
        if params.initial_source_cid != expected_scid {
            return Err(TransportError::TransportParameterError("initial_source_cid mismatch"));
        }
        Ok(())
    }

    fn confirm_handshake(&mut self, now: Instant) {
        if self.handshake_confirmed {
            return;
        }
        self.handshake_confirmed = true;
        info!(side = %self.side, "handshake confirmed");
        self.streams.advertise_stream_limits();
        self.replenish_cids();
        if self.side == Side::Client && self.keys[Epoch::Handshake.index()].is_some() {
            // Confirmation retires the handshake space outright.
            self.discard_epoch(Epoch::Handshake);
        }
        let _ = now;
    }

    /// Server-issued address-validation token for the client's next
    /// connection. The binding owns the sealing key, so it mints the
    /// token and hands it in here.
    pub fn queue_new_token(&mut self, token: Vec<u8>) {
        if self.side == Side::Server {
            self.pend.new_token = Some(token);
        }
    }

    /// Keep the peer stocked with spare CIDs up to its advertised limit.
    fn replenish_cids(&mut self) {
        if self.cids_issued {
            return;
        }
        let limit = self
            .peer_params
            .as_ref()
            .map(|p| p.active_connection_id_limit)
            .unwrap_or(2);
        // Sequence 0 is already in use; offer limit-1 spares, capped.
        let target = limit.min(4) as usize;
        while self.source_cids.active_count() < target {
            let Some((cid, token)) = self.cid_authority.issue_cid(self.partition) else {
                debug!("cid issue failed, peer keeps fewer spares");
                break;
            };
            let sequence = self.source_cids.push(cid, token);
            self.pend.new_cid_seqs.push(sequence);
        }
        self.cids_issued = true;
    }

    fn discard_epoch(&mut self, epoch: Epoch) {
        debug!(epoch = epoch.label(), "keys discarded");
        self.keys[epoch.index()] = None;
        let freed = self.loss.discard_epoch(epoch);
        self.cc.discard_in_flight(freed);
    }

    // ==================================================================
    // CLOSE PATHS
    // ==================================================================

    fn close_transport(&mut self, error: TransportError, now: Instant) {
        if !matches!(self.state, ConnState::Handshaking | ConnState::Connected) {
            return;
        }
        warn!(%error, "closing: transport error");
        let code = error.code();
        let reason = error.reason().into_bytes();
        self.send_event(Event::ShutdownByTransport { code, reason: error.reason() });
        self.enter_closing(code, false, reason, now);
    }

    fn close_application(&mut self, code: u64, now: Instant) {
        if !matches!(self.state, ConnState::Handshaking | ConnState::Connected) {
            return;
        }
        info!(code, "closing: application shutdown");
        self.enter_closing(code, true, Vec::new(), now);
    }

    fn enter_closing(&mut self, code: u64, application: bool, reason: Vec<u8>, now: Instant) {
        let drain_until = now + self.key_discard_delay();
        self.state = ConnState::Closing { code, application, reason, drain_until };
        self.pend.close = true;
        self.datagrams.cancel_all();
        self.flush_datagram_states();
    }

    fn on_peer_close(&mut self, code: u64, application: bool, reason: Vec<u8>, now: Instant) {
        if matches!(self.state, ConnState::Draining { .. } | ConnState::Closed) {
            return;
        }
        let reason_text = String::from_utf8_lossy(&reason).into_owned();
        info!(code, application, reason = %reason_text, "peer closed");
        if application {
            self.send_event(Event::ShutdownByPeer { code });
        } else {
            self.send_event(Event::ShutdownByTransport { code, reason: reason_text });
        }
        self.datagrams.cancel_all();
        self.flush_datagram_states();
        self.state = ConnState::Draining { until: now + self.key_discard_delay() };
        self.send_event(Event::ShutdownComplete {
            reason: CloseReason::Peer { code, application, reason: String::new() },
        });
    }

    // ==================================================================
    // TIMERS
    // ==================================================================

    pub fn next_timeout(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut consider = |deadline: Option<Instant>| {
            if let Some(d) = deadline
                && earliest.is_none_or(|e| d < e)
            {
                earliest = Some(d);
            }
        };

        match &self.state {
            ConnState::Closing { drain_until, .. } => return Some(*drain_until),
            ConnState::Draining { until } => return Some(*until),
            ConnState::Closed => return None,
            _ => {}
        }

        for space in &self.spaces {
            consider(space.ack_timer());
        }
        consider(self.loss.loss_timer().map(|(t, _)| t));
        let amp_blocked = !self.paths[0].validated && self.paths[0].amp_allowance() == 0;
        consider(
            self.loss
                .pto_timer(
                    &self.paths[0].rtt,
                    self.peer_max_ack_delay(),
                    self.handshake_complete,
                    amp_blocked,
                )
                .map(|(t, _)| t),
        );
        consider(self.idle_deadline);
        consider(self.keep_alive_deadline);
        consider(self.prev_remote_key.as_ref().map(|(_, t)| *t));
        for path in &self.paths {
            consider(path.challenge_deadline);
        }
        earliest
    }

    fn peer_max_ack_delay(&self) -> Duration {
        self.peer_params
            .as_ref()
            .map(|p| p.max_ack_delay())
            .unwrap_or(Duration::from_millis(25))
    }

    fn on_timer(&mut self, now: Instant) {
        match &self.state {
            ConnState::Closing { drain_until, code, application, .. } if now >= *drain_until => {
                let reason = if *application {
                    CloseReason::Local(TransportError::ApplicationError(*code))
                } else {
                    CloseReason::Local(TransportError::ProtocolViolation("closed"))
                };
                self.finish_close(reason);
                return;
            }
            ConnState::Draining { until } if now >= *until => {
                self.state = ConnState::Closed;
                return;
            }
            ConnState::Closed => return,
            _ => {}
        }

        // Idle timeout: silent discard, no CONNECTION_CLOSE.
        if let Some(deadline) = self.idle_deadline
            && now >= deadline
        {
            info!("idle timeout");
            self.send_event(Event::ShutdownComplete { reason: CloseReason::IdleTimeout });
            self.state = ConnState::Closed;
            return;
        }

        // Loss timer.
        if let Some((when, epoch)) = self.loss.loss_timer()
            && now >= when
        {
            let rtt = self.paths[0].rtt.clone();
            let lost = self.loss.on_loss_timer(epoch, &rtt, now);
            let lost_bytes: u64 = lost.iter().filter(|p| p.in_flight).map(|p| p.bytes).sum();
            if !lost.is_empty() {
                self.stats.congestion_events += 1;
                self.stats.lost_bytes += lost_bytes;
                let largest_at = lost.iter().map(|p| p.time_sent).max().unwrap();
                if lost_bytes > 0 {
                    self.cc.on_packets_lost(lost_bytes, largest_at, now);
                }
                for packet in &lost {
                    self.on_packet_lost(packet, epoch);
                }
            }
        }

        // PTO.
        let amp_blocked = !self.paths[0].validated && self.paths[0].amp_allowance() == 0;
        if let Some((when, epoch)) = self.loss.pto_timer(
            &self.paths[0].rtt,
            self.peer_max_ack_delay(),
            self.handshake_complete,
            amp_blocked,
        ) && now >= when
        {
            self.loss.on_pto_fired();
            self.stats.ptos += 1;
            if !self.handshake_complete && self.loss.pto_count >= MAX_HANDSHAKE_PTO_COUNT {
                warn!("handshake abandoned after repeated PTO");
                self.send_event(Event::ShutdownComplete {
                    reason: CloseReason::HandshakeTimeout,
                });
                self.state = ConnState::Closed;
                return;
            }
            // One or two probes in the earliest applicable space; the
            // window does not shrink.
            self.cc.set_exemptions(2);
            self.pend.ping[epoch.index()] = true;
        }

        // Keep-alive.
        if let (Some(deadline), Some(interval)) =
            (self.keep_alive_deadline, self.settings.keep_alive)
            && now >= deadline
        {
            if !self.loss.in_flight_ack_eliciting(Epoch::AppData) && self.handshake_confirmed {
                self.pend.ping[Epoch::AppData.index()] = true;
            }
            self.keep_alive_deadline = Some(now + interval);
        }

        // Old read keys age out.
        if let Some((_, discard_at)) = &self.prev_remote_key
            && now >= *discard_at
        {
            self.prev_remote_key = None;
        }

        // Path challenge retransmission.
        for path in &mut self.paths {
            path.on_timer(now);
        }
    }

    fn finish_close(&mut self, reason: CloseReason) {
        self.state = ConnState::Closed;
        self.send_event(Event::ShutdownComplete { reason });
    }

    // ==================================================================
    // EVENTS
    // ==================================================================

    fn send_event(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn surface_notices(&mut self, notices: Vec<StreamNotice>) {
        for notice in notices {
            match notice {
                StreamNotice::Opened(id) => self.send_event(Event::StreamOpened { id }),
                StreamNotice::Closed(id) => self.send_event(Event::StreamClosed { id }),
                StreamNotice::Readable(id) => self.indicate_readable(id),
                StreamNotice::ResetReceived(id, code) => self.send_event(Event::StreamShutdown {
                    id,
                    send_closed: false,
                    recv_closed: true,
                    code,
                }),
                StreamNotice::StopRequested(id, code) => self.send_event(Event::StreamShutdown {
                    id,
                    send_closed: true,
                    recv_closed: false,
                    code,
                }),
                StreamNotice::SendComplete(id, count) => {
                    self.send_event(Event::SendComplete { id, count })
                }
            }
        }
    }

    /// Indicate readable bytes once per ReceiveComplete round trip.
    fn indicate_readable(&mut self, id: StreamId) {
        if self.awaiting_receive.contains(&id) {
            return;
        }
        let Some(stream) = self.streams.get_mut(id) else { return };
        let readable = stream.recv.buffer.readable();
        if readable == 0 {
            return;
        }
        let data = stream.recv.buffer.peek(readable as usize);
        let fin = stream
            .recv
            .final_size
            .is_some_and(|fs| stream.recv.buffer.delivered_offset() + readable == fs);
        self.awaiting_receive.insert(id);
        self.send_event(Event::StreamData { id, data, fin });
    }

    fn indicate_ideal_buffers(&mut self) {
        let mut updates = Vec::new();
        for stream in self.streams.iter_mut() {
            let ideal = self
                .send_buffer
                .stream_ideal(stream.send.max_stream_data.saturating_sub(stream.send.queue.base()));
            if ideal_changed(stream.send.last_ideal, ideal) {
                stream.send.last_ideal = ideal;
                updates.push((stream.id, ideal));
            }
        }
        for (id, bytes) in updates {
            self.send_event(Event::IdealSendBuffer { id, bytes });
        }
    }

    fn flush_datagram_states(&mut self) {
        for (id, state) in self.datagrams.take_state_changes() {
            self.send_event(Event::DatagramSendState { id, state });
        }
    }

    fn reap_streams(&mut self) {
        let mut notices = Vec::new();
        self.streams.reap(&mut notices);
        self.surface_notices(notices);
    }

    // ==================================================================
    // BUILD / FLUSH
    // ==================================================================

    /// After an operation: run the build loop until the send allowance is
    /// exhausted or nothing is pending. Returns datagrams to transmit.
    pub fn flush(&mut self, now: Instant) -> Vec<Transmit> {
        if matches!(self.state, ConnState::Closed | ConnState::Draining { .. }) {
            return Vec::new();
        }
        if let Err(error) = self.pump_tls(now) {
            self.close_transport(error, now);
        }

        let mut transmits = Vec::new();
        // Probing paths get their challenge/response datagrams first; they
        // are small and bounded by the new path's amplification window.
        for index in 1..self.paths.len() {
            if let Some(t) = self.build_probe_datagram(index, now) {
                transmits.push(t);
            }
        }
        // Responses owed on the active path ride the main build.
        loop {
            let Some(transmit) = self.build_datagram(now) else { break };
            transmits.push(transmit);
            if transmits.len() >= 64 {
                break; // re-enter on the next drain cycle
            }
        }

        if !transmits.is_empty()
            && let Some(interval) = self.settings.keep_alive
        {
            self.keep_alive_deadline = Some(now + interval);
        }
        transmits
    }

    fn pacing_budget(&mut self, now: Instant) -> u64 {
        let rate = self.cc.pacing_rate(&self.paths[0].rtt);
        let burst = self.cc.window() / 4;
        self.pacer.set_rate(rate, burst.max(2 * 1200));
        self.pacer.available(now)
    }

    /// One datagram on the active path, or None when nothing fits/pends.
    fn build_datagram(&mut self, now: Instant) -> Option<Transmit> {
        let mtu = self.paths[0].mtu as u64;
        let amp = self.paths[0].amp_allowance();
        if amp == 0 {
            return None;
        }
        let pacing = self.pacing_budget(now);
        let cc = self.cc.can_send(1200);

        // ACK-only (and close) datagrams ignore congestion and pacing.
        let eliciting_budget = mtu.min(amp).min(pacing).min(cc);
        let passive_budget = mtu.min(amp);

        let budget = if eliciting_budget >= 64 { eliciting_budget } else { passive_budget };
        let allow_eliciting = eliciting_budget >= 64;
        if budget < 64 {
            return None;
        }

        // Phase one: pick frames per epoch, highest priority first. The
        // plan is committed before sealing so the padding decision can see
        // the whole coalesced datagram.
        let mut plans: Vec<(Epoch, Vec<Frame>, Vec<SentFrame>)> = Vec::new();
        let mut room_left = budget as usize;
        for epoch in Epoch::ALL {
            if self.keys[epoch.index()].is_none() || room_left < 80 {
                continue;
            }
            let (frames, sent) = self.gather_frames(epoch, room_left - 64, allow_eliciting, now);
            if frames.is_empty() {
                continue;
            }
            let estimate: usize = frames.iter().map(Frame::wire_size).sum::<usize>() + 64;
            room_left = room_left.saturating_sub(estimate);
            plans.push((epoch, frames, sent));
        }
        if plans.is_empty() {
            return None;
        }

        let contains_initial = plans.iter().any(|(e, ..)| *e == Epoch::Initial);
        let pad_last = contains_initial && self.side == Side::Client;
        let last_index = plans.len() - 1;

        let mut builder = DatagramBuilder::new(budget as usize);
        for (index, (epoch, frames, sent)) in plans.into_iter().enumerate() {
            let pn = self.spaces[epoch.index()].alloc_pn();
            let largest_acked = self.loss.largest_acked(epoch);
            let dcid = self.paths[0].dcid;
            let scid = self.source_cids.iter().next().map(|c| c.cid).unwrap_or(Cid::EMPTY);
            let token = std::mem::take(&mut self.token);
            let form = match epoch {
                Epoch::Initial => HeaderForm::Initial {
                    version: self.version,
                    dcid: &dcid,
                    scid: &scid,
                    token: &token,
                },
                Epoch::Handshake => {
                    HeaderForm::Handshake { version: self.version, dcid: &dcid, scid: &scid }
                }
                Epoch::AppData => HeaderForm::Short {
                    dcid: &dcid,
                    spin: self.spin,
                    key_phase: self.key_phase,
                },
            };
            let pad = (pad_last && index == last_index).then_some(MIN_INITIAL_DATAGRAM);

            let keys = self.keys[epoch.index()].as_ref().unwrap();
            let result =
                builder.add_packet(&form, pn, largest_acked, &frames, sent, &keys.local, pad);
            self.token = token;
            if let Err(error) = result {
                warn!(%error, "packet seal failed");
                return None;
            }
            if frames.iter().any(|f| matches!(f, Frame::Ack(_))) {
                self.spaces[epoch.index()].on_ack_sent();
            }
        }

        if builder.is_empty() {
            return None;
        }
        let (payload, packets) = builder.finish();
        self.record_sent(&packets, payload.len(), 0, now);
        Some(Transmit {
            local: self.paths[0].local,
            remote: self.paths[0].remote,
            payload,
            ecn: Default::default(),
        })
    }

    /// Minimal datagram on a probing path: challenge and/or response,
    /// padded, inside that path's amplification budget.
    fn build_probe_datagram(&mut self, index: usize, now: Instant) -> Option<Transmit> {
        let path = &mut self.paths[index];
        let mut frames = Vec::new();
        let mut sent = Vec::new();
        if let Some(payload) = path.response_pending.take() {
            frames.push(Frame::PathResponse(payload));
            sent.push(SentFrame::PathResponse);
        }
        if path.challenge_pending
            && let Some(challenge) = path.challenge
        {
            path.challenge_pending = false;
            frames.push(Frame::PathChallenge(challenge));
            sent.push(SentFrame::PathChallenge { path_id: path.id });
        }
        if frames.is_empty() {
            return None;
        }
        let budget = (path.mtu as u64).min(path.amp_allowance());
        if budget < 256 {
            return None;
        }
        let keys = self.keys[Epoch::AppData.index()].as_ref()?;
        let pn = self.spaces[Epoch::AppData.index()].alloc_pn();
        let largest_acked = self.loss.largest_acked(Epoch::AppData);
        let dcid = self.paths[index].dcid;
        let form = HeaderForm::Short { dcid: &dcid, spin: self.spin, key_phase: self.key_phase };
        let mut builder = DatagramBuilder::new(budget as usize);
        // Challenge datagrams are expanded like Initials when room allows.
        let pad = (budget >= MIN_INITIAL_DATAGRAM as u64).then_some(MIN_INITIAL_DATAGRAM);
        builder
            .add_packet(&form, pn, largest_acked, &frames, sent, &keys.local, pad)
            .ok()?;
        let (payload, packets) = builder.finish();
        self.record_sent(&packets, payload.len(), index, now);
        let path = &self.paths[index];
        Some(Transmit {
            local: path.local,
            remote: path.remote,
            payload,
            ecn: Default::default(),
        })
    }

    /// Frame selection for one epoch: ACK, then CRYPTO, then (AppData)
    /// control frames, datagrams, and stream data.
    fn gather_frames(
        &mut self,
        epoch: Epoch,
        room: usize,
        allow_eliciting: bool,
        now: Instant,
    ) -> (Vec<Frame>, Vec<SentFrame>) {
        let mut frames = Vec::new();
        let mut sent = Vec::new();
        let mut room = room.min(self.paths[0].mtu as usize);
        if room == 0 {
            return (frames, sent);
        }

        // CONNECTION_CLOSE preempts everything else.
        if self.pend.close {
            if let ConnState::Closing { code, application, reason, .. } = &self.state {
                // Handshake-epoch closes must not leak application codes.
                let (error_code, frame_type) = if *application && epoch != Epoch::AppData {
                    (0x0a, Some(0))
                } else if *application {
                    (*code, None)
                } else {
                    (*code, Some(0))
                };
                let frame = Frame::ConnectionClose {
                    error_code,
                    frame_type,
                    reason: if *application { Vec::new() } else { reason.clone() },
                };
                frames.push(frame);
                if epoch == last_keyed_epoch(&self.keys) {
                    self.pend.close = false;
                }
                return (frames, sent);
            }
            self.pend.close = false;
        }

        // ACK first.
        if self.spaces[epoch.index()].ack_due(now) {
            let exponent = self.settings.ack_delay_exponent;
            if let Some(ack) = self.spaces[epoch.index()].build_ack(now, exponent, room) {
                sent.push(SentFrame::Ack { largest: ack.largest });
                room = room.saturating_sub(ack.wire_size());
                frames.push(Frame::Ack(ack));
            }
        }
        if !allow_eliciting {
            return (frames, sent);
        }

        // CRYPTO.
        while room > 8 {
            let Some((offset, data, _)) =
                self.crypto_send[epoch.index()].dequeue(room - 8, u64::MAX)
            else {
                break;
            };
            let len = data.len() as u64;
            sent.push(SentFrame::Crypto { offset, len });
            let frame = Frame::Crypto { offset, data };
            room = room.saturating_sub(frame.wire_size());
            frames.push(frame);
        }

        // PTO probe / keep-alive ping.
        if self.pend.ping[epoch.index()] {
            self.pend.ping[epoch.index()] = false;
            frames.push(Frame::Ping);
            sent.push(SentFrame::Ping);
        }

        if epoch != Epoch::AppData || !self.handshake_complete {
            return (frames, sent);
        }

        // --- 1-RTT control frames ---
        if self.pend.handshake_done && room > 1 {
            self.pend.handshake_done = false;
            frames.push(Frame::HandshakeDone);
            sent.push(SentFrame::HandshakeDone);
            room -= 1;
        }
        if let Some(token) = self.pend.new_token.clone()
            && room > token.len() + 4
        {
            room -= token.len() + 4;
            frames.push(Frame::NewToken { token });
            sent.push(SentFrame::NewToken);
        }
        if let Some(payload) = self.paths[0].response_pending.take() {
            frames.push(Frame::PathResponse(payload));
            sent.push(SentFrame::PathResponse);
            room = room.saturating_sub(9);
        }
        for frame in self.dest_cids.take_retirements() {
            if let Frame::RetireConnectionId { sequence } = frame {
                sent.push(SentFrame::RetireCid { sequence });
            }
            room = room.saturating_sub(frame.wire_size());
            frames.push(frame);
        }
        let cid_seqs = std::mem::take(&mut self.pend.new_cid_seqs);
        for sequence in cid_seqs {
            let Some(entry) = self.source_cids.iter().find(|c| c.sequence == sequence) else {
                continue;
            };
            if entry.retired {
                continue;
            }
            let frame = Frame::NewConnectionId {
                sequence,
                retire_prior_to: self.source_cids.retire_prior_to,
                cid: entry.cid.as_slice().to_vec(),
                reset_token: entry.reset_token,
            };
            if frame.wire_size() > room {
                self.pend.new_cid_seqs.push(sequence);
                continue;
            }
            room -= frame.wire_size();
            sent.push(SentFrame::NewCid { sequence });
            frames.push(frame);
        }

        // Per-stream control frames, then table-level ones.
        let mut stream_control = Vec::new();
        for stream in self.streams.iter_mut() {
            if let Some(f) = stream.take_reset_frame() {
                stream_control.push((f, SentFrame::ResetStream { id: stream.id }));
            }
            if let Some(f) = stream.take_stop_sending_frame() {
                stream_control.push((f, SentFrame::StopSending { id: stream.id }));
            }
            if let Some(f) = stream.take_max_stream_data_frame() {
                stream_control.push((f, SentFrame::MaxStreamData { id: stream.id }));
            }
            if let Some(f) = stream.take_blocked_frame() {
                let id = stream.id;
                stream_control.push((
                    f,
                    // Blocked frames need no loss tracking; dedup is by
                    // limit value.
                    SentFrame::Stream { id, offset: 0, len: 0, fin: false },
                ));
            }
        }
        for (frame, record) in stream_control {
            if frame.wire_size() > room {
                break;
            }
            room -= frame.wire_size();
            if !matches!(frame, Frame::StreamDataBlocked { .. }) {
                sent.push(record);
            }
            frames.push(frame);
        }
        if let Some(frame) = self.streams.take_max_data_frame() {
            room = room.saturating_sub(frame.wire_size());
            sent.push(SentFrame::MaxData);
            frames.push(frame);
        }
        for frame in self.streams.take_max_streams_frames() {
            if let Frame::MaxStreams { dir, .. } = frame {
                sent.push(SentFrame::MaxStreams { dir });
            }
            room = room.saturating_sub(frame.wire_size());
            frames.push(frame);
        }
        if let Some(frame) = self.streams.take_data_blocked_frame() {
            room = room.saturating_sub(frame.wire_size());
            frames.push(frame);
        }
        for dir in [Dir::Bi, Dir::Uni] {
            if self.pend.streams_blocked[dir_index(dir)] {
                self.pend.streams_blocked[dir_index(dir)] = false;
                if let Some(frame) = self.streams.take_streams_blocked_frame(dir) {
                    room = room.saturating_sub(frame.wire_size());
                    frames.push(frame);
                }
            }
        }

        // Datagrams: unreliable traffic goes ahead of stream data.
        while room > 2 {
            let Some((id, data)) = self.datagrams.dequeue(room) else { break };
            let frame = Frame::Datagram { data };
            room = room.saturating_sub(frame.wire_size());
            sent.push(SentFrame::Datagram { id });
            frames.push(frame);
        }
        self.flush_datagram_states();

        // Stream data fills what remains.
        let mut tx_credit = self.streams.tx_credit();
        let mut consumed_credit = 0u64;
        let mut wrote = Vec::new();
        for stream in self.streams.iter_mut() {
            if room < 24 {
                break;
            }
            let flow_limit = stream.send.max_stream_data;
            // New bytes are capped by connection credit; retransmitted
            // ranges below max_sent are not.
            let credit_cap = stream.send.max_sent + tx_credit;
            let effective = flow_limit.min(credit_cap);
            while room >= 24 {
                let Some((offset, data, fin)) = stream.send.queue.dequeue(room - 16, effective)
                else {
                    break;
                };
                let end = offset + data.len() as u64;
                if end > stream.send.max_sent {
                    let fresh = end - stream.send.max_sent;
                    tx_credit -= fresh;
                    consumed_credit += fresh;
                    stream.send.max_sent = end;
                }
                let frame = Frame::Stream { stream_id: stream.id, offset, data, fin };
                sent.push(SentFrame::Stream {
                    id: stream.id,
                    offset,
                    len: match &frame {
                        Frame::Stream { data, .. } => data.len() as u64,
                        _ => 0,
                    },
                    fin,
                });
                room = room.saturating_sub(frame.wire_size());
                if fin {
                    stream.on_fin_sent();
                }
                wrote.push(frame);
            }
            if let Some(offset) = stream.send.queue.dequeue_fin() {
                let frame =
                    Frame::Stream { stream_id: stream.id, offset, data: Vec::new(), fin: true };
                sent.push(SentFrame::Stream { id: stream.id, offset, len: 0, fin: true });
                room = room.saturating_sub(frame.wire_size());
                stream.on_fin_sent();
                wrote.push(frame);
            }
        }
        self.streams.consume_tx_credit(consumed_credit);
        frames.extend(wrote);

        (frames, sent)
    }

    fn record_sent(&mut self, packets: &[BuiltPacket], datagram_len: usize, path: usize, now: Instant) {
        let mut any_eliciting = false;
        for built in packets {
            self.stats.packets_sent += 1;
            any_eliciting |= built.ack_eliciting;
            if built.in_flight {
                self.cc.on_packet_sent(built.bytes, now);
            }
            self.loss.on_packet_sent(
                built.epoch,
                SentPacket {
                    pn: built.pn,
                    time_sent: now,
                    bytes: built.bytes,
                    ack_eliciting: built.ack_eliciting,
                    in_flight: built.in_flight,
                    frames: built.frames.clone(),
                },
            );
        }
        self.stats.bytes_sent += datagram_len as u64;
        self.pacer.on_sent(datagram_len as u64);
        self.paths[path].on_bytes_sent(datagram_len);
        if any_eliciting
            && let Some(timeout) = self.idle_timeout
            && self.idle_deadline.is_some()
        {
            // Sending while idle keeps the peer's timer honest too.
            self.idle_deadline = Some(now + timeout);
        }
    }
}

fn dir_index(dir: Dir) -> usize {
    match dir {
        Dir::Bi => 0,
        Dir::Uni => 1,
    }
}

fn last_keyed_epoch(keys: &[Option<EpochKeys>; EPOCH_COUNT]) -> Epoch {
    for epoch in Epoch::ALL.iter().rev() {
        if keys[epoch.index()].is_some() {
            return *epoch;
        }
    }
    Epoch::Initial
}
