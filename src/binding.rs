//! A binding: one UDP endpoint shared by its connections, with the CID
//! lookup, listener, and the stateless operations (version negotiation,
//! retry, stateless reset) that run without connection state.

use crate::cid::Cid;
use crate::config::Settings;
use crate::connection::{Connection, Event};
use crate::crypto::{ResetTokenKey, RetryKeys, RetrySnapshot, RetryTokenBody, TokenKind};
use crate::datapath::{Datagram, Datapath, Transmit};
use crate::lookup::CidLookup;
use crate::packet::{self, InvariantHeader};
use crate::tls::TlsSession;
use crate::types::{
    GREASE_VERSION_MASK, LOCAL_CID_LEN, MIN_INITIAL_DATAGRAM, QUIC_VERSION_1,
    STATELESS_OP_EXPIRY_MS, STATELESS_OPS_PER_PEER, SUPPORTED_VERSIONS,
};
use crate::worker::{ConnHandle, ConnRef, LookupCidAuthority, WorkerPool};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

// =============================================================================
// LIBRARY-WIDE RETRY KEY
// =============================================================================
// One process-wide key with an explicit lifecycle; every stateless
// operation takes an immutable snapshot at its start.

static RETRY_KEYS: OnceLock<RwLock<RetryKeys>> = OnceLock::new();

fn retry_keys() -> &'static RwLock<RetryKeys> {
    RETRY_KEYS.get_or_init(|| RwLock::new(RetryKeys::new()))
}

pub fn retry_key_snapshot() -> RetrySnapshot {
    retry_keys().read().unwrap().snapshot()
}

/// Rotate the library retry key. Tokens sealed under the previous key
/// stay valid until the next rotation.
pub fn rotate_retry_key() {
    retry_keys().write().unwrap().rotate();
}

// =============================================================================
// LISTENER
// =============================================================================

/// Accepting side of a binding. Supplies the TLS engine and event sink
/// for each accepted connection.
pub trait Listener: Send + Sync {
    /// Return None to refuse the connection.
    fn on_initial(&self, remote: SocketAddr) -> Option<Accept>;

    /// Demand a stateless retry round trip before committing state.
    fn stateless_retry(&self) -> bool {
        false
    }

    /// Called with the handle of each accepted connection.
    fn on_connection(&self, handle: ConnHandle);
}

pub struct Accept {
    pub settings: Settings,
    pub tls: Box<dyn TlsSession>,
    pub events: mpsc::UnboundedSender<Event>,
}

// =============================================================================
// BINDING
// =============================================================================

/// Tracks outstanding stateless responses per peer address.
struct StatelessBudget {
    entries: HashMap<SocketAddr, (usize, Instant)>,
}

impl StatelessBudget {
    fn new() -> Self {
        StatelessBudget { entries: HashMap::new() }
    }

    /// Take one slot for `peer`; false when the peer used its budget.
    fn allow(&mut self, peer: SocketAddr, now: Instant) -> bool {
        let expiry = Duration::from_millis(STATELESS_OP_EXPIRY_MS);
        self.entries.retain(|_, (_, at)| now.duration_since(*at) < expiry);
        let (count, at) = self.entries.entry(peer).or_insert((0, now));
        if *count >= STATELESS_OPS_PER_PEER {
            return false;
        }
        *count += 1;
        *at = now;
        true
    }
}

pub struct Binding {
    local: SocketAddr,
    datapath: Arc<dyn Datapath>,
    pub lookup: Arc<CidLookup<ConnRef>>,
    pool: Arc<WorkerPool>,
    reset_key: ResetTokenKey,
    listener: RwLock<Option<Arc<dyn Listener>>>,
    stateless: Mutex<StatelessBudget>,
    pub dropped_datagrams: std::sync::atomic::AtomicU64,
}

impl Binding {
    pub fn new(local: SocketAddr, datapath: Arc<dyn Datapath>, workers: usize) -> Arc<Self> {
        let lookup = Arc::new(CidLookup::new());
        let pool = WorkerPool::new(workers, datapath.clone(), lookup.clone());
        Arc::new(Binding {
            local,
            datapath,
            lookup,
            pool,
            reset_key: ResetTokenKey::new(),
            listener: RwLock::new(None),
            stateless: Mutex::new(StatelessBudget::new()),
            dropped_datagrams: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Attach a listener. Promotes the lookup to the partitioned shape so
    /// server load shards per worker.
    pub fn set_listener(&self, listener: Arc<dyn Listener>) {
        self.lookup.promote_partitioned(self.pool.worker_count());
        *self.listener.write().unwrap() = Some(listener);
        info!(local = %self.local, "listener attached");
    }

    /// Start an outbound connection on this binding.
    pub fn connect(
        &self,
        remote: SocketAddr,
        settings: Settings,
        tls: Box<dyn TlsSession>,
        events: mpsc::UnboundedSender<Event>,
        token: Vec<u8>,
    ) -> Result<ConnHandle, crate::error::TransportError> {
        let shared = self.pool.allocate();
        let authority = Arc::new(LookupCidAuthority {
            lookup: self.lookup.clone(),
            reset_key: self.reset_key.clone(),
            conn: ConnRef(shared.clone()),
        });
        let partition = shared.worker as u8;
        let (conn, _scid) = Connection::new_client(
            settings,
            tls,
            authority,
            self.local,
            remote,
            partition,
            token,
            events,
            Instant::now(),
        )?;
        Ok(self.pool.install(shared, conn))
    }

    /// The datapath receive upcall: demux each datagram to its connection
    /// or the stateless handlers.
    pub fn receive(&self, datagrams: Vec<Datagram>) {
        let now = Instant::now();
        for datagram in datagrams {
            self.receive_one(datagram, now);
        }
    }

    fn drop_count(&self) {
        self.dropped_datagrams.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn receive_one(&self, datagram: Datagram, now: Instant) {
        let header = match InvariantHeader::parse(&datagram.payload, LOCAL_CID_LEN) {
            Ok(header) => header,
            Err(error) => {
                trace!(%error, "undecodable datagram");
                self.drop_count();
                return;
            }
        };

        // Unsupported version on a long header → version negotiation.
        if let Some(version) = header.version
            && version != 0
            && !SUPPORTED_VERSIONS.contains(&version)
        {
            self.send_version_negotiation(&header, &datagram, now);
            return;
        }

        // CID hit: hand the datagram to the owning worker.
        if let Some(conn) = self.lookup.lookup(&header.dcid) {
            conn.0.push_op(crate::connection::Op::Receive(datagram));
            self.pool.wake(&conn);
            return;
        }

        if !header.is_long {
            // Unknown short-header packet: answer with a stateless reset,
            // unless it already carries the token we would use (a reset
            // must never elicit a reset).
            self.send_stateless_reset(&header, &datagram, now);
            return;
        }

        // Unknown long header: only a well-formed Initial can create state.
        if header.version == Some(QUIC_VERSION_1)
            && datagram.payload.len() >= MIN_INITIAL_DATAGRAM
        {
            self.handle_new_initial(header, datagram, now);
        } else {
            trace!("long-header datagram for unknown connection dropped");
            self.drop_count();
        }
    }

    fn send_version_negotiation(&self, header: &InvariantHeader, datagram: &Datagram, now: Instant) {
        if !header.is_long || header.scid.is_none() {
            self.drop_count();
            return;
        }
        if !self.stateless.lock().unwrap().allow(datagram.remote, now) {
            self.drop_count();
            return;
        }
        // Echo CIDs swapped; advertise the real versions plus one grease
        // entry so peers keep their version handling honest.
        let grease = (rand::random::<u32>() & !GREASE_VERSION_MASK) | GREASE_VERSION_MASK;
        let mut versions = SUPPORTED_VERSIONS.to_vec();
        versions.push(grease);
        let payload = packet::encode_version_negotiation(
            &header.scid.unwrap(),
            &header.dcid,
            &versions,
        );
        debug!(remote = %datagram.remote, "version negotiation sent");
        self.datapath.send(Transmit {
            local: datagram.local,
            remote: datagram.remote,
            payload,
            ecn: Default::default(),
        });
    }

    fn send_stateless_reset(&self, header: &InvariantHeader, datagram: &Datagram, now: Instant) {
        // Too-short datagrams cannot have held a real packet.
        if datagram.payload.len() < 21 + LOCAL_CID_LEN {
            self.drop_count();
            return;
        }
        let token = self.reset_key.token_for(&header.dcid);
        let trailer = &datagram.payload[datagram.payload.len() - 16..];
        if trailer == token {
            // Already a reset shaped by us; never reflect.
            self.drop_count();
            return;
        }
        if !self.stateless.lock().unwrap().allow(datagram.remote, now) {
            self.drop_count();
            return;
        }
        // Shorter than what provoked it, so two stateless ends can't ping
        // forever.
        let len = (datagram.payload.len() - 1).clamp(21 + LOCAL_CID_LEN, 100);
        let payload = packet::encode_stateless_reset(token, len);
        debug!(remote = %datagram.remote, "stateless reset sent");
        self.datapath.send(Transmit {
            local: datagram.local,
            remote: datagram.remote,
            payload,
            ecn: Default::default(),
        });
    }

    fn handle_new_initial(&self, header: InvariantHeader, datagram: Datagram, now: Instant) {
        let Some(listener) = self.listener.read().unwrap().clone() else {
            trace!("initial without listener dropped");
            self.drop_count();
            return;
        };

        // Re-parse as a full packet to get the token.
        let (partial, _) =
            match crate::packet::PartialPacket::decode(&datagram.payload, 0, LOCAL_CID_LEN) {
                Ok(v) => v,
                Err(_) => {
                    self.drop_count();
                    return;
                }
            };
        let token = partial.token.unwrap_or(&[]);
        let client_scid = partial.scid.unwrap_or(Cid::EMPTY);
        let dcid = header.dcid;

        let (odcid, retry_scid, validated) = if !token.is_empty() {
            // AEAD-open under the library retry key, IV bound to the DCID
            // the client switched to.
            let snapshot = retry_key_snapshot();
            match snapshot.open(token, &dcid) {
                Ok(body) => {
                    if body.peer != addr_bytes(&datagram.remote) {
                        debug!(remote = %datagram.remote, "retry token for different address");
                        self.drop_count();
                        return;
                    }
                    let retry = (body.kind == TokenKind::Retry).then_some(dcid);
                    (body.original_dcid, retry, true)
                }
                Err(_) => {
                    debug!(remote = %datagram.remote, "invalid retry token");
                    self.drop_count();
                    return;
                }
            }
        } else if listener.stateless_retry() {
            self.send_retry(&client_scid, &dcid, &datagram, now);
            return;
        } else {
            (dcid, None, false)
        };

        let Some(accept) = listener.on_initial(datagram.remote) else {
            trace!(remote = %datagram.remote, "listener refused connection");
            self.drop_count();
            return;
        };

        let shared = self.pool.allocate();
        let authority = Arc::new(LookupCidAuthority {
            lookup: self.lookup.clone(),
            reset_key: self.reset_key.clone(),
            conn: ConnRef(shared.clone()),
        });
        let partition = shared.worker as u8;
        let conn = Connection::new_server(
            accept.settings,
            accept.tls,
            authority,
            datagram.local,
            datagram.remote,
            partition,
            odcid,
            client_scid,
            retry_scid,
            validated,
            accept.events,
            now,
        );
        let conn = match conn {
            Ok((conn, _scid)) => conn,
            Err(error) => {
                warn!(%error, "server connection setup failed");
                self.drop_count();
                return;
            }
        };
        // The client still addresses us by the Initial's DCID until it
        // learns our CID; route that too.
        let _ = self.lookup.add(&odcid, ConnRef(shared.clone()));
        if let Some(retry_cid) = retry_scid {
            let _ = self.lookup.add(&retry_cid, ConnRef(shared.clone()));
        }

        let handle = self.pool.install(shared, conn);
        handle.enqueue(crate::connection::Op::Receive(datagram));
        listener.on_connection(handle);
    }

    fn send_retry(&self, client_scid: &Cid, odcid: &Cid, datagram: &Datagram, now: Instant) {
        if !self.stateless.lock().unwrap().allow(datagram.remote, now) {
            self.drop_count();
            return;
        }
        // The CID the client must target next is random; the token's IV
        // binds to it, so only an Initial using it can redeem the token.
        let new_scid = Cid::random(LOCAL_CID_LEN);
        let body = RetryTokenBody {
            kind: TokenKind::Retry,
            peer: addr_bytes(&datagram.remote),
            original_dcid: *odcid,
        };
        let token = retry_key_snapshot().seal(&body, &new_scid);
        let payload = packet::encode_retry(client_scid, &new_scid, odcid, &token);
        info!(remote = %datagram.remote, "retry sent");
        self.datapath.send(Transmit {
            local: datagram.local,
            remote: datagram.remote,
            payload,
            ecn: Default::default(),
        });
    }
}

/// Canonical bytes of a socket address for token binding.
fn addr_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        std::net::IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stateless_budget_caps_per_peer() {
        let mut budget = StatelessBudget::new();
        let now = Instant::now();
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        for _ in 0..STATELESS_OPS_PER_PEER {
            assert!(budget.allow(peer, now));
        }
        assert!(!budget.allow(peer, now));
        // Another peer is unaffected.
        assert!(budget.allow("10.0.0.2:5555".parse().unwrap(), now));
        // Expiry frees the budget.
        let later = now + Duration::from_millis(STATELESS_OP_EXPIRY_MS + 1);
        assert!(budget.allow(peer, later));
    }

    #[test]
    fn addr_bytes_distinguish_port() {
        let a = addr_bytes(&"10.0.0.1:1000".parse().unwrap());
        let b = addr_bytes(&"10.0.0.1:1001".parse().unwrap());
        assert_ne!(a, b);
    }
}
