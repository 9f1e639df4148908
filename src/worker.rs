//! The worker pool: each connection is pinned to one worker task, which
//! owns its state outright. Cross-thread surfaces are the per-connection
//! FIFO op queue and the worker's wakeup channel; everything else is
//! single-threaded.

use crate::cid::Cid;
use crate::connection::{ApiOp, ConnStats, Connection, Event, Op};
use crate::datapath::Datapath;
use crate::error::ApiError;
use crate::lookup::CidLookup;
use crate::types::{Dir, StreamId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Cross-thread face of one connection: its identity, owning worker, and
/// op queue. The connection state itself lives inside the worker task.
pub struct ConnShared {
    pub id: u64,
    pub worker: usize,
    queue: Mutex<VecDeque<Op>>,
}

impl ConnShared {
    /// Push one op; the caller wakes the worker afterwards.
    pub fn push_op(&self, op: Op) {
        self.queue.lock().unwrap().push_back(op);
    }
}

/// Routing value stored in the CID lookup. Equality is identity.
#[derive(Clone)]
pub struct ConnRef(pub Arc<ConnShared>);

impl PartialEq for ConnRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

enum WorkerMsg {
    /// Install a new connection on this worker.
    Spawn { shared: Arc<ConnShared>, conn: Box<Connection> },
    /// A connection's op queue has work.
    Wake(u64),
}

/// Handle the API layer uses to drive a connection. Clonable; methods are
/// typed operation requests resolved on the owning worker.
#[derive(Clone)]
pub struct ConnHandle {
    shared: Arc<ConnShared>,
    wake: mpsc::UnboundedSender<WorkerMsg>,
}

impl ConnHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Enqueue one operation and wake the worker. Strict FIFO per
    /// connection.
    pub fn enqueue(&self, op: Op) {
        self.shared.queue.lock().unwrap().push_back(op);
        let _ = self.wake.send(WorkerMsg::Wake(self.shared.id));
    }

    pub async fn open_stream(&self, dir: Dir) -> Result<StreamId, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Op::Api(ApiOp::StreamOpen { dir, reply }));
        rx.await.map_err(|_| ApiError::Aborted)?
    }

    pub fn send_stream(&self, id: StreamId, data: Vec<u8>, fin: bool) {
        self.enqueue(Op::Api(ApiOp::StreamSend { id, data, fin }));
    }

    pub fn receive_complete(&self, id: StreamId, consumed: usize) {
        self.enqueue(Op::Api(ApiOp::ReceiveComplete { id, consumed }));
    }

    pub fn shutdown_stream(&self, id: StreamId, kind: crate::connection::ShutdownKind) {
        self.enqueue(Op::Api(ApiOp::StreamShutdown { id, kind }));
    }

    pub fn release_stream(&self, id: StreamId) {
        self.enqueue(Op::Api(ApiOp::StreamRelease { id }));
    }

    pub async fn send_datagram(&self, data: Vec<u8>) -> Result<u64, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Op::Api(ApiOp::DatagramSend { data, reply }));
        rx.await.map_err(|_| ApiError::Aborted)?
    }

    pub fn key_update(&self) {
        self.enqueue(Op::Api(ApiOp::KeyUpdate));
    }

    pub fn shutdown(&self, code: u64) {
        self.enqueue(Op::Api(ApiOp::Shutdown { code }));
    }

    pub fn set_param(&self, param: crate::connection::Param) {
        self.enqueue(Op::Api(ApiOp::SetParam(param)));
    }

    pub async fn stats(&self) -> Result<ConnStats, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Op::Api(ApiOp::GetStats { reply }));
        rx.await.map_err(|_| ApiError::Aborted)
    }
}

/// Fixed pool of worker tasks. A connection's worker is chosen at
/// creation and embedded in its source CIDs as the partition byte, so the
/// binding can route follow-up packets without consulting the pool.
pub struct WorkerPool {
    senders: Vec<mpsc::UnboundedSender<WorkerMsg>>,
    next_id: AtomicU64,
    next_worker: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        count: usize,
        datapath: Arc<dyn Datapath>,
        lookup: Arc<CidLookup<ConnRef>>,
    ) -> Arc<Self> {
        let count = count.max(1);
        let mut senders = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            tokio::spawn(worker_loop(index, rx, datapath.clone(), lookup.clone()));
        }
        Arc::new(WorkerPool {
            senders,
            next_id: AtomicU64::new(1),
            next_worker: AtomicU64::new(0),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Reserve an identity + worker for a connection about to be built.
    /// The worker index doubles as the CID partition byte.
    pub fn allocate(&self) -> Arc<ConnShared> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let worker =
            (self.next_worker.fetch_add(1, Ordering::Relaxed) % self.senders.len() as u64) as usize;
        Arc::new(ConnShared { id, worker, queue: Mutex::new(VecDeque::new()) })
    }

    /// Hand the built connection to its worker and get the API handle.
    pub fn install(&self, shared: Arc<ConnShared>, conn: Connection) -> ConnHandle {
        let wake = self.senders[shared.worker].clone();
        let _ = wake.send(WorkerMsg::Spawn { shared: shared.clone(), conn: Box::new(conn) });
        ConnHandle { shared, wake }
    }

    /// Wake a connection found through the CID lookup.
    pub fn wake(&self, conn: &ConnRef) {
        let _ = self.senders[conn.0.worker].send(WorkerMsg::Wake(conn.0.id));
    }
}

struct WorkerConn {
    conn: Box<Connection>,
    shared: Arc<ConnShared>,
}

async fn worker_loop(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<WorkerMsg>,
    datapath: Arc<dyn Datapath>,
    lookup: Arc<CidLookup<ConnRef>>,
) {
    debug!(worker = index, "worker started");
    let mut conns: HashMap<u64, WorkerConn> = HashMap::new();

    loop {
        let next_deadline = conns.values().filter_map(|c| c.conn.next_timeout()).min();
        let msg = match next_deadline {
            Some(deadline) => {
                // A deadline that cannot clear (e.g. amplification-blocked
                // ack) must not spin the loop.
                let floor = Instant::now() + std::time::Duration::from_millis(1);
                let deadline = deadline.max(floor);
                tokio::select! {
                    msg = rx.recv() => msg,
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                        fire_timers(&mut conns, &*datapath);
                        reap(&mut conns, &lookup);
                        continue;
                    }
                }
            }
            None => rx.recv().await,
        };
        let Some(msg) = msg else {
            debug!(worker = index, "worker channel closed");
            return;
        };

        match msg {
            WorkerMsg::Spawn { shared, conn } => {
                let id = shared.id;
                let mut entry = WorkerConn { conn, shared };
                // First flush starts the client handshake.
                send_all(&*datapath, entry.conn.flush(Instant::now()));
                conns.insert(id, entry);
            }
            WorkerMsg::Wake(id) => {
                let Some(entry) = conns.get_mut(&id) else { continue };
                // Drain the op queue in enqueue order; one flush follows
                // each operation.
                loop {
                    let op = entry.shared.queue.lock().unwrap().pop_front();
                    let Some(op) = op else { break };
                    let now = Instant::now();
                    entry.conn.handle_op(op, now);
                    send_all(&*datapath, entry.conn.flush(now));
                }
            }
        }
        reap(&mut conns, &lookup);
    }
}

fn fire_timers(conns: &mut HashMap<u64, WorkerConn>, datapath: &dyn Datapath) {
    let now = Instant::now();
    for entry in conns.values_mut() {
        if entry.conn.next_timeout().is_some_and(|deadline| deadline <= now) {
            entry.conn.handle_op(Op::Timer, now);
            send_all(datapath, entry.conn.flush(now));
        }
    }
}

fn send_all(datapath: &dyn Datapath, transmits: Vec<crate::datapath::Transmit>) {
    for transmit in transmits {
        datapath.send(transmit);
    }
}

/// Drop drained connections and unregister their CIDs.
fn reap(conns: &mut HashMap<u64, WorkerConn>, lookup: &CidLookup<ConnRef>) {
    let now = Instant::now();
    let dead: Vec<u64> = conns
        .iter()
        .filter(|(_, c)| c.conn.is_drained(now))
        .map(|(&id, _)| id)
        .collect();
    for id in dead {
        if let Some(entry) = conns.remove(&id) {
            trace!(conn = id, "connection drained, dropping");
            for cid in entry.conn.active_source_cids() {
                lookup.remove(&cid);
            }
        }
    }
}

/// Per-connection CID authority bound to a binding's lookup + reset key.
pub struct LookupCidAuthority {
    pub lookup: Arc<CidLookup<ConnRef>>,
    pub reset_key: crate::crypto::ResetTokenKey,
    pub conn: ConnRef,
}

impl crate::connection::CidAuthority for LookupCidAuthority {
    fn issue_cid(&self, partition: u8) -> Option<(Cid, [u8; 16])> {
        for _ in 0..crate::types::CID_COLLISION_RETRIES {
            let cid = Cid::random_local(partition);
            if self.lookup.add(&cid, self.conn.clone()).is_ok() {
                return Some((cid, self.reset_key.token_for(&cid)));
            }
        }
        None
    }

    fn retire_cid(&self, cid: &Cid) {
        self.lookup.remove(cid);
    }
}

/// Events channel pair for a connection, in the shape the connection
/// constructor expects.
pub fn event_channel() -> (mpsc::UnboundedSender<Event>, mpsc::UnboundedReceiver<Event>) {
    mpsc::unbounded_channel()
}
