//! quictide — a QUIC (RFC 9000/9001/9002/9221) transport core.
//!
//! The crate is the per-connection protocol engine plus the binding layer
//! that routes datagrams to connections. TLS, UDP I/O, and persistence
//! are consumed through the traits in [`tls`] and [`datapath`].

pub mod binding;
pub mod builder;
pub mod cid;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod crypto;
pub mod datagram;
pub mod datapath;
pub mod error;
pub mod frame;
pub mod lookup;
pub mod loss;
pub mod packet;
pub mod path;
pub mod recv_buffer;
pub mod send_buffer;
pub mod space;
pub mod stream;
pub mod testing;
pub mod tls;
pub mod types;
pub mod varint;
pub mod worker;

// Re-exports
pub use binding::{Accept, Binding, Listener, rotate_retry_key};
pub use cid::Cid;
pub use config::{ResumptionRecord, Settings, TransportParams};
pub use congestion::CongestionAlgorithm;
pub use connection::{ApiOp, ConnStats, Connection, Event, Op, Param, ShutdownKind};
pub use datagram::DatagramState;
pub use datapath::{Datagram, Datapath, EcnCodepoint, Transmit};
pub use error::{ApiError, CloseReason, TransportError};
pub use tls::{TlsEvent, TlsSession};
pub use types::{Dir, Epoch, QUIC_VERSION_1, Side, StreamId};
pub use worker::{ConnHandle, WorkerPool};
