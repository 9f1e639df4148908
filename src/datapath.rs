//! Interface to the external UDP datapath.
//!
//! The core never touches sockets: bindings hand fully formed datagrams to
//! a [`Datapath`] and are driven by its receive upcall.

use std::net::SocketAddr;

/// ECN codepoint on a datagram (RFC 3168, RFC 9000 §13.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EcnCodepoint {
    #[default]
    NotEct,
    Ect0,
    Ect1,
    Ce,
}

/// One datagram going out.
#[derive(Debug)]
pub struct Transmit {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub payload: Vec<u8>,
    pub ecn: EcnCodepoint,
}

/// One datagram coming in, as delivered by the receive upcall.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub payload: Vec<u8>,
    pub ecn: EcnCodepoint,
}

/// The send half the datapath provides. Send is fire-and-forget and must
/// not block; the datapath owns its buffers once this returns.
pub trait Datapath: Send + Sync {
    fn send(&self, transmit: Transmit);
}
