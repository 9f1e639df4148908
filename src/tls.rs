//! Interface to the external TLS 1.3 handshake engine.
//!
//! The connection feeds received CRYPTO stream bytes in, pulls outbound
//! handshake bytes per epoch, and consumes key material and completion
//! through drained events. Nothing in this crate interprets handshake
//! messages.

use crate::crypto::EpochKeys;
use crate::error::TransportError;
use crate::types::Epoch;

/// Out-of-band products of the handshake engine.
pub enum TlsEvent {
    /// Keys for an epoch became available and should be installed. Old
    /// keys for earlier epochs are discarded on the connection's schedule,
    /// not here.
    Keys { epoch: Epoch, keys: EpochKeys },
    /// Handshake finished: the peer's raw transport parameters and the
    /// negotiated ALPN protocol.
    HandshakeComplete { peer_params: Vec<u8>, alpn: Option<Vec<u8>> },
    /// Fatal TLS alert code; the connection closes with CryptoError.
    Alert(u8),
    /// A resumption ticket for the application to persist.
    Ticket(Vec<u8>),
}

/// A handshake engine bound to one connection.
pub trait TlsSession: Send {
    /// Install the local transport parameters the engine must carry in
    /// its hello. Called once by the connection before the first flight,
    /// after the connection's source CID exists.
    fn set_transport_params(&mut self, params: Vec<u8>);

    /// Deliver contiguous CRYPTO stream bytes received at `epoch`.
    fn write_handshake(&mut self, epoch: Epoch, data: &[u8]) -> Result<(), TransportError>;

    /// Outbound handshake bytes to carry in CRYPTO frames at `epoch`.
    /// Returns `None` when the engine has nothing further for that epoch.
    fn read_handshake(&mut self, epoch: Epoch) -> Option<Vec<u8>>;

    /// Drain the next pending event, if any.
    fn poll_event(&mut self) -> Option<TlsEvent>;

    /// Local transport parameters were provided at construction; this
    /// returns the bytes the engine is carrying in its hello, for logging.
    fn local_params(&self) -> &[u8];

    fn is_complete(&self) -> bool;
}
