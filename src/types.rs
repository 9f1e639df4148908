//! Protocol constants and core identifier types.

use std::fmt;

// =============================================================================
// VERSIONS
// =============================================================================

/// QUIC version 1 (RFC 9000). The only version this crate speaks.
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// Version negotiation responses advertise the supported set plus one
/// randomly generated grease version of the form 0x?a?a?a?a.
pub const SUPPORTED_VERSIONS: &[u32] = &[QUIC_VERSION_1];

/// Pattern for grease versions: any version with the low nibble of every
/// byte equal to 0xa is reserved for forcing version negotiation.
pub const GREASE_VERSION_MASK: u32 = 0x0a0a_0a0a;

// =============================================================================
// WIRE LIMITS
// =============================================================================

/// Maximum connection ID length in QUIC v1.
pub const MAX_CID_LEN: usize = 20;

/// Client Initial datagrams must be padded to at least this many bytes.
pub const MIN_INITIAL_DATAGRAM: usize = 1200;

/// Default path MTU assumed before any probing.
pub const DEFAULT_MTU: u16 = 1280;

/// Largest varint value: 2^62 - 1.
pub const VARINT_MAX: u64 = (1 << 62) - 1;

/// Stateless reset tokens are always 16 bytes.
pub const RESET_TOKEN_LEN: usize = 16;

/// Retry integrity tags and AEAD tags are 16 bytes.
pub const TAG_LEN: usize = 16;

/// PATH_CHALLENGE / PATH_RESPONSE payload size.
pub const PATH_CHALLENGE_LEN: usize = 8;

// =============================================================================
// LOCAL POLICY
// =============================================================================

/// Bytes a server may send on an unvalidated path per byte received (RFC 9000
/// §8.1 anti-amplification).
pub const AMPLIFICATION_FACTOR: u64 = 3;

/// At most this many paths are tracked per connection: the active path plus
/// one probing path.
pub const MAX_PATHS: usize = 2;

/// Locally generated CIDs are this long: 1 type byte + 1 partition byte +
/// 6 random bytes.
pub const LOCAL_CID_LEN: usize = 8;

/// Byte index inside locally generated CIDs that carries the worker
/// partition ID.
pub const CID_PARTITION_INDEX: usize = 1;

/// Retries on CID collision before the connection reports InternalError.
pub const CID_COLLISION_RETRIES: usize = 8;

/// Concurrent outstanding stateless operations allowed per peer address.
pub const STATELESS_OPS_PER_PEER: usize = 4;

/// A tracked stateless operation ages out after this long.
pub const STATELESS_OP_EXPIRY_MS: u64 = 100;

// =============================================================================
// TIMING DEFAULTS (RFC 9002)
// =============================================================================

/// Initial RTT before the first sample, in milliseconds.
pub const INITIAL_RTT_MS: u64 = 333;

/// Timer granularity floor, in milliseconds.
pub const GRANULARITY_MS: u64 = 1;

/// Time-threshold loss multiplier, as a fraction (9/8).
pub const TIME_THRESHOLD_NUM: u32 = 9;
pub const TIME_THRESHOLD_DEN: u32 = 8;

/// Packet reordering threshold before a packet is declared lost.
pub const PACKET_THRESHOLD: u64 = 3;

/// Consecutive PTOs allowed during the handshake before the connection is
/// abandoned.
pub const MAX_HANDSHAKE_PTO_COUNT: u32 = 6;

/// Persistent congestion duration multiplier.
pub const PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

/// Draining/closing period is this many PTOs (RFC 9000 §10.2).
pub const CLOSE_PTO_COUNT: u32 = 3;

// =============================================================================
// EPOCHS
// =============================================================================

/// A packet-number space, one per encryption epoch. Initial and Handshake
/// keys are discarded as the handshake advances; AppData lives for the rest
/// of the connection, across key updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Epoch {
    Initial = 0,
    Handshake = 1,
    AppData = 2,
}

/// Number of packet-number spaces.
pub const EPOCH_COUNT: usize = 3;

impl Epoch {
    pub const ALL: [Epoch; EPOCH_COUNT] = [Epoch::Initial, Epoch::Handshake, Epoch::AppData];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Epoch::Initial => "initial",
            Epoch::Handshake => "handshake",
            Epoch::AppData => "1rtt",
        }
    }
}

// =============================================================================
// SIDE
// =============================================================================

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    pub fn is_server(self) -> bool {
        self == Side::Server
    }

    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    /// Initiator bit as encoded in stream IDs.
    pub fn stream_bit(self) -> u64 {
        match self {
            Side::Client => 0,
            Side::Server => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

// =============================================================================
// STREAMS
// =============================================================================

/// Stream directionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dir {
    /// Both endpoints can send.
    Bi,
    /// Only the initiator can send.
    Uni,
}

impl Dir {
    pub fn stream_bit(self) -> u64 {
        match self {
            Dir::Bi => 0,
            Dir::Uni => 2,
        }
    }
}

/// A 62-bit stream identifier. The low two bits encode initiator
/// (client = 0) and direction (bidi = 0).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        StreamId(index << 2 | dir.stream_bit() | initiator.stream_bit())
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 { Side::Client } else { Side::Server }
    }

    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 { Dir::Bi } else { Dir::Uni }
    }

    pub fn is_bidi(self) -> bool {
        self.dir() == Dir::Bi
    }

    /// Ordinal of this stream among streams of the same initiator/direction.
    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    /// True if `side` is allowed to send on this stream.
    pub fn sendable_by(self, side: Side) -> bool {
        self.is_bidi() || self.initiator() == side
    }

    /// True if `side` is allowed to receive on this stream.
    pub fn receivable_by(self, side: Side) -> bool {
        self.is_bidi() || self.initiator() != side
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.dir() {
            Dir::Bi => "bi",
            Dir::Uni => "uni",
        };
        write!(f, "{}({} {} {})", self.0, self.initiator(), dir, self.index())
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_bits() {
        let id = StreamId::new(Side::Client, Dir::Bi, 0);
        assert_eq!(id.0, 0);
        assert_eq!(id.initiator(), Side::Client);
        assert!(id.is_bidi());

        let id = StreamId::new(Side::Server, Dir::Uni, 3);
        assert_eq!(id.0, 3 << 2 | 0x3);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.dir(), Dir::Uni);
        assert_eq!(id.index(), 3);
    }

    #[test]
    fn stream_id_permissions() {
        // Server-initiated uni: only the server sends.
        let id = StreamId::new(Side::Server, Dir::Uni, 0);
        assert!(id.sendable_by(Side::Server));
        assert!(!id.sendable_by(Side::Client));
        assert!(id.receivable_by(Side::Client));
        assert!(!id.receivable_by(Side::Server));

        // Bidi: both send and receive.
        let id = StreamId::new(Side::Client, Dir::Bi, 7);
        assert!(id.sendable_by(Side::Server));
        assert!(id.sendable_by(Side::Client));
    }
}
