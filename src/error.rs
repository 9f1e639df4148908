//! Transport error taxonomy and RFC 9000 §20 wire codes.

use thiserror::Error;

/// Errors that terminate or refuse a connection. Each kind maps onto a
/// transport error code carried in CONNECTION_CLOSE (type 0x1c).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("frame encoding error: {0}")]
    FrameEncodingError(&'static str),

    #[error("flow control error: {0}")]
    FlowControlError(&'static str),

    #[error("stream state error: {0}")]
    StreamStateError(&'static str),

    #[error("stream limit error")]
    StreamLimitError,

    #[error("final size error")]
    FinalSizeError,

    #[error("transport parameter error: {0}")]
    TransportParameterError(&'static str),

    #[error("crypto error: tls alert {0}")]
    CryptoError(u8),

    #[error("connection id limit error")]
    ConnectionIdLimitError,

    #[error("invalid retry token")]
    InvalidToken,

    #[error("version negotiation error")]
    VersionNegotiationError,

    #[error("key update error")]
    KeyUpdateError,

    #[error("internal error: {0}")]
    InternalError(&'static str),

    /// Opaque 62-bit code supplied by the application layer.
    #[error("application error {0:#x}")]
    ApplicationError(u64),
}

impl TransportError {
    /// Wire error code for CONNECTION_CLOSE.
    pub fn code(&self) -> u64 {
        match self {
            TransportError::InternalError(_) => 0x01,
            TransportError::FlowControlError(_) => 0x03,
            TransportError::StreamLimitError => 0x04,
            TransportError::StreamStateError(_) => 0x05,
            TransportError::FinalSizeError => 0x06,
            TransportError::FrameEncodingError(_) => 0x07,
            TransportError::TransportParameterError(_) => 0x08,
            TransportError::ConnectionIdLimitError => 0x09,
            TransportError::ProtocolViolation(_) => 0x0a,
            TransportError::InvalidToken => 0x0b,
            TransportError::KeyUpdateError => 0x0e,
            TransportError::VersionNegotiationError => 0x11,
            TransportError::CryptoError(alert) => 0x0100 | *alert as u64,
            TransportError::ApplicationError(code) => *code,
        }
    }

    /// True for codes the application chose, carried in the 0x1d close frame.
    pub fn is_application(&self) -> bool {
        matches!(self, TransportError::ApplicationError(_))
    }

    /// UTF-8 reason phrase for the close frame.
    pub fn reason(&self) -> String {
        match self {
            TransportError::ApplicationError(_) => String::new(),
            other => other.to_string(),
        }
    }
}

/// How a connection ended, as reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// We closed with a transport or application error.
    Local(TransportError),
    /// The peer sent CONNECTION_CLOSE with this code.
    Peer { code: u64, application: bool, reason: String },
    /// No activity for the negotiated idle timeout; discarded silently.
    IdleTimeout,
    /// PTO fired too many times during the handshake.
    HandshakeTimeout,
    /// A datagram carrying the peer's published stateless reset token arrived.
    StatelessReset,
}

/// API misuse reported synchronously, without touching wire state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("operation not valid in the current connection state")]
    InvalidState,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("stream not found")]
    UnknownStream,
    #[error("datagrams not negotiated with the peer")]
    DatagramsDisabled,
    #[error("connection is shutting down")]
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        assert_eq!(TransportError::FlowControlError("x").code(), 0x03);
        assert_eq!(TransportError::ProtocolViolation("x").code(), 0x0a);
        assert_eq!(TransportError::CryptoError(0x28).code(), 0x0128);
        assert_eq!(TransportError::ApplicationError(7).code(), 7);
        assert!(TransportError::ApplicationError(7).is_application());
        assert!(!TransportError::InvalidToken.is_application());
    }
}
