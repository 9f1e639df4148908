//! Frame model and codec (RFC 9000 §19, RFC 9221 §4).

use crate::error::TransportError;
use crate::types::{Dir, PATH_CHALLENGE_LEN, RESET_TOKEN_LEN, StreamId, VARINT_MAX};
use crate::varint::{self, Reader};

// Frame type values. STREAM and DATAGRAM carry flag bits in the low bits of
// the type itself.
const TY_PADDING: u64 = 0x00;
const TY_PING: u64 = 0x01;
const TY_ACK: u64 = 0x02;
const TY_ACK_ECN: u64 = 0x03;
const TY_RESET_STREAM: u64 = 0x04;
const TY_STOP_SENDING: u64 = 0x05;
const TY_CRYPTO: u64 = 0x06;
const TY_NEW_TOKEN: u64 = 0x07;
const TY_STREAM_BASE: u64 = 0x08;
const STREAM_FIN: u64 = 0x01;
const STREAM_LEN: u64 = 0x02;
const STREAM_OFF: u64 = 0x04;
const TY_MAX_DATA: u64 = 0x10;
const TY_MAX_STREAM_DATA: u64 = 0x11;
const TY_MAX_STREAMS_BIDI: u64 = 0x12;
const TY_MAX_STREAMS_UNI: u64 = 0x13;
const TY_DATA_BLOCKED: u64 = 0x14;
const TY_STREAM_DATA_BLOCKED: u64 = 0x15;
const TY_STREAMS_BLOCKED_BIDI: u64 = 0x16;
const TY_STREAMS_BLOCKED_UNI: u64 = 0x17;
const TY_NEW_CONNECTION_ID: u64 = 0x18;
const TY_RETIRE_CONNECTION_ID: u64 = 0x19;
const TY_PATH_CHALLENGE: u64 = 0x1a;
const TY_PATH_RESPONSE: u64 = 0x1b;
const TY_CONNECTION_CLOSE: u64 = 0x1c;
const TY_CONNECTION_CLOSE_APP: u64 = 0x1d;
const TY_HANDSHAKE_DONE: u64 = 0x1e;
const TY_DATAGRAM: u64 = 0x30;
const DATAGRAM_LEN: u64 = 0x01;

/// ECN counts from an ACK_ECN frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

/// One ACK frame, wire-faithful: ranges are stored as descending
/// (gap, length) pairs below `first_range`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest: u64,
    /// Raw wire value; multiply by 2^ack_delay_exponent for microseconds.
    pub delay: u64,
    pub first_range: u64,
    pub ranges: Vec<(u64, u64)>,
    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// Expand to inclusive PN ranges, highest first. Fails when a gap/length
    /// pair underflows below zero.
    pub fn iter_ranges(&self) -> Result<Vec<(u64, u64)>, TransportError> {
        let mut out = Vec::with_capacity(1 + self.ranges.len());
        let mut smallest = self
            .largest
            .checked_sub(self.first_range)
            .ok_or(TransportError::FrameEncodingError("ack range underflow"))?;
        out.push((smallest, self.largest));
        for &(gap, len) in &self.ranges {
            let largest = smallest
                .checked_sub(gap + 2)
                .ok_or(TransportError::FrameEncodingError("ack gap underflow"))?;
            smallest = largest
                .checked_sub(len)
                .ok_or(TransportError::FrameEncodingError("ack range underflow"))?;
            out.push((smallest, largest));
        }
        Ok(out)
    }

    /// Encoded size in bytes, including the leading frame-type byte.
    pub fn wire_size(&self) -> usize {
        use varint::size as vs;
        let mut n = 1 + vs(self.largest) + vs(self.delay) + vs(self.ranges.len() as u64) + vs(self.first_range);
        for &(gap, len) in &self.ranges {
            n += vs(gap) + vs(len);
        }
        if let Some(ecn) = &self.ecn {
            n += vs(ecn.ect0) + vs(ecn.ect1) + vs(ecn.ce);
        }
        n
    }
}

/// A single decoded frame. Data-bearing frames own their payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding(usize),
    Ping,
    Ack(AckFrame),
    ResetStream {
        stream_id: StreamId,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: StreamId,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Vec<u8>,
    },
    NewToken {
        token: Vec<u8>,
    },
    Stream {
        stream_id: StreamId,
        offset: u64,
        data: Vec<u8>,
        fin: bool,
    },
    MaxData(u64),
    MaxStreamData {
        stream_id: StreamId,
        limit: u64,
    },
    MaxStreams {
        dir: Dir,
        limit: u64,
    },
    DataBlocked(u64),
    StreamDataBlocked {
        stream_id: StreamId,
        limit: u64,
    },
    StreamsBlocked {
        dir: Dir,
        limit: u64,
    },
    NewConnectionId {
        sequence: u64,
        retire_prior_to: u64,
        cid: Vec<u8>,
        reset_token: [u8; RESET_TOKEN_LEN],
    },
    RetireConnectionId {
        sequence: u64,
    },
    PathChallenge([u8; PATH_CHALLENGE_LEN]),
    PathResponse([u8; PATH_CHALLENGE_LEN]),
    ConnectionClose {
        error_code: u64,
        /// Type of the frame that triggered the close; absent for 0x1d.
        frame_type: Option<u64>,
        reason: Vec<u8>,
    },
    HandshakeDone,
    Datagram {
        data: Vec<u8>,
    },
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Padding(_) => "padding",
            Frame::Ping => "ping",
            Frame::Ack(_) => "ack",
            Frame::ResetStream { .. } => "reset_stream",
            Frame::StopSending { .. } => "stop_sending",
            Frame::Crypto { .. } => "crypto",
            Frame::NewToken { .. } => "new_token",
            Frame::Stream { .. } => "stream",
            Frame::MaxData(_) => "max_data",
            Frame::MaxStreamData { .. } => "max_stream_data",
            Frame::MaxStreams { .. } => "max_streams",
            Frame::DataBlocked(_) => "data_blocked",
            Frame::StreamDataBlocked { .. } => "stream_data_blocked",
            Frame::StreamsBlocked { .. } => "streams_blocked",
            Frame::NewConnectionId { .. } => "new_connection_id",
            Frame::RetireConnectionId { .. } => "retire_connection_id",
            Frame::PathChallenge(_) => "path_challenge",
            Frame::PathResponse(_) => "path_response",
            Frame::ConnectionClose { .. } => "connection_close",
            Frame::HandshakeDone => "handshake_done",
            Frame::Datagram { .. } => "datagram",
        }
    }

    /// Anything other than ACK, PADDING and CONNECTION_CLOSE elicits an ACK.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack(_) | Frame::Padding(_) | Frame::ConnectionClose { .. }
        )
    }

    /// Frames permitted in Initial and Handshake packets (RFC 9000 §12.5).
    pub fn allowed_pre_1rtt(&self) -> bool {
        matches!(
            self,
            Frame::Padding(_)
                | Frame::Ping
                | Frame::Ack(_)
                | Frame::Crypto { .. }
                | Frame::ConnectionClose { frame_type: Some(_), .. }
        )
    }

    /// Encoded size in bytes.
    pub fn wire_size(&self) -> usize {
        // Encoding into a scratch buffer would defeat the purpose for the
        // builder's fit checks, so sizes are computed directly.
        use varint::size as vs;
        match self {
            Frame::Padding(n) => *n,
            Frame::Ping | Frame::HandshakeDone => 1,
            Frame::Ack(ack) => ack.wire_size(),
            Frame::ResetStream { stream_id, error_code, final_size } => {
                1 + vs(stream_id.0) + vs(*error_code) + vs(*final_size)
            }
            Frame::StopSending { stream_id, error_code } => 1 + vs(stream_id.0) + vs(*error_code),
            Frame::Crypto { offset, data } => {
                1 + vs(*offset) + vs(data.len() as u64) + data.len()
            }
            Frame::NewToken { token } => 1 + vs(token.len() as u64) + token.len(),
            Frame::Stream { stream_id, offset, data, .. } => {
                let mut n = 1 + vs(stream_id.0) + vs(data.len() as u64) + data.len();
                if *offset > 0 {
                    n += vs(*offset);
                }
                n
            }
            Frame::MaxData(v) | Frame::DataBlocked(v) => 1 + vs(*v),
            Frame::MaxStreamData { stream_id, limit }
            | Frame::StreamDataBlocked { stream_id, limit } => 1 + vs(stream_id.0) + vs(*limit),
            Frame::MaxStreams { limit, .. } | Frame::StreamsBlocked { limit, .. } => 1 + vs(*limit),
            Frame::NewConnectionId { sequence, retire_prior_to, cid, .. } => {
                1 + vs(*sequence) + vs(*retire_prior_to) + 1 + cid.len() + RESET_TOKEN_LEN
            }
            Frame::RetireConnectionId { sequence } => 1 + vs(*sequence),
            Frame::PathChallenge(_) | Frame::PathResponse(_) => 1 + PATH_CHALLENGE_LEN,
            Frame::ConnectionClose { error_code, frame_type, reason } => {
                1 + vs(*error_code)
                    + frame_type.map_or(0, vs)
                    + vs(reason.len() as u64)
                    + reason.len()
            }
            Frame::Datagram { data } => 1 + vs(data.len() as u64) + data.len(),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Padding(n) => buf.extend(std::iter::repeat_n(0u8, *n)),
            Frame::Ping => varint::write(buf, TY_PING),
            Frame::Ack(ack) => {
                varint::write(buf, if ack.ecn.is_some() { TY_ACK_ECN } else { TY_ACK });
                varint::write(buf, ack.largest);
                varint::write(buf, ack.delay);
                varint::write(buf, ack.ranges.len() as u64);
                varint::write(buf, ack.first_range);
                for &(gap, len) in &ack.ranges {
                    varint::write(buf, gap);
                    varint::write(buf, len);
                }
                if let Some(ecn) = &ack.ecn {
                    varint::write(buf, ecn.ect0);
                    varint::write(buf, ecn.ect1);
                    varint::write(buf, ecn.ce);
                }
            }
            Frame::ResetStream { stream_id, error_code, final_size } => {
                varint::write(buf, TY_RESET_STREAM);
                varint::write(buf, stream_id.0);
                varint::write(buf, *error_code);
                varint::write(buf, *final_size);
            }
            Frame::StopSending { stream_id, error_code } => {
                varint::write(buf, TY_STOP_SENDING);
                varint::write(buf, stream_id.0);
                varint::write(buf, *error_code);
            }
            Frame::Crypto { offset, data } => {
                varint::write(buf, TY_CRYPTO);
                varint::write(buf, *offset);
                varint::write(buf, data.len() as u64);
                buf.extend_from_slice(data);
            }
            Frame::NewToken { token } => {
                varint::write(buf, TY_NEW_TOKEN);
                varint::write(buf, token.len() as u64);
                buf.extend_from_slice(token);
            }
            Frame::Stream { stream_id, offset, data, fin } => {
                // Length is always explicit so frames can be followed by
                // others in the same packet.
                let mut ty = TY_STREAM_BASE | STREAM_LEN;
                if *offset > 0 {
                    ty |= STREAM_OFF;
                }
                if *fin {
                    ty |= STREAM_FIN;
                }
                varint::write(buf, ty);
                varint::write(buf, stream_id.0);
                if *offset > 0 {
                    varint::write(buf, *offset);
                }
                varint::write(buf, data.len() as u64);
                buf.extend_from_slice(data);
            }
            Frame::MaxData(v) => {
                varint::write(buf, TY_MAX_DATA);
                varint::write(buf, *v);
            }
            Frame::MaxStreamData { stream_id, limit } => {
                varint::write(buf, TY_MAX_STREAM_DATA);
                varint::write(buf, stream_id.0);
                varint::write(buf, *limit);
            }
            Frame::MaxStreams { dir, limit } => {
                varint::write(
                    buf,
                    match dir {
                        Dir::Bi => TY_MAX_STREAMS_BIDI,
                        Dir::Uni => TY_MAX_STREAMS_UNI,
                    },
                );
                varint::write(buf, *limit);
            }
            Frame::DataBlocked(v) => {
                varint::write(buf, TY_DATA_BLOCKED);
                varint::write(buf, *v);
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                varint::write(buf, TY_STREAM_DATA_BLOCKED);
                varint::write(buf, stream_id.0);
                varint::write(buf, *limit);
            }
            Frame::StreamsBlocked { dir, limit } => {
                varint::write(
                    buf,
                    match dir {
                        Dir::Bi => TY_STREAMS_BLOCKED_BIDI,
                        Dir::Uni => TY_STREAMS_BLOCKED_UNI,
                    },
                );
                varint::write(buf, *limit);
            }
            Frame::NewConnectionId { sequence, retire_prior_to, cid, reset_token } => {
                varint::write(buf, TY_NEW_CONNECTION_ID);
                varint::write(buf, *sequence);
                varint::write(buf, *retire_prior_to);
                buf.push(cid.len() as u8);
                buf.extend_from_slice(cid);
                buf.extend_from_slice(reset_token);
            }
            Frame::RetireConnectionId { sequence } => {
                varint::write(buf, TY_RETIRE_CONNECTION_ID);
                varint::write(buf, *sequence);
            }
            Frame::PathChallenge(data) => {
                varint::write(buf, TY_PATH_CHALLENGE);
                buf.extend_from_slice(data);
            }
            Frame::PathResponse(data) => {
                varint::write(buf, TY_PATH_RESPONSE);
                buf.extend_from_slice(data);
            }
            Frame::ConnectionClose { error_code, frame_type, reason } => {
                varint::write(
                    buf,
                    if frame_type.is_some() { TY_CONNECTION_CLOSE } else { TY_CONNECTION_CLOSE_APP },
                );
                varint::write(buf, *error_code);
                if let Some(ft) = frame_type {
                    varint::write(buf, *ft);
                }
                varint::write(buf, reason.len() as u64);
                buf.extend_from_slice(reason);
            }
            Frame::HandshakeDone => varint::write(buf, TY_HANDSHAKE_DONE),
            Frame::Datagram { data } => {
                varint::write(buf, TY_DATAGRAM | DATAGRAM_LEN);
                varint::write(buf, data.len() as u64);
                buf.extend_from_slice(data);
            }
        }
    }

    /// Decode a single frame at the reader's position. Runs of PADDING
    /// collapse into one `Frame::Padding`.
    pub fn decode(r: &mut Reader<'_>) -> Result<Frame, TransportError> {
        let ty = r.varint()?;
        let frame = match ty {
            TY_PADDING => {
                let mut n = 1;
                while !r.is_empty() && r.rest()[0] == 0 {
                    r.skip(1)?;
                    n += 1;
                }
                Frame::Padding(n)
            }
            TY_PING => Frame::Ping,
            TY_ACK | TY_ACK_ECN => {
                let largest = r.varint()?;
                let delay = r.varint()?;
                let range_count = r.varint()?;
                let first_range = r.varint()?;
                if range_count > r.remaining() as u64 / 2 {
                    return Err(TransportError::FrameEncodingError("ack range count"));
                }
                let mut ranges = Vec::with_capacity(range_count as usize);
                for _ in 0..range_count {
                    ranges.push((r.varint()?, r.varint()?));
                }
                let ecn = if ty == TY_ACK_ECN {
                    Some(EcnCounts { ect0: r.varint()?, ect1: r.varint()?, ce: r.varint()? })
                } else {
                    None
                };
                let ack = AckFrame { largest, delay, first_range, ranges, ecn };
                ack.iter_ranges()?;
                Frame::Ack(ack)
            }
            TY_RESET_STREAM => Frame::ResetStream {
                stream_id: StreamId(r.varint()?),
                error_code: r.varint()?,
                final_size: r.varint()?,
            },
            TY_STOP_SENDING => Frame::StopSending {
                stream_id: StreamId(r.varint()?),
                error_code: r.varint()?,
            },
            TY_CRYPTO => {
                let offset = r.varint()?;
                let data = r.varint_bytes()?.to_vec();
                if offset + data.len() as u64 > VARINT_MAX {
                    return Err(TransportError::FrameEncodingError("crypto offset overflow"));
                }
                Frame::Crypto { offset, data }
            }
            TY_NEW_TOKEN => {
                let token = r.varint_bytes()?.to_vec();
                if token.is_empty() {
                    return Err(TransportError::FrameEncodingError("empty token"));
                }
                Frame::NewToken { token }
            }
            ty if (TY_STREAM_BASE..TY_STREAM_BASE + 8).contains(&ty) => {
                let stream_id = StreamId(r.varint()?);
                let offset = if ty & STREAM_OFF != 0 { r.varint()? } else { 0 };
                let data = if ty & STREAM_LEN != 0 {
                    r.varint_bytes()?.to_vec()
                } else {
                    let rest = r.rest().to_vec();
                    r.skip(rest.len())?;
                    rest
                };
                if offset + data.len() as u64 > VARINT_MAX {
                    return Err(TransportError::FinalSizeError);
                }
                Frame::Stream { stream_id, offset, data, fin: ty & STREAM_FIN != 0 }
            }
            TY_MAX_DATA => Frame::MaxData(r.varint()?),
            TY_MAX_STREAM_DATA => Frame::MaxStreamData {
                stream_id: StreamId(r.varint()?),
                limit: r.varint()?,
            },
            TY_MAX_STREAMS_BIDI | TY_MAX_STREAMS_UNI => {
                let limit = r.varint()?;
                if limit > 1 << 60 {
                    return Err(TransportError::FrameEncodingError("streams limit too large"));
                }
                let dir = if ty == TY_MAX_STREAMS_BIDI { Dir::Bi } else { Dir::Uni };
                Frame::MaxStreams { dir, limit }
            }
            TY_DATA_BLOCKED => Frame::DataBlocked(r.varint()?),
            TY_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                stream_id: StreamId(r.varint()?),
                limit: r.varint()?,
            },
            TY_STREAMS_BLOCKED_BIDI | TY_STREAMS_BLOCKED_UNI => {
                let dir = if ty == TY_STREAMS_BLOCKED_BIDI { Dir::Bi } else { Dir::Uni };
                Frame::StreamsBlocked { dir, limit: r.varint()? }
            }
            TY_NEW_CONNECTION_ID => {
                let sequence = r.varint()?;
                let retire_prior_to = r.varint()?;
                if retire_prior_to > sequence {
                    return Err(TransportError::FrameEncodingError("retire_prior_to > sequence"));
                }
                let cid_len = r.u8()? as usize;
                if cid_len == 0 || cid_len > crate::types::MAX_CID_LEN {
                    return Err(TransportError::ProtocolViolation("bad NEW_CONNECTION_ID length"));
                }
                let cid = r.bytes(cid_len)?.to_vec();
                let reset_token = r.bytes(RESET_TOKEN_LEN)?.try_into().unwrap();
                Frame::NewConnectionId { sequence, retire_prior_to, cid, reset_token }
            }
            TY_RETIRE_CONNECTION_ID => Frame::RetireConnectionId { sequence: r.varint()? },
            TY_PATH_CHALLENGE => {
                Frame::PathChallenge(r.bytes(PATH_CHALLENGE_LEN)?.try_into().unwrap())
            }
            TY_PATH_RESPONSE => {
                Frame::PathResponse(r.bytes(PATH_CHALLENGE_LEN)?.try_into().unwrap())
            }
            TY_CONNECTION_CLOSE | TY_CONNECTION_CLOSE_APP => {
                let error_code = r.varint()?;
                let frame_type = if ty == TY_CONNECTION_CLOSE { Some(r.varint()?) } else { None };
                let reason = r.varint_bytes()?.to_vec();
                if std::str::from_utf8(&reason).is_err() {
                    return Err(TransportError::FrameEncodingError("close reason not utf-8"));
                }
                Frame::ConnectionClose { error_code, frame_type, reason }
            }
            TY_HANDSHAKE_DONE => Frame::HandshakeDone,
            TY_DATAGRAM | 0x31 => {
                let data = if ty & DATAGRAM_LEN != 0 {
                    r.varint_bytes()?.to_vec()
                } else {
                    let rest = r.rest().to_vec();
                    r.skip(rest.len())?;
                    rest
                };
                Frame::Datagram { data }
            }
            _ => return Err(TransportError::FrameEncodingError("unknown frame type")),
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn roundtrip(frame: Frame) {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), frame.wire_size(), "wire_size mismatch for {}", frame.name());
        let mut r = Reader::new(&buf);
        let decoded = Frame::decode(&mut r).unwrap();
        assert!(r.is_empty());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_control_frames() {
        roundtrip(Frame::Ping);
        roundtrip(Frame::HandshakeDone);
        roundtrip(Frame::MaxData(123_456));
        roundtrip(Frame::DataBlocked(99));
        roundtrip(Frame::MaxStreams { dir: Dir::Uni, limit: 40 });
        roundtrip(Frame::StreamsBlocked { dir: Dir::Bi, limit: 1 });
        roundtrip(Frame::RetireConnectionId { sequence: 4 });
        roundtrip(Frame::PathChallenge([1, 2, 3, 4, 5, 6, 7, 8]));
        roundtrip(Frame::PathResponse([8, 7, 6, 5, 4, 3, 2, 1]));
        roundtrip(Frame::NewToken { token: vec![0xab; 33] });
    }

    #[test]
    fn roundtrip_stream_frames() {
        let id = StreamId::new(Side::Client, Dir::Bi, 5);
        roundtrip(Frame::Stream { stream_id: id, offset: 0, data: b"hello".to_vec(), fin: false });
        roundtrip(Frame::Stream { stream_id: id, offset: 7000, data: vec![], fin: true });
        roundtrip(Frame::ResetStream { stream_id: id, error_code: 7, final_size: 100 });
        roundtrip(Frame::StopSending { stream_id: id, error_code: 3 });
        roundtrip(Frame::MaxStreamData { stream_id: id, limit: 1 << 20 });
        roundtrip(Frame::StreamDataBlocked { stream_id: id, limit: 4096 });
    }

    #[test]
    fn roundtrip_ack() {
        roundtrip(Frame::Ack(AckFrame {
            largest: 1000,
            delay: 25,
            first_range: 10,
            ranges: vec![(0, 3), (5, 0)],
            ecn: None,
        }));
        roundtrip(Frame::Ack(AckFrame {
            largest: 7,
            delay: 0,
            first_range: 7,
            ranges: vec![],
            ecn: Some(EcnCounts { ect0: 5, ect1: 0, ce: 2 }),
        }));
    }

    #[test]
    fn roundtrip_cid_and_close() {
        roundtrip(Frame::NewConnectionId {
            sequence: 2,
            retire_prior_to: 1,
            cid: vec![9; 8],
            reset_token: [0x42; RESET_TOKEN_LEN],
        });
        roundtrip(Frame::ConnectionClose {
            error_code: 0x0a,
            frame_type: Some(0x06),
            reason: b"crypto stream offset".to_vec(),
        });
        roundtrip(Frame::ConnectionClose {
            error_code: 77,
            frame_type: None,
            reason: vec![],
        });
        roundtrip(Frame::Datagram { data: vec![1, 2, 3] });
    }

    #[test]
    fn padding_run_collapses() {
        let mut r = Reader::new(&[0, 0, 0, 0, 1]);
        assert_eq!(Frame::decode(&mut r).unwrap(), Frame::Padding(4));
        assert_eq!(Frame::decode(&mut r).unwrap(), Frame::Ping);
    }

    #[test]
    fn ack_range_underflow_rejected() {
        // largest=1 but first_range=5 would go below zero.
        let mut buf = Vec::new();
        for v in [TY_ACK, 1, 0, 0, 5] {
            varint::write(&mut buf, v);
        }
        assert!(Frame::decode(&mut Reader::new(&buf)).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = Vec::new();
        varint::write(&mut buf, 0x42);
        assert_eq!(
            Frame::decode(&mut Reader::new(&buf)),
            Err(TransportError::FrameEncodingError("unknown frame type"))
        );
    }

    #[test]
    fn new_connection_id_validation() {
        let mut buf = Vec::new();
        varint::write(&mut buf, TY_NEW_CONNECTION_ID);
        varint::write(&mut buf, 1); // sequence
        varint::write(&mut buf, 2); // retire_prior_to > sequence
        buf.push(8);
        buf.extend_from_slice(&[0; 8 + RESET_TOKEN_LEN]);
        assert!(Frame::decode(&mut Reader::new(&buf)).is_err());
    }
}
