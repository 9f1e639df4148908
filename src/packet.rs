//! Packet headers and the protection envelope (RFC 9000 §17, RFC 9001 §5.4).
//!
//! Decoding is staged: the binding parses only the version-independent
//! header to route the datagram; the owning connection then removes header
//! protection and opens the AEAD envelope with the epoch's keys.

use crate::cid::Cid;
use crate::crypto::{HeaderKey, PacketKey};
use crate::error::TransportError;
use crate::types::{Epoch, MAX_CID_LEN, QUIC_VERSION_1, RESET_TOKEN_LEN, TAG_LEN};
use crate::varint::{self, Reader};
use sha3::{Digest, Sha3_256};

pub const FORM_LONG: u8 = 0x80;
pub const FIXED_BIT: u8 = 0x40;
pub const SPIN_BIT: u8 = 0x20;
pub const KEY_PHASE_BIT: u8 = 0x04;
const LONG_RESERVED: u8 = 0x0c;
const SHORT_RESERVED: u8 = 0x18;

/// Header-protection sample starts this many bytes past the PN offset.
const SAMPLE_OFFSET: usize = 4;
const SAMPLE_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    fn from_bits(bits: u8) -> LongType {
        match bits & 0x03 {
            0 => LongType::Initial,
            1 => LongType::ZeroRtt,
            2 => LongType::Handshake,
            _ => LongType::Retry,
        }
    }

    fn bits(self) -> u8 {
        match self {
            LongType::Initial => 0,
            LongType::ZeroRtt => 1,
            LongType::Handshake => 2,
            LongType::Retry => 3,
        }
    }

    pub fn epoch(self) -> Epoch {
        match self {
            LongType::Initial => Epoch::Initial,
            LongType::Handshake => Epoch::Handshake,
            // 0-RTT shares the AppData packet-number space.
            LongType::ZeroRtt | LongType::Retry => Epoch::AppData,
        }
    }
}

// =============================================================================
// INVARIANT PARSE (binding stage)
// =============================================================================

/// The version-independent fields, parsed before any version-specific field
/// is trusted.
#[derive(Debug)]
pub struct InvariantHeader {
    pub first: u8,
    pub is_long: bool,
    /// Present only for long headers. Zero means version negotiation.
    pub version: Option<u32>,
    pub dcid: Cid,
    pub scid: Option<Cid>,
}

impl InvariantHeader {
    /// Parse the invariant header at the start of `buf`. Short-header DCIDs
    /// have no length on the wire; `local_cid_len` supplies it.
    pub fn parse(buf: &[u8], local_cid_len: usize) -> Result<InvariantHeader, TransportError> {
        let mut r = Reader::new(buf);
        let first = r.u8()?;
        if first & FORM_LONG == 0 {
            let dcid = Cid::from_slice(r.bytes(local_cid_len)?);
            return Ok(InvariantHeader { first, is_long: false, version: None, dcid, scid: None });
        }
        let version = r.u32()?;
        let dcid_len = r.u8()? as usize;
        if dcid_len > MAX_CID_LEN {
            return Err(TransportError::ProtocolViolation("dcid too long"));
        }
        let dcid = Cid::from_slice(r.bytes(dcid_len)?);
        let scid_len = r.u8()? as usize;
        if scid_len > MAX_CID_LEN {
            return Err(TransportError::ProtocolViolation("scid too long"));
        }
        let scid = Cid::from_slice(r.bytes(scid_len)?);
        Ok(InvariantHeader { first, is_long: true, version: Some(version), dcid, scid: Some(scid) })
    }
}

// =============================================================================
// PER-PACKET DECODE (connection stage)
// =============================================================================

/// One packet cut out of a datagram, header parsed, payload still protected.
#[derive(Debug)]
pub struct PartialPacket<'a> {
    pub long_type: Option<LongType>,
    pub version: u32,
    pub dcid: Cid,
    pub scid: Option<Cid>,
    /// Initial packets: address-validation token.
    pub token: Option<&'a [u8]>,
    /// Retry packets: (token, integrity tag).
    pub retry: Option<(&'a [u8], [u8; TAG_LEN])>,
    /// Version negotiation: offered versions.
    pub versions: Option<Vec<u32>>,
    /// Entire packet, header included.
    packet: &'a [u8],
    pn_offset: usize,
}

impl<'a> PartialPacket<'a> {
    /// Decode the packet starting at `datagram[offset]`. Returns the packet
    /// and the offset of the next coalesced packet (the datagram end for
    /// short headers, which extend to the end by definition).
    pub fn decode(
        datagram: &'a [u8],
        offset: usize,
        local_cid_len: usize,
    ) -> Result<(PartialPacket<'a>, usize), TransportError> {
        let buf = &datagram[offset..];
        let mut r = Reader::new(buf);
        let first = r.u8()?;

        if first & FORM_LONG == 0 {
            if first & FIXED_BIT == 0 {
                return Err(TransportError::ProtocolViolation("fixed bit clear"));
            }
            r.bytes(local_cid_len)?;
            let pn_offset = 1 + local_cid_len;
            let dcid = Cid::from_slice(&buf[1..pn_offset]);
            let packet = buf;
            return Ok((
                PartialPacket {
                    long_type: None,
                    version: 0,
                    dcid,
                    scid: None,
                    token: None,
                    retry: None,
                    versions: None,
                    packet,
                    pn_offset,
                },
                datagram.len(),
            ));
        }

        let version = r.u32()?;
        let dcid_len = r.u8()? as usize;
        if dcid_len > MAX_CID_LEN {
            return Err(TransportError::ProtocolViolation("dcid too long"));
        }
        let dcid = Cid::from_slice(r.bytes(dcid_len)?);
        let scid_len = r.u8()? as usize;
        if scid_len > MAX_CID_LEN {
            return Err(TransportError::ProtocolViolation("scid too long"));
        }
        let scid = Cid::from_slice(r.bytes(scid_len)?);

        if version == 0 {
            // Version negotiation: the rest is a list of 32-bit versions.
            let mut versions = Vec::new();
            while r.remaining() >= 4 {
                versions.push(r.u32()?);
            }
            return Ok((
                PartialPacket {
                    long_type: None,
                    version,
                    dcid,
                    scid: Some(scid),
                    token: None,
                    retry: None,
                    versions: Some(versions),
                    packet: buf,
                    pn_offset: 0,
                },
                datagram.len(),
            ));
        }

        if first & FIXED_BIT == 0 {
            return Err(TransportError::ProtocolViolation("fixed bit clear"));
        }

        let long_type = LongType::from_bits(first >> 4);
        match long_type {
            LongType::Retry => {
                // Token runs to the last 16 bytes, which hold the tag.
                let rest = r.rest();
                if rest.len() < TAG_LEN {
                    return Err(TransportError::FrameEncodingError("retry too short"));
                }
                let (token, tag) = rest.split_at(rest.len() - TAG_LEN);
                return Ok((
                    PartialPacket {
                        long_type: Some(LongType::Retry),
                        version,
                        dcid,
                        scid: Some(scid),
                        token: None,
                        retry: Some((token, tag.try_into().unwrap())),
                        versions: None,
                        packet: buf,
                        pn_offset: 0,
                    },
                    datagram.len(),
                ));
            }
            LongType::Initial => {
                let token = r.varint_bytes()?;
                let length = r.varint()?;
                let pn_offset = r.offset();
                if length > r.remaining() as u64 {
                    return Err(TransportError::FrameEncodingError("packet length"));
                }
                let end = pn_offset + length as usize;
                Ok((
                    PartialPacket {
                        long_type: Some(long_type),
                        version,
                        dcid,
                        scid: Some(scid),
                        token: Some(token),
                        retry: None,
                        versions: None,
                        packet: &buf[..end],
                        pn_offset,
                    },
                    offset + end,
                ))
            }
            LongType::Handshake | LongType::ZeroRtt => {
                let length = r.varint()?;
                let pn_offset = r.offset();
                if length > r.remaining() as u64 {
                    return Err(TransportError::FrameEncodingError("packet length"));
                }
                let end = pn_offset + length as usize;
                Ok((
                    PartialPacket {
                        long_type: Some(long_type),
                        version,
                        dcid,
                        scid: Some(scid),
                        token: None,
                        retry: None,
                        versions: None,
                        packet: &buf[..end],
                        pn_offset,
                    },
                    offset + end,
                ))
            }
        }
    }

    pub fn is_long(&self) -> bool {
        self.long_type.is_some() || self.versions.is_some()
    }

    pub fn epoch(&self) -> Epoch {
        match self.long_type {
            Some(ty) => ty.epoch(),
            None => Epoch::AppData,
        }
    }

    /// Raw bytes of this packet (for stateless-reset token inspection).
    pub fn raw(&self) -> &'a [u8] {
        self.packet
    }

    /// Remove header protection: recover the first byte and the full packet
    /// number. The AEAD is not yet checked.
    pub fn unprotect(
        &self,
        hp: &dyn HeaderKey,
        largest_pn: Option<u64>,
    ) -> Result<Unprotected<'a>, TransportError> {
        let sample_start = self.pn_offset + SAMPLE_OFFSET;
        if self.packet.len() < sample_start + SAMPLE_LEN {
            return Err(TransportError::FrameEncodingError("packet too short to sample"));
        }
        let mask = hp.mask(&self.packet[sample_start..sample_start + SAMPLE_LEN]);

        let first_mask = if self.packet[0] & FORM_LONG != 0 { 0x0f } else { 0x1f };
        let first = self.packet[0] ^ (mask[0] & first_mask);
        let pn_len = (first & 0x03) as usize + 1;
        if self.packet.len() < self.pn_offset + pn_len + TAG_LEN {
            return Err(TransportError::FrameEncodingError("packet too short"));
        }

        let mut truncated: u64 = 0;
        let mut header = self.packet[..self.pn_offset + pn_len].to_vec();
        header[0] = first;
        for i in 0..pn_len {
            let byte = self.packet[self.pn_offset + i] ^ mask[1 + i];
            header[self.pn_offset + i] = byte;
            truncated = truncated << 8 | byte as u64;
        }

        let expected = largest_pn.map(|pn| pn + 1).unwrap_or(0);
        let pn = decode_packet_number(truncated, (pn_len * 8) as u32, expected);

        Ok(Unprotected {
            first,
            pn,
            header,
            ciphertext: &self.packet[self.pn_offset + pn_len..],
        })
    }
}

/// A packet with header protection removed, ready to open.
pub struct Unprotected<'a> {
    pub first: u8,
    pub pn: u64,
    header: Vec<u8>,
    ciphertext: &'a [u8],
}

impl Unprotected<'_> {
    pub fn key_phase(&self) -> bool {
        self.first & KEY_PHASE_BIT != 0
    }

    pub fn spin(&self) -> bool {
        self.first & SPIN_BIT != 0
    }

    /// AEAD-open the payload. Reserved header bits are validated only after
    /// a successful open, since before that they are unauthenticated.
    pub fn open(&self, key: &dyn PacketKey) -> Result<Vec<u8>, TransportError> {
        let mut payload = self.ciphertext.to_vec();
        key.open(self.pn, &self.header, &mut payload)?;
        let reserved =
            if self.first & FORM_LONG != 0 { LONG_RESERVED } else { SHORT_RESERVED };
        if self.first & reserved != 0 {
            return Err(TransportError::ProtocolViolation("reserved header bits set"));
        }
        Ok(payload)
    }
}

/// Reconstruct a full PN from its truncated form (RFC 9000 §A.3).
pub fn decode_packet_number(truncated: u64, bits: u32, expected: u64) -> u64 {
    let win = 1u64 << bits;
    let hwin = win / 2;
    let mask = win - 1;
    let candidate = (expected & !mask) | truncated;
    if candidate + hwin <= expected && candidate + win < (1 << 62) {
        candidate + win
    } else if candidate > expected + hwin && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

/// Smallest encoding that any receiver whose largest-acked is at least
/// `largest_acked` will decode back to `pn`.
pub fn packet_number_len(pn: u64, largest_acked: Option<u64>) -> usize {
    let in_flight = match largest_acked {
        Some(acked) => pn.saturating_sub(acked),
        None => pn + 1,
    };
    if in_flight < 1 << 7 {
        1
    } else if in_flight < 1 << 15 {
        2
    } else if in_flight < 1 << 23 {
        3
    } else {
        4
    }
}

// =============================================================================
// ENCODE (builder stage)
// =============================================================================

/// What kind of packet the builder is emitting.
#[derive(Debug, Clone)]
pub enum HeaderForm<'a> {
    Initial { version: u32, dcid: &'a Cid, scid: &'a Cid, token: &'a [u8] },
    Handshake { version: u32, dcid: &'a Cid, scid: &'a Cid },
    ZeroRtt { version: u32, dcid: &'a Cid, scid: &'a Cid },
    Short { dcid: &'a Cid, spin: bool, key_phase: bool },
}

impl HeaderForm<'_> {
    pub fn epoch(&self) -> Epoch {
        match self {
            HeaderForm::Initial { .. } => Epoch::Initial,
            HeaderForm::Handshake { .. } => Epoch::Handshake,
            HeaderForm::ZeroRtt { .. } | HeaderForm::Short { .. } => Epoch::AppData,
        }
    }

    /// Header size on the wire, excluding the PN field. Long headers assume
    /// a 2-byte Length encoding, which `encode` always uses.
    pub fn size(&self) -> usize {
        match self {
            HeaderForm::Initial { dcid, scid, token, .. } => {
                7 + dcid.len() + scid.len() + varint::size(token.len() as u64) + token.len() + 2
            }
            HeaderForm::Handshake { dcid, scid, .. } | HeaderForm::ZeroRtt { dcid, scid, .. } => {
                7 + dcid.len() + scid.len() + 2
            }
            HeaderForm::Short { dcid, .. } => 1 + dcid.len(),
        }
    }

    /// Append the header with `pn` encoded in `pn_len` bytes. For long
    /// headers `payload_len` is the PN + ciphertext + tag length that goes
    /// into the Length field. Returns the PN field's offset within `out`.
    pub fn encode(&self, out: &mut Vec<u8>, pn: u64, pn_len: usize, payload_len: usize) -> usize {
        let pn_bits = (pn_len - 1) as u8;
        match self {
            HeaderForm::Initial { version, dcid, scid, token } => {
                out.push(FORM_LONG | FIXED_BIT | LongType::Initial.bits() << 4 | pn_bits);
                encode_long_common(out, *version, dcid, scid);
                varint::write(out, token.len() as u64);
                out.extend_from_slice(token);
                write_len2(out, payload_len);
            }
            HeaderForm::Handshake { version, dcid, scid } => {
                out.push(FORM_LONG | FIXED_BIT | LongType::Handshake.bits() << 4 | pn_bits);
                encode_long_common(out, *version, dcid, scid);
                write_len2(out, payload_len);
            }
            HeaderForm::ZeroRtt { version, dcid, scid } => {
                out.push(FORM_LONG | FIXED_BIT | LongType::ZeroRtt.bits() << 4 | pn_bits);
                encode_long_common(out, *version, dcid, scid);
                write_len2(out, payload_len);
            }
            HeaderForm::Short { dcid, spin, key_phase } => {
                let mut first = FIXED_BIT | pn_bits;
                if *spin {
                    first |= SPIN_BIT;
                }
                if *key_phase {
                    first |= KEY_PHASE_BIT;
                }
                out.push(first);
                out.extend_from_slice(dcid.as_slice());
            }
        }
        let pn_offset = out.len();
        for i in (0..pn_len).rev() {
            out.push((pn >> (8 * i)) as u8);
        }
        pn_offset
    }
}

fn encode_long_common(out: &mut Vec<u8>, version: u32, dcid: &Cid, scid: &Cid) {
    out.extend_from_slice(&version.to_be_bytes());
    out.push(dcid.len() as u8);
    out.extend_from_slice(dcid.as_slice());
    out.push(scid.len() as u8);
    out.extend_from_slice(scid.as_slice());
}

// Length always uses the 2-byte varint form so the header size is known
// before the payload is final.
fn write_len2(out: &mut Vec<u8>, len: usize) {
    debug_assert!(len < 1 << 14);
    out.extend_from_slice(&(len as u16 | 0x4000).to_be_bytes());
}

/// Apply header protection to a sealed packet in `buf` starting at
/// `packet_start`.
pub fn protect(
    buf: &mut [u8],
    packet_start: usize,
    pn_offset: usize,
    pn_len: usize,
    hp: &dyn HeaderKey,
) {
    let sample_start = pn_offset + SAMPLE_OFFSET;
    let mask = hp.mask(&buf[sample_start..sample_start + SAMPLE_LEN]);
    let first_mask = if buf[packet_start] & FORM_LONG != 0 { 0x0f } else { 0x1f };
    buf[packet_start] ^= mask[0] & first_mask;
    for i in 0..pn_len {
        buf[pn_offset + i] ^= mask[1 + i];
    }
}

// =============================================================================
// STATELESS PACKETS
// =============================================================================

/// Version negotiation response: version field zero, CIDs echoed swapped,
/// then the version list (callers append a grease entry).
pub fn encode_version_negotiation(dcid: &Cid, scid: &Cid, versions: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + dcid.len() + scid.len() + versions.len() * 4);
    out.push(FORM_LONG | (rand::random::<u8>() & 0x3f));
    out.extend_from_slice(&0u32.to_be_bytes());
    out.push(dcid.len() as u8);
    out.extend_from_slice(dcid.as_slice());
    out.push(scid.len() as u8);
    out.extend_from_slice(scid.as_slice());
    for v in versions {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out
}

/// Integrity tag binding a Retry packet to the Initial it answers.
pub fn retry_tag(original_dcid: &Cid, retry_without_tag: &[u8]) -> [u8; TAG_LEN] {
    let mut hasher = Sha3_256::new();
    hasher.update([original_dcid.len() as u8]);
    hasher.update(original_dcid.as_slice());
    hasher.update(retry_without_tag);
    let digest = hasher.finalize();
    digest[..TAG_LEN].try_into().unwrap()
}

/// Retry packet carrying a fresh token. `dcid` is the client's source CID,
/// `scid` the CID the client must target next.
pub fn encode_retry(dcid: &Cid, scid: &Cid, original_dcid: &Cid, token: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + dcid.len() + scid.len() + token.len() + TAG_LEN);
    out.push(FORM_LONG | FIXED_BIT | LongType::Retry.bits() << 4);
    encode_long_common(&mut out, QUIC_VERSION_1, dcid, scid);
    out.extend_from_slice(token);
    let tag = retry_tag(original_dcid, &out);
    out.extend_from_slice(&tag);
    out
}

/// Stateless reset: looks like a short packet full of random bytes, ending
/// in the reset token for the targeted CID.
pub fn encode_stateless_reset(token: [u8; RESET_TOKEN_LEN], min_len: usize) -> Vec<u8> {
    let pad = min_len.max(5 + RESET_TOKEN_LEN) - RESET_TOKEN_LEN;
    let mut out = vec![0u8; pad];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut out[..]);
    out[0] = (out[0] & 0x3f) | FIXED_BIT;
    out.extend_from_slice(&token);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EpochKeys;

    #[test]
    fn pn_decode_rfc_example() {
        // RFC 9000 §A.3: expected 0xa82f30ea, 16-bit truncated 0x9b32.
        assert_eq!(decode_packet_number(0x9b32, 16, 0xa82f30ea), 0xa82f9b32);
    }

    #[test]
    fn pn_len_grows_with_distance() {
        assert_eq!(packet_number_len(0, None), 1);
        assert_eq!(packet_number_len(200, Some(150)), 1);
        assert_eq!(packet_number_len(70_000, Some(100)), 3);
        assert_eq!(packet_number_len(1 << 30, None), 4);
    }

    fn seal_roundtrip(form: HeaderForm<'_>, pn: u64, largest: Option<u64>) {
        let keys = EpochKeys::from_secrets(b"tx", b"rx");
        let peer = EpochKeys::from_secrets(b"rx", b"tx");

        let payload = b"frame bytes frame bytes frame bytes".to_vec();
        let pn_len = packet_number_len(pn, largest);
        let mut out = Vec::new();
        let pn_offset = form.encode(&mut out, pn, pn_len, pn_len + payload.len() + TAG_LEN);
        let header_end = out.len();
        let mut body = payload.clone();
        keys.local.packet.seal(pn, &out[..header_end], &mut body).unwrap();
        out.extend_from_slice(&body);
        protect(&mut out, 0, pn_offset, pn_len, keys.local.header.as_ref());

        let local_cid_len = match &form {
            HeaderForm::Short { dcid, .. } => dcid.len(),
            _ => 0,
        };
        let (partial, next) = PartialPacket::decode(&out, 0, local_cid_len).unwrap();
        assert_eq!(next, out.len());
        let un = partial.unprotect(peer.remote.header.as_ref(), largest).unwrap();
        assert_eq!(un.pn, pn);
        let opened = un.open(peer.remote.packet.as_ref()).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn initial_roundtrip() {
        let dcid = Cid::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let scid = Cid::from_slice(&[9, 10, 11, 12]);
        seal_roundtrip(
            HeaderForm::Initial { version: QUIC_VERSION_1, dcid: &dcid, scid: &scid, token: b"tok" },
            0,
            None,
        );
    }

    #[test]
    fn short_roundtrip_with_high_pn() {
        let dcid = Cid::from_slice(&[7; 8]);
        seal_roundtrip(
            HeaderForm::Short { dcid: &dcid, spin: true, key_phase: true },
            100_000,
            Some(99_990),
        );
    }

    #[test]
    fn coalesced_packets_split() {
        let dcid = Cid::from_slice(&[1; 8]);
        let scid = Cid::from_slice(&[2; 8]);
        let keys = EpochKeys::from_secrets(b"a", b"b");

        let mut datagram = Vec::new();
        for _ in 0..2 {
            let payload = vec![0x01; 32]; // PING + padding
            let mut out = Vec::new();
            let form =
                HeaderForm::Handshake { version: QUIC_VERSION_1, dcid: &dcid, scid: &scid };
            let pn_offset = form.encode(&mut out, 0, 1, 1 + payload.len() + TAG_LEN);
            let header_end = out.len();
            let mut body = payload;
            keys.local.packet.seal(0, &out[..header_end], &mut body).unwrap();
            out.extend_from_slice(&body);
            protect(&mut out, 0, pn_offset, 1, keys.local.header.as_ref());
            datagram.extend_from_slice(&out);
        }

        let (first, next) = PartialPacket::decode(&datagram, 0, 8).unwrap();
        assert_eq!(first.long_type, Some(LongType::Handshake));
        assert!(next < datagram.len());
        let (second, end) = PartialPacket::decode(&datagram, next, 8).unwrap();
        assert_eq!(second.long_type, Some(LongType::Handshake));
        assert_eq!(end, datagram.len());
    }

    #[test]
    fn version_negotiation_parses() {
        let dcid = Cid::from_slice(&[1; 8]);
        let scid = Cid::from_slice(&[2; 8]);
        let vn = encode_version_negotiation(&dcid, &scid, &[QUIC_VERSION_1, 0x1a2a3a4a]);
        let (partial, _) = PartialPacket::decode(&vn, 0, 8).unwrap();
        assert_eq!(partial.versions, Some(vec![QUIC_VERSION_1, 0x1a2a3a4a]));
    }

    #[test]
    fn retry_tag_validates() {
        let odcid = Cid::from_slice(&[1, 2, 3, 4]);
        let dcid = Cid::from_slice(&[5; 8]);
        let scid = Cid::from_slice(&[6; 8]);
        let retry = encode_retry(&dcid, &scid, &odcid, b"token");
        let (partial, _) = PartialPacket::decode(&retry, 0, 8).unwrap();
        let (token, tag) = partial.retry.unwrap();
        assert_eq!(token, b"token");
        assert_eq!(tag, retry_tag(&odcid, &retry[..retry.len() - TAG_LEN]));
        // A different original DCID fails the check.
        assert_ne!(tag, retry_tag(&dcid, &retry[..retry.len() - TAG_LEN]));
    }

    #[test]
    fn stateless_reset_shape() {
        let reset = encode_stateless_reset([9; RESET_TOKEN_LEN], 40);
        assert!(reset.len() >= 40);
        assert_eq!(reset[0] & FORM_LONG, 0);
        assert_eq!(reset[0] & FIXED_BIT, FIXED_BIT);
        assert_eq!(&reset[reset.len() - RESET_TOKEN_LEN..], &[9; RESET_TOKEN_LEN]);
    }
}
