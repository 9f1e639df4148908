//! Packet-protection key interfaces, the built-in ChaCha20-Poly1305
//! provider, retry-token sealing and stateless-reset token derivation.
//!
//! RFC 9001 interop crypto (HKDF-label schedules, AES header protection) is
//! the business of the external TLS collaborator: it hands this crate opaque
//! key objects through [`crate::tls::TlsSession`]. The built-in provider
//! implements the same traits over ChaCha20-Poly1305 with a SHA3-keyed
//! header mask, which is what the in-memory test endpoints use on both
//! sides.

use crate::cid::Cid;
use crate::error::TransportError;
use crate::types::{RESET_TOKEN_LEN, TAG_LEN};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha3::{Digest, Sha3_256};

/// Masks the first byte and packet-number bytes of a header.
pub trait HeaderKey: Send {
    /// 5-byte mask from a 16-byte ciphertext sample.
    fn mask(&self, sample: &[u8]) -> [u8; 5];
}

/// Seals and opens packet payloads.
pub trait PacketKey: Send {
    /// Encrypt `payload` in place, appending the tag. `header` is the
    /// associated data, `pn` the full packet number.
    fn seal(&self, pn: u64, header: &[u8], payload: &mut Vec<u8>) -> Result<(), TransportError>;

    /// Decrypt `payload` (with trailing tag) in place, truncating the tag.
    fn open(&self, pn: u64, header: &[u8], payload: &mut Vec<u8>) -> Result<(), TransportError>;

    fn tag_len(&self) -> usize;

    /// Derive the key for the next key phase.
    fn next(&self) -> Box<dyn PacketKey>;
}

/// Directional key pair for one encryption level.
pub struct KeySet {
    pub header: Box<dyn HeaderKey>,
    pub packet: Box<dyn PacketKey>,
}

/// Send and receive keys for one epoch.
pub struct EpochKeys {
    pub local: KeySet,
    pub remote: KeySet,
}

// =============================================================================
// BUILT-IN PROVIDER
// =============================================================================

fn derive(secret: &[u8], label: &str) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(secret);
    hasher.update(label.as_bytes());
    hasher.finalize().into()
}

/// ChaCha20-Poly1305 packet key with a per-packet nonce of IV XOR PN.
pub struct ChaChaPacketKey {
    cipher: ChaCha20Poly1305,
    iv: [u8; 12],
    secret: [u8; 32],
}

impl ChaChaPacketKey {
    pub fn new(secret: &[u8]) -> Self {
        let key = derive(secret, "key");
        let iv_full = derive(secret, "iv");
        let mut iv = [0u8; 12];
        iv.copy_from_slice(&iv_full[..12]);
        ChaChaPacketKey {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            iv,
            secret: derive(secret, "store"),
        }
    }

    fn nonce(&self, pn: u64) -> Nonce {
        let mut nonce = self.iv;
        for (i, byte) in pn.to_be_bytes().iter().enumerate() {
            nonce[4 + i] ^= byte;
        }
        Nonce::from(nonce)
    }
}

impl PacketKey for ChaChaPacketKey {
    fn seal(&self, pn: u64, header: &[u8], payload: &mut Vec<u8>) -> Result<(), TransportError> {
        let sealed = self
            .cipher
            .encrypt(&self.nonce(pn), Payload { msg: payload, aad: header })
            .map_err(|_| TransportError::InternalError("aead seal"))?;
        *payload = sealed;
        Ok(())
    }

    fn open(&self, pn: u64, header: &[u8], payload: &mut Vec<u8>) -> Result<(), TransportError> {
        let opened = self
            .cipher
            .decrypt(&self.nonce(pn), Payload { msg: payload, aad: header })
            .map_err(|_| TransportError::CryptoError(0))?;
        *payload = opened;
        Ok(())
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    fn next(&self) -> Box<dyn PacketKey> {
        Box::new(ChaChaPacketKey::new(&derive(&self.secret, "ku")))
    }
}

/// Header mask keyed by SHA3 over (hp_key, sample).
pub struct Sha3HeaderKey {
    key: [u8; 32],
}

impl Sha3HeaderKey {
    pub fn new(secret: &[u8]) -> Self {
        Sha3HeaderKey { key: derive(secret, "hp") }
    }
}

impl HeaderKey for Sha3HeaderKey {
    fn mask(&self, sample: &[u8]) -> [u8; 5] {
        let mut hasher = Sha3_256::new();
        hasher.update(self.key);
        hasher.update(sample);
        let digest = hasher.finalize();
        digest[..5].try_into().unwrap()
    }
}

impl KeySet {
    /// Derive a full key set from one secret, as the built-in provider and
    /// the stub TLS engine do.
    pub fn from_secret(secret: &[u8]) -> Self {
        KeySet {
            header: Box::new(Sha3HeaderKey::new(secret)),
            packet: Box::new(ChaChaPacketKey::new(secret)),
        }
    }
}

impl EpochKeys {
    pub fn from_secrets(local: &[u8], remote: &[u8]) -> Self {
        EpochKeys { local: KeySet::from_secret(local), remote: KeySet::from_secret(remote) }
    }

    /// Initial keys are derived from the client's first destination CID, so
    /// both sides can compute them before any negotiation.
    pub fn initial(dcid: &Cid, is_client: bool) -> Self {
        let client_secret = derive(dcid.as_slice(), "client in");
        let server_secret = derive(dcid.as_slice(), "server in");
        if is_client {
            EpochKeys::from_secrets(&client_secret, &server_secret)
        } else {
            EpochKeys::from_secrets(&server_secret, &client_secret)
        }
    }
}

// =============================================================================
// RETRY TOKENS
// =============================================================================

/// Distinguishes tokens minted by Retry packets from NEW_TOKEN tokens; the
/// latter prove only a prior connection, not a fresh round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Retry,
    NewToken,
}

/// Library-wide retry key with explicit lifecycle. Rotation keeps the
/// previous key valid for tokens already in flight.
pub struct RetryKeys {
    current: [u8; 32],
    previous: Option<[u8; 32]>,
}

impl RetryKeys {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut key);
        RetryKeys { current: key, previous: None }
    }

    pub fn rotate(&mut self) {
        let mut key = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut key);
        self.previous = Some(std::mem::replace(&mut self.current, key));
    }

    /// Immutable snapshot taken at operation start.
    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot { current: self.current, previous: self.previous }
    }
}

impl Default for RetryKeys {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
pub struct RetrySnapshot {
    current: [u8; 32],
    previous: Option<[u8; 32]>,
}

/// Plaintext contents of a retry token: what the server must recover to
/// accept a returning Initial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTokenBody {
    pub kind: TokenKind,
    /// Canonical peer address bytes (ip + port).
    pub peer: Vec<u8>,
    /// The DCID from the client's first Initial, echoed back in transport
    /// parameters as original_destination_connection_id.
    pub original_dcid: Cid,
}

fn token_nonce(new_dcid: &Cid) -> Nonce {
    // IV derived from the destination CID the client will use next.
    let digest = derive(new_dcid.as_slice(), "retry iv");
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    Nonce::from(nonce)
}

impl RetrySnapshot {
    /// Seal `{peer, original_dcid}` under the retry key, IV bound to the
    /// CID the client must use on its next Initial.
    pub fn seal(&self, body: &RetryTokenBody, new_dcid: &Cid) -> Vec<u8> {
        let mut plain = Vec::with_capacity(3 + body.peer.len() + body.original_dcid.len());
        plain.push(match body.kind {
            TokenKind::Retry => 1u8,
            TokenKind::NewToken => 2u8,
        });
        plain.push(body.peer.len() as u8);
        plain.extend_from_slice(&body.peer);
        plain.push(body.original_dcid.len() as u8);
        plain.extend_from_slice(body.original_dcid.as_slice());

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.current));
        cipher
            .encrypt(&token_nonce(new_dcid), plain.as_slice())
            .expect("retry token seal")
    }

    /// Open a token from an Initial whose DCID is `dcid`. Tries the current
    /// key, then the previous one if a rotation happened recently.
    pub fn open(&self, token: &[u8], dcid: &Cid) -> Result<RetryTokenBody, TransportError> {
        let nonce = token_nonce(dcid);
        let keys = std::iter::once(&self.current).chain(self.previous.iter());
        for key in keys {
            let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
            if let Ok(plain) = cipher.decrypt(&nonce, token.as_ref()) {
                return Self::parse_body(&plain);
            }
        }
        Err(TransportError::InvalidToken)
    }

    fn parse_body(plain: &[u8]) -> Result<RetryTokenBody, TransportError> {
        let mut r = crate::varint::Reader::new(plain);
        let kind = match r.u8().map_err(|_| TransportError::InvalidToken)? {
            1 => TokenKind::Retry,
            2 => TokenKind::NewToken,
            _ => return Err(TransportError::InvalidToken),
        };
        let peer_len = r.u8().map_err(|_| TransportError::InvalidToken)? as usize;
        let peer = r.bytes(peer_len).map_err(|_| TransportError::InvalidToken)?.to_vec();
        let cid_len = r.u8().map_err(|_| TransportError::InvalidToken)? as usize;
        if cid_len > crate::types::MAX_CID_LEN {
            return Err(TransportError::InvalidToken);
        }
        let cid = r.bytes(cid_len).map_err(|_| TransportError::InvalidToken)?;
        Ok(RetryTokenBody { kind, peer, original_dcid: Cid::from_slice(cid) })
    }
}

// =============================================================================
// STATELESS RESET TOKENS
// =============================================================================

/// Per-binding HMAC key for stateless reset tokens: token = keyed SHA3 of
/// the CID, truncated to 16 bytes. Deterministic, so a restarted binding
/// can still reset connections it no longer remembers.
#[derive(Clone)]
pub struct ResetTokenKey {
    key: [u8; 32],
}

impl ResetTokenKey {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut key);
        ResetTokenKey { key }
    }

    pub fn token_for(&self, cid: &Cid) -> [u8; RESET_TOKEN_LEN] {
        let mut hasher = Sha3_256::new();
        hasher.update(self.key);
        hasher.update(cid.as_slice());
        let digest = hasher.finalize();
        digest[..RESET_TOKEN_LEN].try_into().unwrap()
    }
}

impl Default for ResetTokenKey {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let keys = EpochKeys::from_secrets(b"local secret", b"remote secret");
        let header = b"header bytes";
        let mut payload = b"payload".to_vec();
        keys.local.packet.seal(42, header, &mut payload).unwrap();
        assert_eq!(payload.len(), 7 + TAG_LEN);

        // The peer's remote keys mirror our local keys.
        let peer = EpochKeys::from_secrets(b"remote secret", b"local secret");
        peer.remote.packet.open(42, header, &mut payload).unwrap();
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn open_rejects_wrong_pn_or_aad() {
        let keys = EpochKeys::from_secrets(b"s1", b"s2");
        let mut payload = b"data".to_vec();
        keys.local.packet.seal(7, b"hdr", &mut payload).unwrap();

        let mut tampered = payload.clone();
        assert!(keys.local.packet.open(8, b"hdr", &mut tampered).is_err());
        let mut tampered = payload.clone();
        assert!(keys.local.packet.open(7, b"other", &mut tampered).is_err());
    }

    #[test]
    fn key_update_chain_differs() {
        let key = ChaChaPacketKey::new(b"secret");
        let next = key.next();
        let mut a = b"x".to_vec();
        let mut b = b"x".to_vec();
        key.seal(0, b"", &mut a).unwrap();
        next.seal(0, b"", &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn retry_token_roundtrip() {
        let keys = RetryKeys::new();
        let snap = keys.snapshot();
        let body = RetryTokenBody {
            kind: TokenKind::Retry,
            peer: vec![127, 0, 0, 1, 0x12, 0x34],
            original_dcid: Cid::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]),
        };
        let new_dcid = Cid::from_slice(&[9; 8]);
        let token = snap.seal(&body, &new_dcid);
        assert_eq!(snap.open(&token, &new_dcid).unwrap(), body);

        // Wrong DCID → wrong IV → invalid.
        assert!(snap.open(&token, &Cid::from_slice(&[8; 8])).is_err());
    }

    #[test]
    fn retry_token_survives_one_rotation() {
        let mut keys = RetryKeys::new();
        let body = RetryTokenBody {
            kind: TokenKind::Retry,
            peer: vec![10, 0, 0, 1],
            original_dcid: Cid::from_slice(&[5; 8]),
        };
        let dcid = Cid::from_slice(&[6; 8]);
        let token = keys.snapshot().seal(&body, &dcid);
        keys.rotate();
        assert!(keys.snapshot().open(&token, &dcid).is_ok());
        keys.rotate();
        assert!(keys.snapshot().open(&token, &dcid).is_err());
    }

    #[test]
    fn reset_tokens_deterministic() {
        let key = ResetTokenKey::new();
        let cid = Cid::from_slice(&[1, 2, 3]);
        assert_eq!(key.token_for(&cid), key.token_for(&cid));
        assert_ne!(key.token_for(&cid), key.token_for(&Cid::from_slice(&[1, 2, 4])));
    }
}
