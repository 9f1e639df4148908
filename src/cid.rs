//! Connection IDs and the per-connection source/destination CID lists.

use crate::error::TransportError;
use crate::frame::Frame;
use crate::types::{CID_PARTITION_INDEX, LOCAL_CID_LEN, MAX_CID_LEN, RESET_TOKEN_LEN};
use rand::RngCore;
use std::fmt;

/// An opaque 0–20 byte connection ID, stored inline.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cid {
    len: u8,
    bytes: [u8; MAX_CID_LEN],
}

impl Cid {
    pub const EMPTY: Cid = Cid { len: 0, bytes: [0; MAX_CID_LEN] };

    /// Panics if `slice` exceeds [`MAX_CID_LEN`]; wire decoders validate the
    /// length before calling.
    pub fn from_slice(slice: &[u8]) -> Self {
        assert!(slice.len() <= MAX_CID_LEN);
        let mut bytes = [0; MAX_CID_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Cid { len: slice.len() as u8, bytes }
    }

    /// A fresh random CID with the worker partition ID embedded at
    /// [`CID_PARTITION_INDEX`], so the binding can route packets for this
    /// connection to one worker without a table lookup.
    pub fn random_local(partition: u8) -> Self {
        let mut bytes = [0; MAX_CID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes[..LOCAL_CID_LEN]);
        bytes[CID_PARTITION_INDEX] = partition;
        Cid { len: LOCAL_CID_LEN as u8, bytes }
    }

    pub fn random(len: usize) -> Self {
        assert!(len <= MAX_CID_LEN);
        let mut bytes = [0; MAX_CID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes[..len]);
        Cid { len: len as u8, bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn partition(&self) -> u8 {
        if self.len() > CID_PARTITION_INDEX { self.bytes[CID_PARTITION_INDEX] } else { 0 }
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid:{}", hex::encode(self.as_slice()))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One CID we issued to the peer.
#[derive(Debug, Clone)]
pub struct SourceCid {
    pub sequence: u64,
    pub cid: Cid,
    pub reset_token: [u8; RESET_TOKEN_LEN],
    /// Set once the peer sends RETIRE_CONNECTION_ID for this sequence.
    pub retired: bool,
    /// Registered in the binding lookup; cleared on retirement.
    pub in_lookup: bool,
}

/// CIDs we have issued, keyed by sequence number.
#[derive(Debug, Default)]
pub struct SourceCidList {
    entries: Vec<SourceCid>,
    next_sequence: u64,
    pub retire_prior_to: u64,
}

impl SourceCidList {
    /// Record a newly issued CID. Sequence numbers are assigned in order.
    pub fn push(&mut self, cid: Cid, reset_token: [u8; RESET_TOKEN_LEN]) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(SourceCid { sequence, cid, reset_token, retired: false, in_lookup: true });
        sequence
    }

    /// Peer retired `sequence`. Returns the retired CID so the caller can
    /// drop it from the binding lookup. A sequence we never issued is a
    /// protocol violation; retiring the CID the frame itself arrived on is
    /// checked by the caller.
    pub fn retire(&mut self, sequence: u64) -> Result<Option<Cid>, TransportError> {
        if sequence >= self.next_sequence {
            return Err(TransportError::ProtocolViolation("retire of unissued cid"));
        }
        for entry in &mut self.entries {
            if entry.sequence == sequence {
                if entry.retired {
                    return Ok(None);
                }
                entry.retired = true;
                entry.in_lookup = false;
                return Ok(Some(entry.cid));
            }
        }
        Ok(None)
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.retired).count()
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.entries.iter().any(|e| !e.retired && e.cid == *cid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceCid> {
        self.entries.iter()
    }

    /// Sequence the next issued CID will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

/// One CID the peer issued to us.
#[derive(Debug, Clone)]
pub struct DestCid {
    pub sequence: u64,
    pub cid: Cid,
    pub reset_token: Option<[u8; RESET_TOKEN_LEN]>,
    /// A path is currently sending with this CID.
    pub in_use: bool,
}

/// Peer-issued CIDs, keyed by sequence number, with the peer's
/// retire-prior-to watermark applied locally.
#[derive(Debug, Default)]
pub struct DestCidList {
    entries: Vec<DestCid>,
    retire_prior_to: u64,
    /// RETIRE_CONNECTION_ID frames waiting to be sent.
    pub pending_retirement: Vec<u64>,
}

impl DestCidList {
    /// Seed with the handshake-time CID (sequence 0, or the preferred-address
    /// CID at sequence 1).
    pub fn seed(&mut self, sequence: u64, cid: Cid, reset_token: Option<[u8; RESET_TOKEN_LEN]>) {
        self.entries.push(DestCid { sequence, cid, reset_token, in_use: sequence == 0 });
    }

    /// Update sequence 0 in place: until the handshake fixes the server's
    /// CID, each server long header may carry a new source CID.
    pub fn update_initial(&mut self, cid: Cid) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == 0) {
            entry.cid = cid;
        }
    }

    pub fn set_reset_token(&mut self, sequence: u64, token: [u8; RESET_TOKEN_LEN]) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == sequence) {
            entry.reset_token = Some(token);
        }
    }

    /// Apply a NEW_CONNECTION_ID frame. Enforces the negotiated
    /// active_connection_id_limit and frame consistency rules, and returns
    /// retirement frames queued by an advancing watermark.
    pub fn on_new_cid(
        &mut self,
        sequence: u64,
        retire_prior_to: u64,
        cid: Cid,
        reset_token: [u8; RESET_TOKEN_LEN],
        active_cid_limit: u64,
    ) -> Result<(), TransportError> {
        if let Some(existing) = self.entries.iter().find(|e| e.sequence == sequence) {
            if existing.cid != cid || existing.reset_token != Some(reset_token) {
                return Err(TransportError::ProtocolViolation("NEW_CONNECTION_ID content changed"));
            }
            return Ok(()); // retransmitted frame
        }

        if sequence < self.retire_prior_to {
            // Already retired by a previously received watermark.
            self.pending_retirement.push(sequence);
            return Ok(());
        }

        self.entries.push(DestCid { sequence, cid, reset_token: Some(reset_token), in_use: false });

        if retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = retire_prior_to;
            for entry in &mut self.entries {
                if entry.sequence < retire_prior_to {
                    entry.in_use = false;
                    self.pending_retirement.push(entry.sequence);
                }
            }
            self.entries.retain(|e| e.sequence >= retire_prior_to);
        }

        if self.entries.len() as u64 > active_cid_limit {
            return Err(TransportError::ConnectionIdLimitError);
        }
        Ok(())
    }

    /// The CID the active path should use.
    pub fn active(&self) -> Option<&DestCid> {
        self.entries.iter().find(|e| e.in_use).or_else(|| self.entries.first())
    }

    /// Claim an unused CID for a new path, per RFC 9000 §9.5's requirement
    /// not to reuse CIDs across paths. Falls back to the active CID when the
    /// peer has issued no spares (e.g. zero-length CIDs).
    pub fn claim_for_path(&mut self) -> Option<Cid> {
        if let Some(entry) = self.entries.iter_mut().find(|e| !e.in_use) {
            entry.in_use = true;
            return Some(entry.cid);
        }
        self.entries.first().map(|e| e.cid)
    }

    pub fn mark_in_use(&mut self, cid: &Cid) {
        for entry in &mut self.entries {
            if entry.cid == *cid {
                entry.in_use = true;
            }
        }
    }

    /// Reset tokens that identify a stateless reset aimed at us.
    pub fn reset_tokens(&self) -> impl Iterator<Item = &[u8; RESET_TOKEN_LEN]> {
        self.entries.iter().filter_map(|e| e.reset_token.as_ref())
    }

    /// Drain queued retirements into RETIRE_CONNECTION_ID frames.
    pub fn take_retirements(&mut self) -> Vec<Frame> {
        self.pending_retirement
            .drain(..)
            .map(|sequence| Frame::RetireConnectionId { sequence })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_byte_embedded() {
        let cid = Cid::random_local(7);
        assert_eq!(cid.len(), LOCAL_CID_LEN);
        assert_eq!(cid.partition(), 7);
    }

    #[test]
    fn dest_list_enforces_limit() {
        let mut list = DestCidList::default();
        list.seed(0, Cid::random(8), None);
        assert!(list.on_new_cid(1, 0, Cid::random(8), [0; 16], 2).is_ok());
        assert_eq!(
            list.on_new_cid(2, 0, Cid::random(8), [0; 16], 2),
            Err(TransportError::ConnectionIdLimitError)
        );
    }

    #[test]
    fn dest_list_watermark_retires() {
        let mut list = DestCidList::default();
        list.seed(0, Cid::random(8), None);
        list.on_new_cid(1, 0, Cid::random(8), [1; 16], 4).unwrap();
        // Watermark 2 retires sequences 0 and 1.
        list.on_new_cid(2, 2, Cid::random(8), [2; 16], 4).unwrap();
        let frames = list.take_retirements();
        assert_eq!(frames.len(), 2);
        assert_eq!(list.len(), 1);
        assert_eq!(list.active().unwrap().sequence, 2);
    }

    #[test]
    fn dest_list_rejects_mutation() {
        let mut list = DestCidList::default();
        list.seed(0, Cid::random(8), None);
        let cid = Cid::random(8);
        list.on_new_cid(1, 0, cid, [1; 16], 4).unwrap();
        // Same sequence, different token.
        assert!(list.on_new_cid(1, 0, cid, [9; 16], 4).is_err());
        // Exact retransmit is fine.
        assert!(list.on_new_cid(1, 0, cid, [1; 16], 4).is_ok());
    }

    #[test]
    fn source_list_retirement() {
        let mut list = SourceCidList::default();
        let seq = list.push(Cid::random_local(0), [3; 16]);
        assert_eq!(list.active_count(), 1);
        assert!(list.retire(seq + 1).is_err());
        let retired = list.retire(seq).unwrap();
        assert!(retired.is_some());
        assert_eq!(list.active_count(), 0);
        // Idempotent.
        assert!(list.retire(seq).unwrap().is_none());
    }
}
