//! Packet assembly: turning queued frames into sealed, coalesced UDP
//! datagrams, under the send allowance and pacing budget.

use crate::crypto::KeySet;
use crate::frame::Frame;
use crate::loss::SentFrame;
use crate::packet::{self, HeaderForm, packet_number_len};
use crate::types::Epoch;
use std::time::Instant;

/// One packet recorded while building a datagram; feeds the sent ledger.
#[derive(Debug)]
pub struct BuiltPacket {
    pub epoch: Epoch,
    pub pn: u64,
    /// Wire bytes of this packet alone.
    pub bytes: u64,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    pub frames: Vec<SentFrame>,
}

/// Assembles one UDP datagram, coalescing packets across epochs.
pub struct DatagramBuilder {
    buf: Vec<u8>,
    budget: usize,
    pub packets: Vec<BuiltPacket>,
}

impl DatagramBuilder {
    pub fn new(budget: usize) -> Self {
        DatagramBuilder { buf: Vec::with_capacity(budget), budget, packets: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Bytes left for another coalesced packet.
    pub fn remaining(&self) -> usize {
        self.budget - self.buf.len()
    }

    /// Space available for frame payload in a packet with this header,
    /// after the PN, the AEAD tag, and what the datagram already holds.
    pub fn payload_budget(&self, form: &HeaderForm<'_>, pn: u64, largest_acked: Option<u64>) -> usize {
        let pn_len = packet_number_len(pn, largest_acked);
        let overhead = form.size() + pn_len + 16;
        self.remaining().saturating_sub(overhead)
    }

    /// Seal `frames` into one packet and append it. `pad_datagram_to`
    /// forces the whole datagram to a minimum size (client Initials) by
    /// padding this packet's plaintext.
    ///
    /// Tracked frames (those with ack/loss consequences) are summarized in
    /// `sent_frames` by the caller, which knows their semantic context.
    pub fn add_packet(
        &mut self,
        form: &HeaderForm<'_>,
        pn: u64,
        largest_acked: Option<u64>,
        frames: &[Frame],
        sent_frames: Vec<SentFrame>,
        keys: &KeySet,
        pad_datagram_to: Option<usize>,
    ) -> Result<(), crate::error::TransportError> {
        let pn_len = packet_number_len(pn, largest_acked);
        let tag_len = keys.packet.tag_len();

        let mut plain = Vec::new();
        for frame in frames {
            frame.encode(&mut plain);
        }

        // The header-protection sample assumes a 4-byte PN field, so the
        // ciphertext after the PN must cover sample offset + length.
        let min_plain = 4usize.saturating_sub(pn_len);
        if plain.len() < min_plain {
            plain.resize(min_plain, 0);
        }
        if let Some(target) = pad_datagram_to {
            let this_packet = form.size() + pn_len + plain.len() + tag_len;
            let datagram_len = self.buf.len() + this_packet;
            if datagram_len < target {
                plain.extend(std::iter::repeat_n(0u8, target - datagram_len));
            }
        }

        let packet_start = self.buf.len();
        let pn_offset =
            form.encode(&mut self.buf, pn, pn_len, pn_len + plain.len() + tag_len);
        let header_end = self.buf.len();
        let mut body = plain;
        keys.packet.seal(pn, &self.buf[packet_start..header_end], &mut body)?;
        self.buf.extend_from_slice(&body);
        packet::protect(&mut self.buf, packet_start, pn_offset, pn_len, keys.header.as_ref());

        let wire_bytes = (self.buf.len() - packet_start) as u64;
        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        self.packets.push(BuiltPacket {
            epoch: form.epoch(),
            pn,
            bytes: wire_bytes,
            ack_eliciting,
            // Padding-only packets still occupy the network.
            in_flight: ack_eliciting || frames.iter().any(|f| matches!(f, Frame::Padding(_))),
            frames: sent_frames,
        });
        Ok(())
    }

    pub fn finish(self) -> (Vec<u8>, Vec<BuiltPacket>) {
        (self.buf, self.packets)
    }
}

/// Token-bucket pacer fed by the congestion controller's rate. A `None`
/// rate means no pacing (pre-handshake, or no RTT sample yet).
#[derive(Debug)]
pub struct Pacer {
    rate: Option<u64>,
    tokens: f64,
    capacity: f64,
    last_update: Option<Instant>,
}

impl Pacer {
    /// Burst capacity of roughly a quarter window keeps short flows from
    /// being throttled by their own pacer.
    pub fn new() -> Self {
        Pacer { rate: None, tokens: 0.0, capacity: 0.0, last_update: None }
    }

    pub fn set_rate(&mut self, rate: Option<u64>, burst_capacity: u64) {
        self.rate = rate;
        self.capacity = burst_capacity as f64;
        if self.tokens > self.capacity {
            self.tokens = self.capacity;
        }
    }

    fn refill(&mut self, now: Instant) {
        let Some(rate) = self.rate else { return };
        if let Some(last) = self.last_update {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate as f64).min(self.capacity);
        } else {
            self.tokens = self.capacity;
        }
        self.last_update = Some(now);
    }

    /// Bytes the pacer allows right now.
    pub fn available(&mut self, now: Instant) -> u64 {
        if self.rate.is_none() {
            return u64::MAX;
        }
        self.refill(now);
        self.tokens.max(0.0) as u64
    }

    pub fn on_sent(&mut self, bytes: u64) {
        if self.rate.is_some() {
            self.tokens -= bytes as f64;
        }
    }

    /// When enough budget for one full datagram will have accumulated.
    pub fn next_slot(&self, mtu: u16, now: Instant) -> Option<Instant> {
        let rate = self.rate?;
        if self.tokens >= mtu as f64 || rate == 0 {
            return None;
        }
        let deficit = mtu as f64 - self.tokens;
        let wait = deficit / rate as f64;
        Some(now + std::time::Duration::from_secs_f64(wait))
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new()
    }
}
