//! Loss detection and PTO (RFC 9002 §6): the per-epoch sent-packet ledger,
//! time- and threshold-based loss, probe timeouts, and persistent
//! congestion detection.

use crate::path::RttEstimator;
use crate::types::{
    Dir, Epoch, EPOCH_COUNT, GRANULARITY_MS, PACKET_THRESHOLD,
    PERSISTENT_CONGESTION_THRESHOLD, StreamId, TIME_THRESHOLD_DEN, TIME_THRESHOLD_NUM,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// What a sent packet carried, recorded for ack/loss processing. Only
/// frames with retransmission or state consequences are tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Ack { largest: u64 },
    Stream { id: StreamId, offset: u64, len: u64, fin: bool },
    Crypto { offset: u64, len: u64 },
    ResetStream { id: StreamId },
    StopSending { id: StreamId },
    MaxData,
    MaxStreamData { id: StreamId },
    MaxStreams { dir: Dir },
    NewCid { sequence: u64 },
    RetireCid { sequence: u64 },
    PathChallenge { path_id: u8 },
    PathResponse,
    HandshakeDone,
    NewToken,
    Ping,
    Datagram { id: u64 },
}

/// Ledger entry for one sent packet.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub pn: u64,
    pub time_sent: Instant,
    pub bytes: u64,
    pub ack_eliciting: bool,
    /// Counted against the congestion window.
    pub in_flight: bool,
    pub frames: Vec<SentFrame>,
}

/// Per-epoch ledger.
#[derive(Debug, Default)]
struct Ledger {
    sent: BTreeMap<u64, SentPacket>,
    /// Earliest time an unacked packet becomes lost by time threshold.
    loss_time: Option<Instant>,
    time_of_last_ack_eliciting: Option<Instant>,
    largest_acked: Option<u64>,
}

/// Result of processing one ACK frame.
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub newly_acked: Vec<SentPacket>,
    pub lost: Vec<SentPacket>,
    /// (pn, time_sent) of the largest newly acked packet; the RTT sample.
    pub largest_newly_acked: Option<(u64, Instant)>,
    pub ack_eliciting_acked: bool,
    /// All in-flight packets across a long-enough span were lost.
    pub persistent_congestion: bool,
}

pub struct LossDetection {
    ledgers: [Ledger; EPOCH_COUNT],
    pub pto_count: u32,
}

impl LossDetection {
    pub fn new() -> Self {
        LossDetection { ledgers: Default::default(), pto_count: 0 }
    }

    pub fn on_packet_sent(&mut self, epoch: Epoch, packet: SentPacket) {
        let ledger = &mut self.ledgers[epoch.index()];
        if packet.ack_eliciting {
            ledger.time_of_last_ack_eliciting = Some(packet.time_sent);
        }
        ledger.sent.insert(packet.pn, packet);
    }

    pub fn largest_acked(&self, epoch: Epoch) -> Option<u64> {
        self.ledgers[epoch.index()].largest_acked
    }

    pub fn in_flight_ack_eliciting(&self, epoch: Epoch) -> bool {
        self.ledgers[epoch.index()]
            .sent
            .values()
            .any(|p| p.ack_eliciting && p.in_flight)
    }

    pub fn bytes_in_flight(&self, epoch: Epoch) -> u64 {
        self.ledgers[epoch.index()]
            .sent
            .values()
            .filter(|p| p.in_flight)
            .map(|p| p.bytes)
            .sum()
    }

    /// Packets needing retransmission content for a PTO probe.
    pub fn oldest_unacked(&self, epoch: Epoch) -> Option<&SentPacket> {
        self.ledgers[epoch.index()].sent.values().find(|p| p.ack_eliciting)
    }

    fn loss_delay(rtt: &RttEstimator) -> Duration {
        let base = rtt.smoothed.max(rtt.latest);
        (base * TIME_THRESHOLD_NUM / TIME_THRESHOLD_DEN)
            .max(Duration::from_millis(GRANULARITY_MS))
    }

    /// Process an ACK's expanded ranges for one epoch. `max_ack_delay` is
    /// the peer's negotiated value, used by persistent-congestion math.
    pub fn on_ack_received(
        &mut self,
        epoch: Epoch,
        ranges: &[(u64, u64)],
        rtt: &RttEstimator,
        max_ack_delay: Duration,
        now: Instant,
    ) -> AckOutcome {
        let ledger = &mut self.ledgers[epoch.index()];
        let mut outcome = AckOutcome::default();

        let ack_largest = ranges.iter().map(|&(_, end)| end).max().unwrap_or(0);
        for &(start, end) in ranges {
            let acked: Vec<u64> = ledger.sent.range(start..=end).map(|(&pn, _)| pn).collect();
            for pn in acked {
                let packet = ledger.sent.remove(&pn).unwrap();
                if packet.ack_eliciting {
                    outcome.ack_eliciting_acked = true;
                }
                if outcome
                    .largest_newly_acked
                    .is_none_or(|(largest, _)| pn > largest)
                {
                    outcome.largest_newly_acked = Some((pn, packet.time_sent));
                }
                outcome.newly_acked.push(packet);
            }
        }

        if ledger.largest_acked.is_none_or(|largest| ack_largest > largest) {
            ledger.largest_acked = Some(ack_largest);
        }

        self.detect_losses(epoch, rtt, now, &mut outcome);

        if outcome.ack_eliciting_acked {
            self.pto_count = 0;
        }
        if !outcome.lost.is_empty() {
            outcome.persistent_congestion =
                self.check_persistent_congestion(&outcome, rtt, max_ack_delay);
        }
        outcome
    }

    fn detect_losses(
        &mut self,
        epoch: Epoch,
        rtt: &RttEstimator,
        now: Instant,
        outcome: &mut AckOutcome,
    ) {
        let ledger = &mut self.ledgers[epoch.index()];
        let Some(largest_acked) = ledger.largest_acked else {
            return;
        };
        let delay = Self::loss_delay(rtt);
        let lost_before = now.checked_sub(delay);
        ledger.loss_time = None;

        let candidates: Vec<u64> = ledger
            .sent
            .range(..largest_acked)
            .map(|(&pn, _)| pn)
            .collect();
        for pn in candidates {
            let packet = &ledger.sent[&pn];
            let by_count = largest_acked >= pn + PACKET_THRESHOLD;
            let by_time = lost_before.is_some_and(|cutoff| packet.time_sent <= cutoff);
            if by_count || by_time {
                let packet = ledger.sent.remove(&pn).unwrap();
                debug!(epoch = epoch.label(), pn, by_count, "packet lost");
                outcome.lost.push(packet);
            } else {
                // Not lost yet; it will be at time_sent + delay.
                let when = packet.time_sent + delay;
                if ledger.loss_time.is_none_or(|t| when < t) {
                    ledger.loss_time = Some(when);
                }
            }
        }
    }

    /// Loss timer fired: re-run time-based detection for the epoch.
    pub fn on_loss_timer(
        &mut self,
        epoch: Epoch,
        rtt: &RttEstimator,
        now: Instant,
    ) -> Vec<SentPacket> {
        let mut outcome = AckOutcome::default();
        self.detect_losses(epoch, rtt, now, &mut outcome);
        outcome.lost
    }

    /// RFC 9002 §7.6: declare persistent congestion when the span of this
    /// batch's lost ack-eliciting packets exceeds the PTO-derived period
    /// and no ack landed inside the span.
    fn check_persistent_congestion(
        &self,
        outcome: &AckOutcome,
        rtt: &RttEstimator,
        max_ack_delay: Duration,
    ) -> bool {
        if !rtt.has_sample() {
            return false;
        }
        let eliciting: Vec<&SentPacket> =
            outcome.lost.iter().filter(|p| p.ack_eliciting).collect();
        let (Some(first), Some(last)) = (
            eliciting.iter().map(|p| p.time_sent).min(),
            eliciting.iter().map(|p| p.time_sent).max(),
        ) else {
            return false;
        };
        let period = (rtt.pto_base() + max_ack_delay) * PERSISTENT_CONGESTION_THRESHOLD;
        if last.saturating_duration_since(first) < period {
            return false;
        }
        // An ack for anything sent inside the span breaks it.
        !outcome
            .newly_acked
            .iter()
            .any(|p| p.time_sent >= first && p.time_sent <= last)
    }

    /// Earliest pending loss-time across epochs.
    pub fn loss_timer(&self) -> Option<(Instant, Epoch)> {
        let mut earliest: Option<(Instant, Epoch)> = None;
        for epoch in Epoch::ALL {
            if let Some(when) = self.ledgers[epoch.index()].loss_time
                && earliest.is_none_or(|(t, _)| when < t)
            {
                earliest = Some((when, epoch));
            }
        }
        earliest
    }

    /// PTO deadline: base doubled per consecutive fire, plus the peer's
    /// max_ack_delay only in the AppData space. Armed for the earliest
    /// epoch with ack-eliciting data in flight; before the handshake
    /// completes, armed even with nothing in flight (anti-deadlock).
    pub fn pto_timer(
        &self,
        rtt: &RttEstimator,
        max_ack_delay: Duration,
        handshake_complete: bool,
        amplification_blocked: bool,
    ) -> Option<(Instant, Epoch)> {
        if amplification_blocked {
            // The peer will open the window by sending; a timer cannot.
            return None;
        }
        let backoff = 1u32 << self.pto_count.min(16);
        let mut earliest: Option<(Instant, Epoch)> = None;
        for epoch in Epoch::ALL {
            let ledger = &self.ledgers[epoch.index()];
            if epoch == Epoch::AppData && !handshake_complete {
                // 1-RTT PTO waits for handshake completion.
                continue;
            }
            let has_eliciting = ledger.sent.values().any(|p| p.ack_eliciting);
            if !has_eliciting {
                continue;
            }
            let Some(base_time) = ledger.time_of_last_ack_eliciting else {
                continue;
            };
            let mut timeout = rtt.pto_base();
            if epoch == Epoch::AppData {
                timeout += max_ack_delay;
            }
            let when = base_time + timeout * backoff;
            if earliest.is_none_or(|(t, _)| when < t) {
                earliest = Some((when, epoch));
            }
        }
        earliest
    }

    /// A PTO fired; the backoff doubles until an ack-eliciting packet is
    /// acknowledged.
    pub fn on_pto_fired(&mut self) {
        self.pto_count += 1;
        trace!(count = self.pto_count, "pto fired");
    }

    /// Keys for an epoch were discarded: forget its packets entirely.
    /// Returns the in-flight bytes to remove from the congestion window.
    pub fn discard_epoch(&mut self, epoch: Epoch) -> u64 {
        let ledger = &mut self.ledgers[epoch.index()];
        let bytes = ledger.sent.values().filter(|p| p.in_flight).map(|p| p.bytes).sum();
        ledger.sent.clear();
        ledger.loss_time = None;
        ledger.time_of_last_ack_eliciting = None;
        bytes
    }
}

impl Default for LossDetection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pn: u64, at: Instant) -> SentPacket {
        SentPacket {
            pn,
            time_sent: at,
            bytes: 1200,
            ack_eliciting: true,
            in_flight: true,
            frames: vec![SentFrame::Ping],
        }
    }

    fn rtt_50ms() -> RttEstimator {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(50), Duration::ZERO);
        rtt
    }

    #[test]
    fn packet_threshold_loss() {
        let mut loss = LossDetection::new();
        let t0 = Instant::now();
        for pn in 0..5 {
            loss.on_packet_sent(Epoch::AppData, packet(pn, t0 + Duration::from_millis(pn)));
        }
        // Ack 3 and 4: packet 0 is 3+ below the largest acked → lost;
        // 1 and 2 are within the reordering threshold.
        let outcome = loss.on_ack_received(
            Epoch::AppData,
            &[(3, 4)],
            &rtt_50ms(),
            Duration::from_millis(25),
            t0 + Duration::from_millis(60),
        );
        assert_eq!(outcome.newly_acked.len(), 2);
        assert_eq!(outcome.lost.len(), 1);
        assert_eq!(outcome.lost[0].pn, 0);
        assert!(outcome.ack_eliciting_acked);
    }

    #[test]
    fn time_threshold_loss() {
        let mut loss = LossDetection::new();
        let t0 = Instant::now();
        loss.on_packet_sent(Epoch::AppData, packet(0, t0));
        loss.on_packet_sent(Epoch::AppData, packet(1, t0 + Duration::from_millis(200)));
        // Ack only pn 1, long after pn 0 was sent: time threshold gets it.
        let outcome = loss.on_ack_received(
            Epoch::AppData,
            &[(1, 1)],
            &rtt_50ms(),
            Duration::from_millis(25),
            t0 + Duration::from_millis(260),
        );
        assert_eq!(outcome.lost.len(), 1);
        assert_eq!(outcome.lost[0].pn, 0);
    }

    #[test]
    fn loss_time_armed_for_recent_packet() {
        let mut loss = LossDetection::new();
        let t0 = Instant::now();
        loss.on_packet_sent(Epoch::AppData, packet(0, t0));
        loss.on_packet_sent(Epoch::AppData, packet(1, t0 + Duration::from_millis(1)));
        let outcome =
            loss.on_ack_received(
            Epoch::AppData,
            &[(1, 1)],
            &rtt_50ms(),
            Duration::from_millis(25),
            t0 + Duration::from_millis(2),
        );
        // Too fresh for time loss, below the packet threshold.
        assert!(outcome.lost.is_empty());
        let (when, epoch) = loss.loss_timer().unwrap();
        assert_eq!(epoch, Epoch::AppData);
        assert!(when > t0);
        // Firing the timer later declares it.
        let lost = loss.on_loss_timer(Epoch::AppData, &rtt_50ms(), when + Duration::from_millis(1));
        assert_eq!(lost.len(), 1);
    }

    #[test]
    fn pto_backoff_doubles() {
        let mut loss = LossDetection::new();
        let t0 = Instant::now();
        let rtt = rtt_50ms();
        loss.on_packet_sent(Epoch::AppData, packet(0, t0));
        let (first, _) = loss.pto_timer(&rtt, Duration::from_millis(25), true, false).unwrap();
        loss.on_pto_fired();
        let (second, _) = loss.pto_timer(&rtt, Duration::from_millis(25), true, false).unwrap();
        assert_eq!(second - t0, (first - t0) * 2);
        // An ack of ack-eliciting data resets the backoff.
        let outcome =
            loss.on_ack_received(Epoch::AppData, &[(0, 0)], &rtt, Duration::from_millis(25), t0);
        assert!(outcome.ack_eliciting_acked);
        assert_eq!(loss.pto_count, 0);
    }

    #[test]
    fn pto_prefers_earliest_epoch() {
        let mut loss = LossDetection::new();
        let t0 = Instant::now();
        loss.on_packet_sent(Epoch::Initial, packet(0, t0));
        loss.on_packet_sent(Epoch::AppData, packet(0, t0));
        let (_, epoch) = loss
            .pto_timer(&rtt_50ms(), Duration::from_millis(25), false, false)
            .unwrap();
        assert_eq!(epoch, Epoch::Initial);
    }

    #[test]
    fn persistent_congestion_span() {
        let mut loss = LossDetection::new();
        let t0 = Instant::now();
        let rtt = rtt_50ms();
        // Period ≈ (50 + max(4·var,1) + 25) · 3; sample-initialized var =
        // 25ms → period ≈ 525ms. Packets 0..=10 spaced 100ms apart span 1s.
        for pn in 0..=10 {
            loss.on_packet_sent(Epoch::AppData, packet(pn, t0 + Duration::from_millis(100 * pn)));
        }
        loss.on_packet_sent(Epoch::AppData, packet(11, t0 + Duration::from_secs(2)));
        let outcome = loss.on_ack_received(
            Epoch::AppData,
            &[(11, 11)],
            &rtt,
            Duration::from_millis(25),
            t0 + Duration::from_secs(3),
        );
        assert_eq!(outcome.lost.len(), 11);
        assert!(outcome.persistent_congestion);
    }

    #[test]
    fn discard_epoch_reports_bytes() {
        let mut loss = LossDetection::new();
        let t0 = Instant::now();
        loss.on_packet_sent(Epoch::Initial, packet(0, t0));
        loss.on_packet_sent(Epoch::Initial, packet(1, t0));
        assert_eq!(loss.discard_epoch(Epoch::Initial), 2400);
        assert!(!loss.in_flight_ack_eliciting(Epoch::Initial));
    }
}
