//! Congestion control: the common contract shared by Cubic and BBR, and
//! the in-flight byte accounting both build on.
//!
//! Dispatch is a tagged enum at the build boundary; the per-packet hot
//! paths inside each algorithm are monomorphic.

pub mod bbr;
pub mod cubic;

pub use bbr::Bbr;
pub use cubic::Cubic;

use crate::path::RttEstimator;
use std::time::Instant;

/// Which algorithm a connection runs; Cubic is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionAlgorithm {
    #[default]
    Cubic,
    Bbr,
}

/// Bytes considered still in the network, shared by both algorithms.
///
/// The sender keeps sending until `in_flight` exceeds the congestion
/// window, so it may overshoot by up to one packet plus any exemptions.
/// Exemptions let loss-recovery probes out while the window is full.
#[derive(Debug, Default)]
pub struct Flight {
    in_flight: u64,
    /// High-water mark, feeds the ideal-send-buffer target.
    pub max: u64,
    exemptions: u8,
}

impl Flight {
    pub fn on_sent(&mut self, bytes: u64) {
        self.in_flight += bytes;
        self.max = self.max.max(self.in_flight);
        if bytes > 0 && self.exemptions > 0 {
            self.exemptions -= 1;
        }
    }

    pub fn on_removed(&mut self, bytes: u64) {
        debug_assert!(self.in_flight >= bytes);
        self.in_flight = self.in_flight.saturating_sub(bytes);
    }

    pub fn bytes(&self) -> u64 {
        self.in_flight
    }

    pub fn set_exemptions(&mut self, count: u8) {
        self.exemptions = count;
    }

    pub fn has_exemption(&self) -> bool {
        self.exemptions > 0
    }
}

/// The congestion controller a connection carries. All methods forward to
/// the selected algorithm.
pub enum Controller {
    Cubic(Cubic),
    Bbr(Bbr),
}

impl Controller {
    pub fn new(algorithm: CongestionAlgorithm, mss: u64, now: Instant) -> Self {
        match algorithm {
            CongestionAlgorithm::Cubic => Controller::Cubic(Cubic::new(mss)),
            CongestionAlgorithm::Bbr => Controller::Bbr(Bbr::new(mss, now)),
        }
    }

    fn flight(&self) -> &Flight {
        match self {
            Controller::Cubic(c) => &c.flight,
            Controller::Bbr(b) => &b.flight,
        }
    }

    fn flight_mut(&mut self) -> &mut Flight {
        match self {
            Controller::Cubic(c) => &mut c.flight,
            Controller::Bbr(b) => &mut b.flight,
        }
    }

    pub fn on_packet_sent(&mut self, bytes: u64, now: Instant) {
        self.flight_mut().on_sent(bytes);
        if let Controller::Bbr(b) = self {
            b.on_packet_sent(now);
        }
    }

    /// Acked bytes leave the flight; the algorithm grows its window.
    pub fn on_packets_acked(
        &mut self,
        bytes: u64,
        largest_sent_at: Instant,
        rtt: &RttEstimator,
        now: Instant,
    ) {
        self.flight_mut().on_removed(bytes);
        match self {
            Controller::Cubic(c) => c.on_acked(bytes, largest_sent_at, rtt, now),
            Controller::Bbr(b) => b.on_acked(bytes, largest_sent_at, rtt, now),
        }
    }

    /// Lost bytes leave the flight; one congestion event per loss batch.
    pub fn on_packets_lost(&mut self, bytes: u64, largest_sent_at: Instant, now: Instant) {
        self.flight_mut().on_removed(bytes);
        match self {
            Controller::Cubic(c) => c.on_congestion_event(largest_sent_at, now),
            Controller::Bbr(b) => b.on_congestion_event(bytes, now),
        }
    }

    /// All in-flight data across a long-enough span was lost: collapse to
    /// the minimum window.
    pub fn on_persistent_congestion(&mut self) {
        match self {
            Controller::Cubic(c) => c.on_persistent_congestion(),
            Controller::Bbr(b) => b.on_persistent_congestion(),
        }
    }

    /// ECN congestion-experienced marks count as a congestion event
    /// without byte loss.
    pub fn on_ecn_ce(&mut self, largest_sent_at: Instant, now: Instant) {
        match self {
            Controller::Cubic(c) => c.on_congestion_event(largest_sent_at, now),
            Controller::Bbr(b) => b.on_congestion_event(0, now),
        }
    }

    /// Bytes that may be sent right now. Exempt probes report a full
    /// packet even when the window is closed.
    pub fn can_send(&self, mss: u64) -> u64 {
        let window = self.window();
        let in_flight = self.flight().bytes();
        if in_flight < window {
            window - in_flight
        } else if self.flight().has_exemption() {
            mss
        } else {
            0
        }
    }

    pub fn window(&self) -> u64 {
        match self {
            Controller::Cubic(c) => c.window(),
            Controller::Bbr(b) => b.window(),
        }
    }

    /// Pacing rate in bytes per second, when the algorithm has one.
    pub fn pacing_rate(&self, rtt: &RttEstimator) -> Option<u64> {
        match self {
            Controller::Cubic(c) => c.pacing_rate(rtt),
            Controller::Bbr(b) => b.pacing_rate(),
        }
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.flight().bytes()
    }

    pub fn bytes_in_flight_max(&self) -> u64 {
        self.flight().max
    }

    pub fn set_exemptions(&mut self, count: u8) {
        self.flight_mut().set_exemptions(count);
    }

    /// An epoch's keys were dropped along with its unacked packets; those
    /// bytes leave the flight without a congestion signal.
    pub fn discard_in_flight(&mut self, bytes: u64) {
        self.flight_mut().on_removed(bytes);
    }

    /// Forget everything learned about the path (migration to a new remote
    /// IP). In-flight accounting survives: those bytes are still out there.
    pub fn reset(&mut self, now: Instant) {
        match self {
            Controller::Cubic(c) => c.reset(),
            Controller::Bbr(b) => b.reset(now),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Controller::Cubic(_) => "cubic",
            Controller::Bbr(_) => "bbr",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn flight_accounting() {
        let mut flight = Flight::default();
        flight.on_sent(1200);
        flight.on_sent(1200);
        assert_eq!(flight.bytes(), 2400);
        assert_eq!(flight.max, 2400);
        flight.on_removed(1200);
        assert_eq!(flight.bytes(), 1200);
        assert_eq!(flight.max, 2400);
    }

    #[test]
    fn exemptions_consumed_by_sends() {
        let mut flight = Flight::default();
        flight.set_exemptions(2);
        assert!(flight.has_exemption());
        flight.on_sent(100);
        flight.on_sent(100);
        assert!(!flight.has_exemption());
    }

    #[test]
    fn exempt_probe_bypasses_full_window() {
        let now = Instant::now();
        let mut cc = Controller::new(CongestionAlgorithm::Cubic, 1200, now);
        let window = cc.window();
        cc.on_packet_sent(window, now);
        assert_eq!(cc.can_send(1200), 0);
        cc.set_exemptions(1);
        assert_eq!(cc.can_send(1200), 1200);
    }

    #[test]
    fn both_algorithms_share_contract() {
        let now = Instant::now();
        let rtt = RttEstimator::new();
        for algorithm in [CongestionAlgorithm::Cubic, CongestionAlgorithm::Bbr] {
            let mut cc = Controller::new(algorithm, 1200, now);
            assert!(cc.can_send(1200) > 0);
            cc.on_packet_sent(1200, now);
            cc.on_packets_acked(1200, now, &rtt, now + Duration::from_millis(50));
            assert_eq!(cc.bytes_in_flight(), 0);
            cc.on_persistent_congestion();
            assert_eq!(cc.window(), 2 * 1200);
        }
    }
}
