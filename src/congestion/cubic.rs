//! Cubic congestion control (RFC 9438), the default algorithm.

use super::Flight;
use crate::path::RttEstimator;
use std::time::Instant;
use tracing::trace;

/// Cubic aggressiveness constant, in MSS/s³.
const C: f64 = 0.4;

/// Multiplicative decrease factor.
const BETA: f64 = 0.7;

/// Initial window, in packets (RFC 9002 §7.2).
const INITIAL_WINDOW_PACKETS: u64 = 10;

/// Floor, in packets.
const MINIMUM_WINDOW_PACKETS: u64 = 2;

pub struct Cubic {
    mss: u64,
    pub flight: Flight,
    cwnd: u64,
    ssthresh: u64,
    /// Window (in MSS) at the last congestion event.
    w_max: f64,
    /// Seconds until the cubic curve returns to w_max.
    k: f64,
    /// Start of the current congestion-avoidance epoch.
    epoch_start: Option<Instant>,
    /// Packets sent before this instant don't trigger another reduction.
    recovery_start: Option<Instant>,
}

impl Cubic {
    pub fn new(mss: u64) -> Self {
        Cubic {
            mss,
            flight: Flight::default(),
            cwnd: INITIAL_WINDOW_PACKETS * mss,
            ssthresh: u64::MAX,
            w_max: 0.0,
            k: 0.0,
            epoch_start: None,
            recovery_start: None,
        }
    }

    pub fn window(&self) -> u64 {
        self.cwnd
    }

    fn min_window(&self) -> u64 {
        MINIMUM_WINDOW_PACKETS * self.mss
    }

    pub fn on_acked(&mut self, bytes: u64, sent_at: Instant, rtt: &RttEstimator, now: Instant) {
        if self.in_recovery(sent_at) {
            return;
        }
        self.recovery_start = None;

        if self.cwnd < self.ssthresh {
            // Slow start: one MSS per acked MSS.
            self.cwnd += bytes;
            if self.cwnd >= self.ssthresh {
                // Exit point becomes the new plateau.
                self.w_max = self.cwnd as f64 / self.mss as f64;
                self.k = 0.0;
                self.epoch_start = Some(now);
            }
            return;
        }

        let epoch_start = *self.epoch_start.get_or_insert(now);
        // Evaluate the curve one smoothed RTT ahead, per the RFC's
        // W_cubic(t + RTT) target.
        let t = now.saturating_duration_since(epoch_start).as_secs_f64()
            + rtt.smoothed.as_secs_f64();
        let target_mss = C * (t - self.k).powi(3) + self.w_max;
        let target = (target_mss * self.mss as f64) as u64;

        if target > self.cwnd {
            // Approach the curve proportionally to acked bytes.
            let gap = target - self.cwnd;
            self.cwnd += (gap.saturating_mul(bytes) / self.cwnd).max(1);
        } else {
            // At or above the curve: creep by at most one MSS per window.
            self.cwnd += self.mss * bytes / (100 * self.cwnd.max(1));
        }
    }

    fn in_recovery(&self, sent_at: Instant) -> bool {
        self.recovery_start.is_some_and(|start| sent_at <= start)
    }

    /// Loss or ECN-CE: multiplicative decrease, once per recovery period.
    pub fn on_congestion_event(&mut self, largest_sent_at: Instant, now: Instant) {
        if self.in_recovery(largest_sent_at) {
            return;
        }
        self.recovery_start = Some(now);

        let cwnd_mss = self.cwnd as f64 / self.mss as f64;
        // Fast convergence: a plateau below the previous one shrinks w_max
        // further to release bandwidth faster.
        self.w_max = if cwnd_mss < self.w_max { cwnd_mss * (1.0 + BETA) / 2.0 } else { cwnd_mss };
        self.k = (self.w_max * (1.0 - BETA) / C).cbrt();
        self.epoch_start = None;

        self.ssthresh = ((self.cwnd as f64 * BETA) as u64).max(self.min_window());
        self.cwnd = self.ssthresh;
        trace!(cwnd = self.cwnd, "congestion event");
    }

    pub fn on_persistent_congestion(&mut self) {
        self.cwnd = self.min_window();
        self.recovery_start = None;
        self.epoch_start = None;
    }

    /// Pace at cwnd per smoothed RTT with a 25% surplus, doubled in slow
    /// start so the window can actually grow.
    pub fn pacing_rate(&self, rtt: &RttEstimator) -> Option<u64> {
        let srtt = rtt.smoothed.as_secs_f64();
        if srtt <= 0.0 {
            return None;
        }
        let gain = if self.cwnd < self.ssthresh { 2.0 } else { 1.25 };
        Some((self.cwnd as f64 / srtt * gain) as u64)
    }

    pub fn reset(&mut self) {
        let flight = std::mem::take(&mut self.flight);
        *self = Cubic::new(self.mss);
        // Bytes already in the network stay accounted.
        self.flight = flight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rtt_50ms() -> RttEstimator {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(50), Duration::ZERO);
        rtt
    }

    #[test]
    fn slow_start_doubles() {
        let mut cubic = Cubic::new(1200);
        let rtt = rtt_50ms();
        let now = Instant::now();
        let start = cubic.window();
        cubic.on_acked(start, now, &rtt, now + Duration::from_millis(50));
        assert_eq!(cubic.window(), 2 * start);
    }

    #[test]
    fn loss_applies_beta() {
        let mut cubic = Cubic::new(1200);
        let now = Instant::now();
        let before = cubic.window();
        cubic.on_congestion_event(now, now + Duration::from_millis(10));
        assert_eq!(cubic.window(), (before as f64 * BETA) as u64);
    }

    #[test]
    fn one_reduction_per_recovery() {
        let mut cubic = Cubic::new(1200);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);
        let t2 = t0 + Duration::from_millis(20);
        cubic.on_congestion_event(t0, t1);
        let after_first = cubic.window();
        // Second loss for a packet sent before recovery began: no-op.
        cubic.on_congestion_event(t0, t2);
        assert_eq!(cubic.window(), after_first);
        // Loss of a packet sent after recovery began reduces again.
        cubic.on_congestion_event(t2, t2 + Duration::from_millis(10));
        assert!(cubic.window() < after_first);
    }

    #[test]
    fn growth_resumes_above_ssthresh() {
        let mut cubic = Cubic::new(1200);
        let rtt = rtt_50ms();
        let t0 = Instant::now();
        cubic.on_congestion_event(t0, t0);
        let floor = cubic.window();
        let mut now = t0 + Duration::from_millis(100);
        for _ in 0..50 {
            cubic.on_acked(floor, now, &rtt, now);
            now += Duration::from_millis(50);
        }
        assert!(cubic.window() > floor);
    }

    #[test]
    fn persistent_congestion_floors_window() {
        let mut cubic = Cubic::new(1200);
        cubic.on_persistent_congestion();
        assert_eq!(cubic.window(), 2 * 1200);
    }

    #[test]
    fn pacing_rate_positive() {
        let cubic = Cubic::new(1200);
        assert!(cubic.pacing_rate(&rtt_50ms()).unwrap() > 0);
    }
}
