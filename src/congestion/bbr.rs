//! BBR congestion control: bottleneck-bandwidth and min-RTT probing with
//! the Startup → Drain → ProbeBW → ProbeRTT state machine.

use super::Flight;
use crate::path::RttEstimator;
use std::time::{Duration, Instant};
use tracing::trace;

/// Pacing gain cycle in ProbeBW: one probing phase, one draining phase,
/// six cruising phases.
const PACING_GAIN_CYCLE: [f64; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];

/// Startup gain, 2/ln(2): fills the pipe in one round per bandwidth
/// doubling.
const STARTUP_GAIN: f64 = 2.885;

const DRAIN_GAIN: f64 = 1.0 / STARTUP_GAIN;

/// Startup ends when bandwidth grew less than this across
/// `STARTUP_FULL_BW_ROUNDS` consecutive rounds.
const STARTUP_GROWTH_TARGET: f64 = 1.25;
const STARTUP_FULL_BW_ROUNDS: u8 = 3;

/// Bandwidth filter window, in round trips.
const BW_WINDOW_ROUNDS: u64 = 10;

/// A min-RTT sample expires after this long, forcing a ProbeRTT visit.
const MIN_RTT_EXPIRY: Duration = Duration::from_secs(10);

const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

const INITIAL_WINDOW_PACKETS: u64 = 10;
const MINIMUM_WINDOW_PACKETS: u64 = 2;
/// Window floor while probing for RTT.
const PROBE_RTT_WINDOW_PACKETS: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

/// Windowed max filter with three staged estimates, aged out as the window
/// (measured in round trips) slides.
#[derive(Debug, Clone, Copy)]
struct WindowedMaxFilter {
    window: u64,
    estimates: [(u64, u64); 3], // (sample, round recorded)
}

impl WindowedMaxFilter {
    fn new(window: u64) -> Self {
        WindowedMaxFilter { window, estimates: [(0, 0); 3] }
    }

    fn best(&self) -> u64 {
        self.estimates[0].0
    }

    fn update(&mut self, sample: u64, round: u64) {
        if self.estimates[0].0 == 0 || sample >= self.estimates[0].0
            || round - self.estimates[2].1 > self.window
        {
            self.estimates = [(sample, round); 3];
            return;
        }
        if sample >= self.estimates[1].0 {
            self.estimates[1] = (sample, round);
            self.estimates[2] = self.estimates[1];
        } else if sample >= self.estimates[2].0 {
            self.estimates[2] = (sample, round);
        }
        // Slide the window: promote successors as the best ages out.
        if round - self.estimates[0].1 > self.window {
            self.estimates[0] = self.estimates[1];
            self.estimates[1] = self.estimates[2];
            self.estimates[2] = (sample, round);
            if round - self.estimates[0].1 > self.window {
                self.estimates[0] = self.estimates[1];
                self.estimates[1] = self.estimates[2];
            }
        }
    }
}

pub struct Bbr {
    mss: u64,
    pub flight: Flight,
    state: State,

    /// Bottleneck bandwidth estimate, bytes/sec, windowed max.
    bw_filter: WindowedMaxFilter,
    min_rtt: Duration,
    min_rtt_stamp: Instant,

    /// Round accounting: a round ends one smoothed RTT after it started.
    round_count: u64,
    round_start: Instant,

    pacing_gain: f64,
    cwnd_gain: f64,
    cycle_index: usize,
    cycle_stamp: Instant,

    /// Startup exit detection.
    btlbw_found: bool,
    last_startup_bw: u64,
    stalled_rounds: u8,

    /// ProbeRTT bookkeeping.
    probe_rtt_done: Option<Instant>,

    /// Loss recovery: the window is capped by this until recovery ends.
    recovery_window: Option<u64>,
    recovery_until: Option<Instant>,

    cwnd: u64,
}

impl Bbr {
    pub fn new(mss: u64, now: Instant) -> Self {
        Bbr {
            mss,
            flight: Flight::default(),
            state: State::Startup,
            bw_filter: WindowedMaxFilter::new(BW_WINDOW_ROUNDS),
            min_rtt: Duration::from_millis(crate::types::INITIAL_RTT_MS),
            min_rtt_stamp: now,
            round_count: 0,
            round_start: now,
            pacing_gain: STARTUP_GAIN,
            cwnd_gain: STARTUP_GAIN,
            cycle_index: 0,
            cycle_stamp: now,
            btlbw_found: false,
            last_startup_bw: 0,
            stalled_rounds: 0,
            probe_rtt_done: None,
            recovery_window: None,
            recovery_until: None,
            cwnd: INITIAL_WINDOW_PACKETS * mss,
        }
    }

    fn min_window(&self) -> u64 {
        MINIMUM_WINDOW_PACKETS * self.mss
    }

    pub fn window(&self) -> u64 {
        let base = match self.state {
            State::ProbeRtt => PROBE_RTT_WINDOW_PACKETS * self.mss,
            _ => self.cwnd,
        };
        match self.recovery_window {
            Some(recovery) => base.min(recovery).max(self.min_window()),
            None => base,
        }
    }

    fn bdp(&self) -> u64 {
        let bw = self.bw_filter.best();
        (bw as f64 * self.min_rtt.as_secs_f64()) as u64
    }

    pub fn on_packet_sent(&mut self, _now: Instant) {}

    pub fn on_acked(&mut self, bytes: u64, _sent_at: Instant, rtt: &RttEstimator, now: Instant) {
        // Round bookkeeping.
        let round_ended = now >= self.round_start + rtt.smoothed;
        if round_ended {
            self.round_count += 1;
            self.round_start = now;
        }

        // Bandwidth sample: delivered bytes over the latest RTT.
        let rtt_secs = rtt.latest.as_secs_f64();
        if rtt_secs > 0.0 {
            let sample = (bytes as f64 / rtt_secs) as u64;
            self.bw_filter.update(sample, self.round_count);
        }

        // Min RTT refresh / expiry.
        if rtt.latest <= self.min_rtt || now >= self.min_rtt_stamp + MIN_RTT_EXPIRY {
            let expired = now >= self.min_rtt_stamp + MIN_RTT_EXPIRY && rtt.latest > self.min_rtt;
            self.min_rtt = rtt.latest;
            self.min_rtt_stamp = now;
            if expired && self.state != State::ProbeRtt {
                self.enter_probe_rtt(now);
            }
        }

        // Recovery ends once acks arrive past its deadline; the recovery
        // window grows with acked bytes until then.
        if let Some(until) = self.recovery_until {
            if now >= until {
                self.recovery_window = None;
                self.recovery_until = None;
            } else if let Some(window) = &mut self.recovery_window {
                *window += bytes;
            }
        }

        match self.state {
            State::Startup => {
                if round_ended {
                    let bw = self.bw_filter.best();
                    if bw as f64 >= self.last_startup_bw as f64 * STARTUP_GROWTH_TARGET {
                        self.last_startup_bw = bw;
                        self.stalled_rounds = 0;
                    } else {
                        self.stalled_rounds += 1;
                        if self.stalled_rounds >= STARTUP_FULL_BW_ROUNDS {
                            self.btlbw_found = true;
                            self.enter_drain(now);
                        }
                    }
                }
            }
            State::Drain => {
                if self.flight.bytes() <= self.bdp() {
                    self.enter_probe_bw(now);
                }
            }
            State::ProbeBw => {
                // Advance the gain cycle once per min RTT.
                if now >= self.cycle_stamp + self.min_rtt.max(Duration::from_millis(1)) {
                    self.cycle_index = (self.cycle_index + 1) % PACING_GAIN_CYCLE.len();
                    self.pacing_gain = PACING_GAIN_CYCLE[self.cycle_index];
                    self.cycle_stamp = now;
                }
            }
            State::ProbeRtt => {
                let done = *self
                    .probe_rtt_done
                    .get_or_insert(now + PROBE_RTT_DURATION.max(rtt.smoothed));
                if now >= done {
                    self.min_rtt_stamp = now;
                    if self.btlbw_found {
                        self.enter_probe_bw(now);
                    } else {
                        self.enter_startup();
                    }
                }
            }
        }

        // Target window from the model.
        if self.state != State::ProbeRtt {
            let bdp = self.bdp();
            if bdp > 0 {
                self.cwnd = ((bdp as f64 * self.cwnd_gain) as u64).max(self.min_window());
            } else if self.state == State::Startup {
                self.cwnd += bytes;
            }
        }
    }

    fn enter_startup(&mut self) {
        self.state = State::Startup;
        self.pacing_gain = STARTUP_GAIN;
        self.cwnd_gain = STARTUP_GAIN;
        self.probe_rtt_done = None;
    }

    fn enter_drain(&mut self, now: Instant) {
        trace!(bw = self.bw_filter.best(), "bbr: bottleneck found, draining");
        self.state = State::Drain;
        self.pacing_gain = DRAIN_GAIN;
        self.cwnd_gain = STARTUP_GAIN;
        self.cycle_stamp = now;
    }

    fn enter_probe_bw(&mut self, now: Instant) {
        self.state = State::ProbeBw;
        self.cwnd_gain = 2.0;
        // Skip the 0.75 drain slot when entering fresh.
        self.cycle_index = 2;
        self.pacing_gain = PACING_GAIN_CYCLE[self.cycle_index];
        self.cycle_stamp = now;
        self.probe_rtt_done = None;
    }

    fn enter_probe_rtt(&mut self, _now: Instant) {
        trace!("bbr: probing rtt");
        self.state = State::ProbeRtt;
        self.probe_rtt_done = None;
    }

    /// Loss caps the window at the current flight until recovery ends.
    pub fn on_congestion_event(&mut self, _lost_bytes: u64, now: Instant) {
        if self.recovery_until.is_some_and(|until| now < until) {
            return;
        }
        self.recovery_window =
            Some(self.flight.bytes().max(MINIMUM_WINDOW_PACKETS * self.mss));
        self.recovery_until = Some(now + self.min_rtt);
    }

    pub fn on_persistent_congestion(&mut self) {
        self.cwnd = self.min_window();
        self.recovery_window = None;
        self.recovery_until = None;
        self.enter_startup();
    }

    pub fn pacing_rate(&self) -> Option<u64> {
        let bw = self.bw_filter.best();
        if bw == 0 {
            return None;
        }
        Some((bw as f64 * self.pacing_gain) as u64)
    }

    pub fn reset(&mut self, now: Instant) {
        let flight = std::mem::take(&mut self.flight);
        *self = Bbr::new(self.mss, now);
        self.flight = flight;
    }
}
