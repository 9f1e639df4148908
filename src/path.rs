//! Per-path state: addresses, RTT estimation, validation, and the
//! anti-amplification allowance (RFC 9000 §8–§9, RFC 9002 §5).

use crate::cid::Cid;
use crate::types::{AMPLIFICATION_FACTOR, DEFAULT_MTU, INITIAL_RTT_MS, PATH_CHALLENGE_LEN};
use rand::RngCore;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// RTT estimator per RFC 9002 §5.3.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    pub latest: Duration,
    pub smoothed: Duration,
    pub var: Duration,
    pub min: Duration,
    pub max: Duration,
    has_sample: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        let initial = Duration::from_millis(INITIAL_RTT_MS);
        RttEstimator {
            latest: initial,
            smoothed: initial,
            var: initial / 2,
            min: initial,
            max: initial,
            has_sample: false,
        }
    }

    /// Feed one sample. `ack_delay` is the peer-reported delay, already
    /// capped by its max_ack_delay; it is subtracted only when doing so
    /// cannot push the sample below the observed minimum.
    pub fn update(&mut self, sample: Duration, ack_delay: Duration) {
        self.latest = sample;
        if !self.has_sample {
            self.has_sample = true;
            self.min = sample;
            self.max = sample;
            self.smoothed = sample;
            self.var = sample / 2;
            return;
        }
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);

        let mut adjusted = sample;
        if sample >= self.min + ack_delay {
            adjusted = sample - ack_delay;
        }
        let diff = self.smoothed.abs_diff(adjusted);
        self.var = (3 * self.var + diff) / 4;
        self.smoothed = (7 * self.smoothed + adjusted) / 8;
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    /// PTO contribution: srtt + max(4·rttvar, granularity).
    pub fn pto_base(&self) -> Duration {
        self.smoothed
            + (4 * self.var).max(Duration::from_millis(crate::types::GRANULARITY_MS))
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a path counts as validated (mirrors the original's reason codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathValidReason {
    InitialToken,
    HandshakePacket,
    PathResponse,
}

/// One network path: the (local, remote) tuple plus its destination CID,
/// RTT state and validation bookkeeping.
#[derive(Debug)]
pub struct Path {
    pub id: u8,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// CID this path addresses the peer with.
    pub dcid: Cid,
    pub mtu: u16,
    pub rtt: RttEstimator,
    pub validated: bool,
    pub is_active: bool,

    /// Challenge we sent on this path, with its retransmission deadline.
    pub challenge: Option<[u8; PATH_CHALLENGE_LEN]>,
    pub challenge_pending: bool,
    pub challenge_deadline: Option<Instant>,
    /// PATH_RESPONSE owed to the peer.
    pub response_pending: Option<[u8; PATH_CHALLENGE_LEN]>,

    /// Anti-amplification accounting, meaningful until validated.
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl Path {
    pub fn new(id: u8, local: SocketAddr, remote: SocketAddr, dcid: Cid) -> Self {
        debug!(path = id, %remote, "path initialized");
        Path {
            id,
            local,
            remote,
            dcid,
            mtu: DEFAULT_MTU,
            rtt: RttEstimator::new(),
            validated: false,
            is_active: false,
            challenge: None,
            challenge_pending: false,
            challenge_deadline: None,
            response_pending: None,
            bytes_received: 0,
            bytes_sent: 0,
        }
    }

    pub fn matches(&self, local: &SocketAddr, remote: &SocketAddr) -> bool {
        self.local == *local && self.remote == *remote
    }

    /// Bytes we may still send before the peer is validated: 3× received
    /// minus already sent. Unlimited once validated.
    pub fn amp_allowance(&self) -> u64 {
        if self.validated {
            u64::MAX
        } else {
            (AMPLIFICATION_FACTOR * self.bytes_received).saturating_sub(self.bytes_sent)
        }
    }

    pub fn on_bytes_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    pub fn on_bytes_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn set_valid(&mut self, reason: PathValidReason) {
        if self.validated {
            return;
        }
        info!(path = self.id, ?reason, "path validated");
        self.validated = true;
    }

    /// Begin validation: pick a random challenge payload and queue it.
    pub fn start_challenge(&mut self, now: Instant) -> [u8; PATH_CHALLENGE_LEN] {
        let mut payload = [0u8; PATH_CHALLENGE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut payload);
        self.challenge = Some(payload);
        self.challenge_pending = true;
        // Retransmit the challenge if nothing comes back within a
        // generous round trip.
        self.challenge_deadline = Some(now + 2 * self.rtt.pto_base());
        payload
    }

    /// PATH_RESPONSE received on this path. Validates only if it answers
    /// this path's outstanding challenge; responses that wandered in from a
    /// different tuple are dropped by the caller before this point.
    pub fn on_path_response(&mut self, payload: [u8; PATH_CHALLENGE_LEN]) -> bool {
        if self.challenge == Some(payload) {
            self.challenge = None;
            self.challenge_pending = false;
            self.challenge_deadline = None;
            self.set_valid(PathValidReason::PathResponse);
            return true;
        }
        debug!(path = self.id, "path response with unknown payload discarded");
        false
    }

    /// Re-arm the challenge if its deadline passed.
    pub fn on_timer(&mut self, now: Instant) {
        if let Some(deadline) = self.challenge_deadline
            && deadline <= now
            && self.challenge.is_some()
        {
            self.challenge_pending = true;
            self.challenge_deadline = Some(now + 2 * self.rtt.pto_base());
        }
    }
}

/// Did only the port change between two remote addresses? A pure rebind
/// keeps the congestion state; a different IP resets it.
pub fn port_change_only(old: &SocketAddr, new: &SocketAddr) -> bool {
    old.ip() == new.ip()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn rtt_smoothing() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        assert_eq!(rtt.smoothed, Duration::from_millis(100));
        assert_eq!(rtt.min, Duration::from_millis(100));

        rtt.update(Duration::from_millis(200), Duration::ZERO);
        // smoothed = 7/8·100 + 1/8·200 = 112.5ms
        assert_eq!(rtt.smoothed, Duration::from_micros(112_500));
        assert_eq!(rtt.min, Duration::from_millis(100));
        assert_eq!(rtt.max, Duration::from_millis(200));
    }

    #[test]
    fn ack_delay_not_below_min() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        // Subtracting the full delay would dip under min; sample is used raw.
        rtt.update(Duration::from_millis(110), Duration::from_millis(50));
        assert!(rtt.smoothed >= Duration::from_millis(100));
    }

    #[test]
    fn amplification_allowance() {
        let mut path = Path::new(0, addr("10.0.0.1:443"), addr("10.0.0.2:5000"), Cid::EMPTY);
        assert_eq!(path.amp_allowance(), 0);
        path.on_bytes_received(1200);
        assert_eq!(path.amp_allowance(), 3600);
        path.on_bytes_sent(3000);
        assert_eq!(path.amp_allowance(), 600);
        path.set_valid(PathValidReason::HandshakePacket);
        assert_eq!(path.amp_allowance(), u64::MAX);
    }

    #[test]
    fn challenge_response_cycle() {
        let now = Instant::now();
        let mut path = Path::new(1, addr("10.0.0.1:443"), addr("10.0.0.2:6000"), Cid::EMPTY);
        let payload = path.start_challenge(now);
        assert!(path.challenge_pending);
        // Wrong payload is ignored.
        assert!(!path.on_path_response([0xff; PATH_CHALLENGE_LEN]));
        assert!(!path.validated);
        assert!(path.on_path_response(payload));
        assert!(path.validated);
    }

    #[test]
    fn port_vs_ip_change() {
        assert!(port_change_only(&addr("10.0.0.2:5000"), &addr("10.0.0.2:6000")));
        assert!(!port_change_only(&addr("10.0.0.2:5000"), &addr("10.0.0.3:5000")));
    }
}
