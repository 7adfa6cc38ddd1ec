//! Congestion and flow control (RFC 5681 Reno with fast recovery).
//!
//! [`CongestionController`] owns `cwnd`, `ssthresh` and the peer's advertised
//! window.  It decides how many bytes may be in flight; it never sends
//! anything itself.
//!
//! | Event                    | Effect                                                  |
//! |--------------------------|---------------------------------------------------------|
//! | ACK of `n` new bytes     | slow start: `cwnd += min(n, mss)`; avoidance: `+mss²/cwnd` |
//! | 3rd duplicate ACK        | `ssthresh = max(flight/2, 2·mss)`, `cwnd = ssthresh + 3·mss` |
//! | further duplicate ACK    | `cwnd += mss` (fast recovery only)                      |
//! | ACK during fast recovery | `cwnd = ssthresh`, enter congestion avoidance           |
//! | RTO expiry               | `ssthresh = max(flight/2, 2·mss)`, `cwnd = loss window` |

use crate::config::{EngineConfig, MAX_WINDOW_SCALE};
use crate::state::CongestionPhase;

/// Congestion window, slow-start threshold and peer receive window.
#[derive(Debug, Clone)]
pub struct CongestionController {
    phase: CongestionPhase,
    cwnd: u32,
    ssthresh: u32,
    mss: u32,
    initial_window: u32,
    loss_window: u32,
    initial_segments: u32,
    loss_segments: u32,

    /// Peer receive window in bytes (already shifted by `scale_factor`).
    peer_window: u32,
    scale_factor: u8,
    /// Largest window the peer ever advertised.
    max_peer_window: u32,

    /// Bytes acknowledged since the last avoidance round began.
    round_acked: u32,
    /// Bytes `cwnd` grew by during the current avoidance round.
    round_increase: u32,
}

impl CongestionController {
    pub fn new(config: &EngineConfig) -> Self {
        let mss = u32::from(config.mss.max(1));
        let initial_segments = config.initial_window_segments.max(1);
        let loss_segments = config.loss_window_segments.max(1);
        let initial_window = mss.saturating_mul(initial_segments);
        let mut cc = Self {
            phase: CongestionPhase::SlowStart,
            cwnd: initial_window,
            ssthresh: config.initial_ssthresh,
            mss,
            initial_window,
            loss_window: mss.saturating_mul(loss_segments),
            initial_segments,
            loss_segments,
            peer_window: 0,
            scale_factor: config.peer_window_scale.min(MAX_WINDOW_SCALE),
            max_peer_window: 0,
            round_acked: 0,
            round_increase: 0,
        };
        cc.leave_slow_start_if_done();
        cc
    }

    pub fn phase(&self) -> CongestionPhase {
        self.phase
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn mss(&self) -> u32 {
        self.mss
    }

    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    pub fn max_peer_window(&self) -> u32 {
        self.max_peer_window
    }

    pub fn scale_factor(&self) -> u8 {
        self.scale_factor
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.phase == CongestionPhase::FastRecovery
    }

    /// Record a window advertisement.  Returns `true` if the window changed.
    pub fn update_peer_window(&mut self, raw: u16) -> bool {
        let window = u32::from(raw) << self.scale_factor;
        let changed = window != self.peer_window;
        self.peer_window = window;
        self.max_peer_window = self.max_peer_window.max(window);
        changed
    }

    /// Set the window from the peer's SYN, which is never scaled.
    pub fn set_peer_window(&mut self, bytes: u32) {
        self.peer_window = bytes;
        self.max_peer_window = self.max_peer_window.max(bytes);
    }

    /// Bytes that may be sent now: `min(cwnd, peer_window) - in_flight`,
    /// floored at zero.
    pub fn usable_window(&self, in_flight: u32) -> u32 {
        self.cwnd.min(self.peer_window).saturating_sub(in_flight)
    }

    /// An ACK advanced `send_unacked` by `newly_acked` bytes.
    pub fn on_ack(&mut self, newly_acked: u32) {
        if newly_acked == 0 {
            return;
        }
        match self.phase {
            CongestionPhase::FastRecovery => {
                // Deflate to the threshold picked when recovery started.
                self.cwnd = self.ssthresh;
                self.enter_avoidance();
            }
            CongestionPhase::SlowStart | CongestionPhase::LossRecovery => {
                self.cwnd = self.cwnd.saturating_add(newly_acked.min(self.mss));
                self.phase = CongestionPhase::SlowStart;
                self.leave_slow_start_if_done();
            }
            CongestionPhase::CongestionAvoidance => self.additive_increase(newly_acked),
        }
    }

    /// A duplicate ACK arrived; `dup_count` is the running count.
    ///
    /// Returns `true` exactly when the caller must fast-retransmit the
    /// segment at `send_unacked`.
    pub fn on_duplicate_ack(&mut self, dup_count: u32, flight_size: u32) -> bool {
        if self.phase == CongestionPhase::FastRecovery {
            self.cwnd = self.cwnd.saturating_add(self.mss);
            return false;
        }
        if dup_count != 3 {
            return false;
        }
        self.ssthresh = self.loss_threshold(flight_size);
        self.cwnd = self.ssthresh.saturating_add(3 * self.mss);
        self.phase = CongestionPhase::FastRecovery;
        log::debug!(
            "[cc] fast recovery: ssthresh={} cwnd={}",
            self.ssthresh,
            self.cwnd
        );
        true
    }

    /// The retransmission timer expired.
    ///
    /// `first_timeout` is `false` when the segment being retransmitted was
    /// already retransmitted by the timer; `ssthresh` is then held constant.
    pub fn on_rto(&mut self, flight_size: u32, first_timeout: bool) {
        if first_timeout {
            self.ssthresh = self.loss_threshold(flight_size);
        }
        self.cwnd = self.loss_window;
        self.phase = CongestionPhase::LossRecovery;
        self.round_acked = 0;
        self.round_increase = 0;
        log::debug!(
            "[cc] timeout: ssthresh={} cwnd={}",
            self.ssthresh,
            self.cwnd
        );
    }

    /// Restart window after an idle period (RFC 5681 §4.1).
    pub fn restart_after_idle(&mut self) {
        if self.cwnd > self.initial_window {
            log::debug!("[cc] idle restart: cwnd {} -> {}", self.cwnd, self.initial_window);
            self.cwnd = self.initial_window;
            if self.phase == CongestionPhase::CongestionAvoidance {
                self.phase = CongestionPhase::SlowStart;
                self.leave_slow_start_if_done();
            }
        }
    }

    /// Path-MTU feedback lowered the segment size.
    pub fn set_mss(&mut self, mss: u32) {
        let mss = mss.max(1);
        self.mss = mss;
        self.initial_window = mss.saturating_mul(self.initial_segments);
        self.loss_window = mss.saturating_mul(self.loss_segments);
        self.cwnd = self.cwnd.max(mss);
    }

    fn loss_threshold(&self, flight_size: u32) -> u32 {
        (flight_size / 2).max(2 * self.mss)
    }

    fn leave_slow_start_if_done(&mut self) {
        if self.phase == CongestionPhase::SlowStart && self.cwnd >= self.ssthresh {
            self.enter_avoidance();
        }
    }

    fn enter_avoidance(&mut self) {
        self.phase = CongestionPhase::CongestionAvoidance;
        self.round_acked = 0;
        self.round_increase = 0;
    }

    /// `cwnd += mss·mss/cwnd` per ACK, but never more than one `mss` per
    /// `cwnd` bytes acknowledged.
    fn additive_increase(&mut self, newly_acked: u32) {
        let step = (u64::from(self.mss) * u64::from(self.mss) / u64::from(self.cwnd.max(1))).max(1);
        let budget = self.mss.saturating_sub(self.round_increase);
        let step = (step as u32).min(budget);
        self.cwnd = self.cwnd.saturating_add(step);
        self.round_increase += step;

        self.round_acked = self.round_acked.saturating_add(newly_acked);
        if self.round_acked >= self.cwnd {
            self.round_acked -= self.cwnd;
            self.round_increase = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u32 = 1000;

    fn controller(ssthresh: u32) -> CongestionController {
        let cfg = EngineConfig {
            mss: MSS as u16,
            initial_window_segments: 1,
            initial_ssthresh: ssthresh,
            ..EngineConfig::default()
        };
        let mut cc = CongestionController::new(&cfg);
        cc.update_peer_window(u16::MAX);
        cc
    }

    #[test]
    fn slow_start_grows_by_at_most_mss_per_ack() {
        let mut cc = controller(u32::MAX);
        cc.on_ack(500);
        assert_eq!(cc.cwnd(), MSS + 500);
        cc.on_ack(5000);
        assert_eq!(cc.cwnd(), 2 * MSS + 500);
        assert_eq!(cc.phase(), CongestionPhase::SlowStart);
    }

    #[test]
    fn reaching_ssthresh_switches_to_avoidance() {
        let mut cc = controller(3 * MSS);
        cc.on_ack(MSS);
        cc.on_ack(MSS);
        assert_eq!(cc.cwnd(), 3 * MSS);
        assert_eq!(cc.phase(), CongestionPhase::CongestionAvoidance);
    }

    #[test]
    fn avoidance_grows_at_most_one_mss_per_window() {
        let mut cc = controller(4 * MSS);
        for _ in 0..3 {
            cc.on_ack(MSS);
        }
        assert_eq!(cc.phase(), CongestionPhase::CongestionAvoidance);
        let start = cc.cwnd();
        // One full window of ACKs, each covering a tenth of a segment.
        let mut acked = 0;
        while acked < start {
            cc.on_ack(MSS / 10);
            acked += MSS / 10;
        }
        let grown = cc.cwnd() - start;
        assert!(grown > 0);
        assert!(grown <= MSS, "grew {grown} in one round");
    }

    #[test]
    fn third_duplicate_ack_enters_fast_recovery() {
        let mut cc = controller(u32::MAX);
        let flight = 10 * MSS;
        assert!(!cc.on_duplicate_ack(1, flight));
        assert!(!cc.on_duplicate_ack(2, flight));
        assert!(cc.on_duplicate_ack(3, flight));
        assert_eq!(cc.ssthresh(), 5 * MSS);
        assert_eq!(cc.cwnd(), 8 * MSS);
        assert!(cc.in_fast_recovery());

        // Inflation, then deflation on new data.
        assert!(!cc.on_duplicate_ack(4, flight));
        assert_eq!(cc.cwnd(), 9 * MSS);
        cc.on_ack(MSS);
        assert_eq!(cc.cwnd(), 5 * MSS);
        assert_eq!(cc.phase(), CongestionPhase::CongestionAvoidance);
    }

    #[test]
    fn ssthresh_floor_is_two_segments() {
        let mut cc = controller(u32::MAX);
        assert!(cc.on_duplicate_ack(3, MSS));
        assert_eq!(cc.ssthresh(), 2 * MSS);
    }

    #[test]
    fn rto_collapses_window() {
        let mut cc = controller(u32::MAX);
        for _ in 0..7 {
            cc.on_ack(MSS);
        }
        cc.on_rto(8 * MSS, true);
        assert_eq!(cc.cwnd(), MSS);
        assert_eq!(cc.ssthresh(), 4 * MSS);
        assert_eq!(cc.phase(), CongestionPhase::LossRecovery);

        // A second timeout on the same data keeps ssthresh.
        cc.on_rto(MSS, false);
        assert_eq!(cc.ssthresh(), 4 * MSS);

        cc.on_ack(MSS);
        assert_eq!(cc.phase(), CongestionPhase::SlowStart);
        assert_eq!(cc.cwnd(), 2 * MSS);
    }

    #[test]
    fn usable_window_floors_at_zero() {
        let mut cc = controller(u32::MAX);
        assert_eq!(cc.usable_window(0), MSS);
        assert_eq!(cc.usable_window(MSS * 5), 0);
        cc.update_peer_window(300);
        assert_eq!(cc.usable_window(100), 200);
        cc.update_peer_window(0);
        assert_eq!(cc.usable_window(0), 0);
    }

    #[test]
    fn peer_window_is_scaled() {
        let cfg = EngineConfig {
            peer_window_scale: 7,
            ..EngineConfig::default()
        };
        let mut cc = CongestionController::new(&cfg);
        assert!(cc.update_peer_window(512));
        assert_eq!(cc.peer_window(), 512 << 7);
        assert!(!cc.update_peer_window(512));
    }

    #[test]
    fn idle_restart_shrinks_to_initial_window() {
        let mut cc = controller(u32::MAX);
        for _ in 0..5 {
            cc.on_ack(MSS);
        }
        cc.restart_after_idle();
        assert_eq!(cc.cwnd(), MSS);
    }
}
