//! Retransmission-timeout estimation and single-shot engine timers.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent if no
//! ACK arrives within a bounded time.  This module provides:
//! - [`RtoEstimator`]: smoothed RTT / RTT variance and the resulting RTO
//!   (RFC 6298), with exponential back-off on consecutive timeouts.
//! - [`Timer`]: a single-shot deadline guarded by an epoch counter, so a
//!   firing that raced with cancellation or re-arming is recognised as stale.
//!
//! RTO is computed as `RTO = SRTT + max(G, 4 × RTTVAR)`, clamped to
//! `[min_rto, max_rto]`, and doubles on each consecutive timeout.

use std::time::{Duration, Instant};

use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// RtoEstimator
// ---------------------------------------------------------------------------

/// RTT statistics of one connection.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    initial_rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    granularity: Duration,
    /// Current RTO, including any back-off.
    current_rto: Duration,
    /// Smoothed RTT estimate (SRTT).
    srtt: Option<Duration>,
    /// RTT variance estimate (RTTVAR).
    rttvar: Option<Duration>,
    /// Number of back-offs applied since the last fresh sample.
    backoffs: u32,
}

impl RtoEstimator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            initial_rto: config.initial_rto,
            min_rto: config.min_rto,
            max_rto: config.max_rto,
            granularity: config.clock_granularity,
            current_rto: config.initial_rto.clamp(config.min_rto, config.max_rto),
            srtt: None,
            rttvar: None,
            backoffs: 0,
        }
    }

    pub fn rto(&self) -> Duration {
        self.current_rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Option<Duration> {
        self.rttvar
    }

    pub fn backoffs(&self) -> u32 {
        self.backoffs
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    ///
    /// Callers must only pass samples of segments that were never
    /// retransmitted (Karn's algorithm).
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = Some(rttvar * 3 / 4 + diff / 4);
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
            _ => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }
        self.backoffs = 0;
        self.reset();
    }

    /// Double the RTO on retransmit timeout (exponential back-off, RFC 6298 §5.5).
    ///
    /// Capped at `max_rto` to prevent indefinite growth.
    pub fn back_off(&mut self) {
        self.backoffs = self.backoffs.saturating_add(1);
        self.current_rto = (self.current_rto * 2).min(self.max_rto);
    }

    /// Restore the RTO from the current SRTT / RTTVAR estimates.
    ///
    /// Falls back to `initial_rto` before the first RTT sample is available.
    pub fn reset(&mut self) {
        let rto = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => srtt + (rttvar * 4).max(self.granularity),
            _ => self.initial_rto,
        };
        self.current_rto = rto.clamp(self.min_rto, self.max_rto);
    }
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// The timers a send engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Retransmission timeout for the oldest unacknowledged segment.
    Retransmit,
    /// Zero-window probe.
    Persist,
}

/// Proof of a particular arming of a [`Timer`].
///
/// A token stays valid until the timer is fired, cancelled or re-armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    pub kind: TimerKind,
    epoch: u64,
}

/// An armed timer as seen by whoever schedules wake-ups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub token: TimerToken,
    pub deadline: Instant,
}

/// Single-shot timer with an epoch guard.
#[derive(Debug, Clone)]
pub struct Timer {
    kind: TimerKind,
    epoch: u64,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            epoch: 0,
            deadline: None,
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Arm (or re-arm) the timer.  Any earlier token becomes stale.
    pub fn arm(&mut self, deadline: Instant) -> TimerToken {
        self.epoch = self.epoch.wrapping_add(1);
        self.deadline = Some(deadline);
        TimerToken {
            kind: self.kind,
            epoch: self.epoch,
        }
    }

    /// Disarm the timer.  Any outstanding token becomes stale.
    pub fn cancel(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.deadline = None;
    }

    /// The pending firing, if armed.
    pub fn pending(&self) -> Option<TimerEvent> {
        self.deadline.map(|deadline| TimerEvent {
            token: TimerToken {
                kind: self.kind,
                epoch: self.epoch,
            },
            deadline,
        })
    }

    /// Consume a firing.
    ///
    /// Returns `true` only if `token` belongs to the current arming and the
    /// deadline has passed; the timer is then disarmed.  Stale or early
    /// firings return `false` and change nothing.
    pub fn fire(&mut self, token: TimerToken, now: Instant) -> bool {
        if token.kind != self.kind || token.epoch != self.epoch {
            return false;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> RtoEstimator {
        RtoEstimator::new(&EngineConfig::default())
    }

    #[test]
    fn initial_rto_before_samples() {
        let est = estimator();
        assert_eq!(est.rto(), Duration::from_secs(1));
        assert!(est.srtt().is_none());
    }

    #[test]
    fn first_sample_sets_srtt_and_rttvar() {
        let mut est = estimator();
        est.record_rtt_sample(Duration::from_millis(100));
        assert_eq!(est.srtt(), Some(Duration::from_millis(100)));
        assert_eq!(est.rttvar(), Some(Duration::from_millis(50)));
        // 100 + 4·50 = 300 ms
        assert_eq!(est.rto(), Duration::from_millis(300));
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut est = estimator();
        est.record_rtt_sample(Duration::from_millis(100));
        est.record_rtt_sample(Duration::from_millis(200));
        // RTTVAR = 3/4·50 + 1/4·100 = 62.5; SRTT = 7/8·100 + 1/8·200 = 112.5
        assert_eq!(est.srtt(), Some(Duration::from_micros(112_500)));
        assert_eq!(est.rttvar(), Some(Duration::from_micros(62_500)));
        assert_eq!(est.rto(), Duration::from_micros(362_500));
    }

    #[test]
    fn rto_respects_minimum() {
        let mut est = estimator();
        est.record_rtt_sample(Duration::from_millis(1));
        assert_eq!(est.rto(), Duration::from_millis(200));
    }

    #[test]
    fn back_off_doubles_up_to_max() {
        let mut est = estimator();
        est.back_off();
        assert_eq!(est.rto(), Duration::from_secs(2));
        for _ in 0..10 {
            est.back_off();
        }
        assert_eq!(est.rto(), Duration::from_secs(60));
        est.record_rtt_sample(Duration::from_millis(100));
        assert_eq!(est.backoffs(), 0);
        assert_eq!(est.rto(), Duration::from_millis(300));
    }

    #[test]
    fn stale_token_does_not_fire() {
        let now = Instant::now();
        let mut timer = Timer::new(TimerKind::Retransmit);
        let old = timer.arm(now + Duration::from_millis(10));
        let fresh = timer.arm(now + Duration::from_millis(20));
        let later = now + Duration::from_millis(30);
        assert!(!timer.fire(old, later));
        assert!(timer.fire(fresh, later));
        assert!(!timer.is_armed());
        // Already consumed.
        assert!(!timer.fire(fresh, later));
    }

    #[test]
    fn cancel_invalidates_token() {
        let now = Instant::now();
        let mut timer = Timer::new(TimerKind::Persist);
        let token = timer.arm(now);
        timer.cancel();
        assert!(!timer.fire(token, now));
        assert!(timer.pending().is_none());
    }

    #[test]
    fn early_firing_is_ignored() {
        let now = Instant::now();
        let mut timer = Timer::new(TimerKind::Retransmit);
        let token = timer.arm(now + Duration::from_secs(1));
        assert!(!timer.fire(token, now));
        assert!(timer.is_armed());
        assert_eq!(timer.pending().map(|e| e.token), Some(token));
    }

    #[test]
    fn tokens_of_other_kind_are_rejected() {
        let now = Instant::now();
        let mut rtx = Timer::new(TimerKind::Retransmit);
        let mut persist = Timer::new(TimerKind::Persist);
        rtx.arm(now);
        let token = persist.arm(now);
        assert!(!rtx.fire(token, now));
    }
}
