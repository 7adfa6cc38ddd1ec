//! Retransmission tracking for one connection.
//!
//! [`RetransmitQueue`] keeps one [`RetransmitEntry`] per transmitted, not yet
//! acknowledged segment.  Entries are ordered by sequence number (front =
//! oldest), so the "segment at `send_unacked`" is always the front entry.
//!
//! # Protocol contract
//!
//! - Entries are created when a segment is first transmitted and removed
//!   when a cumulative ACK covers them entirely.  A cumulative ACK that ends
//!   inside an entry trims it from the left; nothing else splits an entry.
//! - SACK blocks mark entries as selectively acknowledged.  Such entries stay
//!   queued (the cumulative ACK still has to cover them) but are skipped by
//!   fast retransmission.  A timeout clears every mark (the peer may renege).
//! - The queue owns the retransmission timer and the RTT estimator.  An
//!   ACK covering any retransmitted byte yields no send-time RTT sample
//!   (Karn's algorithm); only a timestamp echo can measure it.
//!
//! This module only manages state; building and transmitting segments is the
//! caller's responsibility.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::seq::{seq_distance, seq_ge, seq_gt, seq_le, seq_lt};
use crate::timer::{RtoEstimator, Timer, TimerEvent, TimerKind, TimerToken};

// ---------------------------------------------------------------------------
// RetransmitEntry
// ---------------------------------------------------------------------------

/// A segment that has been sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitEntry {
    /// First sequence number covered.
    pub seq_start: u32,
    /// One past the last sequence number covered (includes the FIN).
    pub seq_end: u32,
    /// The segment carried FIN, which occupies the last sequence number.
    pub fin: bool,
    /// Wall-clock time of the most recent transmission.
    pub send_timestamp: Instant,
    /// Retransmissions so far (0 = sent once).
    pub retransmit_count: u32,
    /// Covered by a SACK block from the peer.
    pub sacked: bool,
}

impl RetransmitEntry {
    /// Sequence space occupied, FIN included.
    pub fn seq_len(&self) -> u32 {
        seq_distance(self.seq_start, self.seq_end)
    }

    /// Payload bytes carried, FIN excluded.
    pub fn payload_len(&self) -> u32 {
        self.seq_len() - u32::from(self.fin)
    }
}

/// Result of feeding one acknowledgement to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Entries fully acknowledged and removed.
    pub removed: usize,
    /// Karn-compliant RTT sample taken from this ACK.
    pub rtt_sample: Option<Duration>,
    /// Bytes newly marked as selectively acknowledged.
    pub newly_sacked: u32,
    /// SACK blocks discarded as bogus.
    pub rejected_blocks: usize,
}

/// A retransmission-timer expiry that was acted upon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtoExpiry {
    /// The front entry after it was marked retransmitted.
    pub entry: RetransmitEntry,
    /// Consecutive timeouts without an intervening RTT sample.
    pub consecutive: u32,
}

impl RtoExpiry {
    /// `true` for the first timeout of a loss episode.
    pub fn is_first(&self) -> bool {
        self.consecutive == 1
    }
}

// ---------------------------------------------------------------------------
// RetransmitQueue
// ---------------------------------------------------------------------------

/// Retransmit queue, RTO timer and duplicate-ACK counter for one connection.
#[derive(Debug)]
pub struct RetransmitQueue {
    /// Outstanding entries ordered by sequence number (front = oldest).
    entries: VecDeque<RetransmitEntry>,
    estimator: RtoEstimator,
    timer: Timer,
    dup_acks: u32,
    /// Consecutive RTO expiries since the last forward progress.
    timeouts: u32,
}

impl RetransmitQueue {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            estimator: RtoEstimator::new(config),
            timer: Timer::new(TimerKind::Retransmit),
            dup_acks: 0,
            timeouts: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn rto(&self) -> Duration {
        self.estimator.rto()
    }

    pub fn estimator(&self) -> &RtoEstimator {
        &self.estimator
    }

    pub fn timer(&self) -> Option<TimerEvent> {
        self.timer.pending()
    }

    pub fn duplicate_acks(&self) -> u32 {
        self.dup_acks
    }

    /// Bytes covered by SACK marks.
    pub fn sacked_bytes(&self) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.sacked)
            .map(RetransmitEntry::seq_len)
            .sum()
    }

    /// Record the first transmission of `[seq_start, seq_end)`.
    ///
    /// Arms the retransmission timer if it is not already running.
    pub fn on_segment_sent(&mut self, seq_start: u32, seq_end: u32, fin: bool, now: Instant) {
        debug_assert!(
            self.entries.back().map_or(true, |e| seq_le(e.seq_end, seq_start)),
            "segments must be recorded in sequence order"
        );
        self.entries.push_back(RetransmitEntry {
            seq_start,
            seq_end,
            fin,
            send_timestamp: now,
            retransmit_count: 0,
            sacked: false,
        });
        if !self.timer.is_armed() {
            self.timer.arm(now + self.estimator.rto());
        }
    }

    /// Mark the entry starting at `seq_start` as retransmitted now.
    pub fn mark_retransmitted(&mut self, seq_start: u32, now: Instant) -> Option<&RetransmitEntry> {
        let i = self.position(seq_start)?;
        let entry = &mut self.entries[i];
        entry.retransmit_count += 1;
        entry.send_timestamp = now;
        if !self.timer.is_armed() {
            self.timer.arm(now + self.estimator.rto());
        }
        Some(&self.entries[i])
    }

    /// The front entry went out again as a zero-window probe.
    ///
    /// Leaves the timer alone; the persist timer owns the connection now.
    pub fn mark_probed(&mut self) {
        if let Some(front) = self.entries.front_mut() {
            front.retransmit_count += 1;
        }
    }

    /// Stop the retransmission timer while the peer window is closed.
    ///
    /// The consecutive-timeout count starts over; a live peer that keeps
    /// answering probes is never counted against the retransmit limit.
    pub fn suspend(&mut self) {
        self.timer.cancel();
        self.timeouts = 0;
    }

    /// Arm the retransmission timer if data is outstanding and it is idle.
    pub fn ensure_timer(&mut self, now: Instant) {
        if !self.entries.is_empty() && !self.timer.is_armed() {
            self.timer.arm(now + self.estimator.rto());
        }
    }

    /// First entry not covered by SACK, for fast retransmission.
    pub fn fast_retransmit_candidate(&self) -> Option<&RetransmitEntry> {
        self.entries.iter().find(|e| !e.sacked)
    }

    /// Count one more duplicate ACK and return the running total.
    pub fn record_duplicate_ack(&mut self) -> u32 {
        self.dup_acks = self.dup_acks.saturating_add(1);
        self.dup_acks
    }

    /// Process an acknowledgement.
    ///
    /// `unacked` is `send_unacked` before this ACK and `ack` must satisfy
    /// `unacked <= ack <= send_max` (the caller validates that).
    /// `echo_rtt` is an RTT measured through the timestamp option, preferred
    /// over the entry's send time when the entry qualifies under Karn.
    pub fn on_ack(
        &mut self,
        unacked: u32,
        ack: u32,
        sack_ranges: &[(u32, u32)],
        echo_rtt: Option<Duration>,
        now: Instant,
    ) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        if seq_gt(ack, unacked) {
            self.dup_acks = 0;
            self.timeouts = 0;

            // The ACK may have been triggered by a retransmission of any
            // byte it covers.
            let mut ambiguous = false;
            let mut newest_acked: Option<RetransmitEntry> = None;
            while let Some(front) = self.entries.front() {
                if seq_le(front.seq_end, ack) {
                    ambiguous |= front.retransmit_count > 0;
                    newest_acked = self.entries.pop_front();
                    outcome.removed += 1;
                } else {
                    break;
                }
            }
            if let Some(front) = self.entries.front_mut() {
                if seq_lt(front.seq_start, ack) {
                    ambiguous |= front.retransmit_count > 0;
                    front.seq_start = ack;
                }
            }

            let sample = newest_acked.as_ref().and_then(|e| {
                if ambiguous {
                    echo_rtt
                } else {
                    compute_rtt_sample(e, echo_rtt, now)
                }
            });
            if let Some(sample) = sample {
                self.estimator.record_rtt_sample(sample);
                outcome.rtt_sample = Some(sample);
            }

            // RFC 6298 §5.2/5.3: stop when idle, otherwise restart.
            if self.entries.is_empty() {
                self.timer.cancel();
            } else {
                self.timer.arm(now + self.estimator.rto());
            }
        }

        for &(left, right) in sack_ranges {
            match self.mark_sacked(ack, left, right) {
                Some(bytes) => outcome.newly_sacked += bytes,
                None => outcome.rejected_blocks += 1,
            }
        }
        outcome
    }

    /// Handle a retransmission-timer firing.
    ///
    /// Returns `None` for stale or early firings and when nothing is
    /// outstanding.  Otherwise backs the RTO off, clears SACK marks, marks
    /// the front entry retransmitted and re-arms the timer.
    pub fn on_rto_fire(&mut self, token: TimerToken, now: Instant) -> Option<RtoExpiry> {
        if !self.timer.fire(token, now) {
            return None;
        }
        if self.entries.is_empty() {
            return None;
        }

        self.estimator.back_off();
        self.timeouts = self.timeouts.saturating_add(1);
        self.dup_acks = 0;
        for entry in self.entries.iter_mut() {
            entry.sacked = false;
        }

        let front = self.entries.front_mut()?;
        front.retransmit_count += 1;
        front.send_timestamp = now;
        let entry = front.clone();
        self.timer.arm(now + self.estimator.rto());

        log::debug!(
            "[rtx] timeout #{}: seq={} len={} rto={:?}",
            self.timeouts,
            entry.seq_start,
            entry.seq_len(),
            self.estimator.rto()
        );
        Some(RtoExpiry {
            entry,
            consecutive: self.timeouts,
        })
    }

    /// Disarm the retransmission timer.
    pub fn cancel_timer(&mut self) {
        self.timer.cancel();
    }

    /// Mark entries inside `[left, right)` as selectively acknowledged.
    ///
    /// Returns the newly marked bytes, or `None` for a bogus block (empty,
    /// not beyond the cumulative ACK, or beyond anything sent).
    fn mark_sacked(&mut self, ack: u32, left: u32, right: u32) -> Option<u32> {
        let highest = self.entries.back().map(|e| e.seq_end)?;
        if !seq_lt(left, right) || !seq_gt(left, ack) || seq_gt(right, highest) {
            log::trace!("[rtx] dropping SACK block [{left}, {right})");
            return None;
        }
        let mut marked = 0;
        for entry in self.entries.iter_mut() {
            if seq_ge(entry.seq_start, right) {
                break;
            }
            if !entry.sacked && seq_ge(entry.seq_start, left) && seq_le(entry.seq_end, right) {
                entry.sacked = true;
                marked += entry.seq_len();
            }
        }
        Some(marked)
    }

    fn position(&self, seq_start: u32) -> Option<usize> {
        let base = self.entries.front()?.seq_start;
        let key = seq_distance(base, seq_start);
        let i = self
            .entries
            .partition_point(|e| seq_distance(base, e.seq_start) < key);
        (i < self.entries.len() && self.entries[i].seq_start == seq_start).then_some(i)
    }
}

/// RTT sample for an acknowledged entry, or `None` if Karn's algorithm
/// forbids one.
pub fn compute_rtt_sample(
    entry: &RetransmitEntry,
    echo_rtt: Option<Duration>,
    now: Instant,
) -> Option<Duration> {
    if entry.retransmit_count != 0 {
        return None;
    }
    Some(echo_rtt.unwrap_or_else(|| now.saturating_duration_since(entry.send_timestamp)))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> RetransmitQueue {
        RetransmitQueue::new(&EngineConfig::default())
    }

    fn fill(q: &mut RetransmitQueue, start: u32, count: u32, len: u32, now: Instant) {
        for i in 0..count {
            let s = start.wrapping_add(i * len);
            q.on_segment_sent(s, s.wrapping_add(len), false, now);
        }
    }

    #[test]
    fn first_send_arms_timer() {
        let now = Instant::now();
        let mut q = queue();
        assert!(q.timer().is_none());
        fill(&mut q, 0, 1, 100, now);
        let ev = q.timer().unwrap();
        assert_eq!(ev.deadline, now + Duration::from_secs(1));
        // A second segment does not push the deadline out.
        fill(&mut q, 100, 1, 100, now + Duration::from_millis(5));
        assert_eq!(q.timer().unwrap().deadline, ev.deadline);
    }

    #[test]
    fn cumulative_ack_removes_and_samples() {
        let t0 = Instant::now();
        let mut q = queue();
        fill(&mut q, 0, 3, 100, t0);
        let out = q.on_ack(0, 200, &[], None, t0 + Duration::from_millis(40));
        assert_eq!(out.removed, 2);
        assert_eq!(out.rtt_sample, Some(Duration::from_millis(40)));
        assert_eq!(q.entries.front().unwrap().seq_start, 200);
        assert!(q.timer().is_some());

        let out = q.on_ack(200, 300, &[], None, t0 + Duration::from_millis(50));
        assert_eq!(out.removed, 1);
        assert!(q.is_empty());
        assert!(q.timer().is_none());
    }

    #[test]
    fn partial_ack_trims_front_entry() {
        let now = Instant::now();
        let mut q = queue();
        fill(&mut q, 0, 1, 100, now);
        let out = q.on_ack(0, 60, &[], None, now);
        assert_eq!(out.removed, 0);
        let front = q.entries.front().unwrap();
        assert_eq!((front.seq_start, front.seq_end), (60, 100));
    }

    #[test]
    fn karn_excludes_retransmitted_entries() {
        let t0 = Instant::now();
        let mut q = queue();
        fill(&mut q, 0, 1, 100, t0);
        q.mark_retransmitted(0, t0 + Duration::from_millis(10));
        let out = q.on_ack(0, 100, &[], None, t0 + Duration::from_millis(30));
        assert_eq!(out.removed, 1);
        assert_eq!(out.rtt_sample, None);
    }

    #[test]
    fn cumulative_ack_over_retransmission_is_not_sampled() {
        let t0 = Instant::now();
        let mut q = queue();
        fill(&mut q, 0, 3, 100, t0);
        q.mark_retransmitted(0, t0 + Duration::from_secs(1));

        // The newest entry was sent once, but the ACK may stem from the resend.
        let out = q.on_ack(0, 300, &[], None, t0 + Duration::from_millis(1050));
        assert_eq!(out.removed, 3);
        assert_eq!(out.rtt_sample, None);
        assert_eq!(q.estimator().srtt(), None);
    }

    #[test]
    fn retransmitted_ack_is_sampled_through_timestamp_echo() {
        let t0 = Instant::now();
        let mut q = queue();
        fill(&mut q, 0, 2, 100, t0);
        q.mark_retransmitted(0, t0 + Duration::from_secs(1));
        let out = q.on_ack(
            0,
            200,
            &[],
            Some(Duration::from_millis(30)),
            t0 + Duration::from_millis(1030),
        );
        assert_eq!(out.rtt_sample, Some(Duration::from_millis(30)));
    }

    #[test]
    fn ack_covering_probed_byte_is_ambiguous() {
        let t0 = Instant::now();
        let mut q = queue();
        fill(&mut q, 0, 2, 100, t0);
        q.mark_probed();
        let out = q.on_ack(0, 100, &[], None, t0 + Duration::from_millis(20));
        assert_eq!(out.rtt_sample, None);
    }

    #[test]
    fn suspend_cancels_timer_and_timeout_count() {
        let t0 = Instant::now();
        let mut q = queue();
        fill(&mut q, 0, 1, 100, t0);
        let token = q.timer().unwrap().token;
        assert_eq!(q.on_rto_fire(token, t0 + Duration::from_secs(1)).unwrap().consecutive, 1);

        q.suspend();
        assert!(q.timer().is_none());
        q.ensure_timer(t0 + Duration::from_secs(5));
        let token = q.timer().unwrap().token;
        let expiry = q.on_rto_fire(token, t0 + Duration::from_secs(10)).unwrap();
        assert!(expiry.is_first());
    }

    #[test]
    fn timestamp_echo_is_preferred() {
        let t0 = Instant::now();
        let mut q = queue();
        fill(&mut q, 0, 1, 100, t0);
        let out = q.on_ack(
            0,
            100,
            &[],
            Some(Duration::from_millis(7)),
            t0 + Duration::from_millis(30),
        );
        assert_eq!(out.rtt_sample, Some(Duration::from_millis(7)));
    }

    #[test]
    fn sack_marks_entries_and_skips_them() {
        let now = Instant::now();
        let mut q = queue();
        fill(&mut q, 0, 4, 100, now);
        let out = q.on_ack(0, 0, &[(100, 300)], None, now);
        assert_eq!(out.newly_sacked, 200);
        assert_eq!(q.sacked_bytes(), 200);
        assert_eq!(q.fast_retransmit_candidate().unwrap().seq_start, 0);
        assert_eq!(q.entries.len(), 4);

        // The same block again marks nothing new.
        let out = q.on_ack(0, 0, &[(100, 300)], None, now);
        assert_eq!(out.newly_sacked, 0);
    }

    #[test]
    fn bogus_sack_blocks_are_rejected() {
        let now = Instant::now();
        let mut q = queue();
        fill(&mut q, 1000, 2, 100, now);
        let blocks = [(1150, 1100), (900, 1100), (1100, 5000), (1000, 1100)];
        let out = q.on_ack(1000, 1000, &blocks, None, now);
        assert_eq!(out.rejected_blocks, 4);
        assert_eq!(q.sacked_bytes(), 0);
    }

    #[test]
    fn rto_fire_backs_off_and_retransmits_front() {
        let t0 = Instant::now();
        let mut q = queue();
        fill(&mut q, 0, 2, 100, t0);
        q.on_ack(0, 0, &[(100, 200)], None, t0);
        let token = q.timer().unwrap().token;

        let fire_at = t0 + Duration::from_secs(1);
        let expiry = q.on_rto_fire(token, fire_at).unwrap();
        assert!(expiry.is_first());
        assert_eq!(expiry.entry.seq_start, 0);
        assert_eq!(expiry.entry.retransmit_count, 1);
        assert_eq!(q.rto(), Duration::from_secs(2));
        assert_eq!(q.sacked_bytes(), 0, "timeout clears SACK marks");
        assert_eq!(q.timer().unwrap().deadline, fire_at + Duration::from_secs(2));

        // The consumed token cannot fire again.
        assert!(q.on_rto_fire(token, fire_at).is_none());
    }

    #[test]
    fn lookup_survives_sequence_wrap() {
        let now = Instant::now();
        let mut q = queue();
        let start = u32::MAX - 150;
        fill(&mut q, start, 3, 100, now);
        let third = start.wrapping_add(200);
        assert_eq!(q.position(third), Some(2));
        assert_eq!(q.position(third.wrapping_add(1)), None);
        let out = q.on_ack(start, start.wrapping_add(200), &[], None, now);
        assert_eq!(out.removed, 2);
        assert_eq!(q.entries.front().unwrap().seq_start, third);
    }

    #[test]
    fn fin_entry_lengths() {
        let now = Instant::now();
        let mut q = queue();
        q.on_segment_sent(0, 11, true, now);
        let e = q.entries.front().unwrap();
        assert_eq!(e.seq_len(), 11);
        assert_eq!(e.payload_len(), 10);
    }
}
