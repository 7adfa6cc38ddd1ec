//! Connection send state and the output driver.
//!
//! [`SendEngine`] owns everything the send side of one connection needs:
//! the send buffer, congestion controller, segmenter, retransmit queue and
//! the persist timer.  Every entry point takes the current time, mutates
//! the state and returns the segments to hand to the link.  The engine never
//! transmits anything itself, so it can be driven under a lock without
//! calling out of it (see [`crate::connection`]).
//!
//! # Sequence-number layout
//!
//! ```text
//!  send_unacked        send_next  send_max         buffer end
//!      │                   │         │                  │
//!  ────┼───────────────────┼─────────┼──────────────────┼──▶ seq space
//!      │ <── in flight ──▶ │  probe  │ <──── unsent ───▶│
//! ```
//!
//! `send_max` only runs ahead of `send_next` while a zero-window probe byte
//! is outstanding.  A sent FIN occupies one sequence number past the buffer
//! end.
//!
//! When the peer closes its window with data still in flight, the
//! retransmission timer is suspended and the persist timer probes with the
//! byte at `send_unacked` until the window opens again.
//!
//! # Entry points
//!
//! | Call                   | Trigger                                   |
//! |------------------------|-------------------------------------------|
//! | [`SendEngine::queue_data`] + [`SendEngine::output`] | new application data |
//! | [`SendEngine::report_ack`]    | ACK / SACK / window update from the receive path |
//! | [`SendEngine::on_timer`]      | retransmission or persist timer fired |
//! | [`SendEngine::request_close`] | application finished writing       |

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::builder::{OutgoingSegment, ReceiveState, SegmentBuilder};
use crate::config::EngineConfig;
use crate::congestion::CongestionController;
use crate::error::{BufferError, EngineError};
use crate::packet::{flags, SegmentDescriptor};
use crate::retransmit::RetransmitQueue;
use crate::segmenter::{Pending, Segmenter};
use crate::send_buffer::SendBuffer;
use crate::seq::{seq_distance, seq_gt, seq_le, seq_lt, seq_max};
use crate::state::{CongestionPhase, DriverState};
use crate::stats::GlobalStats;
use crate::timer::{Timer, TimerEvent, TimerKind, TimerToken};

/// Largest persist back-off exponent.
const MAX_PERSIST_SHIFT: u32 = 12;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Port pair identifying a connection in logs and headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectionId {
    pub local_port: u16,
    pub remote_port: u16,
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.local_port, self.remote_port)
    }
}

/// Observability snapshot of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub rto: Duration,
    pub srtt: Option<Duration>,
    /// `send_next - send_unacked`.
    pub in_flight: u32,
    pub send_unacked: u32,
    pub send_next: u32,
    pub send_max: u32,
    pub peer_window: u32,
    pub mss: u32,
    pub phase: CongestionPhase,
    pub state: DriverState,
    pub duplicate_acks: u32,
    /// Bytes covered by the peer's SACK blocks.
    pub sacked: u32,
    /// Bytes held by the send buffer (in flight plus unsent).
    pub buffered: usize,
    pub segments_sent: u64,
    pub retransmits: u64,
    pub fast_retransmits: u64,
    pub timeouts: u64,
    pub window_probes: u64,
}

impl std::fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "state={} phase={} cwnd={} ssthresh={} rto={:?} in_flight={} una={} nxt={} wnd={}",
            self.state,
            self.phase,
            self.cwnd,
            self.ssthresh,
            self.rto,
            self.in_flight,
            self.send_unacked,
            self.send_next,
            self.peer_window
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    segments_sent: u64,
    retransmits: u64,
    fast_retransmits: u64,
    timeouts: u64,
    window_probes: u64,
}

// ---------------------------------------------------------------------------
// SendEngine
// ---------------------------------------------------------------------------

/// Send side of one TCP connection.
#[derive(Debug)]
pub struct SendEngine {
    config: EngineConfig,
    id: ConnectionId,
    stats: Arc<GlobalStats>,

    buffer: SendBuffer,
    cc: CongestionController,
    segmenter: Segmenter,
    rtx: RetransmitQueue,
    builder: SegmentBuilder,
    receive: ReceiveState,

    /// Oldest sequence number not yet acknowledged.
    send_unacked: u32,
    /// Next sequence number to send.
    send_next: u32,
    /// Highest sequence number ever sent, plus one.
    send_max: u32,
    /// Last window field seen from the peer, unscaled.
    last_window_raw: u16,

    fin_queued: bool,
    fin_sent: bool,
    fin_acked: bool,
    /// End of urgent data, cleared once acknowledged.
    urgent_seq: Option<u32>,

    state: DriverState,
    persist: Timer,
    persist_shift: u32,
    last_send: Option<Instant>,
    counters: Counters,
    reset: bool,
}

impl SendEngine {
    /// Create the send side of an established connection.
    ///
    /// `iss` is the first sequence number of application data.
    /// `peer_window` is the window (in bytes) the peer advertised in its SYN.
    pub fn new(
        config: EngineConfig,
        id: ConnectionId,
        iss: u32,
        peer_window: u32,
        now: Instant,
    ) -> Self {
        let config = config.normalized();
        let mut cc = CongestionController::new(&config);
        cc.set_peer_window(peer_window);
        let last_window_raw = (peer_window >> config.peer_window_scale).min(u32::from(u16::MAX)) as u16;
        Self {
            buffer: SendBuffer::new(iss, config.send_buffer_capacity),
            segmenter: Segmenter::new(u32::from(config.mss), config.nagle),
            rtx: RetransmitQueue::new(&config),
            builder: SegmentBuilder::new(&config, id.local_port, id.remote_port, now),
            receive: ReceiveState::default(),
            cc,
            id,
            stats: Arc::new(GlobalStats::new()),
            send_unacked: iss,
            send_next: iss,
            send_max: iss,
            last_window_raw,
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            urgent_seq: None,
            state: DriverState::Idle,
            persist: Timer::new(TimerKind::Persist),
            persist_shift: 0,
            last_send: None,
            counters: Counters::default(),
            reset: false,
            config,
        }
    }

    /// Report into a shared set of process-wide counters.
    pub fn with_stats(mut self, stats: Arc<GlobalStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// `true` once the FIN was acknowledged.
    pub fn is_finished(&self) -> bool {
        self.fin_acked
    }

    /// Free space in the send buffer (backpressure query).
    pub fn send_capacity(&self) -> usize {
        if self.reset || self.fin_queued {
            0
        } else {
            self.buffer.free_space()
        }
    }

    // -----------------------------------------------------------------------
    // Application side
    // -----------------------------------------------------------------------

    /// Append application data.
    ///
    /// Returns how many bytes were accepted.  Call [`output`](Self::output)
    /// afterwards to send them.
    pub fn queue_data(&mut self, bytes: &[u8]) -> Result<usize, EngineError> {
        self.ensure_usable()?;
        if self.fin_queued {
            return Err(EngineError::Closed);
        }
        Ok(self.buffer.append(bytes)?)
    }

    /// Append urgent data; the urgent mark moves to its end.
    pub fn queue_urgent(&mut self, bytes: &[u8]) -> Result<usize, EngineError> {
        let n = self.queue_data(bytes)?;
        if n > 0 {
            self.urgent_seq = Some(self.buffer.end_seq());
            log::debug!("[engine] {}: urgent mark at {}", self.id, self.buffer.end_seq());
        }
        Ok(n)
    }

    /// Queue a FIN after all data queued so far.
    pub fn request_close(&mut self) {
        if !self.fin_queued && !self.reset {
            log::debug!("[engine] {}: close requested, {} bytes pending", self.id, self.buffer.len());
            self.fin_queued = true;
        }
    }

    /// Run the output driver: send whatever the windows allow.
    pub fn output(&mut self, now: Instant) -> Result<Vec<SegmentDescriptor>, EngineError> {
        self.ensure_usable()?;
        let result = self.drive(now);
        self.settle(result)
    }

    // -----------------------------------------------------------------------
    // Receive-path callbacks
    // -----------------------------------------------------------------------

    /// Process an acknowledgement from the peer.
    ///
    /// Stale ACKs (behind `send_unacked`) and ACKs for data never sent are
    /// dropped without touching the state.  Bogus SACK blocks are discarded.
    pub fn report_ack(
        &mut self,
        ack: u32,
        window: u16,
        sack_ranges: &[(u32, u32)],
        timestamp_echo: Option<u32>,
        now: Instant,
    ) -> Result<Vec<SegmentDescriptor>, EngineError> {
        self.ensure_usable()?;
        let result = self.process_ack(ack, window, sack_ranges, timestamp_echo, now);
        self.settle(result)
    }

    /// The receive path saw the peer acknowledge our FIN.
    pub fn report_fin_acked(&mut self, now: Instant) -> Result<(), EngineError> {
        self.ensure_usable()?;
        if self.fin_acked {
            return Ok(());
        }
        let Some(fin_seq) = self.fin_seq() else {
            log::debug!("[engine] {}: FIN ack before FIN was sent, ignored", self.id);
            return Ok(());
        };
        let window = self.last_window_raw;
        self.report_ack(fin_seq.wrapping_add(1), window, &[], None, now)
            .map(|_| ())
    }

    /// Receive-side state echoed in every outgoing header.
    pub fn update_receive_state(
        &mut self,
        receive_next: u32,
        receive_window: u32,
        ts_recent: Option<u32>,
        sack_blocks: Vec<(u32, u32)>,
    ) {
        self.receive = ReceiveState {
            receive_next: Some(receive_next),
            receive_window,
            ts_recent,
            sack_blocks,
        };
    }

    /// Path-MTU feedback.  Affects segments created from now on.
    pub fn update_mss(&mut self, mss: u16) {
        let mss = u32::from(mss.clamp(1, self.config.mss));
        if mss == self.cc.mss() {
            return;
        }
        log::debug!("[engine] {}: mss {} -> {}", self.id, self.cc.mss(), mss);
        self.cc.set_mss(mss);
        self.segmenter.set_mss(mss);
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// The earliest armed timer, if any.
    pub fn next_timer(&self) -> Option<TimerEvent> {
        if self.reset {
            return None;
        }
        [self.rtx.timer(), self.persist.pending()]
            .into_iter()
            .flatten()
            .min_by_key(|event| event.deadline)
    }

    /// A timer fired.  Stale or early tokens are ignored.
    pub fn on_timer(
        &mut self,
        token: TimerToken,
        now: Instant,
    ) -> Result<Vec<SegmentDescriptor>, EngineError> {
        self.ensure_usable()?;
        let result = match token.kind {
            TimerKind::Retransmit => self.on_retransmit_timeout(token, now),
            TimerKind::Persist => self.on_persist_timeout(token, now),
        };
        self.settle(result)
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            cwnd: self.cc.cwnd(),
            ssthresh: self.cc.ssthresh(),
            rto: self.rtx.rto(),
            srtt: self.rtx.estimator().srtt(),
            in_flight: self.flight_size(),
            send_unacked: self.send_unacked,
            send_next: self.send_next,
            send_max: self.send_max,
            peer_window: self.cc.peer_window(),
            mss: self.cc.mss(),
            phase: self.cc.phase(),
            state: self.state,
            duplicate_acks: self.rtx.duplicate_acks(),
            sacked: self.rtx.sacked_bytes(),
            buffered: self.buffer.len(),
            segments_sent: self.counters.segments_sent,
            retransmits: self.counters.retransmits,
            fast_retransmits: self.counters.fast_retransmits,
            timeouts: self.counters.timeouts,
            window_probes: self.counters.window_probes,
        }
    }

    /// Verify the sequence-space invariants.
    pub fn check_invariants(&self) -> Result<(), EngineError> {
        if seq_gt(self.send_unacked, self.send_next) {
            return Err(EngineError::Invariant(format!(
                "send_unacked {} beyond send_next {}",
                self.send_unacked, self.send_next
            )));
        }
        if seq_gt(self.send_next, self.send_max) {
            return Err(EngineError::Invariant(format!(
                "send_next {} beyond send_max {}",
                self.send_next, self.send_max
            )));
        }
        let fin_in_flight = u32::from(self.fin_sent && !self.fin_acked);
        let held = self.buffer.len() as u32 + fin_in_flight;
        if seq_distance(self.send_unacked, self.send_next) > held {
            return Err(EngineError::Invariant(format!(
                "send_next {} beyond buffered data ({} bytes from {})",
                self.send_next, held, self.send_unacked
            )));
        }
        let data_unacked = if self.fin_acked {
            self.send_unacked.wrapping_sub(1)
        } else {
            self.send_unacked
        };
        if self.buffer.base_seq() != data_unacked {
            return Err(EngineError::Invariant(format!(
                "send buffer starts at {}, send_unacked is {}",
                self.buffer.base_seq(),
                self.send_unacked
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_usable(&self) -> Result<(), EngineError> {
        if self.reset {
            Err(EngineError::Reset)
        } else {
            Ok(())
        }
    }

    /// Check invariants after a mutation; fatal errors reset the engine.
    fn settle<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        let result = result.and_then(|value| self.check_invariants().map(|()| value));
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail(e);
            }
        }
        result
    }

    fn fail(&mut self, err: &EngineError) {
        log::error!("[engine] {}: {err}; resetting connection", self.id);
        self.reset = true;
        self.rtx.cancel_timer();
        self.persist.cancel();
        self.state = DriverState::Idle;
        self.stats.record_reset();
    }

    fn flight_size(&self) -> u32 {
        seq_distance(self.send_unacked, self.send_next)
    }

    fn unsent(&self) -> u32 {
        if self.fin_sent {
            0
        } else {
            seq_distance(self.send_next, self.buffer.end_seq())
        }
    }

    /// Sequence number of our FIN, once sent.
    fn fin_seq(&self) -> Option<u32> {
        self.fin_sent.then(|| self.buffer.end_seq())
    }

    fn persist_interval(&self) -> Duration {
        let backed_off = self
            .rtx
            .rto()
            .checked_mul(1 << self.persist_shift)
            .unwrap_or(self.config.persist_max);
        backed_off.clamp(self.config.persist_min, self.config.persist_max)
    }

    /// RTT measured through the timestamp echo.
    fn echo_rtt(&self, timestamp_echo: Option<u32>, now: Instant) -> Option<Duration> {
        if !self.config.timestamps {
            return None;
        }
        let elapsed = self.builder.ts_value(now).wrapping_sub(timestamp_echo?);
        let elapsed = Duration::from_millis(u64::from(elapsed));
        // An echo from the future wraps to a huge value.
        (elapsed <= self.config.max_rto).then_some(elapsed)
    }

    fn process_ack(
        &mut self,
        ack: u32,
        window: u16,
        sack_ranges: &[(u32, u32)],
        timestamp_echo: Option<u32>,
        now: Instant,
    ) -> Result<Vec<SegmentDescriptor>, EngineError> {
        if seq_gt(ack, self.send_max) {
            log::debug!(
                "[engine] {}: ack {ack} beyond send_max {}, dropped",
                self.id,
                self.send_max
            );
            return Ok(Vec::new());
        }
        if seq_lt(ack, self.send_unacked) {
            let stale = BufferError::SequenceRegression {
                ack,
                unacked: self.send_unacked,
            };
            log::trace!("[engine] {}: ignoring {stale}", self.id);
            return Ok(Vec::new());
        }

        self.last_window_raw = window;
        let window_changed = self.cc.update_peer_window(window);
        let sacks: &[(u32, u32)] = if self.config.sack { sack_ranges } else { &[] };
        let mut out = Vec::new();

        if seq_gt(ack, self.send_unacked) {
            let newly_acked = seq_distance(self.send_unacked, ack);
            let fin_covered = self.fin_seq().is_some_and(|fin| seq_gt(ack, fin));
            let data_ack = if fin_covered { ack.wrapping_sub(1) } else { ack };
            self.buffer.consume_acked(data_ack)?;

            let echo_rtt = self.echo_rtt(timestamp_echo, now);
            let outcome = self.rtx.on_ack(self.send_unacked, ack, sacks, echo_rtt, now);
            if outcome.rejected_blocks > 0 {
                log::debug!("[engine] {}: {} bogus SACK blocks", self.id, outcome.rejected_blocks);
            }

            self.send_unacked = ack;
            if seq_lt(self.send_next, ack) {
                // The peer accepted the zero-window probe byte.
                self.send_next = ack;
            }
            if fin_covered && !self.fin_acked {
                log::debug!("[engine] {}: FIN acknowledged", self.id);
                self.fin_acked = true;
            }
            if self.urgent_seq.is_some_and(|u| seq_le(u, ack)) {
                self.urgent_seq = None;
            }
            self.cc.on_ack(newly_acked);
            self.segmenter.on_ack_advanced();
            log::trace!(
                "[engine] {}: ack {ack} (+{newly_acked}) removed={} rtt={:?} cwnd={}",
                self.id,
                outcome.removed,
                outcome.rtt_sample,
                self.cc.cwnd()
            );
        } else {
            let outcome = self.rtx.on_ack(self.send_unacked, ack, sacks, None, now);
            if outcome.rejected_blocks > 0 {
                log::debug!("[engine] {}: {} bogus SACK blocks", self.id, outcome.rejected_blocks);
            }
            // RFC 5681 §2: only an ACK that changes nothing while data is
            // outstanding counts as a duplicate.  Answers to zero-window
            // probes never do.
            if !self.rtx.is_empty() && !window_changed && self.cc.peer_window() > 0 {
                let count = self.rtx.record_duplicate_ack();
                if self.cc.on_duplicate_ack(count, self.flight_size()) {
                    if let Some(segment) = self.fast_retransmit(now)? {
                        out.push(segment);
                    }
                }
            }
        }

        if self.cc.peer_window() > 0 && self.persist.is_armed() {
            log::debug!("[engine] {}: window reopened ({} bytes)", self.id, self.cc.peer_window());
            self.persist.cancel();
            self.persist_shift = 0;
        }

        out.extend(self.drive(now)?);
        Ok(out)
    }

    fn fast_retransmit(&mut self, now: Instant) -> Result<Option<SegmentDescriptor>, EngineError> {
        let Some(entry) = self.rtx.fast_retransmit_candidate().cloned() else {
            return Ok(None);
        };
        self.rtx.mark_retransmitted(entry.seq_start, now);
        let segment = self.make_segment(entry.seq_start, entry.payload_len(), entry.fin, now)?;
        log::debug!(
            "[engine] {}: fast retransmit seq={} len={} cwnd={}",
            self.id,
            entry.seq_start,
            entry.payload_len(),
            self.cc.cwnd()
        );
        self.counters.fast_retransmits += 1;
        self.counters.retransmits += 1;
        self.stats.record_fast_retransmit();
        self.stats.record_retransmission();
        self.record_transmission(&segment, now);
        Ok(Some(segment))
    }

    fn on_retransmit_timeout(
        &mut self,
        token: TimerToken,
        now: Instant,
    ) -> Result<Vec<SegmentDescriptor>, EngineError> {
        let flight = self.flight_size();
        let Some(expiry) = self.rtx.on_rto_fire(token, now) else {
            return Ok(Vec::new());
        };
        if expiry.consecutive > self.config.max_retransmits {
            return Err(EngineError::RetransmitLimit(self.config.max_retransmits));
        }

        self.cc.on_rto(flight, expiry.is_first());
        self.state = DriverState::Sending;
        let entry = expiry.entry;
        let segment = self.make_segment(entry.seq_start, entry.payload_len(), entry.fin, now)?;
        log::debug!(
            "[engine] {}: rto retransmit seq={} len={} rto={:?}",
            self.id,
            entry.seq_start,
            entry.payload_len(),
            self.rtx.rto()
        );
        self.counters.timeouts += 1;
        self.counters.retransmits += 1;
        self.stats.record_timeout();
        self.stats.record_retransmission();
        self.record_transmission(&segment, now);

        let mut out = vec![segment];
        out.extend(self.drive(now)?);
        Ok(out)
    }

    fn on_persist_timeout(
        &mut self,
        token: TimerToken,
        now: Instant,
    ) -> Result<Vec<SegmentDescriptor>, EngineError> {
        if !self.persist.fire(token, now) {
            return Ok(Vec::new());
        }
        let in_flight = self.flight_size() > 0 && !self.buffer.is_empty();
        if self.cc.peer_window() > 0 || (!in_flight && self.unsent() == 0) {
            self.persist_shift = 0;
            return self.drive(now);
        }

        // Probe with the oldest unacknowledged byte, or with the byte at
        // send_next when nothing is in flight.  Only send_max moves.
        let seq = if in_flight { self.send_unacked } else { self.send_next };
        let probe = self.make_segment(seq, 1, false, now)?;
        if in_flight {
            self.rtx.mark_probed();
        }
        self.send_max = seq_max(self.send_max, seq.wrapping_add(1));
        self.persist_shift = (self.persist_shift + 1).min(MAX_PERSIST_SHIFT);
        let interval = self.persist_interval();
        self.persist.arm(now + interval);
        log::debug!(
            "[engine] {}: zero-window probe seq={} next in {:?}",
            self.id,
            seq,
            interval
        );
        self.counters.window_probes += 1;
        self.stats.record_window_probe();
        self.record_transmission(&probe, now);
        Ok(vec![probe])
    }

    /// The output driver proper.
    fn drive(&mut self, now: Instant) -> Result<Vec<SegmentDescriptor>, EngineError> {
        let mut out = Vec::new();
        let unsent = self.unsent();
        let wants_fin = self.fin_queued && !self.fin_sent;

        if unsent > 0 || wants_fin {
            if self.config.idle_restart && self.rtx.is_empty() {
                if let Some(last) = self.last_send {
                    if now.saturating_duration_since(last) > self.rtx.rto() {
                        self.cc.restart_after_idle();
                    }
                }
            }
            if self.state != DriverState::Closing {
                self.state = DriverState::Sending;
            }

            let pending = Pending {
                send_next: self.send_next,
                unsent,
                in_flight: self.flight_size(),
                fin: wants_fin,
                urgent_seq: self.urgent_seq,
                max_peer_window: self.cc.max_peer_window(),
            };
            let usable = self.cc.usable_window(self.flight_size());
            for plan in self.segmenter.next_segments(usable, &pending) {
                let segment = self.make_segment(plan.seq, plan.len, plan.fin, now)?;
                let end = plan.seq.wrapping_add(plan.seq_len());
                self.rtx.on_segment_sent(plan.seq, end, plan.fin, now);
                self.send_next = end;
                self.send_max = seq_max(self.send_max, end);
                if plan.fin {
                    log::debug!("[engine] {}: FIN sent at seq={}", self.id, plan.seq.wrapping_add(plan.len));
                    self.fin_sent = true;
                }
                self.record_transmission(&segment, now);
                out.push(segment);
            }
        }

        self.update_state(now);
        Ok(out)
    }

    fn update_state(&mut self, now: Instant) {
        if self.fin_queued && self.buffer.is_empty() {
            if self.state != DriverState::Closing {
                log::debug!("[engine] {}: all data acknowledged, closing", self.id);
            }
            self.state = DriverState::Closing;
            self.persist.cancel();
            self.rtx.ensure_timer(now);
            return;
        }
        if self.cc.peer_window() == 0 && (self.unsent() > 0 || self.flight_size() > 0) {
            if self.state != DriverState::Probing {
                log::debug!(
                    "[engine] {}: peer window closed, {} bytes in flight",
                    self.id,
                    self.flight_size()
                );
            }
            self.state = DriverState::Probing;
            if self.flight_size() > 0 {
                // The peer dropped whatever lies beyond the closed window.
                self.rtx.suspend();
            }
            if !self.persist.is_armed() {
                self.persist.arm(now + self.persist_interval());
            }
            return;
        }
        self.rtx.ensure_timer(now);
        self.state = DriverState::Idle;
    }

    /// Build the segment carrying `len` bytes from `seq`.
    fn make_segment(
        &self,
        seq: u32,
        len: u32,
        fin: bool,
        now: Instant,
    ) -> Result<SegmentDescriptor, EngineError> {
        let payload = self.buffer.read_range(seq, len as usize)?.to_vec();
        let end = seq.wrapping_add(len);
        let mut seg_flags = 0;
        if fin {
            seg_flags |= flags::FIN;
        }
        if len > 0 && end == self.buffer.end_seq() {
            seg_flags |= flags::PSH;
        }
        let mut urgent = 0;
        if let Some(mark) = self.urgent_seq.filter(|&u| seq_lt(seq, u)) {
            seg_flags |= flags::URG;
            urgent = seq_distance(seq, mark).min(u32::from(u16::MAX)) as u16;
        }
        Ok(self.builder.build(
            OutgoingSegment {
                seq,
                flags: seg_flags,
                urgent,
                payload,
            },
            &self.receive,
            now,
        ))
    }

    fn record_transmission(&mut self, segment: &SegmentDescriptor, now: Instant) {
        self.counters.segments_sent += 1;
        self.stats.record_segment(segment.payload.len());
        self.last_send = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::flags;

    const ID: ConnectionId = ConnectionId {
        local_port: 5000,
        remote_port: 80,
    };

    fn config() -> EngineConfig {
        EngineConfig {
            timestamps: false,
            ..EngineConfig::default()
        }
    }

    fn engine(config: EngineConfig, iss: u32, now: Instant) -> SendEngine {
        SendEngine::new(config, ID, iss, 65535, now)
    }

    fn payload(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn queue_then_output_sends_initial_window() {
        let now = Instant::now();
        let mut e = engine(config(), 0, now);
        assert_eq!(e.queue_data(&payload(10_000)).unwrap(), 10_000);
        let segs = e.output(now).unwrap();
        assert_eq!(segs.len(), 3);
        assert_eq!(e.connection_params().in_flight, 3 * 1460);
        assert_eq!(e.state(), DriverState::Idle);
    }

    #[test]
    fn stale_and_future_acks_are_ignored() {
        let now = Instant::now();
        let mut e = engine(config(), 1000, now);
        e.queue_data(&payload(2000)).unwrap();
        e.output(now).unwrap();
        e.report_ack(2000, 65535, &[], None, now).unwrap();
        let before = e.connection_params();

        assert!(e.report_ack(1500, 65535, &[], None, now).unwrap().is_empty());
        assert!(e.report_ack(9000, 65535, &[], None, now).unwrap().is_empty());
        assert_eq!(e.connection_params(), before);
    }

    #[test]
    fn duplicate_cumulative_ack_is_idempotent() {
        let now = Instant::now();
        let mut e = engine(config(), 0, now);
        e.queue_data(&payload(2000)).unwrap();
        e.output(now).unwrap();
        e.report_ack(2000, 65535, &[], None, now).unwrap();
        let first = e.connection_params();
        assert!(e.report_ack(2000, 65535, &[], None, now).unwrap().is_empty());
        assert_eq!(e.connection_params(), first);
    }

    #[test]
    fn bogus_sack_blocks_do_not_panic() {
        let now = Instant::now();
        let mut e = engine(config(), 0, now);
        e.queue_data(&payload(4000)).unwrap();
        e.output(now).unwrap();
        let sacks = [(5, 1), (0, 100), (3000, u32::MAX), (u32::MAX, 7)];
        e.report_ack(0, 65535, &sacks, None, now).unwrap();
        e.check_invariants().unwrap();
    }

    #[test]
    fn fin_follows_data_and_closing_after_ack() {
        let now = Instant::now();
        let mut e = engine(config(), 100, now);
        e.queue_data(b"hello").unwrap();
        e.request_close();
        assert_eq!(e.queue_data(b"more"), Err(EngineError::Closed));

        let segs = e.output(now).unwrap();
        assert_eq!(segs.len(), 1);
        assert!(segs[0].header.has(flags::FIN));
        assert!(segs[0].header.has(flags::PSH));
        assert_eq!(segs[0].seq_end(), 106);

        e.report_ack(106, 65535, &[], None, now).unwrap();
        assert!(e.is_finished());
        assert_eq!(e.state(), DriverState::Closing);
        assert!(e.next_timer().is_none());
    }

    #[test]
    fn report_fin_acked_completes_close() {
        let now = Instant::now();
        let mut e = engine(config(), 0, now);
        e.request_close();
        // Nothing sent yet: ignored.
        e.report_fin_acked(now).unwrap();
        assert!(!e.is_finished());

        let segs = e.output(now).unwrap();
        assert_eq!(segs.len(), 1);
        assert!(segs[0].payload.is_empty());
        e.report_fin_acked(now).unwrap();
        assert!(e.is_finished());
        assert_eq!(e.connection_params().send_unacked, 1);
    }

    #[test]
    fn retransmit_limit_resets_connection() {
        let now = Instant::now();
        let cfg = EngineConfig {
            max_retransmits: 2,
            ..config()
        };
        let mut e = engine(cfg, 0, now);
        e.queue_data(b"x").unwrap();
        e.output(now).unwrap();

        let mut t = now;
        for _ in 0..2 {
            let ev = e.next_timer().unwrap();
            t = ev.deadline;
            assert_eq!(e.on_timer(ev.token, t).unwrap().len(), 1);
        }
        let ev = e.next_timer().unwrap();
        assert_eq!(
            e.on_timer(ev.token, ev.deadline),
            Err(EngineError::RetransmitLimit(2))
        );
        assert!(e.is_reset());
        assert!(e.next_timer().is_none());
        assert_eq!(e.queue_data(b"y"), Err(EngineError::Reset));
        assert_eq!(e.output(t), Err(EngineError::Reset));
    }

    #[test]
    fn stale_timer_token_is_ignored() {
        let now = Instant::now();
        let mut e = engine(config(), 0, now);
        e.queue_data(&payload(100)).unwrap();
        e.output(now).unwrap();
        let ev = e.next_timer().unwrap();
        e.report_ack(100, 65535, &[], None, now).unwrap();
        assert!(e.on_timer(ev.token, ev.deadline).unwrap().is_empty());
        assert_eq!(e.connection_params().timeouts, 0);
    }

    #[test]
    fn urgent_data_is_flagged_and_bounded() {
        let now = Instant::now();
        let mut e = engine(config(), 0, now);
        e.queue_data(&payload(200)).unwrap();
        e.queue_urgent(&payload(300)).unwrap();
        e.queue_data(&payload(2000)).unwrap();
        let segs = e.output(now).unwrap();
        assert_eq!(segs[0].payload.len(), 500);
        assert!(segs[0].header.has(flags::URG));
        assert_eq!(segs[0].header.urgent, 500);
        assert!(!segs[1].header.has(flags::URG));
        assert_eq!(segs[1].header.seq, 500);
    }

    #[test]
    fn path_mtu_feedback_shrinks_new_segments() {
        let now = Instant::now();
        let mut e = engine(config(), 0, now);
        e.update_mss(536);
        e.queue_data(&payload(1000)).unwrap();
        let segs = e.output(now).unwrap();
        assert_eq!(
            segs.iter().map(|s| s.payload.len()).collect::<Vec<_>>(),
            [536, 464]
        );
        // Never above the negotiated value.
        e.update_mss(9000);
        assert_eq!(e.connection_params().mss, 1460);
    }

    #[test]
    fn idle_period_restarts_congestion_window() {
        let now = Instant::now();
        let mut e = engine(config(), 0, now);
        e.queue_data(&payload(4380)).unwrap();
        e.output(now).unwrap();
        e.report_ack(4380, 65535, &[], None, now).unwrap();
        assert_eq!(e.connection_params().cwnd, 4 * 1460);

        let later = now + Duration::from_secs(5);
        e.queue_data(&payload(100)).unwrap();
        e.output(later).unwrap();
        assert_eq!(e.connection_params().cwnd, 3 * 1460);
    }

    #[test]
    fn timestamp_echo_feeds_rtt_estimator() {
        let now = Instant::now();
        let mut e = engine(EngineConfig::default(), 0, now);
        let sent_at = now + Duration::from_millis(10);
        e.queue_data(&payload(100)).unwrap();
        let segs = e.output(sent_at).unwrap();
        let tsval = segs[0]
            .header
            .options
            .iter()
            .find_map(|o| match o {
                crate::packet::TcpOption::Timestamps { value, .. } => Some(*value),
                _ => None,
            })
            .unwrap();
        assert_eq!(tsval, 10);

        e.report_ack(100, 65535, &[], Some(tsval), sent_at + Duration::from_millis(80))
            .unwrap();
        assert_eq!(e.connection_params().srtt, Some(Duration::from_millis(80)));
    }

    #[test]
    fn invariants_hold_across_sequence_wrap() {
        let now = Instant::now();
        let iss = u32::MAX - 2000;
        let mut e = engine(config(), iss, now);
        e.queue_data(&payload(6000)).unwrap();
        let mut segs = e.output(now).unwrap();
        let mut acked = iss;
        while let Some(last) = segs.last() {
            acked = last.seq_end();
            segs = e.report_ack(acked, 65535, &[], None, now).unwrap();
            e.check_invariants().unwrap();
        }
        assert_eq!(acked, iss.wrapping_add(6000));
        assert_eq!(e.connection_params().buffered, 0);
    }
}
