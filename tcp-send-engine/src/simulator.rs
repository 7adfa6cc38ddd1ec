//! Deterministic network simulator for exercising the engine.
//!
//! A [`Simulation`] wires one [`Connection`] to a [`SimulatedLink`] and a
//! [`SimulatedPeer`] under a [`VirtualClock`].  Nothing sleeps: the clock
//! jumps from one event (segment delivery, ACK delivery, timer expiry) to
//! the next, so a run is fully reproducible from its seed.
//!
//! | Fault              | Description                                         |
//! |--------------------|-----------------------------------------------------|
//! | Segment loss       | Drop a data segment with probability `loss_rate`.   |
//! | ACK loss           | Drop an ACK with probability `ack_loss_rate`.       |
//! | Reordering         | Delay a segment by `reorder_delay`, letting later   |
//! |                    | segments overtake it.                               |
//! | Duplication        | Deliver a segment twice.                            |
//! | Transmit failure   | The link refuses the segment outright.              |
//! | Bandwidth cap      | Serialize segments at `bw_limit` bytes/sec.         |
//!
//! ```text
//!   Simulation::run_transfer(data)
//!        │ queue_data / request_close
//!        ▼
//!   Connection ──transmit──▶ SimulatedLink ──(delay, faults)──▶ SimulatedPeer
//!        ▲                                                          │
//!        └──────────── report_ack ◀──(delay, ACK loss)──────────────┘
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::EngineConfig;
use crate::connection::{Connection, Transmit};
use crate::engine::{ConnectionId, ConnectionParams};
use crate::error::{EngineError, TransmitError};
use crate::packet::{flags, SegmentDescriptor, TcpOption};
use crate::seq::{seq_distance, seq_le};
use crate::state::CongestionPhase;
use crate::stats::{GlobalStats, StatsSnapshot};

/// Most SACK blocks the peer reports per ACK.
const MAX_SACK_BLOCKS: usize = 3;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Fault model and peer behaviour.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that a data segment is silently dropped.
    pub loss_rate: f64,
    /// Probability that a segment is reordered.
    pub reorder_rate: f64,
    /// Extra delay applied to reordered segments.
    pub reorder_delay: Duration,
    /// Probability that a segment is delivered twice.
    pub duplicate_rate: f64,
    /// Optional bandwidth cap in bytes per second (`None` = unlimited).
    pub bw_limit: Option<u64>,
    /// Propagation delay in each direction.
    pub one_way_delay: Duration,
    /// Probability that an ACK is dropped on the way back.
    pub ack_loss_rate: f64,
    /// Probability that the link refuses a segment.
    pub transmit_failure_rate: f64,
    /// RNG seed; equal seeds give equal runs.
    pub seed: u64,
    /// Receive buffer the peer advertises, in bytes.
    pub receive_window: u32,
    /// Give up after this much virtual time.
    pub time_limit: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the link is a plain delay line.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::ZERO,
            duplicate_rate: 0.0,
            bw_limit: None,
            one_way_delay: Duration::from_millis(25),
            ack_loss_rate: 0.0,
            transmit_failure_rate: 0.0,
            seed: 0,
            receive_window: 65_535,
            time_limit: Duration::from_secs(600),
        }
    }
}

// ---------------------------------------------------------------------------
// Clock and event queue
// ---------------------------------------------------------------------------

/// Shared virtual time.  Only moves forward.
#[derive(Debug)]
pub struct VirtualClock {
    now: Mutex<Instant>,
}

impl VirtualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn advance_to(&self, t: Instant) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if t > *now {
            *now = t;
        }
    }
}

/// An item due at `at`; ties are broken by insertion order.
#[derive(Debug)]
struct Scheduled<T> {
    at: Instant,
    order: u64,
    item: T,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.order == other.order
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.order).cmp(&(other.at, other.order))
    }
}

/// Min-heap of scheduled items.
#[derive(Debug)]
struct EventQueue<T> {
    heap: BinaryHeap<Reverse<Scheduled<T>>>,
    next_order: u64,
}

impl<T> EventQueue<T> {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_order: 0,
        }
    }

    fn push(&mut self, at: Instant, item: T) {
        let order = self.next_order;
        self.next_order += 1;
        self.heap.push(Reverse(Scheduled { at, order, item }));
    }

    fn next_at(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(s)| s.at)
    }

    fn pop_due(&mut self, now: Instant) -> Option<T> {
        if self.next_at()? > now {
            return None;
        }
        self.heap.pop().map(|Reverse(s)| s.item)
    }
}

// ---------------------------------------------------------------------------
// SimulatedLink
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LinkState {
    rng: StdRng,
    queue: EventQueue<SegmentDescriptor>,
    /// When the bottleneck finishes serializing the previous segment.
    busy_until: Option<Instant>,
    transmitted: Vec<SegmentDescriptor>,
    dropped: u64,
}

/// Lossy one-way path from the engine to the peer.
#[derive(Debug)]
pub struct SimulatedLink {
    config: SimulatorConfig,
    clock: Arc<VirtualClock>,
    state: Mutex<LinkState>,
}

impl SimulatedLink {
    pub fn new(config: SimulatorConfig, clock: Arc<VirtualClock>) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            clock,
            state: Mutex::new(LinkState {
                rng,
                queue: EventQueue::new(),
                busy_until: None,
                transmitted: Vec::new(),
                dropped: 0,
            }),
        }
    }

    /// Every segment handed to the link, in transmission order.
    pub fn transmitted(&self) -> Vec<SegmentDescriptor> {
        self.lock().transmitted.clone()
    }

    /// Segments lost on the link (not counting refused ones).
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn next_delivery(&self) -> Option<Instant> {
        self.lock().queue.next_at()
    }

    fn pop_due(&self, now: Instant) -> Option<SegmentDescriptor> {
        self.lock().queue.pop_due(now)
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transmit for SimulatedLink {
    fn transmit(&self, segment: SegmentDescriptor) -> Result<(), TransmitError> {
        let now = self.clock.now();
        let cfg = &self.config;
        let mut st = self.lock();

        if st.rng.random_bool(cfg.transmit_failure_rate.clamp(0.0, 1.0)) {
            log::trace!("[link] refused seq={}", segment.header.seq);
            return Err(TransmitError::WouldBlock);
        }
        st.transmitted.push(segment.clone());

        // Serialization at the bottleneck, then propagation.
        let mut departs = st.busy_until.map_or(now, |busy| busy.max(now));
        if let Some(rate) = cfg.bw_limit.filter(|&r| r > 0) {
            let wire_len = segment.header.header_len() + segment.payload.len();
            departs += Duration::from_secs_f64(wire_len as f64 / rate as f64);
            st.busy_until = Some(departs);
        }

        if st.rng.random_bool(cfg.loss_rate.clamp(0.0, 1.0)) {
            log::trace!("[link] dropped seq={}", segment.header.seq);
            st.dropped += 1;
            return Ok(());
        }

        let mut arrives = departs + cfg.one_way_delay;
        if st.rng.random_bool(cfg.reorder_rate.clamp(0.0, 1.0)) {
            arrives += cfg.reorder_delay;
        }
        if st.rng.random_bool(cfg.duplicate_rate.clamp(0.0, 1.0)) {
            st.queue.push(arrives, segment.clone());
        }
        st.queue.push(arrives, segment);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SimulatedPeer
// ---------------------------------------------------------------------------

/// Acknowledgement produced by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAck {
    pub ack: u32,
    pub window: u16,
    pub sack_ranges: Vec<(u32, u32)>,
    pub timestamp_echo: Option<u32>,
}

/// Receiving end: reassembles the stream and generates ACKs.
///
/// The application on the peer side reads instantly, so the advertised
/// window stays at `window` bytes unless changed with
/// [`set_window`](Self::set_window).
#[derive(Debug)]
pub struct SimulatedPeer {
    iss: u32,
    /// Stream offset of the next in-order byte.
    next_offset: u32,
    /// Out-of-order data keyed by stream offset.
    out_of_order: BTreeMap<u32, Vec<u8>>,
    delivered: Vec<u8>,
    /// Stream offset of the FIN, once seen.
    fin_offset: Option<u32>,
    fin_received: bool,
    window: u32,
    window_scale: u8,
    ts_recent: Option<u32>,
}

impl SimulatedPeer {
    pub fn new(iss: u32, window: u32, window_scale: u8) -> Self {
        Self {
            iss,
            next_offset: 0,
            out_of_order: BTreeMap::new(),
            delivered: Vec::new(),
            fin_offset: None,
            fin_received: false,
            window,
            window_scale,
            ts_recent: None,
        }
    }

    /// Bytes delivered in order so far.
    pub fn delivered(&self) -> &[u8] {
        &self.delivered
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    pub fn set_window(&mut self, bytes: u32) {
        self.window = bytes;
    }

    /// The ACK the peer would send right now.
    pub fn current_ack(&self) -> PeerAck {
        let ack = self
            .iss
            .wrapping_add(self.next_offset)
            .wrapping_add(u32::from(self.fin_received));
        let window = (self.window >> self.window_scale).min(u32::from(u16::MAX)) as u16;
        PeerAck {
            ack,
            window,
            sack_ranges: Vec::new(),
            timestamp_echo: self.ts_recent,
        }
    }

    /// Absorb one segment and return the ACK it triggers.
    pub fn on_segment(&mut self, segment: &SegmentDescriptor) -> PeerAck {
        let rcv_nxt = self.iss.wrapping_add(self.next_offset);
        let seq = segment.header.seq;
        if seq_le(seq, rcv_nxt) {
            if let Some(value) = timestamp_value(segment) {
                self.ts_recent = Some(value);
            }
        }

        let offset = seq_distance(self.iss, seq);
        // Only bytes inside the receive window are kept.
        let window_end = self.next_offset.saturating_add(self.window);
        let usable = window_end.saturating_sub(offset) as usize;
        let kept = segment.payload.len().min(usable);
        if kept > 0 && offset.saturating_add(kept as u32) > self.next_offset {
            let data = segment.payload[..kept].to_vec();
            let slot = self.out_of_order.entry(offset).or_default();
            if data.len() > slot.len() {
                *slot = data;
            }
        }
        if segment.header.has(flags::FIN) && kept == segment.payload.len() {
            self.fin_offset = Some(offset.wrapping_add(kept as u32));
        }
        self.absorb();

        let mut ack = self.current_ack();
        ack.sack_ranges = self.sack_blocks(offset);
        log::trace!("[peer] seq={seq} len={} -> ack={}", segment.payload.len(), ack.ack);
        ack
    }

    /// Move contiguous out-of-order data into the delivered stream.
    fn absorb(&mut self) {
        while let Some(entry) = self.out_of_order.first_entry() {
            if *entry.key() > self.next_offset {
                break;
            }
            let (start, data) = entry.remove_entry();
            let end = start + data.len() as u32;
            if end > self.next_offset {
                let skip = (self.next_offset - start) as usize;
                self.delivered.extend_from_slice(&data[skip..]);
                self.next_offset = end;
            }
        }
        if self.fin_offset == Some(self.next_offset) {
            self.fin_received = true;
        }
    }

    /// Merged out-of-order ranges, the one holding `latest` first.
    fn sack_blocks(&self, latest: u32) -> Vec<(u32, u32)> {
        let mut merged: Vec<(u32, u32)> = Vec::new();
        for (&start, data) in &self.out_of_order {
            let end = start + data.len() as u32;
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        if let Some(pos) = merged.iter().position(|&(s, e)| s <= latest && latest < e) {
            let block = merged.remove(pos);
            merged.insert(0, block);
        }
        merged
            .into_iter()
            .take(MAX_SACK_BLOCKS)
            .map(|(s, e)| (self.iss.wrapping_add(s), self.iss.wrapping_add(e)))
            .collect()
    }
}

fn timestamp_value(segment: &SegmentDescriptor) -> Option<u32> {
    segment.header.options.iter().find_map(|o| match o {
        TcpOption::Timestamps { value, .. } => Some(*value),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// One point of the congestion-window trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CwndSample {
    pub elapsed: Duration,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub phase: CongestionPhase,
}

/// Outcome of [`Simulation::run_transfer`].
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// The FIN was acknowledged before the time limit.
    pub completed: bool,
    pub bytes_delivered: usize,
    pub elapsed: Duration,
    pub stats: StatsSnapshot,
    pub params: ConnectionParams,
    pub segments_dropped: u64,
    pub cwnd_trace: Vec<CwndSample>,
}

impl TransferReport {
    /// Delivered bytes per second of virtual time.
    pub fn goodput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_delivered as f64 / secs
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for TransferReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "completed={} delivered={} elapsed={:?} goodput={:.0} B/s dropped={}",
            self.completed,
            self.bytes_delivered,
            self.elapsed,
            self.goodput(),
            self.segments_dropped
        )?;
        writeln!(f, "stats: {}", self.stats)?;
        write!(f, "final: {}", self.params)
    }
}

/// A connection, a link, a peer and a clock.
pub struct Simulation {
    config: SimulatorConfig,
    clock: Arc<VirtualClock>,
    start: Instant,
    link: Arc<SimulatedLink>,
    connection: Arc<Connection>,
    peer: SimulatedPeer,
    acks: EventQueue<PeerAck>,
    ack_rng: StdRng,
    stats: Arc<GlobalStats>,
    trace: Vec<CwndSample>,
}

impl Simulation {
    pub fn new(engine_config: EngineConfig, config: SimulatorConfig) -> Self {
        let start = Instant::now();
        let clock = Arc::new(VirtualClock::new(start));
        let mut ack_rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        let iss: u32 = ack_rng.random();
        let link = Arc::new(SimulatedLink::new(config.clone(), Arc::clone(&clock)));
        let stats = Arc::new(GlobalStats::new());
        let peer = SimulatedPeer::new(iss, config.receive_window, engine_config.peer_window_scale);
        // The SYN window is never scaled.
        let syn_window = config.receive_window.min(u32::from(u16::MAX));
        let connection = Arc::new(Connection::new(
            engine_config,
            ConnectionId {
                local_port: 40_000,
                remote_port: 9000,
            },
            iss,
            syn_window,
            Arc::clone(&link) as Arc<dyn Transmit>,
            Arc::clone(&stats),
            start,
        ));
        log::debug!("[sim] iss={iss} seed={}", config.seed);
        Self {
            config,
            clock,
            start,
            link,
            connection,
            peer,
            acks: EventQueue::new(),
            ack_rng,
            stats,
            trace: Vec::new(),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn link(&self) -> &SimulatedLink {
        &self.link
    }

    pub fn peer(&self) -> &SimulatedPeer {
        &self.peer
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn elapsed(&self) -> Duration {
        self.now().saturating_duration_since(self.start)
    }

    pub fn cwnd_trace(&self) -> &[CwndSample] {
        &self.trace
    }

    /// Change the peer's receive buffer and send a window update.
    pub fn set_peer_window(&mut self, bytes: u32) {
        self.peer.set_window(bytes);
        let update = self.peer.current_ack();
        self.send_ack(update);
    }

    /// Advance to the next event and process everything due at that time.
    ///
    /// Returns `false` when nothing is scheduled at all.
    pub fn step(&mut self) -> Result<bool, EngineError> {
        let timer = self.connection.next_timer();
        let next = [
            self.link.next_delivery(),
            self.acks.next_at(),
            timer.map(|t| t.deadline),
        ]
        .into_iter()
        .flatten()
        .min();
        let Some(at) = next else {
            return Ok(false);
        };
        self.clock.advance_to(at);
        let now = self.clock.now();

        while let Some(segment) = self.link.pop_due(now) {
            let ack = self.peer.on_segment(&segment);
            self.send_ack(ack);
        }
        while let Some(ack) = self.acks.pop_due(now) {
            self.connection
                .report_ack(ack.ack, ack.window, &ack.sack_ranges, ack.timestamp_echo, now)?;
            self.sample();
        }
        if let Some(event) = timer.filter(|t| t.deadline <= now) {
            self.connection.on_timer(event.token, now)?;
            self.sample();
        }
        Ok(true)
    }

    /// Push `data` through the connection, close it and run until the FIN
    /// is acknowledged or the time limit passes.
    pub fn run_transfer(&mut self, data: &[u8]) -> Result<TransferReport, EngineError> {
        let deadline = self.start + self.config.time_limit;
        let mut offset = 0;
        let mut close_requested = false;
        self.sample();

        loop {
            let now = self.clock.now();
            let room = self.connection.send_capacity();
            if offset < data.len() && room > 0 {
                let end = data.len().min(offset + room);
                offset += self.connection.queue_data(&data[offset..end], now)?;
            }
            if offset == data.len() && !close_requested {
                self.connection.request_close(now)?;
                close_requested = true;
            }
            if self.connection.is_finished() || now >= deadline {
                break;
            }
            if !self.step()? {
                log::warn!("[sim] no events left at {:?}", self.elapsed());
                break;
            }
        }
        Ok(self.report())
    }

    pub fn report(&self) -> TransferReport {
        TransferReport {
            completed: self.connection.is_finished(),
            bytes_delivered: self.peer.delivered().len(),
            elapsed: self.elapsed(),
            stats: self.stats.snapshot(),
            params: self.connection.connection_params(),
            segments_dropped: self.link.dropped(),
            cwnd_trace: self.trace.clone(),
        }
    }

    fn send_ack(&mut self, ack: PeerAck) {
        if self
            .ack_rng
            .random_bool(self.config.ack_loss_rate.clamp(0.0, 1.0))
        {
            log::trace!("[sim] ack {} lost", ack.ack);
            return;
        }
        let at = self.clock.now() + self.config.one_way_delay;
        self.acks.push(at, ack);
    }

    fn sample(&mut self) {
        let params = self.connection.connection_params();
        self.trace.push(CwndSample {
            elapsed: self.elapsed(),
            cwnd: params.cwnd,
            ssthresh: params.ssthresh,
            phase: params.phase,
        });
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .field("elapsed", &self.elapsed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_segment(seq: u32, payload: &[u8], fin: bool) -> SegmentDescriptor {
        let mut seg = SegmentDescriptor::default();
        seg.header.seq = seq;
        seg.header.flags = if fin { flags::FIN | flags::ACK } else { flags::ACK };
        seg.payload = payload.to_vec();
        seg
    }

    #[test]
    fn peer_reassembles_out_of_order_and_reports_sack() {
        let mut peer = SimulatedPeer::new(100, 65_535, 0);
        let ack = peer.on_segment(&data_segment(105, b"world", false));
        assert_eq!(ack.ack, 100);
        assert_eq!(ack.sack_ranges, [(105, 110)]);

        let ack = peer.on_segment(&data_segment(100, b"hello", false));
        assert_eq!(ack.ack, 110);
        assert!(ack.sack_ranges.is_empty());
        assert_eq!(peer.delivered(), b"helloworld");
    }

    #[test]
    fn peer_acks_fin_once_stream_complete() {
        let mut peer = SimulatedPeer::new(0, 65_535, 0);
        let ack = peer.on_segment(&data_segment(3, b"def", true));
        assert_eq!(ack.ack, 0);
        assert!(!peer.fin_received());
        let ack = peer.on_segment(&data_segment(0, b"abc", false));
        assert_eq!(ack.ack, 7);
        assert!(peer.fin_received());
    }

    #[test]
    fn peer_trims_to_window() {
        let mut peer = SimulatedPeer::new(0, 0, 0);
        let ack = peer.on_segment(&data_segment(0, b"x", false));
        assert_eq!(ack.ack, 0);
        assert_eq!(ack.window, 0);
        peer.set_window(4);
        let ack = peer.on_segment(&data_segment(0, b"abcdef", false));
        assert_eq!(ack.ack, 4);
        assert_eq!(peer.delivered(), b"abcd");
    }

    #[test]
    fn event_queue_orders_by_time_then_insertion() {
        let t = Instant::now();
        let mut q = EventQueue::new();
        q.push(t + Duration::from_millis(5), "late");
        q.push(t, "first");
        q.push(t, "second");
        assert_eq!(q.pop_due(t), Some("first"));
        assert_eq!(q.pop_due(t), Some("second"));
        assert_eq!(q.pop_due(t), None);
        assert_eq!(q.pop_due(t + Duration::from_millis(5)), Some("late"));
    }

    #[test]
    fn same_seed_same_run() {
        let sim_cfg = SimulatorConfig {
            loss_rate: 0.1,
            seed: 42,
            ..SimulatorConfig::default()
        };
        let data = vec![0xab; 30_000];
        let a = Simulation::new(EngineConfig::default(), sim_cfg.clone())
            .run_transfer(&data)
            .unwrap();
        let b = Simulation::new(EngineConfig::default(), sim_cfg)
            .run_transfer(&data)
            .unwrap();
        assert_eq!(a.elapsed, b.elapsed);
        assert_eq!(a.stats, b.stats);
        assert_eq!(a.segments_dropped, b.segments_dropped);
    }
}
