//! Per-connection serialization token.
//!
//! A [`Connection`] wraps one [`SendEngine`] in a mutex.  Every mutating
//! operation (new data, ACK processing, timer fire) takes the lock, lets the
//! engine decide what to send, releases the lock and only then hands the
//! segments to the [`Transmit`] primitive:
//!
//! ```text
//!  caller ──▶ lock ──▶ SendEngine::report_ack(..) ──▶ Vec<SegmentDescriptor>
//!                 unlock ◀─────────────────────────────────┘
//!                   │
//!                   └──▶ Transmit::transmit(segment)  (may re-enter the Connection)
//! ```
//!
//! Different connections share nothing mutable except the atomic
//! [`GlobalStats`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::config::EngineConfig;
use crate::engine::{ConnectionId, ConnectionParams, SendEngine};
use crate::error::{EngineError, TransmitError};
use crate::packet::SegmentDescriptor;
use crate::stats::GlobalStats;
use crate::timer::{TimerEvent, TimerToken};

/// The link-layer transmission primitive.
///
/// Best effort.  An error is never retried inline; the retransmission timer
/// recovers the segment.  Implementations may call back into the
/// [`Connection`] that invoked them.
pub trait Transmit: Send + Sync {
    fn transmit(&self, segment: SegmentDescriptor) -> Result<(), TransmitError>;
}

impl<F> Transmit for F
where
    F: Fn(SegmentDescriptor) -> Result<(), TransmitError> + Send + Sync,
{
    fn transmit(&self, segment: SegmentDescriptor) -> Result<(), TransmitError> {
        self(segment)
    }
}

/// One connection's send side plus its link.
pub struct Connection {
    id: ConnectionId,
    engine: Mutex<SendEngine>,
    link: Arc<dyn Transmit>,
    stats: Arc<GlobalStats>,
}

impl Connection {
    pub fn new(
        config: EngineConfig,
        id: ConnectionId,
        iss: u32,
        peer_window: u32,
        link: Arc<dyn Transmit>,
        stats: Arc<GlobalStats>,
        now: Instant,
    ) -> Self {
        let engine = SendEngine::new(config, id, iss, peer_window, now).with_stats(Arc::clone(&stats));
        stats.connection_opened();
        log::debug!("[conn] {id}: opened, iss={iss} peer_window={peer_window}");
        Self {
            id,
            engine: Mutex::new(engine),
            link,
            stats,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue application data and send what the windows allow.
    pub fn queue_data(&self, bytes: &[u8], now: Instant) -> Result<usize, EngineError> {
        let (accepted, segments) = {
            let mut engine = self.lock();
            let accepted = engine.queue_data(bytes)?;
            (accepted, engine.output(now)?)
        };
        self.transmit_all(segments);
        Ok(accepted)
    }

    /// Queue urgent data and send what the windows allow.
    pub fn queue_urgent(&self, bytes: &[u8], now: Instant) -> Result<usize, EngineError> {
        let (accepted, segments) = {
            let mut engine = self.lock();
            let accepted = engine.queue_urgent(bytes)?;
            (accepted, engine.output(now)?)
        };
        self.transmit_all(segments);
        Ok(accepted)
    }

    /// Queue the FIN and send it once everything before it went out.
    pub fn request_close(&self, now: Instant) -> Result<(), EngineError> {
        let segments = {
            let mut engine = self.lock();
            engine.request_close();
            engine.output(now)?
        };
        self.transmit_all(segments);
        Ok(())
    }

    pub fn report_ack(
        &self,
        ack: u32,
        window: u16,
        sack_ranges: &[(u32, u32)],
        timestamp_echo: Option<u32>,
        now: Instant,
    ) -> Result<(), EngineError> {
        let segments = self
            .lock()
            .report_ack(ack, window, sack_ranges, timestamp_echo, now)?;
        self.transmit_all(segments);
        Ok(())
    }

    pub fn report_fin_acked(&self, now: Instant) -> Result<(), EngineError> {
        self.lock().report_fin_acked(now)
    }

    pub fn on_timer(&self, token: TimerToken, now: Instant) -> Result<(), EngineError> {
        let segments = self.lock().on_timer(token, now)?;
        self.transmit_all(segments);
        Ok(())
    }

    pub fn update_receive_state(
        &self,
        receive_next: u32,
        receive_window: u32,
        ts_recent: Option<u32>,
        sack_blocks: Vec<(u32, u32)>,
    ) {
        self.lock()
            .update_receive_state(receive_next, receive_window, ts_recent, sack_blocks);
    }

    pub fn update_mss(&self, mss: u16) {
        self.lock().update_mss(mss);
    }

    pub fn next_timer(&self) -> Option<TimerEvent> {
        self.lock().next_timer()
    }

    pub fn connection_params(&self) -> ConnectionParams {
        self.lock().connection_params()
    }

    pub fn send_capacity(&self) -> usize {
        self.lock().send_capacity()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().is_finished()
    }

    pub fn is_reset(&self) -> bool {
        self.lock().is_reset()
    }

    fn lock(&self) -> MutexGuard<'_, SendEngine> {
        // Invariants are re-checked on every engine call.
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand segments to the link.  Must run without the lock held.
    fn transmit_all(&self, segments: Vec<SegmentDescriptor>) {
        for segment in segments {
            let seq = segment.header.seq;
            if let Err(e) = self.link.transmit(segment) {
                log::debug!("[conn] {}: transmit of seq={seq} failed: {e}", self.id);
                self.stats.record_transmit_failure();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stats.connection_closed();
        log::debug!("[conn] {}: dropped", self.id);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish_non_exhaustive()
    }
}
