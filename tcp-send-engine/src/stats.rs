//! Counters shared by every connection of a process.
//!
//! Connections never share mutable send state.  What they do share is this
//! set of atomics, handed out as an `Arc<GlobalStats>` and updated through
//! explicit calls.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Process-wide transmission counters.
#[derive(Debug, Default)]
pub struct GlobalStats {
    active_connections: AtomicUsize,
    segments_sent: AtomicU64,
    bytes_sent: AtomicU64,
    retransmissions: AtomicU64,
    fast_retransmits: AtomicU64,
    timeouts: AtomicU64,
    window_probes: AtomicU64,
    transmit_failures: AtomicU64,
    resets: AtomicU64,
}

/// Point-in-time copy of [`GlobalStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub active_connections: usize,
    pub segments_sent: u64,
    pub bytes_sent: u64,
    pub retransmissions: u64,
    pub fast_retransmits: u64,
    pub timeouts: u64,
    pub window_probes: u64,
    pub transmit_failures: u64,
    pub resets: u64,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Never wraps below zero, even on an unbalanced call.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_segment(&self, payload_len: usize) {
        self.segments_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    pub fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fast_retransmit(&self) {
        self.fast_retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_probe(&self) {
        self.window_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transmit_failure(&self) {
        self.transmit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            segments_sent: self.segments_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            fast_retransmits: self.fast_retransmits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            window_probes: self.window_probes.load(Ordering::Relaxed),
            transmit_failures: self.transmit_failures.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "active={} segments={} bytes={} rtx={} fast_rtx={} timeouts={} probes={} tx_fail={} resets={}",
            self.active_connections,
            self.segments_sent,
            self.bytes_sent,
            self.retransmissions,
            self.fast_retransmits,
            self.timeouts,
            self.window_probes,
            self.transmit_failures,
            self.resets
        )
    }
}
