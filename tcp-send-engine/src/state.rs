//! Finite-state machine types of the send engine.
//!
//! Two machines run side by side:
//!
//! - [`DriverState`]: what the output driver is doing with the connection.
//! - [`CongestionPhase`]: which growth/recovery law governs `cwnd`.
//!
//! Transitions live in [`crate::engine`] and [`crate::congestion`]; this
//! module only names the states.

/// State of the output driver.
///
/// ```text
///            new data / window opens / RTO
///   IDLE ───────────────────────────────────▶ SENDING
///    ▲                                          │  │
///    │  window exhausted or nothing to send     │  │ peer_window == 0
///    └──────────────────────────────────────────┘  ▼
///                                               PROBING ──nonzero window──▶ SENDING
///
///   any ── FIN queued and all data acknowledged ──▶ CLOSING (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverState {
    /// Nothing can be sent right now.
    #[default]
    Idle,
    /// Segments are being pulled from the segmenter or retransmit queue.
    Sending,
    /// The peer advertised a zero window; the persist timer is armed.
    Probing,
    /// FIN queued and every data byte acknowledged.
    Closing,
}

/// Congestion-control phase (RFC 5681).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionPhase {
    /// Exponential growth while `cwnd < ssthresh`.
    #[default]
    SlowStart,
    /// Additive increase once `cwnd >= ssthresh`.
    CongestionAvoidance,
    /// Entered on the third duplicate ACK; `cwnd` is inflated per dup ACK.
    FastRecovery,
    /// Entered on RTO expiry; `cwnd` collapses to the loss window.
    LossRecovery,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DriverState::Idle => "idle",
            DriverState::Sending => "sending",
            DriverState::Probing => "probing",
            DriverState::Closing => "closing",
        };
        f.write_str(name)
    }
}

impl std::fmt::Display for CongestionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CongestionPhase::SlowStart => "slow_start",
            CongestionPhase::CongestionAvoidance => "congestion_avoidance",
            CongestionPhase::FastRecovery => "fast_recovery",
            CongestionPhase::LossRecovery => "loss_recovery",
        };
        f.write_str(name)
    }
}
