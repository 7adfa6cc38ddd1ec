//! Tunable parameters for one send engine.
//!
//! Every connection is created from an [`EngineConfig`].  The defaults follow
//! the conventional values of RFC 5681 (congestion control), RFC 6298
//! (retransmission timer) and RFC 1122 (persist timer).

use std::time::Duration;

/// Largest window-scale shift allowed by RFC 7323.
pub const MAX_WINDOW_SCALE: u8 = 14;

/// Adjustable engine parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Negotiated maximum segment size (payload bytes per segment).
    pub mss: u16,
    /// Initial congestion window, in segments.
    pub initial_window_segments: u32,
    /// Congestion window after a retransmission timeout, in segments.
    pub loss_window_segments: u32,
    /// Initial slow-start threshold in bytes.
    pub initial_ssthresh: u32,

    /// RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// Lower bound of the RTO.
    pub min_rto: Duration,
    /// Upper bound of the RTO after repeated back-off.
    pub max_rto: Duration,
    /// Clock granularity `G` of the RTO formula.
    pub clock_granularity: Duration,
    /// Consecutive retransmission timeouts tolerated before reset.
    pub max_retransmits: u32,

    /// Shortest persist (zero-window probe) interval.
    pub persist_min: Duration,
    /// Longest persist interval after back-off.
    pub persist_max: Duration,

    /// Delay small segments while data is in flight.
    pub nagle: bool,
    /// Bytes of application data the send buffer accepts.
    pub send_buffer_capacity: usize,
    /// Peer agreed to selective acknowledgements.
    pub sack: bool,
    /// Peer agreed to the timestamp option.
    pub timestamps: bool,
    /// Shift applied to windows the peer advertises.
    pub peer_window_scale: u8,
    /// Shift applied to the window we advertise.
    pub local_window_scale: u8,
    /// Collapse the congestion window after an idle period longer than RTO.
    pub idle_restart: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mss: 1460,
            initial_window_segments: 3,
            loss_window_segments: 1,
            initial_ssthresh: u32::MAX,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
            clock_granularity: Duration::from_millis(1),
            max_retransmits: 12,
            persist_min: Duration::from_millis(500),
            persist_max: Duration::from_secs(60),
            nagle: true,
            send_buffer_capacity: 256 * 1024,
            sack: true,
            timestamps: true,
            peer_window_scale: 0,
            local_window_scale: 0,
            idle_restart: true,
        }
    }
}

impl EngineConfig {
    /// Configuration with the given MSS and defaults for everything else.
    pub fn with_mss(mss: u16) -> Self {
        Self {
            mss,
            ..Self::default()
        }
    }

    /// Return a copy whose values are forced into their legal ranges.
    ///
    /// Scales are capped at [`MAX_WINDOW_SCALE`], the MSS is at least one
    /// byte and the RTO bounds are ordered.
    pub fn normalized(mut self) -> Self {
        self.mss = self.mss.max(1);
        self.peer_window_scale = self.peer_window_scale.min(MAX_WINDOW_SCALE);
        self.local_window_scale = self.local_window_scale.min(MAX_WINDOW_SCALE);
        self.initial_window_segments = self.initial_window_segments.max(1);
        self.loss_window_segments = self.loss_window_segments.max(1);
        if self.max_rto < self.min_rto {
            self.max_rto = self.min_rto;
        }
        self.initial_rto = self.initial_rto.clamp(self.min_rto, self.max_rto);
        if self.persist_max < self.persist_min {
            self.persist_max = self.persist_min;
        }
        self
    }
}
