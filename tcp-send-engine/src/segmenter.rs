//! Slicing unsent data into wire-sized segments.
//!
//! The [`Segmenter`] looks at how much unsent data and usable window there
//! is and plans the next segments.  It never reads payload bytes and never
//! touches the send state; the engine turns each [`SegmentPlan`] into a
//! segment and records it.
//!
//! Rules, in order:
//!
//! 1. A segment carries at most `mss` bytes, and all planned segments
//!    together fit into the usable window.
//! 2. A segment starting before the urgent mark ends at or before it.
//! 3. Nagle: with data in flight on entry, a segment shorter than `mss` is deferred
//!    unless an ACK advanced `send_unacked` since the last small segment,
//!    the data is urgent, the segment finishes a closed stream, or Nagle is
//!    off.
//! 4. Sender-side silly window avoidance (RFC 1122 §4.2.3.4): a short
//!    segment that does not drain the buffer waits for more window while
//!    data is in flight, unless it covers half the largest window seen.
//! 5. FIN rides on the segment that drains the buffer, or goes out alone
//!    once everything else was segmented.
//!
//! Header flags other than FIN are the engine's business.

use crate::seq::{seq_distance, seq_lt};

/// One segment to send: `len` payload bytes starting at `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    pub seq: u32,
    pub len: u32,
    pub fin: bool,
}

impl SegmentPlan {
    /// Sequence space consumed, FIN included.
    pub fn seq_len(&self) -> u32 {
        self.len + u32::from(self.fin)
    }
}

/// Snapshot of the send state the segmenter decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    /// First unsent sequence number.
    pub send_next: u32,
    /// Bytes queued but not yet sent.
    pub unsent: u32,
    /// Bytes sent but not yet acknowledged.
    pub in_flight: u32,
    /// End of stream was requested and FIN not yet sent.
    pub fin: bool,
    /// End of urgent data, if any is still unsent.
    pub urgent_seq: Option<u32>,
    /// Largest window the peer ever advertised.
    pub max_peer_window: u32,
}

/// Segment planner of one connection.
#[derive(Debug, Clone)]
pub struct Segmenter {
    mss: u32,
    nagle: bool,
    /// An ACK advanced `send_unacked` since the last deferred-eligible send.
    ack_released: bool,
}

impl Segmenter {
    pub fn new(mss: u32, nagle: bool) -> Self {
        Self {
            mss: mss.max(1),
            nagle,
            ack_released: false,
        }
    }

    pub fn set_mss(&mut self, mss: u32) {
        self.mss = mss.max(1);
    }

    /// An ACK advanced `send_unacked`; one small segment may go out.
    pub fn on_ack_advanced(&mut self) {
        self.ack_released = true;
    }

    /// Plan the segments that may be sent now within `usable_window`.
    pub fn next_segments(&mut self, usable_window: u32, pending: &Pending) -> Vec<SegmentPlan> {
        let mut plans = Vec::new();
        let mut seq = pending.send_next;
        let mut unsent = pending.unsent;
        let mut window = usable_window;
        let mut in_flight = pending.in_flight;
        // Nagle looks at the state on entry: a burst started while idle may
        // end in a short segment.
        let idle = pending.in_flight == 0;

        while unsent > 0 {
            let urgent_end = pending.urgent_seq.filter(|&u| seq_lt(seq, u));
            let mut len = unsent.min(self.mss).min(window);
            if let Some(end) = urgent_end {
                len = len.min(seq_distance(seq, end));
            }
            if len == 0 {
                break;
            }

            let drains = len == unsent;
            let fin = pending.fin && drains;
            if len < self.mss && !idle {
                let nagle_ok = !self.nagle || self.ack_released || urgent_end.is_some() || fin;
                if !nagle_ok {
                    log::trace!("[seg] nagle defers {len} bytes at seq={seq}");
                    break;
                }
            }
            let window_limited = !drains && urgent_end.is_none();
            if len < self.mss
                && in_flight > 0
                && window_limited
                && len < pending.max_peer_window / 2
            {
                log::trace!("[seg] waiting for window beyond {len} bytes at seq={seq}");
                break;
            }
            if len < self.mss && !idle {
                self.ack_released = false;
            }

            plans.push(SegmentPlan { seq, len, fin });
            seq = seq.wrapping_add(len);
            unsent -= len;
            window -= len;
            in_flight = in_flight.saturating_add(len);
            if fin {
                return plans;
            }
        }

        if unsent == 0 && pending.fin {
            plans.push(SegmentPlan {
                seq,
                len: 0,
                fin: true,
            });
        }
        plans
    }
}
