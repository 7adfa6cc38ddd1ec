//! Header assembly for outgoing segments.
//!
//! [`SegmentBuilder::build`] is a pure function of the segment being sent
//! and the receive-side state the engine was last told about.  It decides
//! the acknowledgement number, the advertised window and the option block;
//! it neither transmits nor records anything.
//!
//! Option layout (every block 32-bit aligned with NOPs):
//!
//! ```text
//! SYN:   MSS(4) | NOP WS(4) | NOP NOP SACK-OK(4) | NOP NOP TS(12)      = 24 bytes
//! other: NOP NOP TS(12) | NOP NOP SACK(2 + 8·n)                       <= 40 bytes
//! ```
//!
//! With timestamps on, at most three SACK blocks fit; without, four.

use std::time::Instant;

use crate::config::EngineConfig;
use crate::packet::{flags, Header, SegmentDescriptor, TcpOption, MAX_OPTIONS_LEN};

/// Receive-side inputs to every outgoing header.
///
/// Supplied by the receive path through
/// [`crate::engine::SendEngine::update_receive_state`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveState {
    /// Next sequence number expected from the peer; `None` until the
    /// peer's initial sequence number is known.
    pub receive_next: Option<u32>,
    /// Free space in our receive buffer, in bytes.
    pub receive_window: u32,
    /// Most recent TSval seen from the peer, echoed as TSecr.
    pub ts_recent: Option<u32>,
    /// Out-of-order blocks held by the receiver, most recent first.
    pub sack_blocks: Vec<(u32, u32)>,
}

/// What to send, before header fields are filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSegment {
    pub seq: u32,
    /// Any of SYN/FIN/RST/PSH/URG.  ACK is added by the builder.
    pub flags: u8,
    /// Offset from `seq` to the end of urgent data (with URG).
    pub urgent: u16,
    pub payload: Vec<u8>,
}

/// Fills in header fields from connection-wide settings.
#[derive(Debug, Clone)]
pub struct SegmentBuilder {
    src_port: u16,
    dst_port: u16,
    mss: u16,
    local_window_scale: u8,
    sack: bool,
    timestamps: bool,
    /// Zero point of the timestamp clock.
    epoch: Instant,
}

impl SegmentBuilder {
    pub fn new(config: &EngineConfig, src_port: u16, dst_port: u16, epoch: Instant) -> Self {
        Self {
            src_port,
            dst_port,
            mss: config.mss,
            local_window_scale: config.local_window_scale,
            sack: config.sack,
            timestamps: config.timestamps,
            epoch,
        }
    }

    /// Timestamp clock value at `now`: milliseconds since `epoch`, wrapping.
    pub fn ts_value(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.epoch).as_millis() as u32
    }

    /// Build an immutable descriptor for `segment`.
    pub fn build(&self, segment: OutgoingSegment, rcv: &ReceiveState, now: Instant) -> SegmentDescriptor {
        let syn = segment.flags & flags::SYN != 0;
        let mut header_flags = segment.flags;
        let ack = match rcv.receive_next {
            Some(next) => {
                header_flags |= flags::ACK;
                next
            }
            None => 0,
        };

        // RFC 7323 §2.2: the window of a SYN is never scaled.
        let scaled = if syn {
            rcv.receive_window
        } else {
            rcv.receive_window >> self.local_window_scale
        };
        let window = scaled.min(u32::from(u16::MAX)) as u16;

        let options = if syn {
            self.syn_options()
        } else {
            self.data_options(rcv, now)
        };

        SegmentDescriptor {
            header: Header {
                src_port: self.src_port,
                dst_port: self.dst_port,
                seq: segment.seq,
                ack,
                flags: header_flags,
                window,
                checksum: 0,
                urgent: if segment.flags & flags::URG != 0 {
                    segment.urgent
                } else {
                    0
                },
                options,
            },
            payload: segment.payload,
        }
    }

    /// Options offered on a SYN.
    pub fn syn_options(&self) -> Vec<TcpOption> {
        let mut options = vec![
            TcpOption::MaxSegmentSize(self.mss),
            TcpOption::NoOperation,
            TcpOption::WindowScale(self.local_window_scale),
        ];
        if self.sack {
            options.extend([
                TcpOption::NoOperation,
                TcpOption::NoOperation,
                TcpOption::SackPermitted,
            ]);
        }
        if self.timestamps {
            options.extend([
                TcpOption::NoOperation,
                TcpOption::NoOperation,
                TcpOption::Timestamps {
                    value: 0,
                    echo: 0,
                },
            ]);
        }
        options
    }

    fn data_options(&self, rcv: &ReceiveState, now: Instant) -> Vec<TcpOption> {
        let mut options = Vec::new();
        let mut used = 0;
        if self.timestamps {
            options.extend([
                TcpOption::NoOperation,
                TcpOption::NoOperation,
                TcpOption::Timestamps {
                    value: self.ts_value(now),
                    echo: rcv.ts_recent.unwrap_or(0),
                },
            ]);
            used += 12;
        }
        if self.sack && !rcv.sack_blocks.is_empty() {
            let fit = (MAX_OPTIONS_LEN - used - 4) / 8;
            let blocks: Vec<_> = rcv.sack_blocks.iter().copied().take(fit).collect();
            options.extend([
                TcpOption::NoOperation,
                TcpOption::NoOperation,
                TcpOption::Sack(blocks),
            ]);
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{encode_options, options_len};

    fn builder(cfg: &EngineConfig, epoch: Instant) -> SegmentBuilder {
        SegmentBuilder::new(cfg, 1234, 80, epoch)
    }

    fn data(seq: u32, payload: &[u8]) -> OutgoingSegment {
        OutgoingSegment {
            seq,
            flags: 0,
            urgent: 0,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn ack_and_window_come_from_receive_state() {
        let epoch = Instant::now();
        let cfg = EngineConfig {
            local_window_scale: 2,
            timestamps: false,
            ..EngineConfig::default()
        };
        let rcv = ReceiveState {
            receive_next: Some(777),
            receive_window: 40_000,
            ..ReceiveState::default()
        };
        let seg = builder(&cfg, epoch).build(data(5, b"x"), &rcv, epoch);
        assert_eq!(seg.header.ack, 777);
        assert_eq!(seg.header.window, 10_000);
        assert!(seg.header.has(flags::ACK));
        assert!(seg.header.options.is_empty());
    }

    #[test]
    fn no_ack_flag_before_peer_sequence_known() {
        let epoch = Instant::now();
        let seg = builder(&EngineConfig::default(), epoch).build(
            data(0, b""),
            &ReceiveState::default(),
            epoch,
        );
        assert!(!seg.header.has(flags::ACK));
        assert_eq!(seg.header.ack, 0);
    }

    #[test]
    fn timestamps_carry_clock_and_echo() {
        let epoch = Instant::now();
        let rcv = ReceiveState {
            receive_next: Some(1),
            ts_recent: Some(99),
            ..ReceiveState::default()
        };
        let now = epoch + std::time::Duration::from_millis(1500);
        let seg = builder(&EngineConfig::default(), epoch).build(data(0, b"a"), &rcv, now);
        assert_eq!(
            seg.header.options[2],
            TcpOption::Timestamps {
                value: 1500,
                echo: 99,
            }
        );
    }

    #[test]
    fn sack_blocks_limited_by_option_space() {
        let epoch = Instant::now();
        let rcv = ReceiveState {
            receive_next: Some(1),
            sack_blocks: vec![(10, 20), (30, 40), (50, 60), (70, 80), (90, 100)],
            ..ReceiveState::default()
        };

        let with_ts = builder(&EngineConfig::default(), epoch).build(data(0, b""), &rcv, epoch);
        match with_ts.header.options.last() {
            Some(TcpOption::Sack(blocks)) => assert_eq!(blocks.len(), 3),
            other => panic!("expected SACK option, got {other:?}"),
        }
        assert_eq!(options_len(&with_ts.header.options), 40);

        let cfg = EngineConfig {
            timestamps: false,
            ..EngineConfig::default()
        };
        let without_ts = builder(&cfg, epoch).build(data(0, b""), &rcv, epoch);
        match without_ts.header.options.last() {
            Some(TcpOption::Sack(blocks)) => assert_eq!(blocks.len(), 4),
            other => panic!("expected SACK option, got {other:?}"),
        }
        assert_eq!(options_len(&without_ts.header.options), 36);
    }

    #[test]
    fn syn_carries_unscaled_window_and_negotiation_options() {
        let epoch = Instant::now();
        let cfg = EngineConfig {
            local_window_scale: 7,
            ..EngineConfig::default()
        };
        let rcv = ReceiveState {
            receive_window: 1 << 20,
            ..ReceiveState::default()
        };
        let seg = builder(&cfg, epoch).build(
            OutgoingSegment {
                seq: 100,
                flags: flags::SYN,
                urgent: 0,
                payload: Vec::new(),
            },
            &rcv,
            epoch,
        );
        assert_eq!(seg.header.window, u16::MAX);
        let bytes = encode_options(&seg.header.options);
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..8], &[2, 4, 0x05, 0xb4, 1, 3, 3, 7]);
        assert_eq!(&bytes[8..12], &[1, 1, 4, 2]);
    }

    #[test]
    fn window_scale_only_on_syn() {
        let epoch = Instant::now();
        let rcv = ReceiveState {
            receive_next: Some(1),
            ..ReceiveState::default()
        };
        let seg = builder(&EngineConfig::default(), epoch).build(data(0, b"x"), &rcv, epoch);
        assert!(!seg
            .header
            .options
            .iter()
            .any(|o| matches!(o, TcpOption::WindowScale(_) | TcpOption::MaxSegmentSize(_))));
    }

    #[test]
    fn urgent_pointer_only_with_urg() {
        let epoch = Instant::now();
        let rcv = ReceiveState::default();
        let b = builder(&EngineConfig::default(), epoch);
        let plain = b.build(
            OutgoingSegment {
                urgent: 5,
                ..data(0, b"abcdef")
            },
            &rcv,
            epoch,
        );
        assert_eq!(plain.header.urgent, 0);
        let urgent = b.build(
            OutgoingSegment {
                flags: flags::URG,
                urgent: 5,
                ..data(0, b"abcdef")
            },
            &rcv,
            epoch,
        );
        assert_eq!(urgent.header.urgent, 5);
    }
}
