//! `tcp-send-engine`, the send side of a TCP stack.
//!
//! Turns an application byte stream into segments, decides when each may
//! leave, and recovers from loss.  The receive path, the handshake and the
//! link layer live elsewhere; they talk to the engine through a handful of
//! calls (ACK reports, receive-state updates, MSS updates) and a
//! [`connection::Transmit`] primitive.
//!
//! # Architecture
//!
//! ```text
//!  application ──queue_data──▶ ┌─────────────┐
//!                              │ SendBuffer  │
//!                              └──────┬──────┘
//!                                     │ unsent bytes
//!  ┌────────────────────┐     ┌───────▼──────┐     ┌────────────────┐
//!  │ CongestionController│───▶│  Segmenter   │────▶│ SegmentBuilder │──▶ Transmit
//!  │  (cwnd, peer wnd)   │    │ (Nagle, SWS) │     │ (header, opts) │
//!  └─────────▲──────────┘     └───────┬──────┘     └────────────────┘
//!            │                        │ sent
//!            │ ACK / dup / RTO ┌──────▼──────────┐
//!            └─────────────────│ RetransmitQueue │◀── report_ack (SACK, RTT)
//!                              │  + RTO timer    │◀── on_timer
//!                              └─────────────────┘
//! ```
//!
//! [`engine::SendEngine`] ties these together; [`connection::Connection`]
//! serializes access to it, and [`session`] drives it from tokio.
//!
//! Modules:
//! - [`seq`]         : wrap-around sequence arithmetic
//! - [`config`]      : engine tunables
//! - [`error`]       : error types
//! - [`send_buffer`] : unacknowledged + unsent bytes
//! - [`congestion`]  : Reno congestion and flow control
//! - [`segmenter`]   : MSS slicing, Nagle, silly-window avoidance
//! - [`timer`]       : RTO estimator and one-shot timers
//! - [`retransmit`]  : outstanding segments, SACK scoreboard, RTT sampling
//! - [`packet`]      : segment header and option wire format
//! - [`builder`]     : header assembly for outgoing segments
//! - [`state`]       : driver and congestion state types
//! - [`engine`]      : the per-connection send engine
//! - [`connection`]  : locking wrapper and the transmit primitive
//! - [`stats`]       : process-wide counters
//! - [`session`]     : async event loop around a connection
//! - [`simulator`]   : deterministic lossy network for testing

pub mod builder;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod engine;
pub mod error;
pub mod packet;
pub mod retransmit;
pub mod segmenter;
pub mod send_buffer;
pub mod seq;
pub mod session;
pub mod simulator;
pub mod state;
pub mod stats;
pub mod timer;

pub use config::EngineConfig;
pub use connection::{Connection, Transmit};
pub use engine::{ConnectionId, ConnectionParams, SendEngine};
pub use error::{EngineError, TransmitError};
pub use packet::SegmentDescriptor;
