//! Error taxonomy of the send engine.
//!
//! | Error                 | Meaning                         | Handling                     |
//! |-----------------------|---------------------------------|------------------------------|
//! | `SequenceRegression`  | stale or duplicate ACK          | ignored by the caller        |
//! | `OutOfRange`          | internal invariant violated     | fatal, connection reset      |
//! | [`BufferFull`]        | backpressure                    | surfaced to the application  |
//! | [`TransmitError`]     | link refused a segment          | recovered by RTO only        |

use thiserror::Error;

/// Errors raised by [`crate::send_buffer::SendBuffer`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// The acknowledgement lies behind the oldest held byte.
    #[error("acknowledgement {ack} precedes send_unacked {unacked}")]
    SequenceRegression { ack: u32, unacked: u32 },
    /// The requested range is not held by the buffer.
    #[error("range [{start}, +{len}) is not held by the send buffer")]
    OutOfRange { start: u32, len: usize },
}

/// The send buffer has no room for more application data.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("send buffer full ({capacity} bytes)")]
pub struct BufferFull {
    pub capacity: usize,
}

/// Failure reported by the transmission primitive.
///
/// Always treated as transient: the engine never retries inline and relies on
/// the retransmission timer instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransmitError {
    #[error("link is down")]
    LinkDown,
    #[error("transmit queue full")]
    WouldBlock,
    #[error("transmit failed: {0}")]
    Other(String),
}

/// Errors surfaced by the engine to its owner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Internal state is corrupted; the connection must be torn down.
    #[error("send state invariant violated: {0}")]
    Invariant(String),
    /// Too many consecutive retransmission timeouts.
    #[error("retransmission limit reached after {0} timeouts")]
    RetransmitLimit(u32),
    /// The send buffer is full; retry after ACKs free space.
    #[error(transparent)]
    Full(#[from] BufferFull),
    /// Data was queued after the application requested close, or the
    /// receive path went away before the FIN was acknowledged.
    #[error("send side closed")]
    Closed,
    /// The engine was reset by an earlier fatal error.
    #[error("connection reset")]
    Reset,
}

impl EngineError {
    /// `true` for errors that terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Invariant(_) | EngineError::RetransmitLimit(_) | EngineError::Reset
        )
    }
}

impl From<BufferError> for EngineError {
    fn from(e: BufferError) -> Self {
        EngineError::Invariant(e.to_string())
    }
}
