//! Unacknowledged and unsent application bytes of one connection.
//!
//! [`SendBuffer`] is a ring of bytes addressed by sequence number.  Its head
//! is always `send_unacked`; its tail is the last byte the application queued.
//!
//! ```text
//!  send_unacked        send_next               end_seq
//!      │                   │                      │
//!  ────┼───────────────────┼──────────────────────┼────▶ seq space
//!      │ <── in flight ──▶ │ <──── unsent ──────▶ │
//! ```
//!
//! The buffer never touches the network.  Segments borrow a [`BufferView`]
//! of the bytes they carry and copy them only when the descriptor is built.

use std::collections::VecDeque;

use crate::error::{BufferError, BufferFull};
use crate::seq::{seq_distance, seq_lt};

/// Byte queue addressed by 32-bit sequence numbers.
#[derive(Debug)]
pub struct SendBuffer {
    /// Sequence number of `data[0]`, i.e. `send_unacked`.
    base_seq: u32,
    data: VecDeque<u8>,
    capacity: usize,
}

/// Borrowed, possibly discontiguous view into a [`SendBuffer`].
///
/// The ring may wrap inside the requested range, so the bytes are exposed as
/// two slices that must be read back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView<'a> {
    pub head: &'a [u8],
    pub tail: &'a [u8],
}

impl BufferView<'_> {
    /// Total number of bytes in the view.
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the viewed bytes into an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(self.head);
        out.extend_from_slice(self.tail);
        out
    }
}

impl SendBuffer {
    /// Create an empty buffer whose first byte will carry `start_seq`.
    pub fn new(start_seq: u32, capacity: usize) -> Self {
        Self {
            base_seq: start_seq,
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    /// Sequence number of the oldest held byte (`send_unacked`).
    pub fn base_seq(&self) -> u32 {
        self.base_seq
    }

    /// Sequence number one past the newest held byte.
    pub fn end_seq(&self) -> u32 {
        self.base_seq.wrapping_add(self.data.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes the application may still queue.
    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Append application bytes at the tail.
    ///
    /// Accepts as many bytes as fit and returns that count.  Fails with
    /// [`BufferFull`] only when not a single byte of a non-empty input fits.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, BufferFull> {
        let room = self.free_space();
        if room == 0 && !bytes.is_empty() {
            return Err(BufferFull {
                capacity: self.capacity,
            });
        }
        let take = room.min(bytes.len());
        self.data.extend(&bytes[..take]);
        Ok(take)
    }

    /// Drop every byte before `new_unacked`.
    ///
    /// Returns the number of bytes released.  An acknowledgement behind the
    /// current head is a [`BufferError::SequenceRegression`]; one past the
    /// tail is [`BufferError::OutOfRange`].
    pub fn consume_acked(&mut self, new_unacked: u32) -> Result<usize, BufferError> {
        if seq_lt(new_unacked, self.base_seq) {
            return Err(BufferError::SequenceRegression {
                ack: new_unacked,
                unacked: self.base_seq,
            });
        }
        let n = seq_distance(self.base_seq, new_unacked) as usize;
        if n > self.data.len() {
            return Err(BufferError::OutOfRange {
                start: self.base_seq,
                len: n,
            });
        }
        self.data.drain(..n);
        self.base_seq = new_unacked;
        Ok(n)
    }

    /// Borrow `len` bytes starting at `seq_start`.
    pub fn read_range(&self, seq_start: u32, len: usize) -> Result<BufferView<'_>, BufferError> {
        let out_of_range = BufferError::OutOfRange {
            start: seq_start,
            len,
        };
        if seq_lt(seq_start, self.base_seq) {
            return Err(out_of_range);
        }
        let offset = seq_distance(self.base_seq, seq_start) as usize;
        let end = offset.checked_add(len).ok_or(out_of_range)?;
        if end > self.data.len() {
            return Err(out_of_range);
        }

        let (a, b) = self.data.as_slices();
        let view = if end <= a.len() {
            BufferView {
                head: &a[offset..end],
                tail: &[],
            }
        } else if offset >= a.len() {
            BufferView {
                head: &b[offset - a.len()..end - a.len()],
                tail: &[],
            }
        } else {
            BufferView {
                head: &a[offset..],
                tail: &b[..end - a.len()],
            }
        };
        Ok(view)
    }
}
