//! Wrap-around arithmetic on 32-bit sequence numbers.
//!
//! Two sequence numbers are compared by the sign of their wrapping
//! difference, which is correct as long as they are less than `2^31` apart.
//! Every window this engine deals with is far smaller than that.

/// `true` when `a` precedes `b` in sequence space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `true` when `a` precedes or equals `b` in sequence space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `true` when `a` follows `b` in sequence space.
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// `true` when `a` follows or equals `b` in sequence space.
#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    seq_le(b, a)
}

/// Number of sequence numbers from `from` up to (excluding) `to`.
///
/// The caller guarantees `seq_le(from, to)`.
#[inline]
pub fn seq_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

/// The later of two sequence numbers.
#[inline]
pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_ge(a, b) {
        a
    } else {
        b
    }
}
