//! Wraparound-aware sequence number arithmetic.
//!
//! Sequence numbers live in a 32-bit space that wraps. Two numbers are
//! ordered by the sign of their wrapping difference, so `0xFFFF_FFFF` comes
//! before `0x0000_0001`. The ordering is only meaningful for numbers less
//! than half the space apart, which the connection guarantees by syncing
//! before the outstanding window grows that large.

use std::cmp::Ordering;

/// Compare two sequence numbers, accounting for wraparound.
#[inline]
pub fn compare(a: u32, b: u32) -> Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}

/// `a < b` in sequence order.
#[inline]
pub fn wrapping_lt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// `a <= b` in sequence order.
#[inline]
pub fn wrapping_le(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}

/// `a > b` in sequence order.
#[inline]
pub fn wrapping_gt(a: u32, b: u32) -> bool {
    wrapping_lt(b, a)
}

/// `a >= b` in sequence order.
#[inline]
pub fn wrapping_ge(a: u32, b: u32) -> bool {
    wrapping_le(b, a)
}

/// Rebuild a full sequence number from the 16 bits carried on the wire.
///
/// Takes the high bits of `last` and moves forward one 16-bit period when
/// the result would otherwise go backwards.
#[inline]
pub fn widen(last: u32, low: u16) -> u32 {
    let candidate = (last & 0xFFFF_0000) | u32::from(low);
    if wrapping_lt(candidate, last) {
        candidate.wrapping_add(0x1_0000)
    } else {
        candidate
    }
}
