//! Bit twiddling helpers for the 64-bit bin map and the tree-bin routing
//! logic. The find-first-set and find-last-set functions use the classic
//! 1-based `ffs`/`fls` convention: bit 0 maps to 1 and a zero input maps
//! to 0, so callers can branch on "nothing found" without a separate guard
//! around the hardware intrinsics, which are undefined at zero on some
//! targets.

/// 1-based index of the least significant set bit, 0 if `x` is zero.
#[inline]
pub(crate) fn find_first_set(x: u64) -> usize {
    if x == 0 {
        0
    } else {
        x.trailing_zeros() as usize + 1
    }
}

/// 1-based index of the most significant set bit, 0 if `x` is zero.
#[inline]
pub(crate) fn find_last_set(x: usize) -> usize {
    if x == 0 {
        0
    } else {
        usize::BITS as usize - x.leading_zeros() as usize
    }
}

/// Value of the most significant bit of a machine word, either 0 or 1.
#[inline]
pub(crate) fn word_msb(x: usize) -> usize {
    x >> (usize::BITS - 1)
}

#[inline]
pub(crate) fn set_bit(x: u64, idx: usize) -> u64 {
    x | (1 << idx)
}

#[inline]
pub(crate) fn reset_bit(x: u64, idx: usize) -> u64 {
    x & !(1 << idx)
}

#[inline]
pub(crate) fn check_bit(x: usize, idx: usize) -> bool {
    x & (1 << idx) != 0
}
