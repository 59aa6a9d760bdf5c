//! Size class layout. 64 bins total: 32 exact-fit small bins covering
//! payloads up to 255 bytes with a stride of 8, then 32 tree bins covering
//! each power-of-two range with two bins (split on the second-highest bit).
//! The last tree bin absorbs everything at or above [`MAX_TREE_BIN_SIZE`],
//! which happens naturally when large free blocks coalesce.

use crate::bits;

pub(crate) const NUM_SMALL_BINS: usize = 32;
pub(crate) const NUM_TREE_BINS: usize = 32;
pub(crate) const NUM_BINS: usize = NUM_SMALL_BINS + NUM_TREE_BINS;

/// Largest payload served from the exact-fit small bins.
pub(crate) const MAX_SMALL_BIN_SIZE: usize = 255;

/// Sizes at or above this land in the last tree bin.
pub(crate) const MAX_TREE_BIN_SIZE: usize = 16 * 1024 - 1;

/// Requests above this bypass the bins entirely and get a dedicated
/// external segment.
pub(crate) const LARGE_ALLOC_BOUNDARY: usize = 32 * 1024 * 1024;

#[inline]
pub(crate) fn is_small(num_bytes: usize) -> bool {
    num_bytes <= MAX_SMALL_BIN_SIZE
}

#[inline]
pub(crate) fn is_large(num_bytes: usize) -> bool {
    num_bytes > LARGE_ALLOC_BOUNDARY
}

/// Maps a block size to its bin. Monotonic non-decreasing, so masking the
/// bin map from `bin_index(n)` upwards only ever surfaces blocks of at
/// least `n` bytes.
pub(crate) fn bin_index(num_bytes: usize) -> usize {
    debug_assert!(num_bytes > 0);

    if is_small(num_bytes) {
        num_bytes / 8
    } else if num_bytes < MAX_TREE_BIN_SIZE {
        // The index of the highest set bit narrows the size down to two
        // bins and the bit two below it picks between them. The constants
        // line up so that bin 32 covers [256, 384): 256 has its highest
        // set bit at fls index 9, and 9 + 23 + (9 - 9) = 32.
        let fls = bits::find_last_set(num_bytes);
        let mut bin = fls + 23 + (fls - 9);

        if bits::check_bit(num_bytes, fls - 2) {
            bin += 1;
        }
        bin
    } else {
        NUM_BINS - 1
    }
}

/// Left shift that moves the highest routing bit of a size in `bin_index`'s
/// range into the most significant position. 9 is the fls index of the
/// smallest tree-bin size (256, bin 32); each pair of bins doubles the
/// range and therefore shifts one bit less.
#[inline]
pub(crate) fn tree_bin_shift(bin_index: usize) -> usize {
    debug_assert!((NUM_SMALL_BINS..NUM_BINS).contains(&bin_index));
    usize::BITS as usize - 9 - ((bin_index - NUM_SMALL_BINS) >> 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_bins_are_exact_fit() {
        assert_eq!(bin_index(1), 0);
        assert_eq!(bin_index(8), 1);
        assert_eq!(bin_index(16), 2);
        assert_eq!(bin_index(255), 31);
        for n in 1..=MAX_SMALL_BIN_SIZE {
            assert_eq!(bin_index(n), n / 8);
        }
    }

    #[test]
    fn tree_bins_split_each_power_of_two() {
        assert_eq!(bin_index(256), 32);
        assert_eq!(bin_index(383), 32);
        assert_eq!(bin_index(384), 33);
        assert_eq!(bin_index(511), 33);
        assert_eq!(bin_index(512), 34);
        assert_eq!(bin_index(768), 35);
        assert_eq!(bin_index(1024), 36);
        assert_eq!(bin_index(8192), 42);
        assert_eq!(bin_index(12288), 43);
        assert_eq!(bin_index(MAX_TREE_BIN_SIZE - 1), 43);
    }

    #[test]
    fn last_bin_absorbs_the_tail() {
        assert_eq!(bin_index(MAX_TREE_BIN_SIZE), NUM_BINS - 1);
        assert_eq!(bin_index(1024 * 1024), NUM_BINS - 1);
        assert_eq!(bin_index(LARGE_ALLOC_BOUNDARY), NUM_BINS - 1);
    }

    #[test]
    fn index_is_monotonic() {
        let mut last = 0;
        for n in 1..=(MAX_TREE_BIN_SIZE + 1) {
            let bin = bin_index(n);
            assert!(bin >= last, "bin_index({n}) = {bin} < {last}");
            last = bin;
        }
    }

    #[test]
    fn shift_moves_routing_bit_to_msb() {
        // Smallest size of bin 32 shifted into place has its highest bit on
        // top of the word.
        assert_eq!(256usize << tree_bin_shift(32), 1 << (usize::BITS - 1));
        assert_eq!(512usize << tree_bin_shift(34), 1 << (usize::BITS - 1));
        assert_eq!(8192usize << tree_bin_shift(42), 1 << (usize::BITS - 1));
    }
}
