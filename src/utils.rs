//! Size-class arithmetic shared by the pool and the backing-memory providers.
//! None of these functions touch memory.

use crate::config::SMALLEST_LEVEL;

/// Returns the smallest level `k >= SMALLEST_LEVEL` such that `2^k >= bytes`.
///
/// Zero and one byte both resolve to [`SMALLEST_LEVEL`], there is no size class
/// below it. Byte counts that can't be rounded up to a power of two within a
/// `usize` resolve to `usize::BITS`, a level no pool can ever reach.
pub fn bytes_to_level(bytes: usize) -> u32 {
    let level = match bytes.checked_next_power_of_two() {
        Some(size) => size.trailing_zeros(),
        None => usize::BITS,
    };

    level.max(SMALLEST_LEVEL)
}

/// Size in bytes of a block at `level`.
#[inline]
pub const fn level_size(level: u32) -> usize {
    1 << level
}

/// Offset of the buddy of the block at `offset`, found by flipping bit `level`
/// of the block's offset from the arena base.
#[inline]
pub const fn buddy_offset(offset: usize, level: u32) -> usize {
    offset ^ level_size(level)
}

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// Used to round provider requests up to the computer's page size.
pub fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}
