//! Size classes
//!
//! A level `L` names blocks of `2^(L + MIN_LEVEL_SHIFT)` bytes, header
//! included. Level 0 is the smallest block, the top level spans a page.

use super::buddy_block::HEADER_SIZE;

/// Shift of the smallest block size (level 0 blocks are 32 bytes).
pub const MIN_LEVEL_SHIFT: usize = 5;

/// Highest level any page size may produce (2 GiB pages).
pub const MAX_SUPPORTED_LEVEL: usize = 26;

/// Number of list heads needed to cover every supported level.
pub(crate) const LEVEL_SLOTS: usize = MAX_SUPPORTED_LEVEL + 1;

/// Capacity in bytes of a block at `level`, header included.
#[inline]
pub const fn block_size(level: usize) -> usize {
    1 << (level + MIN_LEVEL_SHIFT)
}

/// Top level for pages of `page_size` bytes.
///
/// `page_size` must be a power of two no smaller than the level 1 block.
#[inline]
pub const fn max_level_for(page_size: usize) -> usize {
    page_size.trailing_zeros() as usize - MIN_LEVEL_SHIFT
}

/// Smallest level whose blocks hold `size` payload bytes plus the header.
///
/// Returns `None` when no level up to `max_level` is large enough.
pub fn level_for(size: usize, max_level: usize) -> Option<usize> {
    let needed = size.checked_add(HEADER_SIZE)?.checked_next_power_of_two()?;
    let level = (needed.trailing_zeros() as usize).saturating_sub(MIN_LEVEL_SHIFT);
    (level <= max_level).then_some(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 7;

    #[test]
    fn test_block_sizes() {
        assert_eq!(block_size(0), 32);
        assert_eq!(block_size(3), 256);
        assert_eq!(block_size(MAX), 4096);
        assert_eq!(max_level_for(4096), MAX);
        assert_eq!(max_level_for(1 << 16), 11);
    }

    #[test]
    fn test_level_for_is_minimal() {
        for size in 0..=block_size(MAX) - HEADER_SIZE {
            let level = level_for(size, MAX).unwrap();
            assert!(block_size(level) >= size + HEADER_SIZE);
            if level > 0 {
                assert!(block_size(level - 1) < size + HEADER_SIZE);
            }
        }
    }

    #[test]
    fn test_level_for_boundaries() {
        assert_eq!(level_for(1, MAX), Some(1));
        assert_eq!(level_for(32, MAX), Some(1));
        assert_eq!(level_for(33, MAX), Some(2));
        assert_eq!(level_for(100, MAX), Some(3));
        assert_eq!(level_for(224, MAX), Some(3));
        assert_eq!(level_for(225, MAX), Some(4));
        assert_eq!(level_for(4096 - HEADER_SIZE, MAX), Some(MAX));
    }

    #[test]
    fn test_level_for_too_large() {
        assert_eq!(level_for(4096 - HEADER_SIZE + 1, MAX), None);
        assert_eq!(level_for(usize::MAX, MAX), None);
        assert_eq!(level_for(usize::MAX - HEADER_SIZE, MAX), None);
    }

    #[test]
    fn test_level_for_monotonic() {
        let mut last = 0;
        for size in (1..4064).step_by(7) {
            let level = level_for(size, MAX).unwrap();
            assert!(level >= last);
            last = level;
        }
    }
}
