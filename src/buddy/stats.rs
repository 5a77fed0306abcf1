//! Statistics and debugging for the buddy heap
//!
//! Provides on-demand statistics snapshots and failure reporting.

use super::level::{block_size, LEVEL_SLOTS};

/// Snapshot of the heap's block distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Pages currently mapped.
    pub pages: usize,
    pub free_blocks_by_level: [usize; LEVEL_SLOTS],
    pub used_blocks_by_level: [usize; LEVEL_SLOTS],
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapStats {
    pub const fn new() -> Self {
        Self {
            pages: 0,
            free_blocks_by_level: [0; LEVEL_SLOTS],
            used_blocks_by_level: [0; LEVEL_SLOTS],
        }
    }

    /// Bytes in free blocks, headers included.
    pub fn free_bytes(&self) -> usize {
        Self::bytes(&self.free_blocks_by_level)
    }

    /// Bytes in used blocks, headers included.
    pub fn used_bytes(&self) -> usize {
        Self::bytes(&self.used_blocks_by_level)
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks_by_level.iter().sum()
    }

    pub fn used_blocks(&self) -> usize {
        self.used_blocks_by_level.iter().sum()
    }

    fn bytes(counts: &[usize; LEVEL_SLOTS]) -> usize {
        counts
            .iter()
            .enumerate()
            .map(|(level, &count)| count * block_size(level))
            .sum()
    }
}

/// Detailed memory statistics reporter
pub struct MemoryStatsReporter;

impl MemoryStatsReporter {
    /// Print detailed allocation failure statistics
    #[allow(unused_variables)]
    pub fn print_alloc_failure_stats(
        page_size: usize,
        max_level: usize,
        stats: &HeapStats,
        request_size: usize,
    ) {
        #[cfg(feature = "log")]
        use log::error;
        error!("========================================");
        error!(
            "Request: {} bytes ({} bytes with header)",
            request_size,
            request_size + super::buddy_block::HEADER_SIZE
        );
        error!("Overall Memory State:");
        error!(
            "  Mapped pages: {} ({} KB)",
            stats.pages,
            (stats.pages * page_size) / 1024
        );
        error!("  Free bytes: {}", stats.free_bytes());
        error!("  Used bytes: {}", stats.used_bytes());
        error!("  Blocks by level:");

        for level in (0..=max_level).rev() {
            let free = stats.free_blocks_by_level[level];
            let used = stats.used_blocks_by_level[level];
            if free + used > 0 {
                error!(
                    "    Level {}: {} free / {} used ({} bytes each)",
                    level,
                    free,
                    used,
                    block_size(level)
                );
            }
        }
        error!("========================================");
    }
}
