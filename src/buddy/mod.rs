//! Buddy heap module
//!
//! This module provides the binary-buddy engine with:
//! - Size classes (levels) over power-of-two blocks
//! - In-place block headers and buddy address math
//! - Intrusive per-level lists
//! - Statistics and failure reporting

pub mod buddy_block;
pub mod buddy_heap;
pub mod free_list;
pub mod level;
pub mod stats;

pub use buddy_block::{BlockHeader, BlockStatus, HEADER_SIZE, PAYLOAD_ALIGN};
pub use buddy_heap::{BlockInfo, BuddyHeap};
pub use free_list::FreeListTable;
pub use level::{block_size, level_for, MAX_SUPPORTED_LEVEL, MIN_LEVEL_SHIFT};
pub use stats::HeapStats;
