//! Page Buddy Allocator
//!
//! A binary-buddy byte allocator that carves fixed-size pages obtained from
//! the operating system into power-of-two blocks, featuring:
//! - In-place block headers with intrusive per-level lists
//! - Eager splitting and maximal coalescing of buddies
//! - Demand-driven page mapping and bulk reclamation
//! - A coarse-locked wrapper usable as a `#[global_allocator]`
//!
//! # Panics
//!
//! A header that contradicts the heap's bookkeeping (a double release, a
//! merge of blocks that are not buddies, a cyclic level list) is an
//! unrecoverable invariant violation and panics. The heap state is not
//! consistent after such a panic, so catching it with `catch_unwind` and
//! carrying on is unsound. Build with `panic = "abort"` when installing
//! [`LockedBuddyHeap`] as the `#[global_allocator]`.

#![no_std]

#[cfg(test)]
extern crate alloc;

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default page size, the unit mapped from the OS.
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Requested size is zero or larger than one page minus the block header.
    InvalidSize,
    /// Requested alignment is stricter than the payload alignment.
    UnsupportedAlignment,
    /// The page source could not map another page.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize => f.write_str("invalid allocation size"),
            Self::UnsupportedAlignment => f.write_str("unsupported alignment"),
            Self::OutOfMemory => f.write_str("out of memory"),
        }
    }
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Byte-granularity allocator.
pub trait ByteAllocator {
    /// Allocate memory with the given size (in bytes) and alignment.
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>>;

    /// Deallocate memory at the given position, size, and alignment.
    ///
    /// # Safety
    ///
    /// `pos` must have been returned by [`ByteAllocator::alloc`] on this
    /// allocator and not deallocated since.
    unsafe fn dealloc(&mut self, pos: NonNull<u8>, layout: Layout);

    /// Returns total memory size in bytes.
    fn total_bytes(&self) -> usize;

    /// Returns allocated memory size in bytes.
    fn used_bytes(&self) -> usize;

    /// Returns available memory size in bytes.
    fn available_bytes(&self) -> usize;
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

/// Round `addr` up to a multiple of the power-of-two `align`.
#[cfg(unix)]
#[inline]
const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

pub mod buddy;
pub use buddy::{
    BlockInfo, BlockStatus, BuddyHeap, HeapStats, HEADER_SIZE, MAX_SUPPORTED_LEVEL,
    MIN_LEVEL_SHIFT, PAYLOAD_ALIGN,
};

pub mod page_source;
#[cfg(unix)]
pub use page_source::MmapPageSource;
pub use page_source::PageSource;

pub mod global_allocator;
pub use global_allocator::LockedBuddyHeap;

/// A buddy heap fed by anonymous `mmap` pages of [`DEFAULT_PAGE_SIZE`] bytes.
#[cfg(unix)]
pub type MmapBuddyHeap = BuddyHeap<MmapPageSource>;
