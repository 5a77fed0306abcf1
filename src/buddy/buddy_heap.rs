//! Buddy heap over OS pages
//!
//! Serves byte requests from power-of-two blocks carved out of pages taken
//! from a [`PageSource`]. Blocks are split on demand down to the requested
//! level and coalesced with their buddies as soon as both halves are free.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::page_source::PageSource;
use crate::{AllocError, AllocResult, ByteAllocator};

#[cfg(feature = "log")]
use log::{debug, info, trace};

use super::{
    buddy_block::{
        buddy_of, header_of, init_block, merge, payload_of, split, BlockHeader, BlockStatus,
        HEADER_SIZE, PAYLOAD_ALIGN,
    },
    free_list::FreeListTable,
    level::{self, block_size, max_level_for, MAX_SUPPORTED_LEVEL},
    stats::{HeapStats, MemoryStatsReporter},
};

/// Public view of one block linked in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: usize,
    pub level: usize,
    pub status: BlockStatus,
}

impl BlockInfo {
    fn of(block: NonNull<BlockHeader>) -> Self {
        let header = unsafe { block.as_ref() };
        Self {
            addr: block.as_ptr() as usize,
            level: header.level(),
            status: header.status(),
        }
    }
}

/// Binary-buddy heap.
///
/// The heap owns every page it maps until [`BuddyHeap::reclaim_all`] or drop.
/// It performs no locking: all mutation goes through `&mut self`. Wrap it in
/// [`crate::LockedBuddyHeap`] to share it between threads.
pub struct BuddyHeap<S: PageSource, const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    lists: FreeListTable,
    source: S,
    pages: usize,
}

// SAFETY: the heap exclusively owns its pages and every header inside them;
// no pointer into them is shared with another heap.
unsafe impl<S: PageSource + Send, const PAGE_SIZE: usize> Send for BuddyHeap<S, PAGE_SIZE> {}

impl<S: PageSource, const PAGE_SIZE: usize> BuddyHeap<S, PAGE_SIZE> {
    /// Level of a block spanning a whole page.
    pub const MAX_LEVEL: usize = {
        assert!(PAGE_SIZE.is_power_of_two(), "page size must be a power of two");
        assert!(PAGE_SIZE >= block_size(1), "page size is smaller than two headers");
        assert!(
            max_level_for(PAGE_SIZE) <= MAX_SUPPORTED_LEVEL,
            "page size exceeds the largest supported level"
        );
        max_level_for(PAGE_SIZE)
    };

    /// Largest request that fits in a page next to its header.
    pub const MAX_REQUEST: usize = PAGE_SIZE - HEADER_SIZE;

    /// Create an empty heap drawing pages from `source`.
    pub const fn new(source: S) -> Self {
        let _max_level = Self::MAX_LEVEL;
        Self {
            lists: FreeListTable::new(),
            source,
            pages: 0,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Number of pages currently mapped.
    pub fn page_count(&self) -> usize {
        self.pages
    }

    /// Level a request of `size` bytes is served from, if any.
    pub fn level_for(&self, size: usize) -> Option<usize> {
        level::level_for(size, Self::MAX_LEVEL)
    }

    /// Allocate at least `size` bytes.
    ///
    /// The payload is aligned to [`PAYLOAD_ALIGN`]. A fresh page is mapped
    /// only when no free block of a sufficient level exists.
    pub fn acquire(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        if size == 0 || size > Self::MAX_REQUEST {
            debug!("buddy heap: invalid request of {} bytes", size);
            return Err(AllocError::InvalidSize);
        }
        let target = self.level_for(size).ok_or(AllocError::InvalidSize)?;

        let block = match self.lists.find_first_free(target, Self::MAX_LEVEL) {
            Some(block) => block,
            None => {
                let Some(page) = self.acquire_page() else {
                    MemoryStatsReporter::print_alloc_failure_stats(
                        PAGE_SIZE,
                        Self::MAX_LEVEL,
                        &self.stats(),
                        size,
                    );
                    return Err(AllocError::OutOfMemory);
                };
                unsafe { self.lists.push_front(Self::MAX_LEVEL, page) };
                page
            }
        };

        let mut block = unsafe { self.split_down(block, target) };
        unsafe { block.as_mut() }.status = BlockStatus::Used;
        trace!(
            "buddy heap: {} bytes at level {} from {:p}",
            size,
            target,
            block
        );
        Ok(payload_of(block))
    }

    /// Return a payload obtained from [`BuddyHeap::acquire`].
    ///
    /// Null is ignored. The block is coalesced with its buddy for as long as
    /// the buddy is free at the same level.
    ///
    /// # Panics
    ///
    /// Panics if the header in front of `ptr` does not describe a used block.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have been returned by `acquire` on this heap and
    /// not released since.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        let mut block = unsafe { header_of(payload) };
        unsafe { self.check_used(block) };

        unsafe { block.as_mut() }.status = BlockStatus::Free;
        unsafe { self.coalesce(block) };
    }

    /// Payload bytes available behind a live allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `acquire` on this heap and not
    /// released since.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let block = unsafe { header_of(ptr) };
        unsafe { block.as_ref() }.capacity() - HEADER_SIZE
    }

    /// Free every outstanding block and unmap every page.
    ///
    /// Afterwards every level is empty and the next `acquire` maps a fresh
    /// page.
    ///
    /// # Safety
    ///
    /// Every pointer handed out by this heap is invalidated, whoever owns it.
    /// None of them may be used or released afterwards.
    pub unsafe fn reclaim_all(&mut self) {
        for level in 0..Self::MAX_LEVEL {
            while let Some(mut block) = self.lists.find_first_used(level) {
                unsafe { block.as_mut() }.status = BlockStatus::Free;
                unsafe { self.coalesce(block) };
            }
            assert!(
                self.lists.is_empty(level),
                "level {} still holds {} blocks after reclamation",
                level,
                self.lists.len(level)
            );
        }

        debug!("buddy heap: reclaiming {} pages", self.pages);
        while let Some(page) = self.lists.head(Self::MAX_LEVEL) {
            unsafe {
                self.lists.remove(page);
                self.release_page(page);
            }
        }
        debug_assert_eq!(self.pages, 0, "page count out of sync with the top level");
    }

    /// Blocks linked at `level`, in list order.
    pub fn blocks(&self, level: usize) -> impl Iterator<Item = BlockInfo> + '_ {
        assert!(level <= Self::MAX_LEVEL, "level {} out of range", level);
        self.lists.iter(level).map(BlockInfo::of)
    }

    /// Count pages and blocks per level.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::new();
        stats.pages = self.pages;
        for level in 0..=Self::MAX_LEVEL {
            for block in self.lists.iter(level) {
                match unsafe { block.as_ref() }.status() {
                    BlockStatus::Free => stats.free_blocks_by_level[level] += 1,
                    BlockStatus::Used => stats.used_blocks_by_level[level] += 1,
                }
            }
        }
        stats
    }

    /// Print the block distribution of the heap.
    pub fn log_heap_info(&self) {
        let stats = self.stats();
        info!("========== Buddy Heap Info ==========");
        info!("Page size: {:#x} ({})", PAGE_SIZE, PAGE_SIZE);
        info!("Mapped pages: {}", stats.pages);
        info!("Blocks by level:");
        for level in 0..=Self::MAX_LEVEL {
            let free = stats.free_blocks_by_level[level];
            let used = stats.used_blocks_by_level[level];
            if free + used > 0 {
                info!(
                    "  Level {} ({} bytes): {} free, {} used",
                    level,
                    block_size(level),
                    free,
                    used
                );
            }
        }
        info!(
            "Free bytes: {}, used bytes: {}",
            stats.free_bytes(),
            stats.used_bytes()
        );
        info!("=====================================");
    }

    /// Split `block` until it reaches `target`, descending into upper halves.
    ///
    /// Both halves of every split are relinked at the lower level.
    unsafe fn split_down(
        &mut self,
        mut block: NonNull<BlockHeader>,
        target: usize,
    ) -> NonNull<BlockHeader> {
        while unsafe { block.as_ref() }.level() != target {
            unsafe {
                self.lists.remove(block);
                let upper = split(block);
                let level = block.as_ref().level();
                self.lists.push_front(level, block);
                self.lists.push_front(level, upper);
                block = upper;
            }
        }
        block
    }

    /// Merge a free, linked `block` upward while its buddy is free.
    unsafe fn coalesce(&mut self, mut block: NonNull<BlockHeader>) {
        while unsafe { block.as_ref() }.level() < Self::MAX_LEVEL {
            let buddy = unsafe { buddy_of(block, Self::MAX_LEVEL) };
            let mergeable = unsafe {
                buddy.as_ref().is_free() && buddy.as_ref().level() == block.as_ref().level()
            };
            if !mergeable {
                break;
            }

            unsafe {
                self.lists.remove(buddy);
                self.lists.remove(block);
                let mut merged = merge(block, buddy, Self::MAX_LEVEL);
                merged.as_mut().status = BlockStatus::Free;
                self.lists.push_front(merged.as_ref().level(), merged);
                block = merged;
            }
        }
    }

    /// Panic unless `block` looks like a used block of this heap.
    unsafe fn check_used(&self, block: NonNull<BlockHeader>) {
        let (level, status) = unsafe { BlockHeader::raw_parts(block) };
        assert!(
            level <= Self::MAX_LEVEL && status == BlockStatus::Used as u32,
            "release of {:p}: corrupted header or double release (level {}, status {})",
            block,
            level,
            status
        );
    }

    /// Map one page and describe it as a single free top level block.
    fn acquire_page(&mut self) -> Option<NonNull<BlockHeader>> {
        let page = self.source.map_page(PAGE_SIZE)?;
        assert!(
            crate::is_aligned(page.as_ptr() as usize, PAGE_SIZE),
            "page source returned {:p}, not aligned to {:#x}",
            page,
            PAGE_SIZE
        );
        self.pages += 1;
        debug!("buddy heap: mapped page {:p} ({} pages)", page, self.pages);
        Some(unsafe { init_block(page, Self::MAX_LEVEL, BlockStatus::Free) })
    }

    /// Hand a bare, unsplit top level block back to the page source.
    unsafe fn release_page(&mut self, page: NonNull<BlockHeader>) {
        debug_assert_eq!(unsafe { page.as_ref() }.level(), Self::MAX_LEVEL);
        unsafe { self.source.unmap_page(page.cast(), PAGE_SIZE) };
        self.pages -= 1;
    }
}

impl<S: PageSource + Default, const PAGE_SIZE: usize> Default for BuddyHeap<S, PAGE_SIZE> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: PageSource, const PAGE_SIZE: usize> Drop for BuddyHeap<S, PAGE_SIZE> {
    fn drop(&mut self) {
        // Outstanding payloads die with the heap.
        unsafe { self.reclaim_all() };
    }
}

impl<S: PageSource, const PAGE_SIZE: usize> ByteAllocator for BuddyHeap<S, PAGE_SIZE> {
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        if layout.align() > PAYLOAD_ALIGN {
            debug!("buddy heap: unsupported alignment {}", layout.align());
            return Err(AllocError::UnsupportedAlignment);
        }
        self.acquire(layout.size())
    }

    unsafe fn dealloc(&mut self, pos: NonNull<u8>, _layout: Layout) {
        unsafe { self.release(pos.as_ptr()) };
    }

    fn total_bytes(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    fn used_bytes(&self) -> usize {
        self.stats().used_bytes()
    }

    fn available_bytes(&self) -> usize {
        self.total_bytes() - self.used_bytes()
    }
}
