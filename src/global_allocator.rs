//! Locked buddy heap.
//!
//! [`BuddyHeap`] has no internal synchronization. This module puts one
//! coarse spin lock around every free-list and header mutation so a heap can
//! be shared between threads or installed as the `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use kspin::{SpinRaw, SpinRawGuard};

#[cfg(feature = "log")]
use log::warn;

use crate::buddy::{BuddyHeap, HeapStats, PAYLOAD_ALIGN};
use crate::page_source::PageSource;
use crate::{AllocError, AllocResult};

/// Buddy heap behind a single spin lock.
pub struct LockedBuddyHeap<S: PageSource, const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    heap: SpinRaw<BuddyHeap<S, PAGE_SIZE>>,
}

impl<S: PageSource, const PAGE_SIZE: usize> LockedBuddyHeap<S, PAGE_SIZE> {
    pub const fn new(source: S) -> Self {
        Self {
            heap: SpinRaw::new(BuddyHeap::new(source)),
        }
    }

    /// Lock the heap for a sequence of operations.
    pub fn lock(&self) -> SpinRawGuard<'_, BuddyHeap<S, PAGE_SIZE>> {
        self.heap.lock()
    }

    /// Allocate at least `size` bytes.
    pub fn acquire(&self, size: usize) -> AllocResult<NonNull<u8>> {
        self.heap.lock().acquire(size)
    }

    /// Return a payload obtained from [`LockedBuddyHeap::acquire`].
    ///
    /// # Safety
    ///
    /// See [`BuddyHeap::release`].
    pub unsafe fn release(&self, ptr: *mut u8) {
        unsafe { self.heap.lock().release(ptr) };
    }

    /// Free every outstanding block and unmap every page.
    ///
    /// # Safety
    ///
    /// See [`BuddyHeap::reclaim_all`].
    pub unsafe fn reclaim_all(&self) {
        unsafe { self.heap.lock().reclaim_all() };
    }

    pub fn stats(&self) -> HeapStats {
        self.heap.lock().stats()
    }

    fn alloc_layout(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        if layout.align() > PAYLOAD_ALIGN {
            return Err(AllocError::UnsupportedAlignment);
        }
        self.acquire(layout.size())
    }
}

impl<S: PageSource + Default, const PAGE_SIZE: usize> Default for LockedBuddyHeap<S, PAGE_SIZE> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

unsafe impl<S: PageSource + Send, const PAGE_SIZE: usize> GlobalAlloc
    for LockedBuddyHeap<S, PAGE_SIZE>
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.alloc_layout(layout) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_e) => {
                warn!("locked buddy heap: allocation of {:?} failed: {}", layout, _e);
                core::ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.release(ptr) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        };

        // Stay in place while the block still has room.
        if new_size <= unsafe { self.heap.lock().usable_size(old) } {
            return ptr;
        }

        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                self.release(ptr);
            }
        }
        new_ptr
    }
}
