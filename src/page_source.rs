//! Page sources
//!
//! The heap never talks to the OS directly. It asks a [`PageSource`] for
//! whole pages and hands them back on reclamation.

use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, error, warn};

/// Supplier of whole, size-aligned pages.
///
/// # Safety
///
/// A region returned by [`PageSource::map_page`] must be readable, writable,
/// exclusively owned by the caller until it is passed back to
/// [`PageSource::unmap_page`], at least `size` bytes long and aligned to
/// `size`. Buddy address arithmetic relies on that alignment.
pub unsafe trait PageSource {
    /// Map one region of `size` bytes aligned to `size`.
    ///
    /// Returns `None` if the region cannot be provided.
    fn map_page(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Return a region obtained from [`PageSource::map_page`].
    ///
    /// # Safety
    ///
    /// `page` must come from `map_page` on this source with the same `size`,
    /// and no reference into it may be used afterwards.
    unsafe fn unmap_page(&mut self, page: NonNull<u8>, size: usize);
}

/// Pages from anonymous private `mmap` mappings.
///
/// Mappings are read/write and never executable, so data written into
/// freed memory cannot be run as code.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapPageSource;

#[cfg(unix)]
impl MmapPageSource {
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
unsafe fn os_mmap(size: usize) -> *mut u8 {
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        core::ptr::null_mut()
    } else {
        ptr.cast()
    }
}

#[cfg(unix)]
unsafe fn os_munmap(ptr: *mut u8, size: usize) -> bool {
    unsafe { libc::munmap(ptr.cast(), size) == 0 }
}

/// Map `size` bytes aligned to `size`.
///
/// mmap only guarantees OS page alignment. When a plain mapping lands off
/// alignment, twice the size is mapped and the unaligned head and the tail
/// are handed back to the OS.
#[cfg(unix)]
unsafe fn os_mmap_aligned(size: usize) -> Option<NonNull<u8>> {
    let page = NonNull::new(unsafe { os_mmap(size) })?;
    if crate::is_aligned(page.as_ptr() as usize, size) {
        return Some(page);
    }
    unsafe { os_munmap(page.as_ptr(), size) };

    let span = size.checked_mul(2)?;
    let raw = NonNull::new(unsafe { os_mmap(span) })?.as_ptr();
    let head = crate::align_up(raw as usize, size) - raw as usize;
    let tail = span - head - size;
    let aligned = raw.wrapping_add(head);
    unsafe {
        if head != 0 {
            os_munmap(raw, head);
        }
        if tail != 0 {
            os_munmap(aligned.wrapping_add(size), tail);
        }
    }
    NonNull::new(aligned)
}

#[cfg(unix)]
unsafe impl PageSource for MmapPageSource {
    fn map_page(&mut self, size: usize) -> Option<NonNull<u8>> {
        let Some(page) = (unsafe { os_mmap_aligned(size) }) else {
            warn!("mmap page source: mapping {:#x} bytes failed", size);
            return None;
        };

        debug!("mmap page source: mapped {:#x} bytes at {:p}", size, page);
        Some(page)
    }

    unsafe fn unmap_page(&mut self, page: NonNull<u8>, size: usize) {
        if unsafe { os_munmap(page.as_ptr(), size) } {
            debug!("mmap page source: unmapped {:#x} bytes at {:p}", size, page);
        } else {
            error!("mmap page source: munmap of {:p} failed", page);
        }
    }
}
