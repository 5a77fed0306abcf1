//! Buddy block metadata
//!
//! Every managed block starts with a [`BlockHeader`] recording its level,
//! its status and its links in the list for that level. The header bytes
//! count against the block's capacity.
//!
//! Buddy and primary addresses are computed on the block address as an
//! integer. This relies on two invariants: every block lies inside a single
//! page aligned to the page size, and every block is aligned to its own
//! capacity. Toggling or clearing the capacity bit therefore always lands on
//! the other half of the enclosing parent block within the same page.

use core::ptr::NonNull;

use super::level::block_size;

/// Allocation status of a block.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Free = 0,
    Used = 1,
}

/// In-place header at the start of every block.
#[repr(C, align(32))]
#[derive(Debug)]
pub struct BlockHeader {
    pub(crate) level: u32,
    pub(crate) status: BlockStatus,
    pub(crate) next: Option<NonNull<BlockHeader>>,
    pub(crate) prev: Option<NonNull<BlockHeader>>,
}

/// Bytes taken by the header of every block.
pub const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Alignment of every payload address handed out.
pub const PAYLOAD_ALIGN: usize = 1 << HEADER_SIZE.trailing_zeros();

const _: () = assert!(HEADER_SIZE == block_size(0));

impl BlockHeader {
    /// Create a detached header.
    pub const fn new(level: usize, status: BlockStatus) -> Self {
        Self {
            level: level as u32,
            status,
            next: None,
            prev: None,
        }
    }

    #[inline]
    pub fn level(&self) -> usize {
        self.level as usize
    }

    #[inline]
    pub fn status(&self) -> BlockStatus {
        self.status
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.status == BlockStatus::Free
    }

    /// Capacity of this block in bytes, header included.
    #[inline]
    pub fn capacity(&self) -> usize {
        block_size(self.level())
    }

    /// Level and status tag, read without trusting the status discriminant.
    ///
    /// # Safety
    ///
    /// `block` must be valid for reads of a header.
    pub unsafe fn raw_parts(block: NonNull<Self>) -> (usize, u32) {
        let ptr = block.as_ptr();
        unsafe {
            let level = core::ptr::addr_of!((*ptr).level).read();
            let status = core::ptr::addr_of!((*ptr).status).cast::<u32>().read();
            (level as usize, status)
        }
    }
}

/// Write a fresh detached header at `at`.
///
/// # Safety
///
/// `at` must be valid for writes of a header and aligned to `block_size(level)`.
pub unsafe fn init_block(
    at: NonNull<u8>,
    level: usize,
    status: BlockStatus,
) -> NonNull<BlockHeader> {
    let block = at.cast::<BlockHeader>();
    unsafe { block.as_ptr().write(BlockHeader::new(level, status)) };
    block
}

/// Move `block` to another address inside the same page.
#[inline]
fn with_addr(block: NonNull<BlockHeader>, f: impl FnOnce(usize) -> usize) -> NonNull<BlockHeader> {
    // SAFETY: `f` only toggles or clears bits below the page alignment, and a
    // mapped page never starts at address zero.
    unsafe { NonNull::new_unchecked(block.as_ptr().map_addr(f)) }
}

/// The sibling that together with `block` forms the next larger block.
///
/// A top level block has no buddy: `block` itself is returned and must be
/// treated as a sentinel by the caller.
///
/// # Safety
///
/// `block` must point to a live header.
pub unsafe fn buddy_of(block: NonNull<BlockHeader>, max_level: usize) -> NonNull<BlockHeader> {
    let level = unsafe { block.as_ref() }.level();
    if level >= max_level {
        return block;
    }
    with_addr(block, |addr| addr ^ block_size(level))
}

/// The lower-address half of the pair `block` belongs to.
///
/// # Safety
///
/// `block` must point to a live header.
pub unsafe fn primary_of(block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
    let level = unsafe { block.as_ref() }.level();
    with_addr(block, |addr| addr & !block_size(level))
}

/// Halve `block`: it keeps the lower half at `level - 1` and a new header
/// with the same level and status is written at the upper half.
///
/// Returns the upper half.
///
/// # Safety
///
/// `block` must point to a live header with `level > 0` that is not linked
/// in any list.
pub unsafe fn split(mut block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
    let (level, status) = {
        let header = unsafe { block.as_mut() };
        debug_assert!(header.level > 0, "splitting a level 0 block");
        header.level -= 1;
        (header.level(), header.status)
    };
    let upper = unsafe { block.cast::<u8>().add(block_size(level)) };
    unsafe { init_block(upper, level, status) }
}

/// Fuse two buddies into their parent and return it.
///
/// The primary header is promoted in place; the secondary header's memory is
/// left as is and must not be read again.
///
/// # Panics
///
/// Panics if `a` and `b` are not buddies of each other.
///
/// # Safety
///
/// Both pointers must point to live headers that are not linked in any list.
pub unsafe fn merge(
    a: NonNull<BlockHeader>,
    b: NonNull<BlockHeader>,
    max_level: usize,
) -> NonNull<BlockHeader> {
    let (level_a, level_b) = unsafe { (a.as_ref().level(), b.as_ref().level()) };
    assert!(
        level_a == level_b && level_a < max_level && unsafe { buddy_of(a, max_level) } == b,
        "merge of non-buddy blocks {:p} (level {}) and {:p} (level {})",
        a,
        level_a,
        b,
        level_b
    );

    let mut primary = unsafe { primary_of(a) };
    unsafe { primary.as_mut() }.level += 1;
    primary
}

/// Payload address handed to callers for `block`.
#[inline]
pub fn payload_of(block: NonNull<BlockHeader>) -> NonNull<u8> {
    // SAFETY: a block is at least one header long, so the address after the
    // header is still inside the same page or one past its end.
    unsafe { NonNull::new_unchecked(block.as_ptr().add(1)).cast() }
}

/// Header of the block a payload address was carved from.
///
/// # Safety
///
/// `payload` must have been produced by [`payload_of`].
#[inline]
pub unsafe fn header_of(payload: NonNull<u8>) -> NonNull<BlockHeader> {
    unsafe { NonNull::new_unchecked(payload.cast::<BlockHeader>().as_ptr().sub(1)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    const MAX: usize = 7;

    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    fn fresh_page() -> (Box<Page>, NonNull<BlockHeader>) {
        let mut page = Box::new(Page([0; 4096]));
        let at = NonNull::new(page.0.as_mut_ptr()).unwrap();
        let block = unsafe { init_block(at, MAX, BlockStatus::Free) };
        (page, block)
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 32);
        assert_eq!(PAYLOAD_ALIGN, 32);
        assert_eq!(core::mem::align_of::<BlockHeader>(), 32);
    }

    #[test]
    fn test_top_level_has_no_buddy() {
        let (_page, block) = fresh_page();
        unsafe {
            assert_eq!(buddy_of(block, MAX), block);
        }
    }

    #[test]
    fn test_split_halves_block() {
        let (_page, block) = fresh_page();
        let base = block.as_ptr() as usize;
        unsafe {
            let upper = split(block);
            assert_eq!(upper.as_ptr() as usize, base + 2048);
            assert_eq!(block.as_ref().level(), 6);
            assert_eq!(upper.as_ref().level(), 6);
            assert_eq!(upper.as_ref().status(), BlockStatus::Free);
            assert!(upper.as_ref().next.is_none() && upper.as_ref().prev.is_none());

            assert_eq!(buddy_of(block, MAX), upper);
            assert_eq!(buddy_of(upper, MAX), block);
            assert_eq!(primary_of(upper), block);
            assert_eq!(primary_of(block), block);
        }
    }

    #[test]
    fn test_split_inherits_status() {
        let (_page, mut block) = fresh_page();
        unsafe {
            block.as_mut().status = BlockStatus::Used;
            let upper = split(block);
            assert_eq!(upper.as_ref().status(), BlockStatus::Used);
        }
    }

    #[test]
    fn test_buddy_involution_at_every_level() {
        let (_page, block) = fresh_page();
        let mut current = block;
        unsafe {
            while current.as_ref().level() > 0 {
                let upper = split(current);
                for half in [current, upper] {
                    assert_eq!(buddy_of(buddy_of(half, MAX), MAX), half);
                }
                current = upper;
            }
        }
    }

    #[test]
    fn test_split_merge_round_trip() {
        let (_page, block) = fresh_page();
        let base = block.as_ptr() as usize;
        unsafe {
            let upper = split(block);
            let deep = split(upper);
            assert_eq!(deep.as_ptr() as usize, base + 3072);

            // Merging in either argument order yields the primary.
            let parent = merge(deep, upper, MAX);
            assert_eq!(parent, upper);
            assert_eq!(parent.as_ref().level(), 6);

            let top = merge(block, parent, MAX);
            assert_eq!(top, block);
            assert_eq!(top.as_ref().level(), MAX);
        }
    }

    #[test]
    #[should_panic(expected = "non-buddy")]
    fn test_merge_rejects_non_buddies() {
        let (_page, block) = fresh_page();
        unsafe {
            let upper = split(block);
            let deep = split(upper);
            // Different levels.
            merge(block, deep, MAX);
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let (_page, block) = fresh_page();
        let payload = payload_of(block);
        assert_eq!(payload.as_ptr() as usize, block.as_ptr() as usize + HEADER_SIZE);
        assert_eq!(unsafe { header_of(payload) }, block);
    }
}
