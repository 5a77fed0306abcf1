//! Per-level block lists
//!
//! One intrusive doubly linked list per level. A list holds every block
//! currently subdivided to its level, free and used alike, so searches skip
//! over used nodes. Links live inside the block headers; the table only
//! keeps the heads and a length per level.

use core::ptr::NonNull;

use super::buddy_block::{BlockHeader, BlockStatus};
use super::level::LEVEL_SLOTS;

/// Table of list heads indexed by level.
pub struct FreeListTable {
    heads: [Option<NonNull<BlockHeader>>; LEVEL_SLOTS],
    lens: [usize; LEVEL_SLOTS],
}

impl FreeListTable {
    /// Create a table with every list empty.
    pub const fn new() -> Self {
        Self {
            heads: [None; LEVEL_SLOTS],
            lens: [0; LEVEL_SLOTS],
        }
    }

    /// First node of the list for `level`.
    #[inline]
    pub fn head(&self, level: usize) -> Option<NonNull<BlockHeader>> {
        self.heads[level]
    }

    /// Number of blocks linked at `level`.
    #[inline]
    pub fn len(&self, level: usize) -> usize {
        self.lens[level]
    }

    #[inline]
    pub fn is_empty(&self, level: usize) -> bool {
        self.heads[level].is_none()
    }

    /// Link `node` in front of the list for `level`.
    ///
    /// # Safety
    ///
    /// `node` must point to a live, detached header whose level is `level`.
    pub unsafe fn push_front(&mut self, level: usize, mut node: NonNull<BlockHeader>) {
        let header = unsafe { node.as_mut() };
        debug_assert_eq!(header.level(), level, "block linked at the wrong level");
        debug_assert!(header.next.is_none() && header.prev.is_none());

        header.prev = None;
        header.next = self.heads[level];
        if let Some(mut old_head) = self.heads[level] {
            unsafe { old_head.as_mut() }.prev = Some(node);
        }
        self.heads[level] = Some(node);
        self.lens[level] += 1;
    }

    /// Unlink `node` from the list of its level.
    ///
    /// # Safety
    ///
    /// `node` must point to a live header currently linked in this table.
    pub unsafe fn remove(&mut self, mut node: NonNull<BlockHeader>) {
        let header = unsafe { node.as_mut() };
        let level = header.level();
        let (prev, next) = (header.prev.take(), header.next.take());

        match prev {
            Some(mut prev) => unsafe { prev.as_mut() }.next = next,
            None => {
                debug_assert_eq!(self.heads[level], Some(node), "unlinked block at list head");
                self.heads[level] = next;
            }
        }
        if let Some(mut next) = next {
            unsafe { next.as_mut() }.prev = prev;
        }
        self.lens[level] -= 1;
    }

    /// First free block at `min_level` or above, smallest level first.
    ///
    /// # Panics
    ///
    /// Panics if a list is longer than its recorded length, which means the
    /// headers have been corrupted.
    pub fn find_first_free(
        &self,
        min_level: usize,
        max_level: usize,
    ) -> Option<NonNull<BlockHeader>> {
        (min_level..=max_level).find_map(|level| {
            self.iter(level)
                .find(|node| unsafe { node.as_ref() }.status() == BlockStatus::Free)
        })
    }

    /// First used block at `level`.
    pub fn find_first_used(&self, level: usize) -> Option<NonNull<BlockHeader>> {
        self.iter(level)
            .find(|node| unsafe { node.as_ref() }.status() == BlockStatus::Used)
    }

    /// Walk the list for `level` from its head.
    pub fn iter(&self, level: usize) -> FreeListIter<'_> {
        FreeListIter {
            table: self,
            level,
            current: self.heads[level],
            visited: 0,
        }
    }
}

impl Default for FreeListTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the headers linked at one level.
pub struct FreeListIter<'a> {
    table: &'a FreeListTable,
    level: usize,
    current: Option<NonNull<BlockHeader>>,
    visited: usize,
}

impl Iterator for FreeListIter<'_> {
    type Item = NonNull<BlockHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;
        if self.visited >= self.table.lens[self.level] {
            panic!(
                "potential cycle in level {} list: more than {} nodes",
                self.level, self.table.lens[self.level]
            );
        }
        self.visited += 1;
        // SAFETY: linked nodes are live headers for as long as they stay
        // linked, and the table is borrowed for the whole walk.
        self.current = unsafe { node.as_ref() }.next;
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy::buddy_block::{init_block, split};
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    const MAX: usize = 7;

    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    fn fresh_page() -> (Box<Page>, NonNull<BlockHeader>) {
        let mut page = Box::new(Page([0; 4096]));
        let at = NonNull::new(page.0.as_mut_ptr()).unwrap();
        let block = unsafe { init_block(at, MAX, BlockStatus::Free) };
        (page, block)
    }

    /// Split a page into the four level 5 quarters.
    fn quarters(block: NonNull<BlockHeader>) -> [NonNull<BlockHeader>; 4] {
        unsafe {
            let upper = split(block);
            let q1 = split(block);
            let q3 = split(upper);
            [block, q1, upper, q3]
        }
    }

    fn collect(table: &FreeListTable, level: usize) -> Vec<NonNull<BlockHeader>> {
        table.iter(level).collect()
    }

    #[test]
    fn test_push_front_order() {
        let (_page, block) = fresh_page();
        let [a, b, c, d] = quarters(block);
        let mut table = FreeListTable::new();

        unsafe {
            for node in [a, b, c, d] {
                table.push_front(5, node);
            }
        }
        assert_eq!(table.len(5), 4);
        assert_eq!(table.head(5), Some(d));
        assert_eq!(collect(&table, 5), [d, c, b, a]);
        unsafe {
            assert!(d.as_ref().prev.is_none());
            assert_eq!(c.as_ref().prev, Some(d));
        }
    }

    #[test]
    fn test_remove_head_middle_tail() {
        let (_page, block) = fresh_page();
        let [a, b, c, d] = quarters(block);
        let mut table = FreeListTable::new();

        unsafe {
            for node in [a, b, c, d] {
                table.push_front(5, node);
            }
            table.remove(c);
            assert_eq!(collect(&table, 5), [d, b, a]);
            table.remove(d);
            assert_eq!(table.head(5), Some(b));
            assert!(b.as_ref().prev.is_none());
            table.remove(a);
            assert_eq!(collect(&table, 5), [b]);
            assert!(b.as_ref().next.is_none());
            table.remove(b);
            assert!(c.as_ref().next.is_none() && c.as_ref().prev.is_none());
        }
        assert!(table.is_empty(5));
        assert_eq!(table.len(5), 0);
    }

    #[test]
    fn test_find_first_free_skips_used() {
        let (_page, block) = fresh_page();
        let [a, mut b, c, mut d] = quarters(block);
        let mut table = FreeListTable::new();

        unsafe {
            b.as_mut().status = BlockStatus::Used;
            d.as_mut().status = BlockStatus::Used;
            for node in [a, b, c, d] {
                table.push_front(5, node);
            }
        }
        assert_eq!(table.find_first_free(5, MAX), Some(c));
        assert_eq!(table.find_first_used(5), Some(d));
        assert_eq!(table.find_first_free(6, MAX), None);
    }

    #[test]
    fn test_find_first_free_prefers_smallest_level() {
        let (_page, block) = fresh_page();
        let mut table = FreeListTable::new();

        unsafe {
            let upper = split(block);
            let deep = split(upper);
            table.push_front(6, block);
            table.push_front(5, upper);
            table.push_front(5, deep);
        }
        assert_eq!(
            table.find_first_free(0, MAX).map(|n| n.as_ptr() as usize),
            Some(block.as_ptr() as usize + 3072)
        );
        assert_eq!(table.find_first_free(6, MAX), Some(block));
    }

    #[test]
    fn test_empty_table() {
        let table = FreeListTable::new();
        for level in 0..=MAX {
            assert!(table.is_empty(level));
        }
        assert_eq!(table.find_first_free(0, MAX), None);
    }
}
