//! Per-page descriptors for a zone
//!
//! Every frame in a zone's span has an atomic state word and, while it heads
//! a free block, a list node. Pageblock migration tags live here too.
//! States and tags are read without the zone lock; list nodes are only
//! touched under it.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use super::buddy_block::{MigrateType, PAGEBLOCK_ORDER};

/// Lifecycle state of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Never handed to the allocator (firmware, holes, kernel image).
    Reserved = 0,
    /// Owned by a caller.
    Allocated = 1,
    /// First page of a free block registered in a free list.
    Buddy = 2,
    /// Non-head page of a free block.
    Free = 3,
    /// Queued in a per-CPU cache.
    PerCpu = 4,
}

impl PageState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => PageState::Reserved,
            1 => PageState::Allocated,
            2 => PageState::Buddy,
            3 => PageState::Free,
            _ => PageState::PerCpu,
        }
    }
}

/// Atomic page states and pageblock tags for one zone.
pub struct PageMap {
    start_pfn: usize,
    nr_pages: usize,
    states: Vec<AtomicU8>,
    pageblock_tags: Vec<AtomicU8>,
}

impl PageMap {
    /// Create a map where every page is [`PageState::Reserved`] and every
    /// pageblock is tagged `Movable`.
    pub fn new(start_pfn: usize, nr_pages: usize) -> Self {
        let first_block = start_pfn >> PAGEBLOCK_ORDER;
        let last_block = (start_pfn + nr_pages).saturating_sub(1) >> PAGEBLOCK_ORDER;
        let nr_blocks = if nr_pages == 0 {
            0
        } else {
            last_block - first_block + 1
        };
        Self {
            start_pfn,
            nr_pages,
            states: (0..nr_pages)
                .map(|_| AtomicU8::new(PageState::Reserved as u8))
                .collect(),
            pageblock_tags: (0..nr_blocks)
                .map(|_| AtomicU8::new(MigrateType::Movable as u8))
                .collect(),
        }
    }

    #[inline]
    pub fn start_pfn(&self) -> usize {
        self.start_pfn
    }

    #[inline]
    pub fn end_pfn(&self) -> usize {
        self.start_pfn + self.nr_pages
    }

    #[inline]
    pub fn contains(&self, pfn: usize) -> bool {
        pfn >= self.start_pfn && pfn < self.end_pfn()
    }

    #[inline]
    fn slot(&self, pfn: usize) -> &AtomicU8 {
        &self.states[pfn - self.start_pfn]
    }

    #[inline]
    pub fn state(&self, pfn: usize) -> PageState {
        PageState::from_raw(self.slot(pfn).load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, pfn: usize, state: PageState) {
        self.slot(pfn).store(state as u8, Ordering::Release);
    }

    /// Atomically move `pfn` from `from` to `to`. On failure returns the
    /// state actually observed.
    #[inline]
    pub fn transition(&self, pfn: usize, from: PageState, to: PageState) -> Result<(), PageState> {
        self.slot(pfn)
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(PageState::from_raw)
    }

    #[inline]
    fn block_slot(&self, pfn: usize) -> &AtomicU8 {
        &self.pageblock_tags[(pfn >> PAGEBLOCK_ORDER) - (self.start_pfn >> PAGEBLOCK_ORDER)]
    }

    #[inline]
    pub fn pageblock_migratetype(&self, pfn: usize) -> MigrateType {
        MigrateType::from_index(self.block_slot(pfn).load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_pageblock_migratetype(&self, pfn: usize, mt: MigrateType) {
        self.block_slot(pfn).store(mt as u8, Ordering::Release);
    }

    /// Whether any page in `[start, end)` is reserved.
    pub fn any_reserved(&self, start: usize, end: usize) -> bool {
        (start.max(self.start_pfn)..end.min(self.end_pfn()))
            .any(|pfn| self.state(pfn) == PageState::Reserved)
    }
}

/// List linkage for a page heading a free block
#[derive(Debug, Clone, Copy)]
pub struct ListNode {
    pub prev: Option<usize>,
    pub next: Option<usize>,
    /// Order of the free block this page heads.
    pub order: u8,
    /// Free list the block is currently registered in.
    pub migratetype: MigrateType,
}

impl ListNode {
    const EMPTY: ListNode = ListNode {
        prev: None,
        next: None,
        order: 0,
        migratetype: MigrateType::Movable,
    };
}

/// Storage for every page's list node, addressed by frame number.
///
/// Only accessed under the zone lock.
pub struct PageLinks {
    start_pfn: usize,
    nodes: Vec<ListNode>,
}

impl PageLinks {
    pub fn new(start_pfn: usize, nr_pages: usize) -> Self {
        Self {
            start_pfn,
            nodes: alloc::vec![ListNode::EMPTY; nr_pages],
        }
    }

    #[inline]
    pub fn get(&self, pfn: usize) -> &ListNode {
        &self.nodes[pfn - self.start_pfn]
    }

    #[inline]
    pub fn get_mut(&mut self, pfn: usize) -> &mut ListNode {
        &mut self.nodes[pfn - self.start_pfn]
    }
}
