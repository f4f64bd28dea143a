//! Buddy free-list engine for a single zone
//!
//! Owns the per-(order, migration type) free lists and implements merging on
//! free, splitting on allocation, fallback stealing between migration types
//! and bulk moves of free pages between types. Everything here runs with the
//! zone lock held; page states and counters it touches are atomics shared
//! with lock-free readers.

use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::{debug, error, trace};

use super::{
    buddy_block::{buddy_pfn, FreeBlockInfo, MigrateType, MIGRATE_TYPES, PAGEBLOCK_NR_PAGES, PAGEBLOCK_ORDER},
    free_list::FreeList,
    page_map::{PageLinks, PageMap, PageState},
    stats::ZoneCounters,
};
use crate::MAX_ORDER;

/// Free lists of one order, split by migration type
pub struct FreeArea {
    free_list: [FreeList; MIGRATE_TYPES],
    nr_free: usize,
}

impl FreeArea {
    const fn new() -> Self {
        Self {
            free_list: [const { FreeList::new() }; MIGRATE_TYPES],
            nr_free: 0,
        }
    }

    #[inline]
    pub fn nr_free(&self) -> usize {
        self.nr_free
    }

    #[inline]
    pub fn list(&self, mt: MigrateType) -> &FreeList {
        &self.free_list[mt.index()]
    }
}

/// All free areas of a zone plus the link storage their lists use.
///
/// This is the state protected by the zone lock.
pub struct FreeAreas {
    areas: [FreeArea; MAX_ORDER],
    links: PageLinks,
}

impl FreeAreas {
    pub fn new(start_pfn: usize, nr_pages: usize) -> Self {
        Self {
            areas: [const { FreeArea::new() }; MAX_ORDER],
            links: PageLinks::new(start_pfn, nr_pages),
        }
    }

    #[inline]
    pub fn area(&self, order: usize) -> &FreeArea {
        &self.areas[order]
    }

    #[inline]
    pub fn links(&self) -> &PageLinks {
        &self.links
    }
}

/// Borrowed view of a locked zone: free areas plus the shared page map and counters.
pub(crate) struct BuddyEngine<'a> {
    pub(crate) areas: &'a mut FreeAreas,
    pub(crate) map: &'a PageMap,
    pub(crate) stat: &'a ZoneCounters,
    pub(crate) zone_name: &'a str,
}

impl BuddyEngine<'_> {
    /// Register a free block headed by `pfn`.
    fn add_to_list(&mut self, pfn: usize, order: usize, mt: MigrateType, tail: bool) {
        let node = self.areas.links.get_mut(pfn);
        node.order = order as u8;
        node.migratetype = mt;
        let area = &mut self.areas.areas[order];
        let list = &mut area.free_list[mt.index()];
        if tail {
            list.push_back(&mut self.areas.links, pfn);
        } else {
            list.push_front(&mut self.areas.links, pfn);
        }
        area.nr_free += 1;
        self.stat.inc_nr_free(order);
        self.map.set_state(pfn, PageState::Buddy);
    }

    /// Unregister the free block headed by `pfn`, returning its order.
    ///
    /// The head keeps the `Buddy` state; the caller decides what it becomes.
    fn del_from_list(&mut self, pfn: usize) -> usize {
        let node = *self.areas.links.get(pfn);
        let order = node.order as usize;
        let area = &mut self.areas.areas[order];
        area.free_list[node.migratetype.index()].remove(&mut self.areas.links, pfn);
        area.nr_free -= 1;
        self.stat.dec_nr_free(order);
        order
    }

    /// Whether `pfn` heads a free block of exactly `order` that may merge
    /// with a block being freed as `mt`.
    fn page_is_buddy(&self, pfn: usize, order: usize, mt: MigrateType) -> bool {
        if !self.map.contains(pfn) || self.map.state(pfn) != PageState::Buddy {
            return false;
        }
        let node = self.areas.links.get(pfn);
        if node.order as usize != order {
            return false;
        }
        // Isolated free pages are not counted as free; never mix them with counted ones
        (node.migratetype == MigrateType::Isolate) == (mt == MigrateType::Isolate)
    }

    /// Insert a block whose pages are all in the `Free` state, merging with
    /// free buddies as far as possible.
    pub(crate) fn free_one_page(&mut self, pfn: usize, order: usize, mt: MigrateType) {
        let nr_pages = 1usize << order;
        let mut pfn = pfn;
        let mut order = order;

        while order < MAX_ORDER - 1 {
            let buddy = buddy_pfn(pfn, order);
            if !self.page_is_buddy(buddy, order, mt) {
                break;
            }
            self.del_from_list(buddy);
            self.map.set_state(buddy, PageState::Free);
            pfn &= buddy;
            order += 1;
        }

        // If the next-larger buddy is free too, this block is likely to merge
        // again soon: queue it at the tail so it is reused last.
        let mut tail = false;
        if order < MAX_ORDER - 2 {
            let combined = pfn & buddy_pfn(pfn, order);
            let higher_buddy = buddy_pfn(combined, order + 1);
            tail = self.page_is_buddy(higher_buddy, order + 1, mt);
        }

        trace!(
            "zone {}: free pfn {:#x} merged to order {} ({:?}, tail={})",
            self.zone_name,
            pfn,
            order,
            mt,
            tail
        );
        self.add_to_list(pfn, order, mt, tail);
        if mt != MigrateType::Isolate {
            self.stat.add_free_pages(nr_pages);
        }
    }

    /// Split the free block at `pfn` from order `high` down to `low`,
    /// returning the upper halves to the `mt` lists. The lowest `2^low`
    /// pages stay with the caller.
    pub(crate) fn expand(&mut self, pfn: usize, low: usize, high: usize, mt: MigrateType) {
        let mut high = high;
        let mut size = 1usize << high;
        while high > low {
            high -= 1;
            size >>= 1;
            self.add_to_list(pfn + size, high, mt, false);
        }
    }

    /// Take the smallest available block of exactly type `mt` at or above
    /// `order` and split it down to `order`.
    pub(crate) fn rmqueue_smallest(&mut self, order: usize, mt: MigrateType) -> Option<usize> {
        for current in order..MAX_ORDER {
            let Some(pfn) = self.areas.areas[current].free_list[mt.index()].front() else {
                continue;
            };
            self.del_from_list(pfn);
            self.expand(pfn, order, current, mt);
            return Some(pfn);
        }
        None
    }

    /// Steal a block from a fallback migration type, largest first.
    ///
    /// If the block is large, or most of its pageblock is free, the whole
    /// pageblock is retagged to `start_mt` and its free pages follow.
    pub(crate) fn rmqueue_fallback(&mut self, order: usize, start_mt: MigrateType) -> Option<usize> {
        for current in (order..MAX_ORDER).rev() {
            for &mt in start_mt.fallbacks() {
                // Reserve is handled by the caller once everything else fails
                if mt == MigrateType::Reserve {
                    break;
                }
                let Some(pfn) = self.areas.areas[current].free_list[mt.index()].front() else {
                    continue;
                };

                let mut target = mt;
                if self.can_steal_pageblock(pfn, current, mt) {
                    let moved = self.move_freepages_block(pfn, start_mt);
                    self.map.set_pageblock_migratetype(pfn, start_mt);
                    target = start_mt;
                    ZoneCounters::count(&self.stat.fallback_steals);
                    debug!(
                        "zone {}: {:?} stole pageblock at {:#x} from {:?} (order {}, {} free pages moved)",
                        self.zone_name,
                        start_mt,
                        pfn,
                        mt,
                        current,
                        moved
                    );
                }

                self.del_from_list(pfn);
                if current >= PAGEBLOCK_ORDER && mt != MigrateType::Cma {
                    self.change_pageblock_range(pfn, current, start_mt);
                }
                self.expand(pfn, order, current, target);
                return Some(pfn);
            }
        }
        None
    }

    fn can_steal_pageblock(&self, pfn: usize, order: usize, mt: MigrateType) -> bool {
        if mt == MigrateType::Cma {
            return false;
        }
        match self.map.pageblock_migratetype(pfn) {
            MigrateType::Reserve | MigrateType::Cma | MigrateType::Isolate => return false,
            _ => {}
        }
        if order >= PAGEBLOCK_ORDER / 2 {
            return true;
        }
        let (start, end) = self.pageblock_bounds(pfn);
        2 * self.count_freepages(start, end) >= PAGEBLOCK_NR_PAGES
    }

    fn change_pageblock_range(&self, pfn: usize, order: usize, mt: MigrateType) {
        let mut block = pfn;
        let end = pfn + (1 << order);
        while block < end {
            self.map.set_pageblock_migratetype(block, mt);
            block += PAGEBLOCK_NR_PAGES;
        }
    }

    /// Allocate from `mt`, then its fallbacks, then the reserve.
    pub(crate) fn rmqueue(&mut self, order: usize, mt: MigrateType) -> Option<usize> {
        if mt == MigrateType::Isolate {
            return None;
        }
        if let Some(pfn) = self.rmqueue_smallest(order, mt) {
            return Some(pfn);
        }
        if mt != MigrateType::Reserve {
            if let Some(pfn) = self.rmqueue_fallback(order, mt) {
                return Some(pfn);
            }
            return self.rmqueue_smallest(order, MigrateType::Reserve);
        }
        None
    }

    /// Check every page of a block just taken off the free lists and hand
    /// it over in state `to`.
    pub(crate) fn prep_new_block(&mut self, pfn: usize, order: usize, to: PageState) {
        for p in pfn..pfn + (1 << order) {
            let state = self.map.state(p);
            let expected = if p == pfn { PageState::Buddy } else { PageState::Free };
            if state != expected {
                error!(
                    "zone {}: allocating pfn {:#x} in state {:?}, expected {:?}",
                    self.zone_name,
                    p,
                    state,
                    expected
                );
                panic!("bad page state: pfn {:#x} is {:?} while being allocated", p, state);
            }
            self.map.set_state(p, to);
        }
        self.stat.sub_free_pages(1 << order);
    }

    /// Count free pages whose block starts in `[start, end)`.
    fn count_freepages(&self, start: usize, end: usize) -> usize {
        let mut pfn = start;
        let mut count = 0;
        while pfn < end {
            if !self.map.contains(pfn) || self.map.state(pfn) != PageState::Buddy {
                pfn += 1;
                continue;
            }
            let order = self.areas.links.get(pfn).order as usize;
            count += 1 << order;
            pfn += 1 << order;
        }
        count
    }

    /// Move every free block starting in `[start, end)` to the `mt` lists.
    ///
    /// Returns the number of pages moved.
    pub(crate) fn move_freepages(&mut self, start: usize, end: usize, mt: MigrateType) -> usize {
        let mut pfn = start;
        let mut moved = 0;
        while pfn < end {
            if !self.map.contains(pfn) || self.map.state(pfn) != PageState::Buddy {
                pfn += 1;
                continue;
            }
            let old_mt = self.areas.links.get(pfn).migratetype;
            let order = self.del_from_list(pfn);
            self.add_to_list(pfn, order, mt, false);

            let nr = 1usize << order;
            match (old_mt == MigrateType::Isolate, mt == MigrateType::Isolate) {
                (true, false) => self.stat.add_free_pages(nr),
                (false, true) => self.stat.sub_free_pages(nr),
                _ => {}
            }
            pfn += nr;
            moved += nr;
        }
        moved
    }

    /// Pageblock-aligned bounds around `pfn`, clipped to the zone span.
    fn pageblock_bounds(&self, pfn: usize) -> (usize, usize) {
        let start = pfn & !(PAGEBLOCK_NR_PAGES - 1);
        let end = start + PAGEBLOCK_NR_PAGES;
        (start.max(self.map.start_pfn()), end.min(self.map.end_pfn()))
    }

    /// Move the free pages of the pageblock containing `pfn` to `mt`.
    ///
    /// A pageblock cut off by the zone edge moves only its part inside the zone.
    pub(crate) fn move_freepages_block(&mut self, pfn: usize, mt: MigrateType) -> usize {
        let (start, end) = self.pageblock_bounds(pfn);
        self.move_freepages(start, end, mt)
    }

    /// Every free block of the zone, ordered by frame number.
    pub(crate) fn free_blocks(&self) -> Vec<FreeBlockInfo> {
        let mut blocks = Vec::new();
        for (order, area) in self.areas.areas.iter().enumerate() {
            for mt in MigrateType::ALL {
                for pfn in area.list(mt).iter(&self.areas.links) {
                    blocks.push(FreeBlockInfo {
                        pfn,
                        order,
                        migratetype: mt,
                    });
                }
            }
        }
        blocks.sort_unstable_by_key(|b| b.pfn);
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        areas: FreeAreas,
        map: PageMap,
        stat: ZoneCounters,
    }

    impl Fixture {
        fn new(start_pfn: usize, nr_pages: usize) -> Self {
            Self {
                areas: FreeAreas::new(start_pfn, nr_pages),
                map: PageMap::new(start_pfn, nr_pages),
                stat: ZoneCounters::new(),
            }
        }

        fn engine(&mut self) -> BuddyEngine<'_> {
            BuddyEngine {
                areas: &mut self.areas,
                map: &self.map,
                stat: &self.stat,
                zone_name: "test",
            }
        }

        /// Release `[pfn, pfn + 2^order)` as one block.
        fn release(&mut self, pfn: usize, order: usize, mt: MigrateType) {
            for p in pfn..pfn + (1 << order) {
                self.map.set_state(p, PageState::Free);
            }
            self.engine().free_one_page(pfn, order, mt);
        }
    }

    #[test]
    fn test_free_merges_with_free_buddy() {
        let mut fx = Fixture::new(0, 64);
        fx.release(0, 0, MigrateType::Movable);
        fx.release(1, 0, MigrateType::Movable);
        let blocks = fx.engine().free_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].pfn, 0);
        assert_eq!(blocks[0].order, 1);
        assert_eq!(fx.stat.free_pages(), 2);
        assert_eq!(fx.map.state(1), PageState::Free);
        assert_eq!(fx.map.state(0), PageState::Buddy);
    }

    #[test]
    fn test_no_merge_with_allocated_buddy() {
        let mut fx = Fixture::new(0, 64);
        fx.map.set_state(0, PageState::Allocated);
        fx.release(1, 0, MigrateType::Movable);
        let blocks = fx.engine().free_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!((blocks[0].pfn, blocks[0].order), (1, 0));
    }

    #[test]
    fn test_expand_leaves_decreasing_orders() {
        let mut fx = Fixture::new(0, 32);
        fx.release(0, 5, MigrateType::Movable);
        let pfn = fx.engine().rmqueue_smallest(0, MigrateType::Movable).unwrap();
        assert_eq!(pfn, 0);
        let blocks = fx.engine().free_blocks();
        let orders: Vec<_> = blocks.iter().map(|b| (b.pfn, b.order)).collect();
        assert_eq!(orders, [(1, 0), (2, 1), (4, 2), (8, 3), (16, 4)]);
    }

    #[test]
    fn test_isolated_block_does_not_merge() {
        let mut fx = Fixture::new(0, 64);
        fx.release(0, 0, MigrateType::Isolate);
        fx.release(1, 0, MigrateType::Movable);
        assert_eq!(fx.engine().free_blocks().len(), 2);
        assert_eq!(fx.stat.free_pages(), 1);
    }

    #[test]
    fn test_move_freepages_counts_pages() {
        let mut fx = Fixture::new(0, 64);
        fx.release(0, 3, MigrateType::Movable);
        fx.release(16, 2, MigrateType::Movable);
        let moved = fx.engine().move_freepages(0, 32, MigrateType::Unmovable);
        assert_eq!(moved, 12);
        for block in fx.engine().free_blocks() {
            assert_eq!(block.migratetype, MigrateType::Unmovable);
        }
    }
}
