//! A single memory zone
//!
//! A zone is a contiguous range of page frames with its own buddy free
//! lists, watermarks, lowmem reserves and one per-CPU page cache per CPU.
//! The free lists sit behind the zone lock; page states, pageblock tags and
//! counters are atomics readable without it.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use kspin::SpinNoIrq;
#[cfg(feature = "log")]
use log::{debug, error, info, warn};

use super::{
    buddy_block::{FreeBlockInfo, MigrateType, MAX_ZONES, MIGRATE_TYPES, PAGEBLOCK_NR_PAGES},
    free_area::{BuddyEngine, FreeAreas},
    page_map::{PageMap, PageState},
    per_cpu::{zone_batchsize, PcpPage, PerCpuPages},
    stats::{ZoneCounters, ZoneStats},
    watermark::{watermark_ok, AllocFlags, Watermarks},
};
use crate::{AllocError, AllocResult, MAX_ORDER};

/// Maximum number of pageblocks set aside as the migrate reserve.
const MAX_RESERVE_BLOCKS: usize = 2;

/// Construction parameters of a [`Zone`].
#[derive(Debug, Clone, Copy)]
pub struct ZoneConfig {
    pub name: &'static str,
    pub start_pfn: usize,
    pub spanned_pages: usize,
    /// Number of per-CPU caches to create.
    pub nr_cpus: usize,
    /// High memory gets a small fixed min watermark instead of a share of
    /// the global minimum.
    pub highmem: bool,
}

impl ZoneConfig {
    pub const fn new(name: &'static str, start_pfn: usize, spanned_pages: usize) -> Self {
        Self {
            name,
            start_pfn,
            spanned_pages,
            nr_cpus: 1,
            highmem: false,
        }
    }

    pub const fn with_cpus(mut self, nr_cpus: usize) -> Self {
        self.nr_cpus = nr_cpus;
        self
    }

    pub const fn highmem(mut self) -> Self {
        self.highmem = true;
        self
    }
}

/// One memory zone.
pub struct Zone {
    name: &'static str,
    index: usize,
    start_pfn: usize,
    spanned_pages: usize,
    highmem: bool,
    managed_pages: AtomicUsize,
    wmark_min: AtomicUsize,
    wmark_low: AtomicUsize,
    wmark_high: AtomicUsize,
    /// Pages kept back from requests whose preferred zone is higher.
    lowmem_reserve: [AtomicUsize; MAX_ZONES],
    map: PageMap,
    stat: ZoneCounters,
    free_area: SpinNoIrq<FreeAreas>,
    pageset: Vec<SpinNoIrq<PerCpuPages>>,
}

impl Zone {
    /// Create an empty zone. Every page starts out reserved; hand usable
    /// ranges over with [`Zone::free_bootmem`].
    pub fn new(config: ZoneConfig) -> AllocResult<Self> {
        if config.spanned_pages == 0 || config.nr_cpus == 0 {
            return Err(AllocError::InvalidParam);
        }
        config
            .start_pfn
            .checked_add(config.spanned_pages)
            .ok_or(AllocError::InvalidParam)?;

        let batch = zone_batchsize(0);
        let pageset = (0..config.nr_cpus)
            .map(|_| SpinNoIrq::new(PerCpuPages::new(batch)))
            .collect();

        info!(
            "zone {}: pfn [{:#x}, {:#x}), {} cpus",
            config.name,
            config.start_pfn,
            config.start_pfn + config.spanned_pages,
            config.nr_cpus
        );

        Ok(Self {
            name: config.name,
            index: 0,
            start_pfn: config.start_pfn,
            spanned_pages: config.spanned_pages,
            highmem: config.highmem,
            managed_pages: AtomicUsize::new(0),
            wmark_min: AtomicUsize::new(0),
            wmark_low: AtomicUsize::new(0),
            wmark_high: AtomicUsize::new(0),
            lowmem_reserve: [const { AtomicUsize::new(0) }; MAX_ZONES],
            map: PageMap::new(config.start_pfn, config.spanned_pages),
            stat: ZoneCounters::new(),
            free_area: SpinNoIrq::new(FreeAreas::new(config.start_pfn, config.spanned_pages)),
            pageset,
        })
    }

    fn with_engine<R>(&self, f: impl FnOnce(&mut BuddyEngine<'_>) -> R) -> R {
        let mut areas = self.free_area.lock();
        let mut engine = BuddyEngine {
            areas: &mut *areas,
            map: &self.map,
            stat: &self.stat,
            zone_name: self.name,
        };
        f(&mut engine)
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Position of this zone in its allocator.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    #[inline]
    pub fn start_pfn(&self) -> usize {
        self.start_pfn
    }

    #[inline]
    pub fn end_pfn(&self) -> usize {
        self.start_pfn + self.spanned_pages
    }

    #[inline]
    pub fn spanned_pages(&self) -> usize {
        self.spanned_pages
    }

    #[inline]
    pub fn is_highmem(&self) -> bool {
        self.highmem
    }

    /// Pages handed to the allocator so far.
    #[inline]
    pub fn managed_pages(&self) -> usize {
        self.managed_pages.load(Ordering::Relaxed)
    }

    /// Free pages in the buddy lists, isolated pages excluded.
    #[inline]
    pub fn free_pages(&self) -> usize {
        self.stat.free_pages()
    }

    /// Free blocks of `order` across all migration types.
    #[inline]
    pub fn nr_free(&self, order: usize) -> usize {
        self.stat.nr_free(order)
    }

    #[inline]
    pub fn contains(&self, pfn: usize) -> bool {
        self.map.contains(pfn)
    }

    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.pageset.len()
    }

    pub fn page_state(&self, pfn: usize) -> Option<PageState> {
        self.contains(pfn).then(|| self.map.state(pfn))
    }

    pub fn get_pageblock_migratetype(&self, pfn: usize) -> MigrateType {
        self.map.pageblock_migratetype(pfn)
    }

    /// Retag the pageblock containing `pfn` without moving its free pages.
    pub fn set_pageblock_migratetype(&self, pfn: usize, mt: MigrateType) {
        self.map.set_pageblock_migratetype(pfn, mt);
    }

    fn bad_page(&self, pfn: usize, state: PageState, reason: &str) -> ! {
        error!(
            "zone {}: bad page state at pfn {:#x}: {:?} ({})",
            self.name, pfn, state, reason
        );
        panic!("bad page state: pfn {:#x} is {:?}: {}", pfn, state, reason);
    }

    fn check_block(&self, pfn: usize, order: usize) -> AllocResult {
        if order >= MAX_ORDER || pfn & ((1 << order) - 1) != 0 {
            return Err(AllocError::InvalidParam);
        }
        if !self.contains(pfn) || !self.contains(pfn + (1 << order) - 1) {
            return Err(AllocError::NotAllocated);
        }
        Ok(())
    }

    /// Move every page of an allocated block to `Free`, catching double
    /// frees and frees of pages the allocator never handed out.
    fn free_pages_prepare(&self, pfn: usize, order: usize) {
        for p in pfn..pfn + (1 << order) {
            if let Err(state) = self.map.transition(p, PageState::Allocated, PageState::Free) {
                self.bad_page(p, state, "freeing a page that is not allocated");
            }
        }
    }

    /// Hand the reserved range `[pfn, pfn + nr_pages)` to the allocator.
    ///
    /// The range is released as maximal naturally aligned blocks, each
    /// tagged by its pageblock's migration type.
    pub fn free_bootmem(&self, pfn: usize, nr_pages: usize) -> AllocResult {
        let end = pfn.checked_add(nr_pages).ok_or(AllocError::InvalidParam)?;
        if nr_pages == 0 || !self.contains(pfn) || end > self.end_pfn() {
            return Err(AllocError::InvalidParam);
        }
        if (pfn..end).any(|p| self.map.state(p) != PageState::Reserved) {
            warn!(
                "zone {}: bootmem range [{:#x}, {:#x}) already released",
                self.name, pfn, end
            );
            return Err(AllocError::MemoryOverlap);
        }
        for p in pfn..end {
            self.map.set_state(p, PageState::Allocated);
        }

        let mut cur = pfn;
        while cur < end {
            let mut order = (cur.trailing_zeros() as usize).min(MAX_ORDER - 1);
            while cur + (1 << order) > end {
                order -= 1;
            }
            self.free_pages_prepare(cur, order);
            let mt = self.map.pageblock_migratetype(cur);
            self.with_engine(|e| e.free_one_page(cur, order, mt));
            cur += 1 << order;
        }

        self.managed_pages.fetch_add(nr_pages, Ordering::Relaxed);
        self.update_pageset_sizes();
        debug!(
            "zone {}: released {} boot pages at {:#x}, managed {}",
            self.name,
            nr_pages,
            pfn,
            self.managed_pages()
        );
        Ok(())
    }

    /// Recompute every per-CPU cache's batch and high mark from the
    /// current managed size.
    pub fn update_pageset_sizes(&self) {
        let batch = zone_batchsize(self.managed_pages());
        for pcp in &self.pageset {
            pcp.lock().set_batch(batch);
        }
    }

    /// Return an allocated block straight to the buddy lists as type `mt`.
    pub fn free_one_block(&self, pfn: usize, order: usize, mt: MigrateType) -> AllocResult {
        self.check_block(pfn, order)?;
        self.free_pages_prepare(pfn, order);
        self.with_engine(|e| e.free_one_page(pfn, order, mt));
        Ok(())
    }

    /// Allocate `2^order` pages from the `mt` lists only, splitting a larger
    /// block if needed.
    pub fn allocate_smallest(&self, order: usize, mt: MigrateType) -> Option<usize> {
        if order >= MAX_ORDER {
            return None;
        }
        self.with_engine(|e| {
            let pfn = e.rmqueue_smallest(order, mt)?;
            e.prep_new_block(pfn, order, PageState::Allocated);
            Some(pfn)
        })
    }

    /// Allocate `2^order` pages by stealing from the fallback types of `mt`.
    pub fn allocate_with_fallback(&self, order: usize, mt: MigrateType) -> Option<usize> {
        if order >= MAX_ORDER {
            return None;
        }
        self.with_engine(|e| {
            let pfn = e.rmqueue_fallback(order, mt)?;
            e.prep_new_block(pfn, order, PageState::Allocated);
            Some(pfn)
        })
    }

    /// Allocate `2^order` pages: own type, then fallbacks, then the reserve.
    pub fn rmqueue(&self, order: usize, mt: MigrateType) -> Option<usize> {
        if order >= MAX_ORDER {
            return None;
        }
        self.with_engine(|e| {
            let pfn = e.rmqueue(order, mt)?;
            e.prep_new_block(pfn, order, PageState::Allocated);
            Some(pfn)
        })
    }

    /// Take up to `count` order-0 pages under a single lock acquisition,
    /// handing each to `sink` in the `PerCpu` state. Returns how many were taken.
    pub fn rmqueue_bulk(&self, count: usize, mt: MigrateType, mut sink: impl FnMut(PcpPage)) -> usize {
        let taken = self.with_engine(|e| {
            let mut taken = 0;
            while taken < count {
                let Some(pfn) = e.rmqueue(0, mt) else {
                    break;
                };
                e.prep_new_block(pfn, 0, PageState::PerCpu);
                let block_mt = e.map.pageblock_migratetype(pfn);
                let migratetype = match block_mt {
                    MigrateType::Cma | MigrateType::Isolate => block_mt,
                    _ => mt,
                };
                sink(PcpPage { pfn, migratetype });
                taken += 1;
            }
            taken
        });
        if taken > 0 {
            ZoneCounters::count(&self.stat.pcp_refills);
        }
        taken
    }

    /// Return pages detached from a per-CPU cache under a single lock
    /// acquisition.
    pub fn free_pcppages_bulk(&self, pages: &[PcpPage]) {
        if pages.is_empty() {
            return;
        }
        for page in pages {
            if let Err(state) = self.map.transition(page.pfn, PageState::PerCpu, PageState::Free) {
                self.bad_page(page.pfn, state, "draining a page that is not cached");
            }
        }
        self.with_engine(|e| {
            for page in pages {
                // The pageblock may have been isolated while the page was cached
                let mt = match e.map.pageblock_migratetype(page.pfn) {
                    MigrateType::Isolate => MigrateType::Isolate,
                    _ => page.migratetype,
                };
                e.free_one_page(page.pfn, 0, mt);
            }
        });
        ZoneCounters::count(&self.stat.pcp_drains);
    }

    /// Move free blocks starting in `[start_pfn, end_pfn)` to `mt`.
    /// Returns the number of pages moved.
    pub fn move_contiguous_pages(&self, start_pfn: usize, end_pfn: usize, mt: MigrateType) -> usize {
        let start = start_pfn.max(self.start_pfn);
        let end = end_pfn.min(self.end_pfn());
        if start >= end {
            return 0;
        }
        self.with_engine(|e| e.move_freepages(start, end, mt))
    }

    /// Move the free pages of the pageblock containing `pfn` to `mt`.
    pub fn move_freepages_block(&self, pfn: usize, mt: MigrateType) -> usize {
        if !self.contains(pfn) {
            return 0;
        }
        self.with_engine(|e| e.move_freepages_block(pfn, mt))
    }

    /// Withdraw the pageblock containing `pfn` from allocation.
    ///
    /// Its free pages move to the isolate lists and stop counting as free.
    /// Pages freed into it later stay isolated. Returns the pages moved.
    pub fn isolate_pageblock(&self, pfn: usize) -> AllocResult<usize> {
        if !self.contains(pfn) {
            return Err(AllocError::InvalidParam);
        }
        let moved = self.with_engine(|e| {
            if e.map.pageblock_migratetype(pfn) == MigrateType::Isolate {
                return Err(AllocError::InvalidParam);
            }
            e.map.set_pageblock_migratetype(pfn, MigrateType::Isolate);
            Ok(e.move_freepages_block(pfn, MigrateType::Isolate))
        })?;
        // Cached pages of this block return to the isolate lists
        self.drain_all_pages();
        debug!(
            "zone {}: isolated pageblock at {:#x}, {} free pages",
            self.name,
            pfn & !(PAGEBLOCK_NR_PAGES - 1),
            moved
        );
        Ok(moved)
    }

    /// Return an isolated pageblock to `mt`. Returns the pages moved.
    pub fn unisolate_pageblock(&self, pfn: usize, mt: MigrateType) -> AllocResult<usize> {
        if !self.contains(pfn) || mt == MigrateType::Isolate {
            return Err(AllocError::InvalidParam);
        }
        self.with_engine(|e| {
            if e.map.pageblock_migratetype(pfn) != MigrateType::Isolate {
                return Err(AllocError::InvalidParam);
            }
            e.map.set_pageblock_migratetype(pfn, mt);
            Ok(e.move_freepages_block(pfn, mt))
        })
    }

    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            min: self.wmark_min.load(Ordering::Relaxed),
            low: self.wmark_low.load(Ordering::Relaxed),
            high: self.wmark_high.load(Ordering::Relaxed),
        }
    }

    pub fn set_watermarks(&self, wm: Watermarks) {
        self.wmark_min.store(wm.min, Ordering::Relaxed);
        self.wmark_low.store(wm.low, Ordering::Relaxed);
        self.wmark_high.store(wm.high, Ordering::Relaxed);
    }

    pub fn lowmem_reserve(&self, classzone_idx: usize) -> usize {
        self.lowmem_reserve
            .get(classzone_idx)
            .map_or(0, |r| r.load(Ordering::Relaxed))
    }

    pub fn set_lowmem_reserve(&self, classzone_idx: usize, pages: usize) {
        if let Some(r) = self.lowmem_reserve.get(classzone_idx) {
            r.store(pages, Ordering::Relaxed);
        }
    }

    /// Whether a request of `order` whose preferred zone is `classzone_idx`
    /// may be served from this zone without dropping below `mark`.
    pub fn meets_watermark(
        &self,
        order: usize,
        mark: usize,
        classzone_idx: usize,
        alloc_flags: AllocFlags,
    ) -> bool {
        let nr_free: [usize; MAX_ORDER] = core::array::from_fn(|o| self.stat.nr_free(o));
        watermark_ok(
            self.stat.free_pages(),
            order,
            mark,
            self.lowmem_reserve(classzone_idx),
            alloc_flags,
            &nr_free,
        )
    }

    /// Tag up to two pageblocks `Reserve`, sized from the min watermark.
    ///
    /// Only fully managed `Movable` or already-reserved pageblocks qualify.
    /// Excess `Reserve` pageblocks go back to `Movable`.
    pub fn setup_migrate_reserve(&self) {
        let min = self.wmark_min.load(Ordering::Relaxed);
        let mut reserve = min.div_ceil(PAGEBLOCK_NR_PAGES).min(MAX_RESERVE_BLOCKS);
        let first = self.start_pfn.next_multiple_of(PAGEBLOCK_NR_PAGES);

        self.with_engine(|e| {
            let mut pfn = first;
            while pfn + PAGEBLOCK_NR_PAGES <= self.end_pfn() {
                let block_mt = e.map.pageblock_migratetype(pfn);
                if reserve > 0 {
                    if e.map.any_reserved(pfn, pfn + PAGEBLOCK_NR_PAGES) {
                        pfn += PAGEBLOCK_NR_PAGES;
                        continue;
                    }
                    match block_mt {
                        MigrateType::Reserve => reserve -= 1,
                        MigrateType::Movable => {
                            e.map.set_pageblock_migratetype(pfn, MigrateType::Reserve);
                            e.move_freepages_block(pfn, MigrateType::Reserve);
                            reserve -= 1;
                        }
                        _ => {}
                    }
                } else if block_mt == MigrateType::Reserve {
                    e.map.set_pageblock_migratetype(pfn, MigrateType::Movable);
                    e.move_freepages_block(pfn, MigrateType::Movable);
                }
                pfn += PAGEBLOCK_NR_PAGES;
            }
        });
    }

    /// Batch size of the per-CPU caches.
    pub fn pcp_batch(&self) -> usize {
        self.pageset.first().map_or(1, |pcp| pcp.lock().batch())
    }

    /// High mark of the per-CPU caches.
    pub fn pcp_high(&self) -> usize {
        self.pageset.first().map_or(6, |pcp| pcp.lock().high())
    }

    /// Pages cached by `cpu`.
    pub fn pcp_count(&self, cpu: usize) -> usize {
        self.pageset.get(cpu).map_or(0, |pcp| pcp.lock().count())
    }

    /// Pages cached across all CPUs.
    pub fn pcp_total(&self) -> usize {
        self.pageset.iter().map(|pcp| pcp.lock().count()).sum()
    }

    fn pageset(&self, cpu: usize) -> AllocResult<&SpinNoIrq<PerCpuPages>> {
        self.pageset.get(cpu).ok_or(AllocError::InvalidParam)
    }

    /// Take one page of type `mt` from `cpu`'s cache.
    pub fn allocate_one(&self, cpu: usize, mt: MigrateType, cold: bool) -> Option<usize> {
        let pfn = self.pageset(cpu).ok()?.lock().allocate_one(self, mt, cold)?;
        if let Err(state) = self.map.transition(pfn, PageState::PerCpu, PageState::Allocated) {
            self.bad_page(pfn, state, "cached page changed state");
        }
        Some(pfn)
    }

    /// Give an allocated order-0 page to `cpu`'s cache.
    ///
    /// Pages of isolated pageblocks bypass the cache.
    pub fn free_one(&self, cpu: usize, pfn: usize, cold: bool) -> AllocResult {
        self.check_block(pfn, 0)?;
        let pcp = self.pageset(cpu)?;
        let mt = self.map.pageblock_migratetype(pfn);
        if mt == MigrateType::Isolate {
            return self.free_one_block(pfn, 0, mt);
        }
        if let Err(state) = self.map.transition(pfn, PageState::Allocated, PageState::PerCpu) {
            self.bad_page(pfn, state, "freeing a page that is not allocated");
        }
        pcp.lock().free_one(self, pfn, mt, cold);
        Ok(())
    }

    /// Return all of `cpu`'s cached pages to the buddy lists.
    pub fn drain_pages(&self, cpu: usize) {
        if let Some(pcp) = self.pageset.get(cpu) {
            pcp.lock().drain(self);
        }
    }

    pub fn drain_all_pages(&self) {
        for cpu in 0..self.pageset.len() {
            self.drain_pages(cpu);
        }
    }

    /// Allocate `2^order` pages: order 0 through `cpu`'s cache, larger
    /// orders directly from the buddy lists.
    pub fn buffered_rmqueue(&self, cpu: usize, order: usize, mt: MigrateType, cold: bool) -> Option<usize> {
        let pfn = if order == 0 {
            self.allocate_one(cpu, mt, cold)
        } else {
            self.rmqueue(order, mt)
        };
        match pfn {
            Some(_) => ZoneCounters::count(&self.stat.alloc_success),
            None => ZoneCounters::count(&self.stat.alloc_fail),
        }
        pfn
    }

    /// Free `2^order` pages at `pfn`. Order-0 pages go through `cpu`'s cache.
    pub fn free_pages_cpu(&self, cpu: usize, pfn: usize, order: usize, cold: bool) -> AllocResult {
        if order == 0 {
            return self.free_one(cpu, pfn, cold);
        }
        self.check_block(pfn, order)?;
        let mt = self.map.pageblock_migratetype(pfn);
        self.free_one_block(pfn, order, mt)
    }

    /// Every free block in the buddy lists, ordered by frame number.
    pub fn free_blocks(&self) -> Vec<FreeBlockInfo> {
        self.with_engine(|e| e.free_blocks())
    }

    /// Free blocks on the `(order, mt)` list, head first.
    pub fn free_list(&self, order: usize, mt: MigrateType) -> Vec<usize> {
        if order >= MAX_ORDER {
            return Vec::new();
        }
        let areas = self.free_area.lock();
        areas.area(order).list(mt).iter(areas.links()).collect()
    }

    pub fn stats(&self) -> ZoneStats {
        ZoneStats {
            spanned_pages: self.spanned_pages,
            managed_pages: self.managed_pages(),
            free_pages: self.stat.free_pages(),
            free_blocks_by_order: core::array::from_fn(|o| self.stat.nr_free(o)),
            pcp_pages: self.pcp_total(),
            watermarks: self.watermarks(),
            alloc_success: self.stat.alloc_success.load(Ordering::Relaxed),
            alloc_fail: self.stat.alloc_fail.load(Ordering::Relaxed),
            fallback_steals: self.stat.fallback_steals.load(Ordering::Relaxed),
            pcp_refills: self.stat.pcp_refills.load(Ordering::Relaxed),
            pcp_drains: self.stat.pcp_drains.load(Ordering::Relaxed),
        }
    }

    /// Log free block counts per order and migration type.
    pub fn print_info(&self) {
        let wm = self.watermarks();
        info!(
            "zone {}: free {} managed {} min {} low {} high {} pcp {}",
            self.name,
            self.free_pages(),
            self.managed_pages(),
            wm.min,
            wm.low,
            wm.high,
            self.pcp_total()
        );
        let areas = self.free_area.lock();
        for order in 0..MAX_ORDER {
            let area = areas.area(order);
            if area.nr_free() == 0 {
                continue;
            }
            let mut counts = [0usize; MIGRATE_TYPES];
            for mt in MigrateType::ALL {
                counts[mt.index()] = area.list(mt).len();
            }
            info!("  order {:2}: {:5} blocks {:?}", order, area.nr_free(), counts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(start: usize, pages: usize) -> Zone {
        Zone::new(ZoneConfig::new("test", start, pages)).unwrap()
    }

    #[test]
    fn test_free_bootmem_builds_aligned_blocks() {
        let z = zone(0x100, 0x200);
        z.free_bootmem(0x103, 0x11).unwrap();
        let blocks: Vec<_> = z.free_blocks().iter().map(|b| (b.pfn, b.order)).collect();
        assert_eq!(blocks, [(0x103, 0), (0x104, 2), (0x108, 3), (0x110, 2)]);
        assert_eq!(z.free_pages(), 0x11);
        assert_eq!(z.managed_pages(), 0x11);
        assert_eq!(z.page_state(0x102), Some(PageState::Reserved));
    }

    #[test]
    fn test_free_bootmem_twice_rejected() {
        let z = zone(0, 64);
        z.free_bootmem(0, 16).unwrap();
        assert_eq!(z.free_bootmem(8, 16), Err(AllocError::MemoryOverlap));
    }

    #[test]
    fn test_alloc_free_restores_block() {
        let z = zone(0, 1024);
        z.free_bootmem(0, 1024).unwrap();
        let pfn = z.rmqueue(3, MigrateType::Movable).unwrap();
        assert_eq!(z.free_pages(), 1016);
        assert_eq!(z.page_state(pfn), Some(PageState::Allocated));
        z.free_pages_cpu(0, pfn, 3, false).unwrap();
        assert_eq!(z.free_pages(), 1024);
        let blocks = z.free_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].order, 10);
    }

    #[test]
    #[should_panic(expected = "bad page state")]
    fn test_double_free_panics() {
        let z = zone(0, 64);
        z.free_bootmem(0, 64).unwrap();
        let pfn = z.rmqueue(1, MigrateType::Movable).unwrap();
        z.free_pages_cpu(0, pfn, 1, false).unwrap();
        let _ = z.free_pages_cpu(0, pfn, 1, false);
    }

    #[test]
    fn test_isolate_hides_free_pages() {
        let z = zone(0, 2048);
        z.free_bootmem(0, 2048).unwrap();
        let moved = z.isolate_pageblock(0).unwrap();
        assert_eq!(moved, 1024);
        assert_eq!(z.free_pages(), 1024);
        assert_eq!(z.isolate_pageblock(5), Err(AllocError::InvalidParam));

        // Only the second pageblock can serve requests now
        let pfn = z.rmqueue(0, MigrateType::Movable).unwrap();
        assert!(pfn >= 1024);
        z.free_pages_cpu(0, pfn, 0, false).unwrap();
        z.drain_all_pages();

        assert_eq!(z.unisolate_pageblock(0, MigrateType::Movable), Ok(1024));
        assert_eq!(z.free_pages(), 2048);
    }

    #[test]
    fn test_migrate_reserve_follows_min_watermark() {
        let z = zone(0, 4096);
        z.free_bootmem(0, 4096).unwrap();
        z.set_watermarks(Watermarks::from_min(1500, 1500));
        z.setup_migrate_reserve();
        let reserved = (0..4)
            .filter(|b| z.get_pageblock_migratetype(b * PAGEBLOCK_NR_PAGES) == MigrateType::Reserve)
            .count();
        assert_eq!(reserved, 2);

        z.set_watermarks(Watermarks::from_min(100, 100));
        z.setup_migrate_reserve();
        let reserved = (0..4)
            .filter(|b| z.get_pageblock_migratetype(b * PAGEBLOCK_NR_PAGES) == MigrateType::Reserve)
            .count();
        assert_eq!(reserved, 1);
        assert_eq!(z.free_pages(), 4096);
    }

    #[test]
    fn test_pcp_refill_and_drain() {
        let z = Zone::new(ZoneConfig::new("pcp", 0, 32768).with_cpus(2)).unwrap();
        z.free_bootmem(0, 32768).unwrap();
        assert_eq!(z.pcp_batch(), 7);
        assert_eq!(z.pcp_high(), 42);

        let pfn = z.buffered_rmqueue(1, 0, MigrateType::Unmovable, false).unwrap();
        assert_eq!(z.pcp_count(1), 6);
        assert_eq!(z.pcp_count(0), 0);
        assert_eq!(z.free_pages(), 32768 - 7);

        z.free_pages_cpu(1, pfn, 0, false).unwrap();
        assert_eq!(z.pcp_count(1), 7);
        z.drain_pages(1);
        assert_eq!(z.pcp_count(1), 0);
        assert_eq!(z.free_pages(), 32768);
    }
}
