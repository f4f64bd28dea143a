//! Virtual region allocator
//!
//! Hands out non-overlapping `[start, end)` ranges inside a bounded arena.
//! The areas live in one ordered map keyed by start address, which serves
//! both the point lookups and the address-ordered walk of the allocator.
//! Released ranges are unmapped at once but only removed, behind a single
//! TLB flush, once enough of them have piled up.

use alloc::{collections::BTreeMap, vec::Vec};
use core::{
    ops::Bound::{Excluded, Unbounded},
    sync::atomic::{AtomicUsize, Ordering},
};

use kspin::SpinNoIrq;
#[cfg(feature = "log")]
use log::{debug, error, info, trace, warn};

use super::{
    area::{VmStruct, VmapArea, VmapAreaFlags},
    page_table::PageTable,
};
use crate::{checked_align_up, is_aligned, AllocError, AllocResult, PAGE_SHIFT, PAGE_SIZE};

/// Lazily freed address space tolerated per `log2(cpus)` step.
const LAZY_UNIT_BYTES: usize = 32 * 1024 * 1024;

/// Pending lazily freed pages that trigger a purge: 32MB worth of pages
/// for every bit of the CPU count.
pub fn lazy_max_pages(nr_cpus: usize) -> usize {
    let log = (usize::BITS - nr_cpus.leading_zeros()) as usize;
    log * (LAZY_UNIT_BYTES / PAGE_SIZE)
}

/// Construction parameters of a [`VmapArena`].
#[derive(Debug, Clone, Copy)]
pub struct VmapConfig {
    pub start: usize,
    pub end: usize,
    pub nr_cpus: usize,
    /// Purge threshold override; defaults to [`lazy_max_pages`].
    pub lazy_max_pages: Option<usize>,
}

impl VmapConfig {
    pub const fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            nr_cpus: 1,
            lazy_max_pages: None,
        }
    }

    pub const fn with_cpus(mut self, nr_cpus: usize) -> Self {
        self.nr_cpus = nr_cpus;
        self
    }

    pub const fn with_lazy_max_pages(mut self, pages: usize) -> Self {
        self.lazy_max_pages = Some(pages);
        self
    }
}

/// Snapshot of an arena's state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmapStats {
    /// Areas in the tree, lazily freed ones included.
    pub nr_areas: usize,
    /// Areas carrying a mapping descriptor.
    pub nr_vm_areas: usize,
    /// Released areas waiting for a purge.
    pub nr_lazy: usize,
    pub lazy_pages: usize,
    pub lazy_max_pages: usize,
    pub purges: usize,
    /// Bytes reserved by areas that are still owned.
    pub live_bytes: usize,
}

/// Area map plus the allocation cache, protected by the arena lock.
struct VmapTree {
    areas: BTreeMap<usize, VmapArea>,
    /// Start of the area the next scan resumes after.
    free_cache: Option<usize>,
    /// Largest hole skipped since the cache was set.
    cached_hole_size: usize,
    cached_vstart: usize,
    cached_align: usize,
}

impl VmapTree {
    const fn new() -> Self {
        Self {
            areas: BTreeMap::new(),
            free_cache: None,
            cached_hole_size: 0,
            cached_vstart: 0,
            cached_align: 0,
        }
    }

    fn invalidate_cache(&mut self) {
        self.cached_hole_size = 0;
        self.free_cache = None;
    }

    /// Lowest area whose end is at or above `addr`.
    fn first_ending_at_or_after(&self, addr: usize) -> Option<(usize, usize)> {
        if let Some((_, va)) = self.areas.range(..=addr).next_back() {
            if va.va_end >= addr {
                return Some((va.va_start, va.va_end));
            }
        }
        self.areas
            .range((Excluded(addr), Unbounded))
            .next()
            .map(|(_, va)| (va.va_start, va.va_end))
    }

    fn next_area(&self, start: usize) -> Option<(usize, usize)> {
        self.areas
            .range((Excluded(start), Unbounded))
            .next()
            .map(|(_, va)| (va.va_start, va.va_end))
    }

    /// Lowest `align`-aligned address in `[vstart, vend)` with `size`
    /// free bytes, or `None` if there is none or the arithmetic wraps.
    fn find_hole(&mut self, size: usize, align: usize, vstart: usize, vend: usize) -> Option<usize> {
        // More permissive parameters than the cached scan used: start over
        if size < self.cached_hole_size || vstart < self.cached_vstart || align < self.cached_align {
            self.invalidate_cache();
        }
        self.cached_vstart = vstart;
        self.cached_align = align;

        let cached = self
            .free_cache
            .and_then(|start| self.areas.get(&start))
            .map(|va| (va.va_start, va.va_end));
        let mut resume = None;
        if let Some((start, end)) = cached {
            let addr = checked_align_up(end, align)?;
            if addr >= vstart {
                resume = Some((addr, Some((start, end))));
            }
        }
        let (mut addr, first) = match resume {
            Some(point) => point,
            None => {
                self.invalidate_cache();
                let addr = checked_align_up(vstart, align)?;
                (addr, self.first_ending_at_or_after(addr))
            }
        };

        if let Some(mut cur) = first {
            loop {
                let end = addr.checked_add(size)?;
                if end <= cur.0 || end > vend {
                    break;
                }
                if addr.saturating_add(self.cached_hole_size) < cur.0 {
                    self.cached_hole_size = cur.0 - addr;
                }
                addr = checked_align_up(cur.1, align)?;
                match self.next_area(cur.0) {
                    Some(next) => cur = next,
                    None => break,
                }
            }
        }

        let end = addr.checked_add(size)?;
        (end <= vend).then_some(addr)
    }

    fn insert(&mut self, va: VmapArea) {
        let start = va.va_start;
        self.areas.insert(start, va);
        self.free_cache = Some(start);
    }

    /// Drop the area at `start`, keeping the allocation cache on a live node.
    fn remove(&mut self, start: usize) -> Option<VmapArea> {
        let va_end = self.areas.get(&start)?.va_end;
        if let Some(cache) = self.free_cache {
            if va_end < self.cached_vstart {
                self.free_cache = None;
            } else if start <= cache {
                self.free_cache = self.areas.range(..start).next_back().map(|(&s, _)| s);
            }
        }
        self.areas.remove(&start)
    }
}

/// Virtual region allocator over `[start, end)`.
pub struct VmapArena<P: PageTable> {
    start: usize,
    end: usize,
    tree: SpinNoIrq<VmapTree>,
    purge_lock: SpinNoIrq<()>,
    lazy_nr: AtomicUsize,
    lazy_max: usize,
    nr_purges: AtomicUsize,
    page_table: P,
}

impl<P: PageTable> VmapArena<P> {
    pub fn new(config: VmapConfig, page_table: P) -> AllocResult<Self> {
        if config.start >= config.end
            || !is_aligned(config.start, PAGE_SIZE)
            || !is_aligned(config.end, PAGE_SIZE)
            || config.nr_cpus == 0
        {
            return Err(AllocError::InvalidParam);
        }
        let lazy_max = config
            .lazy_max_pages
            .unwrap_or_else(|| lazy_max_pages(config.nr_cpus));
        info!(
            "vmap arena [{:#x}, {:#x}), lazy purge after {} pages",
            config.start, config.end, lazy_max
        );
        Ok(Self {
            start: config.start,
            end: config.end,
            tree: SpinNoIrq::new(VmapTree::new()),
            purge_lock: SpinNoIrq::new(()),
            lazy_nr: AtomicUsize::new(0),
            lazy_max,
            nr_purges: AtomicUsize::new(0),
            page_table,
        })
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn page_table(&self) -> &P {
        &self.page_table
    }

    /// Lazily freed pages not yet purged.
    #[inline]
    pub fn lazy_pages(&self) -> usize {
        self.lazy_nr.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn lazy_max_pages(&self) -> usize {
        self.lazy_max
    }

    /// Reserve `size` bytes aligned to `align` inside `[vstart, vend)`,
    /// lowest address first.
    ///
    /// If no hole fits, lazily freed areas are purged and the search is
    /// retried once before failing with [`AllocError::NoAddressSpace`].
    pub fn alloc_region(&self, size: usize, align: usize, vstart: usize, vend: usize) -> AllocResult<usize> {
        if size == 0
            || !is_aligned(size, PAGE_SIZE)
            || !align.is_power_of_two()
            || !is_aligned(vstart, PAGE_SIZE)
            || vstart >= vend
            || vstart < self.start
            || vend > self.end
        {
            return Err(AllocError::InvalidParam);
        }

        let mut purged = false;
        loop {
            let found = {
                let mut tree = self.tree.lock();
                tree.find_hole(size, align, vstart, vend).map(|addr| {
                    tree.insert(VmapArea::new(addr, addr + size));
                    addr
                })
            };
            match found {
                Some(addr) => {
                    trace!("vmap: [{:#x}, {:#x})", addr, addr + size);
                    return Ok(addr);
                }
                None if !purged => {
                    self.purge_lazy();
                    purged = true;
                }
                None => {
                    warn!(
                        "vmap allocation for size {:#x} align {:#x} in [{:#x}, {:#x}) failed",
                        size, align, vstart, vend
                    );
                    return Err(AllocError::NoAddressSpace);
                }
            }
        }
    }

    /// Release the area starting at `addr`.
    ///
    /// Its page-table entries are cleared before this returns; the range
    /// itself is reclaimed by a later purge.
    pub fn free_region_lazy(&self, addr: usize) -> AllocResult {
        self.release(addr, false).map(|_| ())
    }

    /// Unmap and lazily free the area at `addr`, handing back its descriptor.
    ///
    /// With `require_vm` only areas carrying a descriptor are accepted.
    pub(crate) fn release(&self, addr: usize, require_vm: bool) -> AllocResult<Option<VmStruct>> {
        let (start, end, vm) = {
            let mut tree = self.tree.lock();
            let Some(va) = tree.areas.get_mut(&addr) else {
                error!("trying to free nonexistent vmap area {:#x}", addr);
                return Err(AllocError::NotAllocated);
            };
            if va.is_released() {
                error!("trying to free vmap area {:#x} twice", addr);
                return Err(AllocError::NotAllocated);
            }
            if require_vm && !va.flags.contains(VmapAreaFlags::VM_AREA) {
                error!("vmap area {:#x} has no mapping descriptor", addr);
                return Err(AllocError::NotAllocated);
            }
            // The flag keeps the slot reserved while the lock is dropped
            va.flags.insert(VmapAreaFlags::UNMAPPING);
            va.flags.remove(VmapAreaFlags::VM_AREA);
            (va.va_start, va.va_end, va.vm.take())
        };

        let cleared = self.unmap_range(start, end);

        // Account before a purge can see the area
        let nr = (end - start) >> PAGE_SHIFT;
        let pending = self.lazy_nr.fetch_add(nr, Ordering::Relaxed) + nr;
        if let Some(va) = self.tree.lock().areas.get_mut(&start) {
            va.flags.remove(VmapAreaFlags::UNMAPPING);
            va.flags.insert(VmapAreaFlags::LAZY_FREE);
        }
        trace!(
            "vmap: lazily freed [{:#x}, {:#x}), {} entries cleared, {} pages pending",
            start,
            end,
            cleared,
            pending
        );
        if pending > self.lazy_max {
            self.try_purge_lazy();
        }
        Ok(vm)
    }

    /// Clear every present entry in `[start, end)`. Returns how many were present.
    fn unmap_range(&self, start: usize, end: usize) -> usize {
        (start..end)
            .step_by(PAGE_SIZE)
            .filter(|&vaddr| self.page_table.clear_mapping(vaddr).is_some())
            .count()
    }

    /// Reclaim every lazily freed area, waiting for a purge already in
    /// progress. Returns the number of areas reclaimed.
    pub fn purge_lazy(&self) -> usize {
        let _guard = self.purge_lock.lock();
        self.purge_locked()
    }

    /// Like [`VmapArena::purge_lazy`], but gives up if another purge is running.
    pub fn try_purge_lazy(&self) -> usize {
        match self.purge_lock.try_lock() {
            Some(_guard) => self.purge_locked(),
            None => 0,
        }
    }

    fn purge_locked(&self) -> usize {
        let mut batch = Vec::new();
        let mut flush_start = usize::MAX;
        let mut flush_end = 0;
        let mut nr = 0;

        {
            let mut tree = self.tree.lock();
            for va in tree.areas.values_mut() {
                if !va.flags.contains(VmapAreaFlags::LAZY_FREE) {
                    continue;
                }
                flush_start = flush_start.min(va.va_start);
                flush_end = flush_end.max(va.va_end);
                nr += va.size() >> PAGE_SHIFT;
                va.flags.remove(VmapAreaFlags::LAZY_FREE);
                va.flags.insert(VmapAreaFlags::LAZY_FREEING);
                batch.push(va.va_start);
            }
        }
        if batch.is_empty() {
            return 0;
        }

        self.lazy_nr.fetch_sub(nr, Ordering::Relaxed);
        self.page_table.flush_tlb(flush_start, flush_end);

        let mut tree = self.tree.lock();
        for start in &batch {
            tree.remove(*start);
        }
        drop(tree);

        self.nr_purges.fetch_add(1, Ordering::Relaxed);
        debug!(
            "vmap purge: {} areas, {} pages, flushed [{:#x}, {:#x})",
            batch.len(),
            nr,
            flush_start,
            flush_end
        );
        batch.len()
    }

    /// Attach a mapping descriptor to the live area at `addr`.
    pub(crate) fn set_vm(&self, addr: usize, vm: VmStruct) {
        if let Some(va) = self.tree.lock().areas.get_mut(&addr) {
            va.vm = Some(vm);
            va.flags.insert(VmapAreaFlags::VM_AREA);
        }
    }

    /// Run `f` on the descriptor of the live area at `addr`.
    pub(crate) fn with_vm_mut<R>(&self, addr: usize, f: impl FnOnce(&mut VmStruct) -> R) -> Option<R> {
        let mut tree = self.tree.lock();
        let va = tree.areas.get_mut(&addr)?;
        if !va.flags.contains(VmapAreaFlags::VM_AREA) {
            return None;
        }
        va.vm.as_mut().map(f)
    }

    /// Descriptor of the mapped area starting at `addr`.
    pub fn find_vm_area(&self, addr: usize) -> Option<VmStruct> {
        self.with_vm_mut(addr, |vm| vm.clone())
    }

    /// `[start, end)` of the area covering `addr`, released or not.
    pub fn area_containing(&self, addr: usize) -> Option<(usize, usize)> {
        let tree = self.tree.lock();
        let (_, va) = tree.areas.range(..=addr).next_back()?;
        va.contains(addr).then_some((va.va_start, va.va_end))
    }

    /// Run `f` on the descriptor of the mapped area covering `addr`.
    pub(crate) fn with_vm_containing<R>(&self, addr: usize, f: impl FnOnce(&VmStruct) -> R) -> Option<R> {
        let tree = self.tree.lock();
        let (_, va) = tree.areas.range(..=addr).next_back()?;
        if !va.contains(addr) || !va.flags.contains(VmapAreaFlags::VM_AREA) {
            return None;
        }
        va.vm.as_ref().map(f)
    }

    /// Every area in address order, lazily freed ones included.
    pub fn regions(&self) -> Vec<(usize, usize)> {
        self.tree
            .lock()
            .areas
            .values()
            .map(|va| (va.va_start, va.va_end))
            .collect()
    }

    pub fn stats(&self) -> VmapStats {
        let tree = self.tree.lock();
        let mut stats = VmapStats {
            nr_areas: tree.areas.len(),
            lazy_pages: self.lazy_pages(),
            lazy_max_pages: self.lazy_max,
            purges: self.nr_purges.load(Ordering::Relaxed),
            ..Default::default()
        };
        for va in tree.areas.values() {
            if va.is_released() {
                stats.nr_lazy += 1;
                continue;
            }
            if va.flags.contains(VmapAreaFlags::VM_AREA) {
                stats.nr_vm_areas += 1;
            }
            stats.live_bytes += va.size();
        }
        stats
    }

    /// Log every mapped area with its size, kind and caller.
    pub fn print_vmallocinfo(&self) {
        let tree = self.tree.lock();
        for va in tree.areas.values() {
            let Some(vm) = va.vm.as_ref() else {
                continue;
            };
            info!(
                "{:#x}-{:#x} {:>8} {}:{} pages={} {:?}",
                va.va_start,
                va.va_end,
                vm.size,
                vm.caller.file(),
                vm.caller.line(),
                vm.pages.len(),
                vm.flags
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmap::SoftPageTable;

    const BASE: usize = 0xf000_0000;
    const END: usize = 0xf800_0000;

    fn arena(config: VmapConfig) -> VmapArena<SoftPageTable> {
        VmapArena::new(config, SoftPageTable::new()).unwrap()
    }

    #[test]
    fn test_lazy_max_pages_scales_with_cpus() {
        assert_eq!(lazy_max_pages(1), 8192);
        assert_eq!(lazy_max_pages(2), 2 * 8192);
        assert_eq!(lazy_max_pages(4), 3 * 8192);
        assert_eq!(lazy_max_pages(8), 4 * 8192);
    }

    #[test]
    fn test_gap_between_regions_is_used() {
        let a = arena(VmapConfig::new(BASE, END));
        assert_eq!(a.alloc_region(0x2000, PAGE_SIZE, BASE, END), Ok(0xf000_0000));
        assert_eq!(
            a.alloc_region(0x2000, PAGE_SIZE, 0xf000_4000, END),
            Ok(0xf000_4000)
        );
        assert_eq!(a.alloc_region(0x2000, 0x2000, BASE, END), Ok(0xf000_2000));
        assert_eq!(
            a.regions(),
            [
                (0xf000_0000, 0xf000_2000),
                (0xf000_2000, 0xf000_4000),
                (0xf000_4000, 0xf000_6000)
            ]
        );
    }

    #[test]
    fn test_alignment_skips_unaligned_hole() {
        let a = arena(VmapConfig::new(BASE, END));
        a.alloc_region(0x1000, PAGE_SIZE, BASE, END).unwrap();
        // The hole right after the first area is not 64K aligned
        assert_eq!(a.alloc_region(0x1000, 0x10000, BASE, END), Ok(BASE + 0x10000));
    }

    #[test]
    fn test_lazy_area_blocks_reuse_until_purged() {
        let a = arena(VmapConfig::new(BASE, END));
        let r1 = a.alloc_region(0x2000, PAGE_SIZE, BASE, END).unwrap();
        let r2 = a.alloc_region(0x2000, PAGE_SIZE, BASE, END).unwrap();
        let r3 = a.alloc_region(0x2000, PAGE_SIZE, BASE, END).unwrap();
        a.free_region_lazy(r2).unwrap();
        assert_eq!(a.lazy_pages(), 2);

        let r4 = a.alloc_region(0x2000, PAGE_SIZE, BASE, END).unwrap();
        assert_eq!(r4, r3 + 0x2000);

        assert_eq!(a.purge_lazy(), 1);
        assert_eq!(a.lazy_pages(), 0);
        assert_eq!(a.page_table().last_flush(), Some((r2, r2 + 0x2000)));
        // The cache moved back to the area before the purged one
        assert_eq!(a.alloc_region(0x2000, PAGE_SIZE, BASE, END), Ok(r2));
        assert_eq!(r1, BASE);
    }

    #[test]
    fn test_threshold_triggers_single_flush() {
        let a = arena(VmapConfig::new(BASE, END).with_lazy_max_pages(4));
        let regions: Vec<_> = (0..3)
            .map(|_| a.alloc_region(0x2000, PAGE_SIZE, BASE, END).unwrap())
            .collect();
        a.free_region_lazy(regions[0]).unwrap();
        a.free_region_lazy(regions[2]).unwrap();
        assert_eq!(a.page_table().tlb_flushes(), 0);
        a.free_region_lazy(regions[1]).unwrap();
        assert_eq!(a.page_table().tlb_flushes(), 1);
        assert_eq!(a.page_table().last_flush(), Some((BASE, BASE + 0x6000)));
        assert!(a.regions().is_empty());
        assert_eq!(a.stats().purges, 1);
    }

    #[test]
    fn test_exhaustion_purges_then_fails() {
        let a = arena(VmapConfig::new(BASE, BASE + 0x4000));
        let r = a.alloc_region(0x4000, PAGE_SIZE, BASE, BASE + 0x4000).unwrap();
        a.free_region_lazy(r).unwrap();
        // Only the purge makes room
        assert_eq!(a.alloc_region(0x4000, PAGE_SIZE, BASE, BASE + 0x4000), Ok(BASE));
        assert_eq!(
            a.alloc_region(0x1000, PAGE_SIZE, BASE, BASE + 0x4000),
            Err(AllocError::NoAddressSpace)
        );
    }

    #[test]
    fn test_bad_frees_rejected() {
        let a = arena(VmapConfig::new(BASE, END));
        let r = a.alloc_region(0x1000, PAGE_SIZE, BASE, END).unwrap();
        assert_eq!(a.free_region_lazy(r + 0x1000), Err(AllocError::NotAllocated));
        a.free_region_lazy(r).unwrap();
        assert_eq!(a.free_region_lazy(r), Err(AllocError::NotAllocated));
    }

    #[test]
    fn test_invalid_requests() {
        let a = arena(VmapConfig::new(BASE, END));
        assert_eq!(a.alloc_region(0, PAGE_SIZE, BASE, END), Err(AllocError::InvalidParam));
        assert_eq!(a.alloc_region(0x800, PAGE_SIZE, BASE, END), Err(AllocError::InvalidParam));
        assert_eq!(a.alloc_region(0x1000, 3, BASE, END), Err(AllocError::InvalidParam));
        assert_eq!(
            a.alloc_region(0x1000, PAGE_SIZE, BASE - 0x1000, END),
            Err(AllocError::InvalidParam)
        );
        assert!(VmapArena::new(VmapConfig::new(END, BASE), SoftPageTable::new()).is_err());
    }
}
