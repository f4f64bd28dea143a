//! Multi-zone page allocator
//!
//! Chooses a zone from the caller's preference list, applies watermark
//! admission control and drives the slow path (privileged retries, per-CPU
//! drain, reclaim and OOM through a [`ReclaimPolicy`]) when the fast path
//! comes up empty.

use alloc::vec::Vec;

use bitflags::bitflags;
#[cfg(feature = "log")]
use log::{debug, info, warn};

pub use crate::buddy::MAX_ZONES;
use crate::{
    buddy::{AllocFlags, MigrateType, PageBlock, Watermarks, Zone, ZoneConfig, ZoneStats},
    AllocError, AllocResult, PageSource, MAX_ORDER, PAGE_SIZE,
};

/// Orders above this are unlikely to be satisfied by reclaim alone.
const PAGE_ALLOC_COSTLY_ORDER: usize = 3;

/// Upper bound on reclaim rounds of the slow path.
const MAX_RECLAIM_RETRIES: usize = 16;

/// Default per-zone lowmem reserve ratios: the lowest zone keeps 1/256 of
/// the memory above it, the others 1/32.
pub const DEFAULT_LOWMEM_RESERVE_RATIO: [usize; MAX_ZONES] = [256, 32, 32, 32, 32, 32, 32, 32];

bitflags! {
    /// Request modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GfpFlags: u32 {
        /// The caller may wait for reclaim.
        const WAIT = 1 << 0;
        /// High priority: may use part of the emergency pool.
        const HIGH = 1 << 1;
        const IO = 1 << 2;
        const FS = 1 << 3;
        /// Prefer a cache-cold page.
        const COLD = 1 << 4;
        /// Suppress the allocation failure report.
        const NOWARN = 1 << 5;
        /// Retry until the retry bound instead of failing early.
        const NOFAIL = 1 << 6;
        /// Give up after a single reclaim attempt.
        const NORETRY = 1 << 7;
        /// Ignore watermarks entirely (the caller frees memory).
        const MEMALLOC = 1 << 8;
        const MOVABLE = 1 << 9;
        const RECLAIMABLE = 1 << 10;

        const ATOMIC = Self::HIGH.bits();
        const KERNEL = Self::WAIT.bits() | Self::IO.bits() | Self::FS.bits();
        const USER_MOVABLE = Self::KERNEL.bits() | Self::MOVABLE.bits();
    }
}

impl GfpFlags {
    /// Migration type implied by the mobility bits.
    pub fn migratetype(self) -> MigrateType {
        if self.contains(GfpFlags::MOVABLE) {
            MigrateType::Movable
        } else if self.contains(GfpFlags::RECLAIMABLE) {
            MigrateType::Reclaimable
        } else {
            MigrateType::Unmovable
        }
    }

    /// Watermark privileges granted to this request on the slow path.
    pub fn alloc_flags(self) -> AllocFlags {
        // Min watermark: neither WMARK_LOW nor WMARK_HIGH
        let mut flags = AllocFlags::empty();
        if self.contains(GfpFlags::HIGH) {
            flags |= AllocFlags::HIGH;
        }
        if !self.contains(GfpFlags::WAIT) {
            flags |= AllocFlags::HARDER;
        }
        if self.contains(GfpFlags::MEMALLOC) {
            flags |= AllocFlags::NO_WATERMARKS;
        }
        flags
    }
}

/// Memory reclaim collaborator consulted by the slow path.
///
/// Every hook defaults to doing nothing.
pub trait ReclaimPolicy: Send + Sync {
    /// Kick asynchronous reclaim for the zones in `zonelist`.
    fn wake_background_reclaim(&self, _order: usize, _zonelist: &[usize]) {}

    /// Synchronously reclaim memory; returns the number of pages freed.
    fn direct_reclaim(&self, _order: usize, _gfp: GfpFlags) -> usize {
        0
    }

    /// Last resort once reclaim makes no progress. Returns `true` if memory
    /// was released and the allocation should be retried.
    fn out_of_memory(&self, _order: usize, _gfp: GfpFlags) -> bool {
        false
    }
}

/// A [`ReclaimPolicy`] that never reclaims anything.
pub struct NoReclaim;

impl ReclaimPolicy for NoReclaim {}

/// `sqrt(lowmem_kbytes * 16)` clamped to `[128, 65536]` KB.
pub fn default_min_free_kbytes(lowmem_kbytes: usize) -> usize {
    int_sqrt(lowmem_kbytes.saturating_mul(16)).clamp(128, 65536)
}

fn int_sqrt(x: usize) -> usize {
    if x < 2 {
        return x;
    }
    let mut r = x;
    let mut y = x / 2 + (x & 1);
    while y < r {
        r = y;
        y = (r + x / r) / 2;
    }
    r
}

/// Zoned page allocator
pub struct PageAllocator {
    zones: Vec<Zone>,
    reclaim: Option<&'static dyn ReclaimPolicy>,
}

impl PageAllocator {
    pub const fn new() -> Self {
        Self {
            zones: Vec::new(),
            reclaim: None,
        }
    }

    pub fn set_reclaim_policy(&mut self, policy: &'static dyn ReclaimPolicy) {
        self.reclaim = Some(policy);
    }

    /// Register a zone; zones are indexed in the order they are added,
    /// lowest first. Returns the new zone's index.
    pub fn add_zone(&mut self, config: ZoneConfig) -> AllocResult<usize> {
        if self.zones.len() >= MAX_ZONES {
            return Err(AllocError::InvalidParam);
        }
        let end = config
            .start_pfn
            .checked_add(config.spanned_pages)
            .ok_or(AllocError::InvalidParam)?;
        if self
            .zones
            .iter()
            .any(|z| config.start_pfn < z.end_pfn() && z.start_pfn() < end)
        {
            warn!(
                "zone {} [{:#x}, {:#x}) overlaps an existing zone",
                config.name, config.start_pfn, end
            );
            return Err(AllocError::MemoryOverlap);
        }
        let mut zone = Zone::new(config)?;
        let idx = self.zones.len();
        zone.set_index(idx);
        self.zones.push(zone);
        Ok(idx)
    }

    #[inline]
    pub fn nr_zones(&self) -> usize {
        self.zones.len()
    }

    #[inline]
    pub fn zone(&self, idx: usize) -> Option<&Zone> {
        self.zones.get(idx)
    }

    #[inline]
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Index of the zone spanning `pfn`.
    pub fn zone_of(&self, pfn: usize) -> Option<usize> {
        self.zones.iter().position(|z| z.contains(pfn))
    }

    /// Release boot memory `[pfn, pfn + nr_pages)`, which may cross zones.
    pub fn free_bootmem(&self, pfn: usize, nr_pages: usize) -> AllocResult {
        let end = pfn.checked_add(nr_pages).ok_or(AllocError::InvalidParam)?;
        let mut covered = 0;
        for zone in &self.zones {
            let start = pfn.max(zone.start_pfn());
            let stop = end.min(zone.end_pfn());
            if start < stop {
                zone.free_bootmem(start, stop - start)?;
                covered += stop - start;
            }
        }
        if covered != nr_pages {
            warn!(
                "bootmem [{:#x}, {:#x}): {} pages outside every zone",
                pfn,
                end,
                nr_pages - covered
            );
            return Err(AllocError::InvalidParam);
        }
        Ok(())
    }

    /// Zones from `highest` down to zone 0: the usual preference order.
    pub fn default_zonelist(&self, highest: usize) -> Vec<usize> {
        let top = highest.min(self.zones.len().saturating_sub(1));
        if self.zones.is_empty() {
            return Vec::new();
        }
        (0..=top).rev().collect()
    }

    /// Managed pages of all non-highmem zones, in KB.
    pub fn lowmem_kbytes(&self) -> usize {
        self.zones
            .iter()
            .filter(|z| !z.is_highmem())
            .map(|z| z.managed_pages() * (PAGE_SIZE / 1024))
            .sum()
    }

    /// Split `min_free_pages` across zones in proportion to their size and
    /// derive every zone's watermarks and migrate reserve.
    ///
    /// Highmem zones get a small fixed min mark instead of their share.
    pub fn setup_watermarks(&self, min_free_pages: usize) {
        let lowmem_pages: usize = self
            .zones
            .iter()
            .filter(|z| !z.is_highmem())
            .map(|z| z.managed_pages())
            .sum();

        for zone in &self.zones {
            let managed = zone.managed_pages();
            let tmp = if lowmem_pages == 0 {
                0
            } else {
                min_free_pages * managed / lowmem_pages
            };
            let min = if zone.is_highmem() {
                (managed / 1024).clamp(32, 128)
            } else {
                tmp
            };
            let wm = Watermarks::from_min(min, tmp);
            zone.set_watermarks(wm);
            zone.setup_migrate_reserve();
            info!(
                "zone {}: watermarks min {} low {} high {}",
                zone.name(),
                wm.min,
                wm.low,
                wm.high
            );
        }
    }

    /// Keep part of each lower zone back from requests that prefer a higher
    /// zone: zone `i` reserves `(managed pages of zones i+1..=j) / ratios[i]`
    /// against classzone `j`.
    pub fn setup_lowmem_reserve(&self, ratios: &[usize]) {
        for (j, zone) in self.zones.iter().enumerate() {
            let mut managed = zone.managed_pages();
            zone.set_lowmem_reserve(j, 0);
            let mut idx = j;
            while idx > 0 {
                idx -= 1;
                let ratio = ratios.get(idx).copied().unwrap_or(32).max(1);
                let lower = &self.zones[idx];
                lower.set_lowmem_reserve(j, managed / ratio);
                managed += lower.managed_pages();
            }
        }
    }

    fn get_page_from_freelist(
        &self,
        cpu: usize,
        order: usize,
        mt: MigrateType,
        zonelist: &[usize],
        alloc_flags: AllocFlags,
        cold: bool,
    ) -> Option<PageBlock> {
        let classzone_idx = *zonelist.first()?;
        for &idx in zonelist {
            let zone = &self.zones[idx];
            if !alloc_flags.contains(AllocFlags::NO_WATERMARKS) {
                let mark = zone.watermarks().get(alloc_flags);
                if !zone.meets_watermark(order, mark, classzone_idx, alloc_flags) {
                    continue;
                }
            }
            if let Some(pfn) = zone.buffered_rmqueue(cpu, order, mt, cold) {
                return Some(PageBlock::new(pfn, order, idx));
            }
        }
        None
    }

    /// Allocate `2^order` contiguous pages.
    ///
    /// `zonelist` lists zone indices in preference order; the first one is
    /// the preferred zone whose lowmem reserve applies. An empty list means
    /// every zone, highest first. Without a `migratetype` hint the type is
    /// taken from `gfp`.
    pub fn alloc_pages(
        &self,
        cpu: usize,
        order: usize,
        migratetype: Option<MigrateType>,
        zonelist: &[usize],
        gfp: GfpFlags,
    ) -> AllocResult<PageBlock> {
        if order >= MAX_ORDER {
            return Err(AllocError::InvalidParam);
        }
        let default_list;
        let zonelist = if zonelist.is_empty() {
            default_list = self.default_zonelist(usize::MAX);
            &default_list[..]
        } else {
            zonelist
        };
        if zonelist.is_empty() || zonelist.iter().any(|&i| i >= self.zones.len()) {
            return Err(AllocError::InvalidParam);
        }
        if zonelist.iter().any(|&i| cpu >= self.zones[i].nr_cpus()) {
            return Err(AllocError::InvalidParam);
        }
        let mt = migratetype.unwrap_or_else(|| gfp.migratetype());
        let cold = gfp.contains(GfpFlags::COLD);

        if let Some(block) =
            self.get_page_from_freelist(cpu, order, mt, zonelist, AllocFlags::WMARK_LOW, cold)
        {
            return Ok(block);
        }
        self.alloc_pages_slowpath(cpu, order, mt, zonelist, gfp, cold)
    }

    fn alloc_pages_slowpath(
        &self,
        cpu: usize,
        order: usize,
        mt: MigrateType,
        zonelist: &[usize],
        gfp: GfpFlags,
        cold: bool,
    ) -> AllocResult<PageBlock> {
        let policy: &dyn ReclaimPolicy = self.reclaim.unwrap_or(&NoReclaim);
        policy.wake_background_reclaim(order, zonelist);

        let alloc_flags = gfp.alloc_flags();
        debug!(
            "slow path: order {} {:?} gfp {:?} alloc_flags {:?}",
            order, mt, gfp, alloc_flags
        );

        let mut retries = 0;
        loop {
            if let Some(block) =
                self.get_page_from_freelist(cpu, order, mt, zonelist, alloc_flags, cold)
            {
                return Ok(block);
            }
            if !gfp.contains(GfpFlags::WAIT) {
                break;
            }

            let reclaimed = policy.direct_reclaim(order, gfp);
            debug!("direct reclaim freed {} pages (round {})", reclaimed, retries);
            if reclaimed == 0 {
                // Cached pages may be all that is left
                self.drain_all_pages();
                if let Some(block) =
                    self.get_page_from_freelist(cpu, order, mt, zonelist, alloc_flags, cold)
                {
                    return Ok(block);
                }
                if gfp.contains(GfpFlags::NORETRY) || order > PAGE_ALLOC_COSTLY_ORDER {
                    break;
                }
                if !policy.out_of_memory(order, gfp) && !gfp.contains(GfpFlags::NOFAIL) {
                    break;
                }
            } else if gfp.contains(GfpFlags::NORETRY)
                || (order > PAGE_ALLOC_COSTLY_ORDER && !gfp.contains(GfpFlags::NOFAIL))
            {
                // One last attempt after the reclaim round
                if let Some(block) =
                    self.get_page_from_freelist(cpu, order, mt, zonelist, alloc_flags, cold)
                {
                    return Ok(block);
                }
                break;
            }

            retries += 1;
            if retries >= MAX_RECLAIM_RETRIES {
                break;
            }
        }

        if !gfp.contains(GfpFlags::NOWARN) {
            warn!(
                "page allocation failure: order {} {:?} gfp {:?}",
                order, mt, gfp
            );
            self.print_alloc_failure_stats(order, gfp);
        }
        Err(AllocError::NoMemory)
    }

    #[cfg(feature = "tracking")]
    fn print_alloc_failure_stats(&self, order: usize, gfp: GfpFlags) {
        let names: Vec<&str> = self.zones.iter().map(|z| z.name()).collect();
        let stats = self.zone_stats();
        crate::buddy::MemoryStatsReporter::print_alloc_failure_stats(
            &names,
            &stats,
            order,
            gfp.bits(),
        );
    }

    #[cfg(not(feature = "tracking"))]
    fn print_alloc_failure_stats(&self, _order: usize, _gfp: GfpFlags) {}

    fn owning_zone(&self, block: &PageBlock) -> AllocResult<&Zone> {
        match self.zones.get(block.zone) {
            Some(zone) if zone.contains(block.pfn) => Ok(zone),
            _ => self
                .zone_of(block.pfn)
                .map(|idx| &self.zones[idx])
                .ok_or_else(|| {
                    warn!("freeing pfn {:#x} outside every zone", block.pfn);
                    AllocError::NotAllocated
                }),
        }
    }

    /// Free a block obtained from [`PageAllocator::alloc_pages`].
    pub fn free_pages(&self, cpu: usize, block: PageBlock) -> AllocResult {
        self.owning_zone(&block)?
            .free_pages_cpu(cpu, block.pfn, block.order, false)
    }

    /// Like [`PageAllocator::free_pages`], but order-0 pages are queued as
    /// cache-cold.
    pub fn free_pages_cold(&self, cpu: usize, block: PageBlock) -> AllocResult {
        self.owning_zone(&block)?
            .free_pages_cpu(cpu, block.pfn, block.order, true)
    }

    /// Return every per-CPU cached page of every zone to the buddy lists.
    pub fn drain_all_pages(&self) {
        for zone in &self.zones {
            zone.drain_all_pages();
        }
    }

    pub fn zone_stats(&self) -> Vec<ZoneStats> {
        self.zones.iter().map(|z| z.stats()).collect()
    }

    /// Totals across every zone.
    pub fn stats(&self) -> ZoneStats {
        let mut total = ZoneStats::default();
        for zone in &self.zones {
            total.add(&zone.stats());
        }
        total
    }

    pub fn free_pages_total(&self) -> usize {
        self.zones.iter().map(|z| z.free_pages()).sum()
    }

    pub fn print_zone_info(&self) {
        for zone in &self.zones {
            zone.print_info();
        }
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for PageAllocator {
    fn alloc_page(&self, cpu: usize, gfp: GfpFlags) -> AllocResult<usize> {
        self.alloc_pages(cpu, 0, None, &[], gfp).map(|block| block.pfn)
    }

    fn free_page(&self, cpu: usize, pfn: usize) {
        let Some(zone) = self.zone_of(pfn) else {
            warn!("freeing pfn {:#x} outside every zone", pfn);
            return;
        };
        if let Err(err) = self.free_pages(cpu, PageBlock::new(pfn, 0, zone)) {
            warn!("failed to free pfn {:#x}: {}", pfn, err);
        }
    }
}
