//! Statistics and debugging for the buddy allocator
//!
//! Lock-free zone counters, point-in-time snapshots and failure reporting.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::watermark::Watermarks;
use crate::MAX_ORDER;

/// Counters updated under the zone lock and read without it.
pub struct ZoneCounters {
    /// Free pages available to allocation (isolated pages excluded).
    free_pages: AtomicUsize,
    /// Free blocks per order, across every migration type.
    nr_free: [AtomicUsize; MAX_ORDER],
    pub(crate) alloc_success: AtomicUsize,
    pub(crate) alloc_fail: AtomicUsize,
    pub(crate) fallback_steals: AtomicUsize,
    pub(crate) pcp_refills: AtomicUsize,
    pub(crate) pcp_drains: AtomicUsize,
}

impl ZoneCounters {
    pub const fn new() -> Self {
        Self {
            free_pages: AtomicUsize::new(0),
            nr_free: [const { AtomicUsize::new(0) }; MAX_ORDER],
            alloc_success: AtomicUsize::new(0),
            alloc_fail: AtomicUsize::new(0),
            fallback_steals: AtomicUsize::new(0),
            pcp_refills: AtomicUsize::new(0),
            pcp_drains: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn add_free_pages(&self, nr: usize) {
        self.free_pages.fetch_add(nr, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn sub_free_pages(&self, nr: usize) {
        self.free_pages.fetch_sub(nr, Ordering::Relaxed);
    }

    #[inline]
    pub fn nr_free(&self, order: usize) -> usize {
        self.nr_free[order].load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn inc_nr_free(&self, order: usize) {
        self.nr_free[order].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn dec_nr_free(&self, order: usize) {
        self.nr_free[order].fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ZoneCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a zone's state
#[derive(Debug, Clone, Copy, Default)]
pub struct ZoneStats {
    pub spanned_pages: usize,
    pub managed_pages: usize,
    pub free_pages: usize,
    pub free_blocks_by_order: [usize; MAX_ORDER],
    pub pcp_pages: usize,
    pub watermarks: Watermarks,
    pub alloc_success: usize,
    pub alloc_fail: usize,
    pub fallback_steals: usize,
    pub pcp_refills: usize,
    pub pcp_drains: usize,
}

impl ZoneStats {
    /// Add statistics from another zone
    pub fn add(&mut self, other: &ZoneStats) {
        self.spanned_pages += other.spanned_pages;
        self.managed_pages += other.managed_pages;
        self.free_pages += other.free_pages;
        self.pcp_pages += other.pcp_pages;
        for (i, &count) in other.free_blocks_by_order.iter().enumerate() {
            self.free_blocks_by_order[i] += count;
        }
        self.alloc_success += other.alloc_success;
        self.alloc_fail += other.alloc_fail;
        self.fallback_steals += other.fallback_steals;
        self.pcp_refills += other.pcp_refills;
        self.pcp_drains += other.pcp_drains;
    }

    /// Pages held by callers: neither free in buddy lists nor cached per CPU.
    pub fn used_pages(&self) -> usize {
        self.managed_pages
            .saturating_sub(self.free_pages)
            .saturating_sub(self.pcp_pages)
    }
}

/// Detailed memory statistics reporter
pub struct MemoryStatsReporter;

impl MemoryStatsReporter {
    /// Print detailed allocation failure statistics
    /// This is a standalone function to keep allocation logic clean
    #[allow(unused_variables)]
    pub fn print_alloc_failure_stats(
        names: &[&str],
        zone_stats: &[ZoneStats],
        request_order: usize,
        gfp_bits: u32,
    ) {
        #[cfg(feature = "log")]
        use log::error;
        let mut total = ZoneStats::default();
        for stats in zone_stats {
            total.add(stats);
        }

        error!("========================================");
        error!(
            "Request: order {} ({} KB), gfp {:#x}",
            request_order,
            ((1usize << request_order) * crate::PAGE_SIZE) / 1024,
            gfp_bits
        );
        error!("Overall Memory State:");
        error!("  Total zones: {}", zone_stats.len());
        error!("  Managed pages: {}", total.managed_pages);
        error!("  Free pages: {}", total.free_pages);
        error!("  Per-CPU cached pages: {}", total.pcp_pages);
        error!("  Used pages: {}", total.used_pages());
        error!("========================================");

        for (i, stats) in zone_stats.iter().enumerate() {
            error!("Zone {} ({}):", i, names.get(i).copied().unwrap_or("?"));
            error!(
                "  Free pages: {} / {} (min {} low {} high {})",
                stats.free_pages,
                stats.managed_pages,
                stats.watermarks.min,
                stats.watermarks.low,
                stats.watermarks.high
            );
            error!("  Free blocks by order:");
            for order in (0..MAX_ORDER).rev() {
                let count = stats.free_blocks_by_order[order];
                if count > 0 {
                    error!(
                        "    Order {}: {} blocks ({} KB each)",
                        order,
                        count,
                        ((1usize << order) * crate::PAGE_SIZE) / 1024
                    );
                }
            }
            error!("----------------------------------------");
        }
        error!("========================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_pages_excludes_pcp() {
        let stats = ZoneStats {
            managed_pages: 100,
            free_pages: 60,
            pcp_pages: 10,
            ..Default::default()
        };
        assert_eq!(stats.used_pages(), 30);
    }

    #[test]
    fn test_add() {
        let mut a = ZoneStats {
            managed_pages: 10,
            free_pages: 4,
            ..Default::default()
        };
        a.free_blocks_by_order[2] = 1;
        let mut b = a;
        b.free_blocks_by_order[0] = 3;
        a.add(&b);
        assert_eq!(a.managed_pages, 20);
        assert_eq!(a.free_pages, 8);
        assert_eq!(a.free_blocks_by_order[2], 2);
        assert_eq!(a.free_blocks_by_order[0], 3);
    }
}
