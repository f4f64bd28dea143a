//! Per-CPU order-0 page cache
//!
//! Each CPU keeps a small stock of single pages per migration type so the
//! common allocation and free paths never touch the zone lock. The stock is
//! refilled from the buddy lists `batch` pages at a time and drained back in
//! batches once it grows past `high`.

use alloc::{collections::VecDeque, vec::Vec};

use super::{
    buddy_block::{MigrateType, MIGRATE_PCPTYPES},
    zone::Zone,
};
use crate::PAGE_SIZE;

/// A cached page and the migration type it returns to when drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcpPage {
    pub pfn: usize,
    pub migratetype: MigrateType,
}

/// Per-CPU page lists for one zone.
///
/// Hot pages sit at the front of each list, cold ones at the back.
pub struct PerCpuPages {
    lists: [VecDeque<PcpPage>; MIGRATE_PCPTYPES],
    /// Pages across all lists.
    count: usize,
    /// Drain once `count` reaches this.
    high: usize,
    /// Refill and drain chunk size.
    batch: usize,
}

impl PerCpuPages {
    pub fn new(batch: usize) -> Self {
        let batch = batch.max(1);
        Self {
            lists: [const { VecDeque::new() }; MIGRATE_PCPTYPES],
            count: 0,
            high: 6 * batch,
            batch,
        }
    }

    /// Resize the cache; `high` follows at six batches.
    pub fn set_batch(&mut self, batch: usize) {
        self.batch = batch.max(1);
        self.high = 6 * self.batch;
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn high(&self) -> usize {
        self.high
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Pages cached on the list for `mt`.
    pub fn list_len(&self, mt: MigrateType) -> usize {
        if mt.is_pcp_type() {
            self.lists[mt.index()].len()
        } else {
            0
        }
    }

    /// Pop a page of type `mt`, refilling the list from `zone` if it is empty.
    ///
    /// Hot requests take the most recently freed page, cold ones the oldest.
    /// The page is returned in the `PerCpu` state; the caller claims it.
    pub fn allocate_one(&mut self, zone: &Zone, mt: MigrateType, cold: bool) -> Option<usize> {
        if !mt.is_pcp_type() {
            return None;
        }
        let list = &mut self.lists[mt.index()];
        if list.is_empty() {
            let added = zone.rmqueue_bulk(self.batch, mt, |page| list.push_back(page));
            self.count += added;
            if added == 0 {
                return None;
            }
        }
        let page = if cold { list.pop_back() } else { list.pop_front() }?;
        self.count -= 1;
        Some(page.pfn)
    }

    /// Queue a page whose state the caller already moved to `PerCpu`.
    ///
    /// Pages of non-cached types (`Reserve`, `Cma`) go on the movable list
    /// but keep their own type for the trip back to the buddy lists.
    pub fn free_one(&mut self, zone: &Zone, pfn: usize, mt: MigrateType, cold: bool) {
        let idx = if mt.is_pcp_type() {
            mt.index()
        } else {
            MigrateType::Movable.index()
        };
        let page = PcpPage { pfn, migratetype: mt };
        if cold {
            self.lists[idx].push_back(page);
        } else {
            self.lists[idx].push_front(page);
        }
        self.count += 1;
        if self.count >= self.high {
            let pages = self.take_batch(self.batch);
            zone.free_pcppages_bulk(&pages);
        }
    }

    /// Return every cached page to `zone`.
    pub fn drain(&mut self, zone: &Zone) {
        if self.count == 0 {
            return;
        }
        let pages = self.take_batch(self.count);
        zone.free_pcppages_bulk(&pages);
    }

    /// Detach up to `to_free` pages, visiting the lists round-robin and
    /// taking from each list's cold end.
    ///
    /// Lists found empty on the way make the next non-empty list give up
    /// proportionally more pages.
    fn take_batch(&mut self, to_free: usize) -> Vec<PcpPage> {
        let mut to_free = to_free.min(self.count);
        let mut pages = Vec::with_capacity(to_free);
        let mut mt = 0;
        let mut batch_free = 0;

        while to_free > 0 {
            loop {
                batch_free += 1;
                mt = (mt + 1) % MIGRATE_PCPTYPES;
                if !self.lists[mt].is_empty() {
                    break;
                }
            }

            // Only one list left: empty it in one go
            if batch_free == MIGRATE_PCPTYPES {
                batch_free = to_free;
            }

            let list = &mut self.lists[mt];
            while let Some(page) = list.pop_back() {
                pages.push(page);
                self.count -= 1;
                to_free -= 1;
                batch_free -= 1;
                if to_free == 0 || batch_free == 0 {
                    break;
                }
            }
        }
        pages
    }
}

/// Per-CPU batch size for a zone with `managed_pages` pages.
///
/// Roughly a quarter of a thousandth of the zone, capped at 128KB worth of
/// pages and rounded to `2^n - 1` so batches of neighbouring CPUs don't
/// all alias the same cache colours.
pub fn zone_batchsize(managed_pages: usize) -> usize {
    let mut batch = managed_pages / 1024;
    if batch * PAGE_SIZE > 512 * 1024 {
        batch = (512 * 1024) / PAGE_SIZE;
    }
    batch /= 4;
    if batch < 1 {
        batch = 1;
    }
    let batch = batch + batch / 2;
    let rounded = 1usize << (usize::BITS - 1 - batch.leading_zeros());
    (rounded - 1).max(1)
}
