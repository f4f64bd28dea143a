//! Buddy block metadata
//!
//! Migration types, the fallback policy between them, and the handle
//! returned for an allocated block.

use crate::{MAX_ORDER, PAGE_SHIFT};

/// Order of a pageblock, the granule of migration-type bookkeeping.
pub const PAGEBLOCK_ORDER: usize = MAX_ORDER - 1;

/// Number of pages in a pageblock.
pub const PAGEBLOCK_NR_PAGES: usize = 1 << PAGEBLOCK_ORDER;

/// Number of migration types.
pub const MIGRATE_TYPES: usize = 6;

/// Migration types that own a per-CPU list.
pub const MIGRATE_PCPTYPES: usize = 3;

/// Maximum number of zones a page allocator manages.
pub const MAX_ZONES: usize = 8;

/// Intended mobility class of the pages in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MigrateType {
    Unmovable = 0,
    Reclaimable = 1,
    Movable = 2,
    /// Emergency headroom, only used once every other type is exhausted.
    Reserve = 3,
    /// Contiguous memory area: movable pages only, never retagged by a steal.
    Cma = 4,
    /// Pages withheld from allocation while a range is being isolated.
    Isolate = 5,
}

impl MigrateType {
    pub const ALL: [MigrateType; MIGRATE_TYPES] = [
        MigrateType::Unmovable,
        MigrateType::Reclaimable,
        MigrateType::Movable,
        MigrateType::Reserve,
        MigrateType::Cma,
        MigrateType::Isolate,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn from_index(idx: u8) -> Self {
        match idx {
            0 => MigrateType::Unmovable,
            1 => MigrateType::Reclaimable,
            2 => MigrateType::Movable,
            3 => MigrateType::Reserve,
            4 => MigrateType::Cma,
            _ => MigrateType::Isolate,
        }
    }

    /// Types other than this one to try, in order, when its own lists are empty.
    ///
    /// `Reserve` terminates every list; it is handled separately by the caller.
    pub const fn fallbacks(self) -> &'static [MigrateType] {
        match self {
            MigrateType::Unmovable => &[
                MigrateType::Reclaimable,
                MigrateType::Movable,
                MigrateType::Reserve,
            ],
            MigrateType::Reclaimable => &[
                MigrateType::Unmovable,
                MigrateType::Movable,
                MigrateType::Reserve,
            ],
            MigrateType::Movable => &[
                MigrateType::Cma,
                MigrateType::Reclaimable,
                MigrateType::Unmovable,
                MigrateType::Reserve,
            ],
            MigrateType::Reserve | MigrateType::Cma | MigrateType::Isolate => &[MigrateType::Reserve],
        }
    }

    /// Whether this type owns a per-CPU list.
    #[inline]
    pub const fn is_pcp_type(self) -> bool {
        (self as usize) < MIGRATE_PCPTYPES
    }
}

/// A block handed out by the allocator: `2^order` pages starting at `pfn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBlock {
    pub pfn: usize,
    pub order: usize,
    /// Index of the owning zone in the [`crate::PageAllocator`].
    pub zone: usize,
}

impl PageBlock {
    pub const fn new(pfn: usize, order: usize, zone: usize) -> Self {
        Self { pfn, order, zone }
    }

    /// Physical address of the first page.
    pub const fn phys_addr(&self) -> usize {
        self.pfn << PAGE_SHIFT
    }

    pub const fn nr_pages(&self) -> usize {
        1 << self.order
    }
}

/// The unique same-size block that, combined with the block at `pfn`,
/// forms the next larger aligned block.
#[inline]
pub const fn buddy_pfn(pfn: usize, order: usize) -> usize {
    pfn ^ (1 << order)
}

/// A free block as seen by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlockInfo {
    pub pfn: usize,
    pub order: usize,
    pub migratetype: MigrateType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buddy_pfn_flips_order_bit() {
        assert_eq!(buddy_pfn(0x20000, 0), 0x20001);
        assert_eq!(buddy_pfn(0x20001, 0), 0x20000);
        assert_eq!(buddy_pfn(0x20000, 5), 0x20020);
        assert_eq!(buddy_pfn(0x20020, 5), 0x20000);
    }

    #[test]
    fn test_fallbacks_end_in_reserve() {
        for mt in MigrateType::ALL {
            let fb = mt.fallbacks();
            assert_eq!(*fb.last().unwrap(), MigrateType::Reserve);
            assert!(!fb[..fb.len() - 1].contains(&mt));
        }
    }

    #[test]
    fn test_isolate_never_in_fallbacks() {
        for mt in MigrateType::ALL {
            assert!(!mt.fallbacks().contains(&MigrateType::Isolate));
        }
    }
}
