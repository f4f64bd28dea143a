//! Zoned physical page allocator and virtual region allocator
//!
//! This crate implements the two memory-management engines that sit under
//! every other memory consumer of a kernel:
//! - Buddy page allocator with migration-type grouping and watermark gating
//! - Per-CPU order-0 page caches refilled and drained in batches
//! - Multi-zone dispatcher with a fallback/reclaim slow path
//! - Virtual region allocator mapping discontiguous pages into contiguous
//!   virtual ranges, with lazy, batched unmapping

#![no_std]

extern crate alloc;

use core::fmt;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// log2 of the page size
pub const PAGE_SHIFT: usize = 12;

/// Size of a physical page in bytes
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of buddy orders; the largest block is `2^(MAX_ORDER - 1)` pages.
pub const MAX_ORDER: usize = 11;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid order, size or alignment (e.g. `order >= MAX_ORDER`, wrapping range).
    InvalidParam,
    /// A zone added to the allocator overlapped an existing zone.
    MemoryOverlap,
    /// No block of the requested order is available in any eligible zone.
    NoMemory,
    /// No virtual range of the requested size fits in the arena, even after a purge.
    NoAddressSpace,
    /// Deallocate memory the allocator does not own.
    NotAllocated,
    /// The page-table layer refused to install a mapping.
    MapFailed,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::InvalidParam => "invalid allocation parameter",
            AllocError::MemoryOverlap => "memory region overlaps an existing zone",
            AllocError::NoMemory => "out of memory",
            AllocError::NoAddressSpace => "virtual address space exhausted",
            AllocError::NotAllocated => "memory was not allocated",
            AllocError::MapFailed => "failed to install page mapping",
        };
        f.write_str(msg)
    }
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Source of single physical pages, used by the virtual allocator to back
/// `vmalloc` ranges.
pub trait PageSource {
    /// Allocate one order-0 page on behalf of `cpu`, returning its frame number.
    fn alloc_page(&self, cpu: usize, gfp: GfpFlags) -> AllocResult<usize>;

    /// Return an order-0 page previously obtained from [`PageSource::alloc_page`].
    fn free_page(&self, cpu: usize, pfn: usize);
}

#[inline]
const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

/// Round `pos` up to `align`, or `None` if the result would wrap.
#[inline]
const fn checked_align_up(pos: usize, align: usize) -> Option<usize> {
    match pos.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

/// Number of pages needed to hold `size` bytes.
#[inline]
pub const fn pages_for(size: usize) -> usize {
    (size + PAGE_SIZE - 1) >> PAGE_SHIFT
}

pub mod buddy;
pub use buddy::{
    watermark_ok, zone_batchsize, AllocFlags, FreeBlockInfo, MigrateType, PageBlock, PageState,
    PerCpuPages, Watermarks, Zone, ZoneConfig, ZoneStats, PAGEBLOCK_NR_PAGES, PAGEBLOCK_ORDER,
};

pub mod page_allocator;
pub use page_allocator::{
    default_min_free_kbytes, GfpFlags, NoReclaim, PageAllocator, ReclaimPolicy,
    DEFAULT_LOWMEM_RESERVE_RATIO, MAX_ZONES,
};

pub mod vmap;
pub use vmap::{
    lazy_max_pages, PageProt, PageTable, PageTableEntry, SoftPageTable, VmFlags, VmStruct,
    VmapArea, VmapAreaFlags, VmapArena, VmapConfig, VmapStats,
};
