//! Buddy page allocator module
//!
//! This module provides a zoned buddy system with:
//! - Free lists split by order and migration type, with pageblock stealing
//! - Watermark admission control and lowmem reserves
//! - Per-CPU order-0 page caches
//! - Per-page state tracking to catch double frees
//! - Detailed statistics and debugging

pub mod buddy_block;
pub mod free_area;
pub mod free_list;
pub mod page_map;
pub mod per_cpu;
pub mod stats;
pub mod watermark;
pub mod zone;

pub use buddy_block::{
    buddy_pfn, FreeBlockInfo, MigrateType, PageBlock, MAX_ZONES, MIGRATE_PCPTYPES, MIGRATE_TYPES,
    PAGEBLOCK_NR_PAGES, PAGEBLOCK_ORDER,
};
pub use page_map::PageState;
pub use per_cpu::{zone_batchsize, PcpPage, PerCpuPages};
pub use stats::{MemoryStatsReporter, ZoneStats};
pub use watermark::{watermark_ok, AllocFlags, Watermarks};
pub use zone::{Zone, ZoneConfig};
