//! Virtual region allocator and the mapping surface built on it.

mod area;
mod arena;
mod page_table;
mod vmalloc;

pub use area::{VmFlags, VmStruct, VmapArea, VmapAreaFlags};
pub use arena::{lazy_max_pages, VmapArena, VmapConfig, VmapStats};
pub use page_table::{PageProt, PageTable, PageTableEntry, SoftPageTable};
