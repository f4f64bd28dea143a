//! Page-table programming interface
//!
//! The virtual region allocator never encodes MMU entries itself; it drives
//! a [`PageTable`] implementation supplied by the platform.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use kspin::SpinNoIrq;

use crate::{is_aligned, AllocError, AllocResult, PAGE_SIZE};

bitflags! {
    /// Protection of a kernel mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Uncached device memory.
        const NOCACHE = 1 << 3;
        const GLOBAL = 1 << 4;

        const KERNEL = Self::READ.bits() | Self::WRITE.bits() | Self::GLOBAL.bits();
        const KERNEL_EXEC = Self::KERNEL.bits() | Self::EXECUTE.bits();
    }
}

/// A present page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    pub pfn: usize,
    pub prot: PageProt,
}

/// MMU operations consumed by [`crate::VmapArena`].
pub trait PageTable: Send + Sync {
    /// Map the page at `vaddr` to frame `pfn`. Fails if `vaddr` is already
    /// mapped.
    fn install_mapping(&self, vaddr: usize, pfn: usize, prot: PageProt) -> AllocResult;

    /// Remove the mapping at `vaddr`, returning the previous entry if one
    /// was present. Does not flush the TLB.
    fn clear_mapping(&self, vaddr: usize) -> Option<PageTableEntry>;

    /// Invalidate cached translations for `[start, end)`.
    fn flush_tlb(&self, start: usize, end: usize);
}

/// In-memory page table for hosted use.
///
/// Translations live in an ordered map; TLB flushes are only counted.
pub struct SoftPageTable {
    entries: SpinNoIrq<BTreeMap<usize, PageTableEntry>>,
    flushes: AtomicUsize,
    last_flush: SpinNoIrq<Option<(usize, usize)>>,
}

impl SoftPageTable {
    pub const fn new() -> Self {
        Self {
            entries: SpinNoIrq::new(BTreeMap::new()),
            flushes: AtomicUsize::new(0),
            last_flush: SpinNoIrq::new(None),
        }
    }

    /// Entry of the page containing `vaddr`.
    pub fn translate(&self, vaddr: usize) -> Option<PageTableEntry> {
        self.entries.lock().get(&(vaddr & !(PAGE_SIZE - 1))).copied()
    }

    pub fn is_mapped(&self, vaddr: usize) -> bool {
        self.translate(vaddr).is_some()
    }

    /// Number of present entries.
    pub fn nr_mappings(&self) -> usize {
        self.entries.lock().len()
    }

    /// Number of TLB flushes issued so far.
    pub fn tlb_flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Range of the most recent TLB flush.
    pub fn last_flush(&self) -> Option<(usize, usize)> {
        *self.last_flush.lock()
    }
}

impl Default for SoftPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable for SoftPageTable {
    fn install_mapping(&self, vaddr: usize, pfn: usize, prot: PageProt) -> AllocResult {
        if !is_aligned(vaddr, PAGE_SIZE) {
            return Err(AllocError::InvalidParam);
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(&vaddr) {
            return Err(AllocError::MapFailed);
        }
        entries.insert(vaddr, PageTableEntry { pfn, prot });
        Ok(())
    }

    fn clear_mapping(&self, vaddr: usize) -> Option<PageTableEntry> {
        self.entries.lock().remove(&vaddr)
    }

    fn flush_tlb(&self, start: usize, end: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        *self.last_flush.lock() = Some((start, end));
    }
}
