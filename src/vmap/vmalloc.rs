//! Mapping surface: vm areas, `vmap`, `vmalloc` and `ioremap`
//!
//! Every vm area is a region of the arena plus a [`VmStruct`] descriptor,
//! followed by an unmapped guard page unless `NO_GUARD` is requested.

use alloc::vec::Vec;
use core::panic::Location;

#[cfg(feature = "log")]
use log::warn;

use super::{
    area::{VmFlags, VmStruct},
    arena::VmapArena,
    page_table::{PageProt, PageTable},
};
use crate::{
    align_down, checked_align_up, pages_for, AllocError, AllocResult, GfpFlags, PageSource,
    PAGE_SHIFT, PAGE_SIZE,
};

/// Largest alignment given to ioremap areas, as a shift.
const IOREMAP_MAX_ORDER: usize = 7 + PAGE_SHIFT;

impl<P: PageTable> VmapArena<P> {
    fn reserve_vm_area(
        &self,
        size: usize,
        flags: VmFlags,
        caller: &'static Location<'static>,
    ) -> AllocResult<usize> {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }
        let size = checked_align_up(size, PAGE_SIZE).ok_or(AllocError::InvalidParam)?;
        let align = if flags.contains(VmFlags::IOREMAP) {
            let shift = (usize::BITS - size.leading_zeros()) as usize;
            1 << shift.clamp(PAGE_SHIFT, IOREMAP_MAX_ORDER)
        } else {
            PAGE_SIZE
        };
        let size = if flags.contains(VmFlags::NO_GUARD) {
            size
        } else {
            size.checked_add(PAGE_SIZE).ok_or(AllocError::InvalidParam)?
        };

        let addr = self.alloc_region(size, align, self.start(), self.end())?;
        self.set_vm(
            addr,
            VmStruct {
                addr,
                size,
                flags,
                pages: Vec::new(),
                caller,
            },
        );
        Ok(addr)
    }

    /// Reserve a vm area of at least `size` bytes anywhere in the arena.
    #[track_caller]
    pub fn get_vm_area(&self, size: usize, flags: VmFlags) -> AllocResult<usize> {
        self.reserve_vm_area(size, flags, Location::caller())
    }

    /// Unmap and release the vm area at `addr`, returning its descriptor.
    pub fn remove_vm_area(&self, addr: usize) -> AllocResult<VmStruct> {
        self.release(addr, true)?.ok_or(AllocError::NotAllocated)
    }

    fn map_pages(&self, addr: usize, pages: &[usize], prot: PageProt) -> AllocResult {
        for (i, &pfn) in pages.iter().enumerate() {
            let vaddr = addr + i * PAGE_SIZE;
            if let Err(err) = self.page_table().install_mapping(vaddr, pfn, prot) {
                warn!("failed to map pfn {:#x} at {:#x}: {}", pfn, vaddr, err);
                return Err(AllocError::MapFailed);
            }
        }
        Ok(())
    }

    /// Give back an area whose setup failed part way.
    fn abandon(&self, addr: usize) {
        if let Err(err) = self.release(addr, true) {
            warn!("vmap: cannot release half-built area {:#x}: {}", addr, err);
        }
    }

    fn record_pages(&self, addr: usize, pages: Vec<usize>) {
        self.with_vm_mut(addr, |vm| vm.pages = pages);
    }

    /// Map `pages` into a fresh virtually contiguous area.
    ///
    /// The pages stay owned by the caller; [`VmapArena::vunmap`] only tears
    /// the mapping down.
    #[track_caller]
    pub fn vmap(&self, pages: &[usize], flags: VmFlags, prot: PageProt) -> AllocResult<usize> {
        if pages.is_empty() {
            return Err(AllocError::InvalidParam);
        }
        let size = pages
            .len()
            .checked_mul(PAGE_SIZE)
            .ok_or(AllocError::InvalidParam)?;
        let addr = self.reserve_vm_area(size, flags | VmFlags::MAP, Location::caller())?;
        if let Err(err) = self.map_pages(addr, pages, prot) {
            self.abandon(addr);
            return Err(err);
        }
        self.record_pages(addr, pages.to_vec());
        Ok(addr)
    }

    /// Tear down a mapping created by [`VmapArena::vmap`].
    pub fn vunmap(&self, addr: usize) -> AllocResult {
        self.remove_vm_area(addr).map(|_| ())
    }

    /// Allocate `size` bytes of virtually contiguous memory backed by
    /// order-0 pages from `source`.
    #[track_caller]
    pub fn vmalloc<S: PageSource + ?Sized>(
        &self,
        size: usize,
        source: &S,
        cpu: usize,
        gfp: GfpFlags,
        prot: PageProt,
    ) -> AllocResult<usize> {
        let addr = self.reserve_vm_area(size, VmFlags::ALLOC, Location::caller())?;
        let nr_pages = pages_for(size);

        let mut pages = Vec::with_capacity(nr_pages);
        for _ in 0..nr_pages {
            match source.alloc_page(cpu, gfp) {
                Ok(pfn) => pages.push(pfn),
                Err(err) => {
                    if !gfp.contains(GfpFlags::NOWARN) {
                        warn!(
                            "vmalloc: allocation failure, allocated {} of {} bytes",
                            pages.len() * PAGE_SIZE,
                            size
                        );
                    }
                    self.discard(addr, &pages, source, cpu);
                    return Err(err);
                }
            }
        }
        if let Err(err) = self.map_pages(addr, &pages, prot) {
            self.discard(addr, &pages, source, cpu);
            return Err(err);
        }
        self.record_pages(addr, pages);
        Ok(addr)
    }

    fn discard<S: PageSource + ?Sized>(&self, addr: usize, pages: &[usize], source: &S, cpu: usize) {
        self.abandon(addr);
        for &pfn in pages {
            source.free_page(cpu, pfn);
        }
    }

    /// Release memory obtained from [`VmapArena::vmalloc`]. The backing
    /// pages go back to `source` once the mapping is gone.
    pub fn vfree<S: PageSource + ?Sized>(&self, addr: usize, source: &S, cpu: usize) -> AllocResult {
        let vm = self.remove_vm_area(addr)?;
        if vm.flags.contains(VmFlags::ALLOC) {
            for pfn in vm.pages {
                source.free_page(cpu, pfn);
            }
        }
        Ok(())
    }

    /// Frame mapped at `addr` inside a vm area.
    pub fn vmalloc_to_pfn(&self, addr: usize) -> Option<usize> {
        self.with_vm_containing(addr, |vm| {
            vm.pages.get((addr - vm.addr) >> PAGE_SHIFT).copied()
        })
        .flatten()
    }

    /// Map the device range `[phys_addr, phys_addr + size)` uncached and
    /// return the virtual address corresponding to `phys_addr`.
    #[track_caller]
    pub fn ioremap(&self, phys_addr: usize, size: usize) -> AllocResult<usize> {
        let last = phys_addr
            .checked_add(size)
            .filter(|_| size != 0)
            .ok_or(AllocError::InvalidParam)?;
        let offset = phys_addr & (PAGE_SIZE - 1);
        let base = align_down(phys_addr, PAGE_SIZE);
        let end = checked_align_up(last, PAGE_SIZE).ok_or(AllocError::InvalidParam)?;
        let pages: Vec<usize> = (base >> PAGE_SHIFT..end >> PAGE_SHIFT).collect();

        let addr = self.reserve_vm_area(end - base, VmFlags::IOREMAP, Location::caller())?;
        if let Err(err) = self.map_pages(addr, &pages, PageProt::KERNEL | PageProt::NOCACHE) {
            self.abandon(addr);
            return Err(err);
        }
        self.record_pages(addr, pages);
        Ok(addr + offset)
    }

    /// Undo [`VmapArena::ioremap`].
    pub fn iounmap(&self, addr: usize) -> AllocResult {
        self.vunmap(align_down(addr, PAGE_SIZE))
    }
}
