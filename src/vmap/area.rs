//! Virtual area nodes and mapping descriptors

use alloc::vec::Vec;
use core::panic::Location;

use bitflags::bitflags;

use crate::{PAGE_SHIFT, PAGE_SIZE};

bitflags! {
    /// Lifecycle state of a [`VmapArea`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VmapAreaFlags: u32 {
        /// Released by its owner; page-table entries are being cleared.
        const UNMAPPING = 1 << 0;
        /// Unmapped, waiting for the next purge.
        const LAZY_FREE = 1 << 1;
        /// Picked up by a purge in progress.
        const LAZY_FREEING = 1 << 2;
        /// Carries a [`VmStruct`].
        const VM_AREA = 1 << 3;
    }
}

bitflags! {
    /// Kind of a mapped virtual area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        /// Device memory mapping.
        const IOREMAP = 1 << 0;
        /// Backed by pages allocated by `vmalloc` and freed by `vfree`.
        const ALLOC = 1 << 1;
        /// Caller-provided pages mapped by `vmap`.
        const MAP = 1 << 2;
        /// No trailing guard page.
        const NO_GUARD = 1 << 6;
    }
}

/// Descriptor of a mapped virtual area.
#[derive(Debug, Clone)]
pub struct VmStruct {
    pub addr: usize,
    /// Size in bytes, guard page included.
    pub size: usize,
    pub flags: VmFlags,
    /// Frames mapped at `addr`, in order.
    pub pages: Vec<usize>,
    /// Where the area was requested from.
    pub caller: &'static Location<'static>,
}

impl VmStruct {
    /// Usable size in bytes, without the guard page.
    pub fn area_size(&self) -> usize {
        if self.flags.contains(VmFlags::NO_GUARD) {
            self.size
        } else {
            self.size - PAGE_SIZE
        }
    }

    pub fn nr_pages(&self) -> usize {
        self.area_size() >> PAGE_SHIFT
    }
}

/// One reserved virtual range `[va_start, va_end)`.
#[derive(Debug)]
pub struct VmapArea {
    pub va_start: usize,
    pub va_end: usize,
    pub flags: VmapAreaFlags,
    pub vm: Option<VmStruct>,
}

impl VmapArea {
    pub(crate) fn new(va_start: usize, va_end: usize) -> Self {
        Self {
            va_start,
            va_end,
            flags: VmapAreaFlags::empty(),
            vm: None,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.va_end - self.va_start
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.va_start && addr < self.va_end
    }

    /// Whether the owner has released this range.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.flags.intersects(
            VmapAreaFlags::UNMAPPING | VmapAreaFlags::LAZY_FREE | VmapAreaFlags::LAZY_FREEING,
        )
    }
}
