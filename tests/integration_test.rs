//! Integration tests for the allocator crate
//!
//! Drives the zoned page allocator and the virtual region allocator
//! together, focusing on cross-module scenarios.

#![no_std]

extern crate alloc;
extern crate buddy_vmap_allocator;
extern crate std;

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use buddy_vmap_allocator::{
    default_min_free_kbytes, AllocError, GfpFlags, MigrateType, PageAllocator, PageBlock,
    PageProt, ReclaimPolicy, SoftPageTable, VmapArena, VmapConfig, ZoneConfig,
    DEFAULT_LOWMEM_RESERVE_RATIO, PAGE_SIZE,
};

const DMA_PAGES: usize = 4096;
const NORMAL_PAGES: usize = 16384;

/// DMA zone at pfn 0 and a Normal zone right above it, both fully released.
fn two_zones(cpus: usize) -> PageAllocator {
    let mut pa = PageAllocator::new();
    pa.add_zone(ZoneConfig::new("DMA", 0, DMA_PAGES).with_cpus(cpus))
        .unwrap();
    pa.add_zone(ZoneConfig::new("Normal", DMA_PAGES, NORMAL_PAGES).with_cpus(cpus))
        .unwrap();
    pa.free_bootmem(0, DMA_PAGES + NORMAL_PAGES).unwrap();
    pa
}

#[test]
fn test_bootmem_spanning_zones() {
    let pa = two_zones(1);
    assert_eq!(pa.zone(0).unwrap().managed_pages(), DMA_PAGES);
    assert_eq!(pa.zone(1).unwrap().managed_pages(), NORMAL_PAGES);
    assert_eq!(pa.free_pages_total(), DMA_PAGES + NORMAL_PAGES);
    assert_eq!(
        pa.free_bootmem(DMA_PAGES + NORMAL_PAGES, 1),
        Err(AllocError::InvalidParam)
    );
}

#[test]
fn test_prefers_first_zone_of_list() {
    let pa = two_zones(1);
    let block = pa
        .alloc_pages(0, 4, None, &[], GfpFlags::KERNEL)
        .unwrap();
    assert_eq!(block.zone, 1);
    assert!(block.pfn >= DMA_PAGES);

    let dma = pa.alloc_pages(0, 4, None, &[0], GfpFlags::KERNEL).unwrap();
    assert_eq!(dma.zone, 0);
    assert!(dma.pfn < DMA_PAGES);

    pa.free_pages(0, block).unwrap();
    pa.free_pages(0, dma).unwrap();
    assert_eq!(pa.free_pages_total(), DMA_PAGES + NORMAL_PAGES);
}

#[test]
fn test_falls_back_to_lower_zone_when_exhausted() {
    let pa = two_zones(1);
    let mut blocks = Vec::new();
    // Drain Normal completely through the zonelist [Normal]
    while let Ok(b) = pa.alloc_pages(0, 10, None, &[1], GfpFlags::KERNEL | GfpFlags::NOWARN) {
        blocks.push(b);
    }
    assert_eq!(blocks.len(), NORMAL_PAGES / 1024);
    assert_eq!(pa.zone(1).unwrap().free_pages(), 0);

    let b = pa.alloc_pages(0, 10, None, &[1, 0], GfpFlags::KERNEL).unwrap();
    assert_eq!(b.zone, 0);
    blocks.push(b);

    for b in blocks {
        pa.free_pages(0, b).unwrap();
    }
    assert_eq!(pa.free_pages_total(), DMA_PAGES + NORMAL_PAGES);
}

#[test]
fn test_lowmem_reserve_protects_dma() {
    let pa = two_zones(1);
    pa.setup_watermarks(512);
    pa.setup_lowmem_reserve(&DEFAULT_LOWMEM_RESERVE_RATIO);
    // DMA keeps NORMAL_PAGES / 256 pages back from Normal-preferring requests
    assert_eq!(pa.zone(0).unwrap().lowmem_reserve(1), NORMAL_PAGES / 256);

    let dma = pa.zone(0).unwrap();
    let wm = dma.watermarks();
    // Leave DMA at min + reserve: enough for itself, nothing for Normal-first
    while dma.free_pages() > wm.min + NORMAL_PAGES / 256 {
        dma.rmqueue(0, MigrateType::Unmovable).unwrap();
    }
    let normal = pa.zone(1).unwrap();
    while normal.rmqueue(0, MigrateType::Unmovable).is_some() {}

    // Normal-first request: DMA's reserve applies on the slow path too
    assert_eq!(
        pa.alloc_pages(0, 0, None, &[1, 0], GfpFlags::KERNEL | GfpFlags::NOWARN)
            .map(|b| b.zone),
        Err(AllocError::NoMemory)
    );
    // DMA-first request: no reserve against itself
    assert_eq!(
        pa.alloc_pages(0, 0, None, &[0], GfpFlags::KERNEL).map(|b| b.zone),
        Ok(0)
    );
}

#[test]
fn test_watermarks_scale_with_zone_size() {
    let pa = two_zones(1);
    let min_free = default_min_free_kbytes(pa.lowmem_kbytes()) / (PAGE_SIZE / 1024);
    pa.setup_watermarks(min_free);
    let dma = pa.zone(0).unwrap().watermarks();
    let normal = pa.zone(1).unwrap().watermarks();
    assert!(dma.min < normal.min);
    assert!(normal.min < normal.low && normal.low < normal.high);
    assert!(dma.min + normal.min + 1 >= min_free);
}

#[test]
fn test_invalid_block_free_rejected() {
    let pa = two_zones(1);
    assert_eq!(
        pa.free_pages(0, PageBlock::new(DMA_PAGES + NORMAL_PAGES + 5, 0, 1)),
        Err(AllocError::NotAllocated)
    );
}

#[test]
fn test_bad_cpu_rejected_without_side_effects() {
    let pa = two_zones(1);
    for order in [0, 3] {
        assert_eq!(
            pa.alloc_pages(7, order, None, &[], GfpFlags::KERNEL | GfpFlags::NOWARN),
            Err(AllocError::InvalidParam)
        );
    }
    assert_eq!(pa.free_pages_total(), DMA_PAGES + NORMAL_PAGES);
    assert_eq!(pa.stats().alloc_fail, 0);
    assert!(pa.alloc_pages(0, 0, None, &[], GfpFlags::KERNEL).is_ok());
}

struct CountingReclaim {
    wakeups: AtomicUsize,
    direct: AtomicUsize,
    ooms: AtomicUsize,
}

impl ReclaimPolicy for CountingReclaim {
    fn wake_background_reclaim(&self, _order: usize, _zonelist: &[usize]) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    fn direct_reclaim(&self, _order: usize, _gfp: GfpFlags) -> usize {
        self.direct.fetch_add(1, Ordering::Relaxed);
        0
    }

    fn out_of_memory(&self, _order: usize, _gfp: GfpFlags) -> bool {
        self.ooms.fetch_add(1, Ordering::Relaxed);
        false
    }
}

static RECLAIM: CountingReclaim = CountingReclaim {
    wakeups: AtomicUsize::new(0),
    direct: AtomicUsize::new(0),
    ooms: AtomicUsize::new(0),
};

#[test]
fn test_slow_path_consults_reclaim_policy() {
    let mut pa = PageAllocator::new();
    pa.set_reclaim_policy(&RECLAIM);
    pa.add_zone(ZoneConfig::new("Normal", 0, 1024)).unwrap();
    pa.free_bootmem(0, 1024).unwrap();
    let all = pa.alloc_pages(0, 10, None, &[], GfpFlags::KERNEL).unwrap();

    assert_eq!(
        pa.alloc_pages(0, 0, None, &[], GfpFlags::KERNEL | GfpFlags::NOWARN),
        Err(AllocError::NoMemory)
    );
    assert_eq!(RECLAIM.wakeups.load(Ordering::Relaxed), 1);
    assert_eq!(RECLAIM.direct.load(Ordering::Relaxed), 1);
    assert_eq!(RECLAIM.ooms.load(Ordering::Relaxed), 1);

    // Atomic requests never enter reclaim
    assert!(pa
        .alloc_pages(0, 0, None, &[], GfpFlags::ATOMIC | GfpFlags::NOWARN)
        .is_err());
    assert_eq!(RECLAIM.direct.load(Ordering::Relaxed), 1);
    assert_eq!(RECLAIM.wakeups.load(Ordering::Relaxed), 2);

    pa.free_pages(0, all).unwrap();
    assert!(pa.alloc_pages(0, 0, None, &[], GfpFlags::KERNEL).is_ok());
}

#[test]
fn test_vmalloc_backed_by_zones() {
    let pa = two_zones(2);
    let arena = VmapArena::new(
        VmapConfig::new(0xffff_8000_0000_0000, 0xffff_8000_1000_0000).with_cpus(2),
        SoftPageTable::new(),
    )
    .unwrap();

    let addrs: Vec<usize> = (1..=8)
        .map(|n| {
            arena
                .vmalloc(n * PAGE_SIZE, &pa, n % 2, GfpFlags::KERNEL, PageProt::KERNEL)
                .unwrap()
        })
        .collect();
    assert_eq!(arena.stats().nr_vm_areas, 8);
    assert_eq!(arena.page_table().nr_mappings(), (1..=8).sum::<usize>());

    for (i, addr) in addrs.into_iter().enumerate() {
        arena.vfree(addr, &pa, i % 2).unwrap();
    }
    assert_eq!(arena.page_table().nr_mappings(), 0);
    pa.drain_all_pages();
    assert_eq!(pa.free_pages_total(), DMA_PAGES + NORMAL_PAGES);
}

#[test]
fn test_concurrent_alloc_free() {
    const CPUS: usize = 4;
    let pa = Arc::new(two_zones(CPUS));
    let arena = Arc::new(
        VmapArena::new(
            VmapConfig::new(0xf000_0000, 0xf800_0000)
                .with_cpus(CPUS)
                .with_lazy_max_pages(256),
            SoftPageTable::new(),
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..CPUS)
        .map(|cpu| {
            let pa = Arc::clone(&pa);
            let arena = Arc::clone(&arena);
            std::thread::spawn(move || {
                for round in 0..200 {
                    let order = (cpu + round) % 4;
                    let block = pa
                        .alloc_pages(cpu, order, None, &[], GfpFlags::KERNEL)
                        .unwrap();
                    let addr = arena
                        .vmalloc(3 * PAGE_SIZE, &*pa, cpu, GfpFlags::KERNEL, PageProt::KERNEL)
                        .unwrap();
                    pa.free_pages(cpu, block).unwrap();
                    arena.vfree(addr, &*pa, cpu).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    arena.purge_lazy();
    assert!(arena.regions().is_empty());
    assert_eq!(arena.page_table().nr_mappings(), 0);
    pa.drain_all_pages();
    assert_eq!(pa.free_pages_total(), DMA_PAGES + NORMAL_PAGES);
    assert_eq!(pa.stats().used_pages(), 0);
}
