//! Watermark admission tests

#![no_std]

extern crate alloc;
extern crate buddy_vmap_allocator;

use alloc::vec::Vec;
use buddy_vmap_allocator::{
    watermark_ok, AllocFlags, MigrateType, Watermarks, Zone, ZoneConfig, MAX_ORDER,
};

#[test]
fn test_monotonic_in_free_pages() {
    let flag_sets = [
        AllocFlags::empty(),
        AllocFlags::HIGH,
        AllocFlags::HARDER,
        AllocFlags::HIGH | AllocFlags::HARDER,
    ];
    let mut nr_free = [0usize; MAX_ORDER];
    nr_free[0] = 40;
    nr_free[1] = 12;
    nr_free[3] = 5;

    for order in 0..5 {
        for mark in [0, 16, 100, 257] {
            for reserve in [0, 32] {
                for flags in flag_sets {
                    let mut admitted = false;
                    for free in 0..2048 {
                        let ok = watermark_ok(free, order, mark, reserve, flags, &nr_free);
                        assert!(
                            ok || !admitted,
                            "order {} mark {} reserve {} {:?}: admitted below {}",
                            order,
                            mark,
                            reserve,
                            flags,
                            free
                        );
                        admitted |= ok;
                    }
                }
            }
        }
    }
}

#[test]
fn test_lowmem_reserve_raises_threshold() {
    let nr_free = [0usize; MAX_ORDER];
    assert!(watermark_ok(150, 0, 100, 0, AllocFlags::empty(), &nr_free));
    assert!(!watermark_ok(150, 0, 100, 50, AllocFlags::empty(), &nr_free));
    assert!(watermark_ok(151, 0, 100, 50, AllocFlags::empty(), &nr_free));
}

#[test]
fn test_fragmented_zone_fails_high_order() {
    // Plenty of free pages, but all of them order-0
    let mut nr_free = [0usize; MAX_ORDER];
    nr_free[0] = 1000;
    assert!(watermark_ok(1000, 0, 64, 0, AllocFlags::empty(), &nr_free));
    assert!(!watermark_ok(1000, 1, 64, 0, AllocFlags::empty(), &nr_free));
}

#[test]
fn test_zone_check_tracks_allocations() {
    let z = Zone::new(ZoneConfig::new("wm", 0, 1024)).unwrap();
    z.free_bootmem(0, 1024).unwrap();
    z.set_watermarks(Watermarks::from_min(1000, 0));
    let low = z.watermarks().get(AllocFlags::WMARK_LOW);
    assert_eq!(low, 1000);

    let mut taken = Vec::new();
    let mut last = true;
    while z.free_pages() > 990 {
        let ok = z.meets_watermark(0, low, 0, AllocFlags::empty());
        assert!(last || !ok, "admission came back after allocating");
        last = ok;
        taken.push(z.rmqueue(0, MigrateType::Movable).unwrap());
    }
    assert!(!z.meets_watermark(0, low, 0, AllocFlags::empty()));
    // A high-priority atomic caller may still dig in
    assert!(z.meets_watermark(0, low, 0, AllocFlags::HIGH | AllocFlags::HARDER));

    for pfn in taken {
        z.free_one_block(pfn, 0, MigrateType::Movable).unwrap();
    }
    assert!(z.meets_watermark(0, low, 0, AllocFlags::empty()));
}
