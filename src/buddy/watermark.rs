//! Watermark admission control
//!
//! Decides whether a zone may satisfy a request of a given order without
//! eating into the headroom reserved for privileged or lower-zone callers.

use bitflags::bitflags;

/// Free-page thresholds of a zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermarks {
    pub min: usize,
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    /// Derive the three marks from a zone's minimum and its share `tmp` of
    /// the global minimum.
    pub const fn from_min(min: usize, tmp: usize) -> Self {
        Self {
            min,
            low: min + (tmp >> 2),
            high: min + (tmp >> 1),
        }
    }

    /// The mark selected by the watermark bits of `flags`.
    pub fn get(&self, flags: AllocFlags) -> usize {
        if flags.contains(AllocFlags::WMARK_HIGH) {
            self.high
        } else if flags.contains(AllocFlags::WMARK_LOW) {
            self.low
        } else {
            self.min
        }
    }
}

bitflags! {
    /// Internal allocation flags derived from a request.
    ///
    /// With neither `WMARK_LOW` nor `WMARK_HIGH` set the min watermark applies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        const WMARK_LOW = 1 << 0;
        const WMARK_HIGH = 1 << 1;
        /// Skip the watermark check entirely.
        const NO_WATERMARKS = 1 << 2;
        /// Atomic context: may dig a further quarter below the mark.
        const HARDER = 1 << 4;
        /// High-priority caller: may dig half below the mark.
        const HIGH = 1 << 5;
    }
}

/// Core watermark test.
///
/// `free_pages` is the zone's free-page counter, `nr_free[o]` the number of
/// free blocks at order `o`. The request is admitted only if, after taking
/// out the pages it needs, the zone stays above `mark` (lowered for
/// privileged callers) plus `lowmem_reserve`, and every lower order that
/// would have to be split keeps a proportionally halved reserve.
pub fn watermark_ok(
    free_pages: usize,
    order: usize,
    mark: usize,
    lowmem_reserve: usize,
    alloc_flags: AllocFlags,
    nr_free: &[usize],
) -> bool {
    let mut free = free_pages as isize - ((1isize << order) - 1);
    let mut min = mark as isize;

    if alloc_flags.contains(AllocFlags::HIGH) {
        min -= min / 2;
    }
    if alloc_flags.contains(AllocFlags::HARDER) {
        min -= min / 4;
    }

    if free <= min + lowmem_reserve as isize {
        return false;
    }
    for o in 0..order {
        // At the next order, this order's pages become unavailable
        free -= (nr_free.get(o).copied().unwrap_or(0) << o) as isize;

        // Require fewer higher order pages to be free
        min >>= 1;

        if free <= min {
            return false;
        }
    }
    true
}
