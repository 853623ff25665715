//! Arena descriptor (C2).
//!
//! One contiguous region plus the four bitmaps that track it. An `Arena` is immutable after
//! publication except for its bitmaps, `search_idx` and `purge_expire` — the same fields the
//! allocator and purge engine mutate through atomics, never through `&mut`.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering::*};

use crate::bitmap::{AtomicBitmap, BitmapIndex, BITS_PER_FIELD};
use crate::constants::BLOCK_SIZE;
use crate::memid::ArenaId;

/// Whether an arena's backing region was reserved by this crate (and would be released on
/// drop, which in practice never happens — arenas live for the rest of the process) or
/// supplied by the caller (`manage_os_memory`, never released by us).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Region {
    Owned,
    Borrowed,
}

pub struct Arena {
    /// `0` until published into the registry; thereafter `slot + 1`.
    id: AtomicU8,
    pub(crate) exclusive: bool,
    pub(crate) start: NonNull<u8>,
    pub(crate) block_count: usize,
    pub(crate) field_count: usize,
    pub(crate) numa_node: i32,
    pub(crate) is_large: bool,
    pub(crate) allow_decommit: bool,
    pub(crate) is_zero_init: bool,
    pub(crate) region: Region,
    pub(crate) region_size: usize,
    pub(crate) region_alignment: usize,
    pub(crate) search_idx: AtomicUsize,
    pub(crate) purge_expire: AtomicI64,
    pub(crate) blocks_inuse: AtomicBitmap,
    pub(crate) blocks_dirty: AtomicBitmap,
    pub(crate) blocks_committed: Option<AtomicBitmap>,
    pub(crate) blocks_purge: Option<AtomicBitmap>,
}

// The region is a raw pointer into OS-reserved memory, not thread-local; every mutable access
// goes through an atomic bitmap or atomic scalar.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

pub(crate) struct NewArena {
    pub(crate) start: NonNull<u8>,
    pub(crate) size: usize,
    pub(crate) region_alignment: usize,
    pub(crate) is_committed: bool,
    pub(crate) is_large: bool,
    pub(crate) is_zero_init: bool,
    pub(crate) numa_node: i32,
    pub(crate) exclusive: bool,
    pub(crate) region: Region,
}

impl Arena {
    pub(crate) fn new(params: NewArena) -> Arena {
        let NewArena {
            start,
            size,
            region_alignment,
            mut is_committed,
            is_large,
            is_zero_init,
            numa_node,
            exclusive,
            region,
        } = params;

        // I4: large pages are always committed and never decommittable.
        if is_large {
            is_committed = true;
        }
        // Decommit is permitted for any non-large arena regardless of its initial commit
        // state — a region that starts fully committed can still have blocks purged back to
        // uncommitted later (I4, I5). Only huge/large-page regions are pinned for life.
        let allow_decommit = !is_large;

        let block_count = size / BLOCK_SIZE;
        let field_count = (block_count + BITS_PER_FIELD - 1) / BITS_PER_FIELD;

        let blocks_inuse = AtomicBitmap::new(field_count);
        let blocks_dirty = AtomicBitmap::new(field_count);
        let blocks_committed = if allow_decommit {
            Some(if is_committed {
                AtomicBitmap::new_all_set(field_count)
            } else {
                AtomicBitmap::new(field_count)
            })
        } else {
            None
        };
        let blocks_purge = if allow_decommit { Some(AtomicBitmap::new(field_count)) } else { None };

        // I3: permanently claim the trailing bits beyond block_count so they're never handed out.
        let total_bits = field_count * BITS_PER_FIELD;
        let post = total_bits - block_count;
        if post > 0 {
            let post_idx = BitmapIndex::new(field_count - 1, BITS_PER_FIELD - post);
            blocks_inuse.claim_across(post, post_idx);
        }

        Arena {
            id: AtomicU8::new(0),
            exclusive,
            start,
            block_count,
            field_count,
            numa_node,
            is_large,
            allow_decommit,
            is_zero_init,
            region,
            region_size: size,
            region_alignment,
            search_idx: AtomicUsize::new(0),
            purge_expire: AtomicI64::new(0),
            blocks_inuse,
            blocks_dirty,
            blocks_committed,
            blocks_purge,
        }
    }

    pub(crate) fn set_id(&self, id: ArenaId) {
        self.id.store(id.as_raw(), Relaxed);
    }

    pub fn id(&self) -> Option<ArenaId> {
        match self.id.load(Relaxed) {
            0 => None,
            raw => Some(ArenaId::from_slot(raw as usize - 1)),
        }
    }

    /// Byte address of block `idx`, i.e. `start + idx * BLOCK_SIZE`.
    pub(crate) fn addr(&self, idx: BitmapIndex) -> NonNull<u8> {
        let flat = idx.to_flat();
        debug_assert!(flat < self.block_count);
        unsafe { NonNull::new_unchecked(self.start.as_ptr().add(flat * BLOCK_SIZE)) }
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn region(&self) -> (NonNull<u8>, usize) {
        (self.start, self.region_size)
    }

    /// Arena-suitability check against an optional requested arena id (§4.4 bullet 1):
    /// exclusive arenas refuse any request that doesn't name them, and a request naming a
    /// *specific* arena is refused by every other arena too, exclusive or not.
    pub(crate) fn suitable_for(&self, req_arena_id: Option<ArenaId>) -> bool {
        match req_arena_id {
            Some(req) => self.id() == Some(req),
            None => !self.exclusive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BitmapIndex;
    use std::alloc::{alloc, Layout};

    fn make_region(blocks: usize) -> NonNull<u8> {
        let size = blocks * BLOCK_SIZE;
        let layout = Layout::from_size_align(size.max(1), BLOCK_SIZE).unwrap();
        NonNull::new(unsafe { alloc(layout) }).unwrap()
    }

    #[test]
    fn trailing_bits_are_preclaimed() {
        let start = make_region(3);
        let arena = Arena::new(NewArena {
            start,
            size: 3 * BLOCK_SIZE,
            region_alignment: BLOCK_SIZE,
            is_committed: true,
            is_large: false,
            is_zero_init: true,
            numa_node: -1,
            exclusive: false,
            region: Region::Owned,
        });

        assert_eq!(arena.block_count, 3);
        assert_eq!(arena.field_count, 1);
        // Bits [3, 64) must be pre-claimed.
        assert!(arena.blocks_inuse.is_claimed_across(BITS_PER_FIELD - 3, BitmapIndex::new(0, 3)));
        // Bits [0, 3) must still be free.
        assert!(!arena.blocks_inuse.is_claimed_across(3, BitmapIndex::new(0, 0)));
    }

    #[test]
    fn large_arena_forbids_decommit() {
        let start = make_region(1);
        let arena = Arena::new(NewArena {
            start,
            size: BLOCK_SIZE,
            region_alignment: BLOCK_SIZE,
            is_committed: false, // forced to true internally because is_large
            is_large: true,
            is_zero_init: true,
            numa_node: -1,
            exclusive: false,
            region: Region::Owned,
        });

        assert!(!arena.allow_decommit);
        assert!(arena.blocks_committed.is_none());
        assert!(arena.blocks_purge.is_none());
    }

    #[test]
    fn uncommitted_arena_allows_decommit() {
        let start = make_region(1);
        let arena = Arena::new(NewArena {
            start,
            size: BLOCK_SIZE,
            region_alignment: BLOCK_SIZE,
            is_committed: false,
            is_large: false,
            is_zero_init: false,
            numa_node: -1,
            exclusive: false,
            region: Region::Owned,
        });

        assert!(arena.allow_decommit);
        assert!(arena.blocks_committed.is_some());
        assert!(arena.blocks_purge.is_some());
    }

    #[test]
    fn suitability_matches_exclusivity_rules() {
        let start = make_region(1);
        let exclusive_arena = Arena::new(NewArena {
            start,
            size: BLOCK_SIZE,
            region_alignment: BLOCK_SIZE,
            is_committed: true,
            is_large: false,
            is_zero_init: true,
            numa_node: -1,
            exclusive: true,
            region: Region::Owned,
        });
        exclusive_arena.set_id(ArenaId::from_slot(0));
        assert!(!exclusive_arena.suitable_for(None));
        assert!(exclusive_arena.suitable_for(Some(ArenaId::from_slot(0))));
        assert!(!exclusive_arena.suitable_for(Some(ArenaId::from_slot(1))));

        let start2 = make_region(1);
        let shared_arena = Arena::new(NewArena {
            start: start2,
            size: BLOCK_SIZE,
            region_alignment: BLOCK_SIZE,
            is_committed: true,
            is_large: false,
            is_zero_init: true,
            numa_node: -1,
            exclusive: false,
            region: Region::Owned,
        });
        shared_arena.set_id(ArenaId::from_slot(1));
        assert!(shared_arena.suitable_for(None));
        assert!(shared_arena.suitable_for(Some(ArenaId::from_slot(1))));
        // a request naming a *different* specific arena is refused even by a non-exclusive one
        assert!(!shared_arena.suitable_for(Some(ArenaId::from_slot(0))));
    }

    #[test]
    fn addr_is_block_aligned() {
        let start = make_region(4);
        let arena = Arena::new(NewArena {
            start,
            size: 4 * BLOCK_SIZE,
            region_alignment: BLOCK_SIZE,
            is_committed: true,
            is_large: false,
            is_zero_init: true,
            numa_node: -1,
            exclusive: false,
            region: Region::Owned,
        });

        let p0 = arena.addr(BitmapIndex::new(0, 0));
        let p1 = arena.addr(BitmapIndex::new(0, 1));
        assert_eq!(p1.as_ptr() as usize - p0.as_ptr() as usize, BLOCK_SIZE);
    }
}
