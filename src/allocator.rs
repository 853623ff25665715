//! Allocator (C4) — the public entry point of the arena subsystem.
//!
//! Owns the [`Registry`], the [`ArenaOptions`], and the [`OsMemory`] collaborator. Every
//! arena-aware `alloc`/`free` call funnels through here; no other module reaches into a live
//! arena's bitmaps directly.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering::*};
use std::sync::Arc;

use log::{error, trace, warn};

use crate::arena::{Arena, NewArena, Region};
use crate::constants::{ARENA_MIN_OBJ_SIZE, BLOCK_SIZE, N_MAX, SEGMENT_ALIGN};
use crate::config::ArenaOptions;
use crate::error::ArenaError;
use crate::memid::{ArenaId, Memid};
use crate::os::OsMemory;
use crate::purge;
use crate::registry::Registry;

/// A request to [`Allocator::alloc`]. `numa_node = -1` means "use the calling thread's own
/// node", matching the original's convention for "no preference".
#[derive(Copy, Clone, Debug)]
pub struct AllocRequest {
    pub size: usize,
    pub alignment: usize,
    pub align_offset: usize,
    /// Whether the caller wants the returned range committed.
    pub commit: bool,
    /// Whether the caller will accept (or is requesting) large/huge-page backing.
    pub large: bool,
    /// Restrict the search to this arena only; `None` means "any arena will do".
    pub req_arena_id: Option<ArenaId>,
    pub numa_node: i32,
}

impl AllocRequest {
    /// Convenience constructor matching `alloc_default` (§6): segment-aligned (the
    /// strongest alignment this subsystem ever guarantees, per §1's Non-goals — see
    /// `DESIGN.md` for why this resolves to `SEGMENT_ALIGN` rather than the larger
    /// `BLOCK_SIZE` the distilled spec's public-surface listing names), no offset,
    /// committed, no large-page preference, any NUMA node.
    pub fn default_for(size: usize, req_arena_id: Option<ArenaId>) -> Self {
        AllocRequest {
            size,
            alignment: SEGMENT_ALIGN,
            align_offset: 0,
            commit: true,
            large: false,
            req_arena_id,
            numa_node: -1,
        }
    }
}

/// The outcome of a successful [`Allocator::alloc`].
#[derive(Copy, Clone, Debug)]
pub struct AllocResult {
    pub ptr: NonNull<u8>,
    pub memid: Memid,
    pub commit: bool,
    pub large: bool,
    pub is_zero: bool,
    pub is_pinned: bool,
}

pub struct Allocator {
    registry: Registry,
    options: ArenaOptions,
    os: Arc<dyn OsMemory>,
    /// True until the first successful arena claim. Purge scheduling behaves differently
    /// during early process startup (§4.5): purges that would otherwise be deferred happen
    /// immediately, since there's no steady-state churn yet to amortise against.
    early_init: AtomicBool,
    /// Single-thread-at-a-time guard for [`Self::try_purge`]; contention yields immediately
    /// rather than blocking (§4.5 "Process sweep").
    purge_lock: AtomicBool,
}

impl Allocator {
    pub fn new(options: ArenaOptions, os: Arc<dyn OsMemory>) -> Self {
        Allocator {
            registry: Registry::new(N_MAX),
            options,
            os,
            early_init: AtomicBool::new(true),
            purge_lock: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ArenaOptions {
        &self.options
    }

    // ---- allocation ----------------------------------------------------------------

    pub fn alloc(&self, req: AllocRequest) -> Option<AllocResult> {
        assert!(req.size > 0, "alloc size must be > 0");
        assert!(req.alignment <= SEGMENT_ALIGN, "alignment must not exceed SEGMENT_ALIGN");

        let takes_arena_path =
            req.size >= ARENA_MIN_OBJ_SIZE && req.alignment <= SEGMENT_ALIGN && req.align_offset == 0;

        if !takes_arena_path {
            return self.alloc_os_direct(&req);
        }

        if let Some(result) = self.alloc_via_arenas(&req) {
            return Some(result);
        }

        // No arena could satisfy the request. Fall through to the OS only if the caller
        // didn't name a specific arena and hasn't capped us to arena-only allocation.
        if req.req_arena_id.is_none() && !self.options.limit_os_alloc {
            return self.alloc_os_direct(&req);
        }
        None
    }

    pub fn alloc_default(&self, size: usize, req_arena_id: Option<ArenaId>) -> Option<AllocResult> {
        self.alloc(AllocRequest::default_for(size, req_arena_id))
    }

    fn alloc_os_direct(&self, req: &AllocRequest) -> Option<AllocResult> {
        let mut large = req.large;
        let ptr = if req.align_offset > 0 {
            self.os.alloc_aligned_offset(req.size, req.alignment, req.align_offset, req.commit, &mut large)?
        } else {
            self.os.alloc_aligned(req.size, req.alignment, req.commit, &mut large)?
        };
        trace!("OS-direct alloc of {} bytes at {:p}", req.size, ptr.as_ptr());
        Some(AllocResult {
            ptr,
            memid: Memid::OS,
            commit: req.commit,
            large,
            is_zero: req.commit,
            is_pinned: false,
        })
    }

    fn alloc_via_arenas(&self, req: &AllocRequest) -> Option<AllocResult> {
        let bcount = ceil_div(req.size, BLOCK_SIZE);
        let caller_node = if req.numa_node >= 0 { req.numa_node } else { self.os.numa_node() };

        // Step 1: a specific arena was named. Try only it; no further scanning applies once
        // req_arena_id is set, since every other arena refuses such a request (§4.4 bullet 1).
        if let Some(id) = req.req_arena_id {
            if let Some(arena) = self.registry.get(id) {
                let numa_ok = arena.numa_node == -1 || arena.numa_node == caller_node;
                let large_ok = req.large || !arena.is_large;
                if numa_ok && large_ok {
                    if let Some(result) = self.alloc_from(arena, bcount, req) {
                        return Some(result);
                    }
                }
            }
            return None;
        }

        // Step 2: NUMA-local scan, registry order (lower id preferred within a pass).
        for arena in self.registry.iter() {
            if arena.numa_node >= 0 && arena.numa_node != caller_node {
                continue;
            }
            if arena.is_large && !req.large {
                continue;
            }
            if arena.exclusive {
                continue;
            }
            if let Some(result) = self.alloc_from(arena, bcount, req) {
                return Some(result);
            }
        }

        // Step 3: NUMA-remote scan — only arenas explicitly pinned to a different node.
        for arena in self.registry.iter() {
            if !(arena.numa_node >= 0 && arena.numa_node != caller_node) {
                continue;
            }
            if arena.is_large && !req.large {
                continue;
            }
            if arena.exclusive {
                continue;
            }
            if let Some(result) = self.alloc_from(arena, bcount, req) {
                return Some(result);
            }
        }

        // Step 4: eager reserve — acquire a fresh arena and retry against it.
        if self.options.arena_reserve > 0 && self.registry.published_count() < 3 * N_MAX / 4 {
            let reserve_size = self.options.arena_reserve.max(req.size).next_multiple_of(BLOCK_SIZE);
            if let Ok(id) = self.reserve_os_memory(reserve_size, req.commit, req.large, false) {
                if let Some(arena) = self.registry.get(id) {
                    if let Some(result) = self.alloc_from(arena, bcount, req) {
                        return Some(result);
                    }
                }
            }
        }

        None
    }

    /// Per-arena claim (§4.4 "alloc_from").
    fn alloc_from(&self, arena: &'static Arena, bcount: usize, req: &AllocRequest) -> Option<AllocResult> {
        if !arena.suitable_for(req.req_arena_id) {
            return None;
        }

        let hint = arena.search_idx.load(Acquire);
        let idx = arena.blocks_inuse.try_find_from(hint, bcount)?;
        arena.search_idx.store(idx.field, Release);

        let addr = arena.addr(idx);

        // These blocks may have been scheduled for purge by an earlier free; they're being
        // reused now, so the purge hint is stale. Harmless if it races with a sweep: the
        // sweep re-claims `inuse` before touching pages (§5 "Races resolved by design").
        if let Some(purge_bm) = &arena.blocks_purge {
            purge_bm.unclaim_across(bcount, idx);
        }

        let never_written = arena.blocks_dirty.claim_across_if_all_clear(bcount, idx);
        let mut is_zero = never_written && arena.is_zero_init;

        let commit = match &arena.blocks_committed {
            None => true,
            Some(committed_bm) if req.commit => {
                let any_was_uncommitted = committed_bm.claim_across(bcount, idx);
                if any_was_uncommitted {
                    let (ok, zeroed) = self.os.commit(addr, bcount * BLOCK_SIZE);
                    if !ok {
                        error!("OS commit of {} bytes at {:p} failed", bcount * BLOCK_SIZE, addr.as_ptr());
                    }
                    if zeroed {
                        is_zero = true;
                    }
                }
                true
            }
            Some(committed_bm) => committed_bm.is_claimed_across(bcount, idx),
        };

        let is_pinned = arena.is_large || !arena.allow_decommit;
        self.early_init.store(false, Relaxed);

        let arena_id = arena.id()?;
        let memid = Memid::encode(arena_id, arena.exclusive, idx);
        trace!("claimed {} blocks at {:p} (arena {:?})", bcount, addr.as_ptr(), arena_id);

        Some(AllocResult { ptr: addr, memid, commit, large: arena.is_large, is_zero, is_pinned })
    }

    // ---- release ---------------------------------------------------------------------

    pub fn free(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        alignment: usize,
        align_offset: usize,
        memid: Memid,
        all_committed: bool,
    ) {
        if memid.is_os() {
            self.os.free_aligned(ptr, size, alignment, align_offset, all_committed);
            return;
        }

        let (arena_id, _exclusive, idx) = match memid.decode() {
            Some(parts) => parts,
            None => {
                error!("free with bogus memid: arena id bits are zero but memid is not Memid::OS");
                return;
            }
        };
        let arena = match self.registry.get(arena_id) {
            Some(a) => a,
            None => {
                error!("free with bogus memid: arena {:?} is not published", arena_id);
                return;
            }
        };
        if idx.field >= arena.field_count {
            error!("free with bogus memid: bitmap field {} out of range", idx.field);
            return;
        }

        let bcount = ceil_div(size, BLOCK_SIZE);

        if arena.allow_decommit && arena.blocks_committed.is_some() {
            let early_init = self.early_init.load(Relaxed);
            purge::schedule_purge(arena, self.os.as_ref(), &self.options, early_init, idx, bcount);
        }

        if !arena.blocks_inuse.unclaim_across(bcount, idx) {
            warn!("double-free detected: arena {:?}, field {} bit {}", arena_id, idx.field, idx.bit);
        }
    }

    // ---- introspection / arena management ---------------------------------------------

    pub fn arena_area(&self, id: ArenaId) -> Option<(NonNull<u8>, usize)> {
        self.registry.get(id).map(|arena| arena.region())
    }

    pub fn arena_count(&self) -> usize {
        self.registry.published_count()
    }

    /// Publishes an externally-supplied (borrowed, never freed by this crate) region.
    pub fn manage_os_memory(
        &self,
        start: NonNull<u8>,
        size: usize,
        is_committed: bool,
        is_large: bool,
        is_zero: bool,
        numa_node: i32,
        exclusive: bool,
    ) -> Result<ArenaId, ArenaError> {
        if size < BLOCK_SIZE {
            return Err(ArenaError::RegionTooSmall { size, min: BLOCK_SIZE });
        }
        let arena = Arena::new(NewArena {
            start,
            size,
            region_alignment: SEGMENT_ALIGN,
            is_committed,
            is_large,
            is_zero_init: is_zero,
            numa_node,
            exclusive,
            region: Region::Borrowed,
        });
        self.registry.add(arena)
    }

    /// Self-acquires a region from the `OsMemory` collaborator and publishes it.
    pub fn reserve_os_memory(
        &self,
        size: usize,
        commit: bool,
        allow_large: bool,
        exclusive: bool,
    ) -> Result<ArenaId, ArenaError> {
        let size = size.max(BLOCK_SIZE).next_multiple_of(BLOCK_SIZE);
        let mut large = allow_large;
        let ptr = self
            .os
            .alloc_aligned(size, BLOCK_SIZE, commit, &mut large)
            .ok_or(ArenaError::OsReservationFailed { requested: size })?;
        let arena = Arena::new(NewArena {
            start: ptr,
            size,
            region_alignment: BLOCK_SIZE,
            is_committed: commit,
            is_large: large,
            is_zero_init: commit,
            numa_node: -1,
            exclusive,
            region: Region::Owned,
        });
        self.registry.add(arena)
    }

    pub fn reserve_huge_os_pages_at(
        &self,
        pages: usize,
        node: i32,
        timeout_ms: u64,
        exclusive: bool,
    ) -> Result<ArenaId, ArenaError> {
        let (ptr, reserved, size) = self
            .os
            .alloc_huge_os_pages(pages, node, timeout_ms)
            .filter(|(_, reserved, _)| *reserved > 0)
            .ok_or(ArenaError::HugePageReservationFailed { requested: pages, reserved: 0 })?;

        if reserved < pages {
            warn!("huge page reservation short: got {} of {} requested pages, retaining partial arena", reserved, pages);
        }

        let arena = Arena::new(NewArena {
            start: ptr,
            size,
            region_alignment: BLOCK_SIZE,
            is_committed: true,
            is_large: true,
            is_zero_init: true,
            numa_node: node,
            exclusive,
            region: Region::Owned,
        });
        self.registry.add(arena)
    }

    /// Spreads `pages` huge pages as evenly as possible across `nodes`, one non-exclusive
    /// arena per node.
    pub fn reserve_huge_os_pages_interleave(&self, pages: usize, nodes: &[i32], timeout_ms: u64) -> Result<(), ArenaError> {
        if pages == 0 || nodes.is_empty() {
            return Ok(());
        }
        let per_node = pages / nodes.len();
        let remainder = pages % nodes.len();
        for (i, &node) in nodes.iter().enumerate() {
            let node_pages = per_node + usize::from(i < remainder);
            if node_pages == 0 {
                continue;
            }
            self.reserve_huge_os_pages_at(node_pages, node, timeout_ms, false)?;
        }
        Ok(())
    }

    // ---- purge -------------------------------------------------------------------------

    /// Process-wide sweep (§4.5 "Process sweep"). Returns false without doing any work if
    /// another sweep is already in progress (contention yields immediately, it never waits).
    pub fn try_purge(&self, force: bool, visit_all: bool) -> bool {
        if self.purge_lock.compare_exchange(false, true, Acquire, Relaxed).is_err() {
            return false;
        }

        let now = self.os.clock_now_ms();
        let early_init = self.early_init.load(Relaxed);
        let mut purged_any = false;
        for arena in self.registry.iter() {
            if purge::try_purge(arena, self.os.as_ref(), &self.options, early_init, now, force) {
                purged_any = true;
                if !visit_all {
                    break;
                }
            }
        }

        self.purge_lock.store(false, Release);
        purged_any
    }
}

fn ceil_div(value: usize, divisor: usize) -> usize {
    (value + divisor - 1) / divisor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::MockOsMemory;

    fn allocator_with(options: ArenaOptions) -> Allocator {
        let _ = env_logger::builder().is_test(true).try_init();
        Allocator::new(options, Arc::new(MockOsMemory::new()))
    }

    fn allocator() -> Allocator {
        allocator_with(ArenaOptions::default())
    }

    #[test]
    fn single_alloc_free_reuses_lowest_free_block() {
        let alloc = allocator();
        alloc.manage_os_memory(fresh_region(2), 2 * BLOCK_SIZE, true, false, true, -1, false).unwrap();

        let first = alloc.alloc_default(BLOCK_SIZE, None).unwrap();
        assert!(!first.memid.is_os());
        assert!(first.is_zero);
        assert!(!first.is_pinned);

        let second = alloc.alloc_default(BLOCK_SIZE, None).unwrap();
        assert_ne!(first.ptr, second.ptr);

        alloc.free(first.ptr, BLOCK_SIZE, BLOCK_SIZE, 0, first.memid, true);

        let third = alloc.alloc_default(BLOCK_SIZE, None).unwrap();
        assert_eq!(third.ptr, first.ptr, "freed block should be reused before a fresh one");
    }

    #[test]
    fn exclusive_arena_is_opt_in_only() {
        let alloc = allocator();
        alloc.manage_os_memory(fresh_region(1), BLOCK_SIZE, true, false, true, -1, false).unwrap();
        let exclusive_id = alloc.manage_os_memory(fresh_region(1), BLOCK_SIZE, true, false, true, -1, true).unwrap();

        // A generic request must never land in the exclusive arena.
        for _ in 0..4 {
            let res = alloc.alloc_default(BLOCK_SIZE, None).unwrap();
            assert!(res.memid.is_suitable(None));
        }

        // A request naming the exclusive arena explicitly must succeed and land there.
        let res = alloc.alloc_default(BLOCK_SIZE, Some(exclusive_id)).unwrap();
        assert!(res.memid.is_suitable(Some(exclusive_id)));
    }

    #[test]
    fn double_free_is_logged_and_a_noop() {
        let alloc = allocator();
        alloc.manage_os_memory(fresh_region(1), BLOCK_SIZE, true, false, true, -1, false).unwrap();
        let a = alloc.alloc_default(BLOCK_SIZE, None).unwrap();
        alloc.free(a.ptr, BLOCK_SIZE, BLOCK_SIZE, 0, a.memid, true);
        // second free of the same memid: must not panic, and the block must still be
        // available for exactly one more allocation.
        alloc.free(a.ptr, BLOCK_SIZE, BLOCK_SIZE, 0, a.memid, true);
        let b = alloc.alloc_default(BLOCK_SIZE, None).unwrap();
        assert_eq!(b.ptr, a.ptr);
    }

    #[test]
    fn numa_local_arena_preferred_over_lower_index_remote() {
        let alloc = allocator();
        let _remote = alloc.manage_os_memory(fresh_region(1), BLOCK_SIZE, true, false, true, 0, false).unwrap();
        let local = alloc.manage_os_memory(fresh_region(1), BLOCK_SIZE, true, false, true, 1, false).unwrap();

        let req = AllocRequest { numa_node: 1, ..AllocRequest::default_for(BLOCK_SIZE, None) };
        let res = alloc.alloc(req).unwrap();
        assert!(res.memid.is_suitable(Some(local)));
    }

    #[test]
    fn eager_reserve_publishes_and_retries() {
        let alloc = allocator_with(ArenaOptions { arena_reserve: BLOCK_SIZE, ..ArenaOptions::default() });
        assert_eq!(alloc.arena_count(), 0);
        let res = alloc.alloc_default(BLOCK_SIZE, None).unwrap();
        assert!(!res.memid.is_os());
        assert_eq!(alloc.arena_count(), 1);
    }

    #[test]
    fn os_fallback_used_when_no_arena_and_no_eager_reserve() {
        let alloc = allocator_with(ArenaOptions { arena_reserve: 0, ..ArenaOptions::default() });
        let res = alloc.alloc_default(BLOCK_SIZE, None).unwrap();
        assert!(res.memid.is_os());
    }

    #[test]
    fn limit_os_alloc_returns_none_instead_of_falling_back() {
        let alloc = allocator_with(ArenaOptions { arena_reserve: 0, limit_os_alloc: true, ..ArenaOptions::default() });
        assert!(alloc.alloc_default(BLOCK_SIZE, None).is_none());
    }

    #[test]
    fn below_min_obj_size_always_goes_os_direct() {
        let alloc = allocator();
        alloc.manage_os_memory(fresh_region(4), 4 * BLOCK_SIZE, true, false, true, -1, false).unwrap();
        let tiny = AllocRequest { size: 16, ..AllocRequest::default_for(16, None) };
        let res = alloc.alloc(tiny).unwrap();
        assert!(res.memid.is_os());
    }

    #[test]
    fn purge_scheduling_then_sweep_decommits() {
        let alloc = allocator_with(ArenaOptions { arena_purge_delay_ms: 5_000, reset_decommits: true, ..ArenaOptions::default() });
        alloc.manage_os_memory(fresh_region(1), BLOCK_SIZE, false, false, false, -1, false).unwrap();
        let a = alloc.alloc_default(BLOCK_SIZE, None).unwrap();
        assert!(a.commit);
        alloc.free(a.ptr, BLOCK_SIZE, BLOCK_SIZE, 0, a.memid, true);

        // before expiry: no-op
        assert!(!alloc.try_purge(false, true));
        // force bypasses the timer
        assert!(alloc.try_purge(true, true));
    }

    fn fresh_region(blocks: usize) -> NonNull<u8> {
        let size = blocks * BLOCK_SIZE;
        let layout = std::alloc::Layout::from_size_align(size, BLOCK_SIZE).unwrap();
        NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap()
    }
}
