//! Purge engine (C5).
//!
//! Returns idle physical memory to the OS without losing the virtual reservation. Everything
//! here operates on one [`Arena`] at a time; [`crate::Allocator::try_purge`] drives the
//! process-wide sweep with a single-thread-at-a-time try-lock.

use std::sync::atomic::Ordering::*;

use log::trace;

use crate::arena::Arena;
use crate::bitmap::{BitmapIndex, BITS_PER_FIELD};
use crate::config::ArenaOptions;
use crate::constants::BLOCK_SIZE;
use crate::os::OsMemory;

/// `os_purge`: decommits if configured and past early init, otherwise resets. Decommit clears
/// the committed bit; reset leaves it set (pages stay mapped, frames may be dropped). Returns
/// true iff a decommit occurred.
fn os_purge(os: &dyn OsMemory, options: &ArenaOptions, early_init: bool, addr: std::ptr::NonNull<u8>, size: usize) -> bool {
    if options.reset_decommits && !early_init {
        os.decommit(addr, size);
        true
    } else {
        os.reset(addr, size);
        false
    }
}

/// Schedules `n` blocks starting at `idx` for eventual purge. Purges immediately during early
/// init or when scheduling is disabled (`arena_purge_delay_ms == 0`); otherwise arms or bumps
/// `purge_expire` and marks the blocks in the `purge` bitmap for the sweep to find later.
pub(crate) fn schedule_purge(
    arena: &Arena,
    os: &dyn OsMemory,
    options: &ArenaOptions,
    early_init: bool,
    idx: BitmapIndex,
    n: usize,
) {
    let purge_bm = match &arena.blocks_purge {
        Some(p) => p,
        None => return,
    };

    if early_init || options.arena_purge_delay_ms == 0 {
        arena_purge(arena, os, options, early_init, idx, n);
        return;
    }

    let now = os.clock_now_ms();
    let delay = options.arena_purge_delay_ms;
    // Open Question resolution (SPEC_FULL §9): a CAS-clamped `fetch_update` replaces the
    // original's bare `fetch_add(delay/10)`, which could run away under heavy contention
    // since each racing free bumps an already-stale reload.
    let bump = (delay / 10).max(1);
    let _ = arena.purge_expire.fetch_update(AcqRel, Acquire, |cur| {
        Some(if cur == 0 { now + delay } else { cur.saturating_add(bump) })
    });

    purge_bm.claim_across(n, idx);
    trace!("scheduled purge of {} blocks at field {} bit {}", n, idx.field, idx.bit);
}

/// Purges `n` blocks starting at `idx` immediately: calls `os_purge` and, only if it actually
/// decommitted, clears the corresponding `committed` and `purge` bits. A reset-only purge
/// leaves both bitmaps untouched so the next sweep revisits the same range (documented as
/// intentional in SPEC_FULL §9 — reset is a softer, revisitable form of purge).
pub(crate) fn arena_purge(
    arena: &Arena,
    os: &dyn OsMemory,
    options: &ArenaOptions,
    early_init: bool,
    idx: BitmapIndex,
    n: usize,
) {
    let addr = arena.addr(idx);
    let decommitted = os_purge(os, options, early_init, addr, n * BLOCK_SIZE);
    if decommitted {
        if let Some(committed) = &arena.blocks_committed {
            committed.unclaim_across(n, idx);
        }
        if let Some(purge) = &arena.blocks_purge {
            purge.unclaim_across(n, idx);
        }
    }
}

/// One arena's share of a sweep. Returns true iff anything was purged.
pub(crate) fn try_purge(
    arena: &Arena,
    os: &dyn OsMemory,
    options: &ArenaOptions,
    early_init: bool,
    now: i64,
    force: bool,
) -> bool {
    if !arena.allow_decommit {
        return false;
    }
    let purge_bm = match &arena.blocks_purge {
        Some(p) => p,
        None => return false,
    };

    let expire = arena.purge_expire.load(Relaxed);
    if expire == 0 {
        return false;
    }
    if !force && expire > now {
        return false;
    }

    // Idempotent: another thread may race this CAS and lose, or may have already zeroed and
    // re-armed `purge_expire` by the time we get here. Either way we proceed with the sweep.
    let _ = arena.purge_expire.compare_exchange(expire, 0, AcqRel, Relaxed);

    let mut purged_any = false;
    for field in 0..arena.field_count {
        let word = purge_bm.load_field(field, Acquire);
        for (run_bit, run_len) in bit_runs(word, 0, BITS_PER_FIELD) {
            let mut bitlen = run_len;
            let mut claimed = 0;
            // Shrink the run until the corresponding `inuse` bits can be claimed as free;
            // some of them may have been reallocated between schedule and sweep.
            while bitlen > 0 {
                let idx = BitmapIndex::new(field, run_bit);
                if arena.blocks_inuse.try_claim_at(idx, bitlen) {
                    claimed = bitlen;
                    break;
                }
                bitlen -= 1;
            }
            if claimed == 0 {
                continue;
            }

            let claim_idx = BitmapIndex::new(field, run_bit);
            // Re-read after claiming `inuse`: a concurrent free could have re-scheduled a
            // purge on part of this range since we snapshotted `word`.
            let still_scheduled = purge_bm.load_field(field, Acquire);
            for (sub_bit, sub_len) in bit_runs(still_scheduled, run_bit, claimed) {
                arena_purge(arena, os, options, early_init, BitmapIndex::new(field, sub_bit), sub_len);
                purged_any = true;
            }
            arena.blocks_inuse.unclaim_across(claimed, claim_idx);
        }
    }

    purged_any
}

/// Finds maximal runs of set bits within `word`, restricted to the half-open bit range
/// `[from, from+len)`. Used both to scan a whole field (`from = 0, len = BITS_PER_FIELD`) and to
/// re-scan a just-claimed sub-range for bits still marked for purge.
fn bit_runs(word: usize, from: usize, len: usize) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let end = from + len;
    let mut bit = from;
    while bit < end {
        if (word >> bit) & 1 == 1 {
            let start = bit;
            let mut run_len = 0;
            while bit < end && (word >> bit) & 1 == 1 {
                run_len += 1;
                bit += 1;
            }
            runs.push((start, run_len));
        } else {
            bit += 1;
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{NewArena, Region};
    use crate::os::MockOsMemory;
    use std::alloc::{alloc, Layout};
    use std::ptr::NonNull;

    fn make_arena(blocks: usize, committed: bool) -> Arena {
        let size = blocks * BLOCK_SIZE;
        let layout = Layout::from_size_align(size, BLOCK_SIZE).unwrap();
        let start = NonNull::new(unsafe { alloc(layout) }).unwrap();
        Arena::new(NewArena {
            start,
            size,
            region_alignment: BLOCK_SIZE,
            is_committed: committed,
            is_large: false,
            is_zero_init: false,
            numa_node: -1,
            exclusive: false,
            region: Region::Owned,
        })
    }

    #[test]
    fn bit_runs_finds_multi_bit_run_above_bit_zero() {
        // Regression test for the Open Question: the original's inner test on an
        // extracted bit was equivalent to "== 1" instead of "!= 0", which only worked by
        // accident when the run started at bit 0. A run starting at bit 3, length 5,
        // must be found in full.
        let word = 0b0001_1111_000usize;
        let runs = bit_runs(word, 0, BITS_PER_FIELD);
        assert_eq!(runs, vec![(3, 5)]);
    }

    #[test]
    fn schedule_then_force_purge_decommits() {
        let arena = make_arena(2, false);
        let os = MockOsMemory::new();
        let options = ArenaOptions { reset_decommits: true, arena_purge_delay_ms: 10_000, ..ArenaOptions::default() };

        let idx = arena.blocks_inuse.try_find_from(0, 2).unwrap();
        schedule_purge(&arena, &os, &options, false, idx, 2);
        assert_ne!(arena.purge_expire.load(Relaxed), 0);

        // Before expiry, a non-forced sweep is a no-op.
        assert!(!try_purge(&arena, &os, &options, false, os.clock_now_ms(), false));

        os.advance_ms(20_000);
        assert!(try_purge(&arena, &os, &options, false, os.clock_now_ms(), false));
        assert!(!arena.blocks_committed.as_ref().unwrap().is_claimed_across(2, idx));
        assert!(!arena.blocks_purge.as_ref().unwrap().is_claimed_across(2, idx));
    }

    #[test]
    fn purge_shortens_run_when_block_reallocated() {
        let arena = make_arena(4, false);
        let os = MockOsMemory::new();
        let options = ArenaOptions { arena_purge_delay_ms: 0, ..ArenaOptions::default() };

        let idx = arena.blocks_inuse.try_find_from(0, 4).unwrap();
        // Schedule all 4 for purge immediately (delay == 0 purges right away and clears
        // inuse/committed would already be handled by the allocator; here we drive the
        // bitmaps directly to exercise the sweep's shrink logic).
        arena.blocks_purge.as_ref().unwrap().claim_across(4, idx);
        arena.purge_expire.store(1, Relaxed);
        // Re-claim the first 2 blocks as in-use again, simulating a reallocation race.
        arena.blocks_inuse.unclaim_across(4, idx);
        arena.blocks_inuse.try_claim_at(idx, 2);

        assert!(try_purge(&arena, &os, &options, false, 100, true));
        // The first 2 blocks remain in-use (never touched by purge); the last 2 are free again.
        assert!(arena.blocks_inuse.is_claimed_across(2, idx));
        assert!(!arena.blocks_inuse.is_claimed_across(2, BitmapIndex::new(idx.field, idx.bit + 2)));
    }

    #[test]
    fn reset_only_purge_leaves_purge_bit_set() {
        let arena = make_arena(1, false);
        let os = MockOsMemory::new();
        let options = ArenaOptions { reset_decommits: false, ..ArenaOptions::default() };

        let idx = BitmapIndex::new(0, 0);
        arena_purge(&arena, &os, &options, false, idx, 1);
        // reset, not decommit: committed/purge bits are left exactly as they were (both clear
        // here since we never set them) -- the meaningful assertion is that a *set* purge bit
        // survives a reset-only purge so the sweep revisits it.
        arena.blocks_purge.as_ref().unwrap().claim_across(1, idx);
        arena_purge(&arena, &os, &options, false, idx, 1);
        assert!(arena.blocks_purge.as_ref().unwrap().is_claimed_across(1, idx));
    }
}
