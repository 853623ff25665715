//! Atomic bitmap primitive (C1).
//!
//! An [`AtomicBitmap`] is an array of `usize`-wide atomic words, addressed by a
//! [`BitmapIndex`] (field, bit). Every block-granular structure in this crate (the four
//! per-arena bitmaps) is built on top of it. All operations here are linearisable: a bit
//! transitions 0->1 or 1->0 exactly once per logical claim/unclaim, no matter how many
//! threads race on the same word.

use std::sync::atomic::{AtomicUsize, Ordering, Ordering::*};

/// Number of bits in one field.
pub const BITS_PER_FIELD: usize = usize::BITS as usize;

/// Coordinates of a bit inside a bitmap: which field, and which bit within that field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BitmapIndex {
    pub field: usize,
    pub bit: usize,
}

impl BitmapIndex {
    pub const fn new(field: usize, bit: usize) -> Self {
        BitmapIndex { field, bit }
    }

    /// Flattens to a single block index, used by [`crate::memid`] to pack into a `Memid`.
    pub(crate) fn to_flat(self) -> usize {
        self.field * BITS_PER_FIELD + self.bit
    }

    pub(crate) fn from_flat(flat: usize) -> Self {
        BitmapIndex::new(flat / BITS_PER_FIELD, flat % BITS_PER_FIELD)
    }
}

fn mask_for(bit: usize, count: usize) -> usize {
    debug_assert!(bit + count <= BITS_PER_FIELD);
    if count == BITS_PER_FIELD {
        usize::MAX
    } else {
        ((1usize << count) - 1) << bit
    }
}

/// A contiguous array of atomic words, each bit tracking one block.
pub struct AtomicBitmap {
    fields: Box<[AtomicUsize]>,
}

impl AtomicBitmap {
    /// Allocates a bitmap of `field_count` words, all bits clear (free).
    pub fn new(field_count: usize) -> Self {
        let mut fields = Vec::with_capacity(field_count);
        fields.resize_with(field_count, || AtomicUsize::new(0));
        AtomicBitmap { fields: fields.into_boxed_slice() }
    }

    /// Allocates a bitmap with every bit set (used when the whole region starts committed).
    pub fn new_all_set(field_count: usize) -> Self {
        let mut fields = Vec::with_capacity(field_count);
        fields.resize_with(field_count, || AtomicUsize::new(usize::MAX));
        AtomicBitmap { fields: fields.into_boxed_slice() }
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Unconditionally sets `n` bits starting at `idx`, possibly spanning fields.
    /// Returns true iff at least one of those bits was previously clear.
    pub fn claim_across(&self, n: usize, idx: BitmapIndex) -> bool {
        let mut any_was_clear = false;
        self.for_each_chunk(idx, n, |field, mask| {
            let prev = self.fields[field].fetch_or(mask, AcqRel);
            if prev & mask != mask {
                any_was_clear = true;
            }
        });
        any_was_clear
    }

    /// Unconditionally sets `n` bits starting at `idx`, possibly spanning fields. Returns
    /// true iff every one of those bits was previously clear — used by the allocator to
    /// tell whether a claimed range has ever been written (the dirty bitmap), as opposed to
    /// [`Self::claim_across`]'s "was any bit already set" used for the committed bitmap.
    pub fn claim_across_if_all_clear(&self, n: usize, idx: BitmapIndex) -> bool {
        let mut all_were_clear = true;
        self.for_each_chunk(idx, n, |field, mask| {
            let prev = self.fields[field].fetch_or(mask, AcqRel);
            if prev & mask != 0 {
                all_were_clear = false;
            }
        });
        all_were_clear
    }

    /// Raw snapshot of one field's word, used by the purge sweep to locate runs of set bits
    /// without paying for a bit-by-bit `is_claimed_across` scan.
    pub(crate) fn load_field(&self, field: usize, ordering: Ordering) -> usize {
        self.fields[field].load(ordering)
    }

    /// Unconditionally clears `n` bits starting at `idx`, possibly spanning fields.
    /// Returns true iff every one of those bits was previously set (i.e. a clean free;
    /// false signals a double-free).
    pub fn unclaim_across(&self, n: usize, idx: BitmapIndex) -> bool {
        let mut all_were_set = true;
        self.for_each_chunk(idx, n, |field, mask| {
            let prev = self.fields[field].fetch_and(!mask, AcqRel);
            if prev & mask != mask {
                all_were_set = false;
            }
        });
        all_were_set
    }

    /// True iff all `n` bits starting at `idx` are currently set.
    pub fn is_claimed_across(&self, n: usize, idx: BitmapIndex) -> bool {
        let mut all_set = true;
        self.for_each_chunk(idx, n, |field, mask| {
            let val = self.fields[field].load(Acquire);
            if val & mask != mask {
                all_set = false;
            }
        });
        all_set
    }

    /// Attempts to claim exactly the `n` bits starting at `idx`, atomically, iff all of
    /// them are currently clear. On conflict, any already-claimed chunk is rolled back
    /// (the claim is all-or-nothing even though it is built from one CAS loop per field).
    pub fn try_claim_at(&self, idx: BitmapIndex, n: usize) -> bool {
        let mut claimed: Vec<(usize, usize)> = Vec::new();
        let mut field = idx.field;
        let mut bit = idx.bit;
        let mut remaining = n;
        while remaining > 0 {
            let take = remaining.min(BITS_PER_FIELD - bit);
            let mask = mask_for(bit, take);
            loop {
                let cur = self.fields[field].load(Relaxed);
                if cur & mask != 0 {
                    for (f, m) in claimed {
                        self.fields[f].fetch_and(!m, Release);
                    }
                    return false;
                }
                if self.fields[field]
                    .compare_exchange_weak(cur, cur | mask, AcqRel, Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
            claimed.push((field, mask));
            remaining -= take;
            field += 1;
            bit = 0;
        }
        true
    }

    /// Searches for `n` consecutive clear bits, starting the scan at field `hint` and
    /// wrapping around the whole bitmap. On success, claims them atomically and returns
    /// the starting index; a racing claim on the same candidate range causes the scan to
    /// continue rather than retry forever on one spot.
    ///
    /// Visits every non-wrapping start position `s` (`s + n <= total_bits`) exactly once,
    /// in hint order: `offset` ranges over a full residue system of size `total_bits`, so
    /// `(start_bit + offset) % total_bits` covers every bit position, not just the ones
    /// within `n-1` bits of the wrap seam. A narrower `0..=(total_bits - n)` range (visiting
    /// only as many offsets as there are valid starts) under-covers whenever `hint > 0`,
    /// since most of those offsets land on positions that get skipped for wrapping.
    pub fn try_find_from(&self, hint: usize, n: usize) -> Option<BitmapIndex> {
        let total_bits = self.fields.len() * BITS_PER_FIELD;
        if n == 0 || n > total_bits {
            return None;
        }
        let field_count = self.fields.len();
        let start_bit = (hint % field_count) * BITS_PER_FIELD;
        for offset in 0..total_bits {
            let s = (start_bit + offset) % total_bits;
            if s + n > total_bits {
                // Don't let a run wrap past the end of the bitmap.
                continue;
            }
            let idx = BitmapIndex::from_flat(s);
            if self.snapshot_is_clear_run(idx, n) && self.try_claim_at(idx, n) {
                return Some(idx);
            }
        }
        None
    }

    /// Convenience wrapper over [`Self::try_find_from`] starting the search at field 0.
    pub fn try_claim_any(&self, n: usize) -> Option<BitmapIndex> {
        self.try_find_from(0, n)
    }

    fn snapshot_is_clear_run(&self, idx: BitmapIndex, n: usize) -> bool {
        let mut clear = true;
        self.for_each_chunk(idx, n, |field, mask| {
            let val = self.fields[field].load(Relaxed);
            if val & mask != 0 {
                clear = false;
            }
        });
        clear
    }

    fn for_each_chunk(&self, idx: BitmapIndex, n: usize, mut f: impl FnMut(usize, usize)) {
        let mut field = idx.field;
        let mut bit = idx.bit;
        let mut remaining = n;
        while remaining > 0 {
            let take = remaining.min(BITS_PER_FIELD - bit);
            let mask = mask_for(bit, take);
            f(field, mask);
            remaining -= take;
            field += 1;
            bit = 0;
        }
    }
}
