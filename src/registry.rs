//! Arena registry (C3).
//!
//! Arenas are appended, never removed: `mi_arena_add` in the original never shrinks the
//! table, and neither does this. The slot array is fixed-capacity and filled left-to-right;
//! a reader walks it until the first unpublished slot, which is always safe because
//! publication is a release-store and the walk uses an acquire-load (I6).

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering::*};

use crate::arena::Arena;
use crate::constants::MAX_ARENAS_HARD_CEILING;
use crate::error::ArenaError;
use crate::memid::ArenaId;

pub(crate) struct Registry {
    slots: Box<[AtomicPtr<Arena>]>,
    count: AtomicUsize,
    capacity: usize,
}

impl Registry {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_ARENAS_HARD_CEILING);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || AtomicPtr::new(std::ptr::null_mut()));
        Registry { slots: slots.into_boxed_slice(), count: AtomicUsize::new(0), capacity }
    }

    /// Publishes `arena` into the next free slot, leaking it (arenas are never freed for the
    /// life of the process, matching the original). Returns the id assigned.
    pub(crate) fn add(&self, arena: Arena) -> Result<ArenaId, ArenaError> {
        let slot = self.count.fetch_add(1, AcqRel);
        if slot >= self.capacity {
            self.count.fetch_sub(1, AcqRel);
            return Err(ArenaError::RegistryFull { max: self.capacity });
        }
        let id = ArenaId::from_slot(slot);
        arena.set_id(id);
        let leaked: &'static Arena = Box::leak(Box::new(arena));
        self.slots[slot].store(leaked as *const Arena as *mut Arena, Release);
        Ok(id)
    }

    pub(crate) fn get(&self, id: ArenaId) -> Option<&'static Arena> {
        let ptr = self.slots.get(id.index())?.load(Acquire);
        unsafe { ptr.as_ref() }
    }

    /// Number of slots currently published; may race with a concurrent `add`, so a walk to
    /// this bound can observe one fewer arena than exists by the time it finishes — never
    /// more, and never a half-initialised one (I6).
    pub(crate) fn published_count(&self) -> usize {
        self.count.load(Acquire).min(self.capacity)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &'static Arena> + '_ {
        (0..self.published_count()).filter_map(move |slot| {
            let ptr = self.slots[slot].load(Acquire);
            unsafe { ptr.as_ref() }
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
