//! OS collaborator contract (C7, ambient addition).
//!
//! §1 and §6 put the real page primitives (reserve / commit / decommit / reset / huge pages /
//! NUMA discovery) out of this crate's scope: they're external collaborators. Modelling that
//! boundary as ambient free functions would hide it; instead it's a trait object the allocator
//! holds by `Arc<dyn OsMemory>`, so a host can swap in a real mmap/VirtualAlloc/NUMA-aware
//! backend without touching arena logic. [`StdOsMemory`] is the crate's own default: a
//! `std::alloc`-backed implementation good enough to make the crate usable and testable
//! standalone, but it cannot truly decommit or reset (there is no portable stable API for that
//! over a `std::alloc` allocation), so it reports the conservative answer in both cases.

use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// The OS-level primitives the arena subsystem consumes. See the module docs for why this is
/// a trait rather than a set of free functions.
pub trait OsMemory: Send + Sync {
    /// Reserves (and optionally commits) `size` bytes aligned to `alignment`. `large` is
    /// updated to reflect whether large/huge pages actually backed the allocation.
    fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
        commit: bool,
        large: &mut bool,
    ) -> Option<NonNull<u8>>;

    /// As [`Self::alloc_aligned`] but the returned pointer is `alignment`-aligned only after
    /// adding `offset` (used for allocations whose true start must land `offset` bytes into
    /// an aligned region).
    fn alloc_aligned_offset(
        &self,
        size: usize,
        alignment: usize,
        offset: usize,
        commit: bool,
        large: &mut bool,
    ) -> Option<NonNull<u8>>;

    fn free_aligned(&self, ptr: NonNull<u8>, size: usize, alignment: usize, offset: usize, was_committed: bool);

    fn free_ex(&self, ptr: NonNull<u8>, size: usize, was_committed: bool);

    /// Ensures `size` bytes at `ptr` are committed. Returns `(ok, was_zeroed)`.
    fn commit(&self, ptr: NonNull<u8>, size: usize) -> (bool, bool);

    /// Removes physical backing; the mapping's committed bit must be cleared by the caller.
    fn decommit(&self, ptr: NonNull<u8>, size: usize);

    /// Advises the OS the contents may be discarded; the mapping stays committed.
    fn reset(&self, ptr: NonNull<u8>, size: usize);

    /// Reserves `pages` huge/large OS pages (platform page size, e.g. 1 GiB) on `node`
    /// (`-1` = any), waiting up to `timeout_ms`. Returns `(ptr, pages_reserved, size_bytes)`;
    /// `pages_reserved` may be less than `pages` on partial success.
    fn alloc_huge_os_pages(
        &self,
        pages: usize,
        node: i32,
        timeout_ms: u64,
    ) -> Option<(NonNull<u8>, usize, usize)>;

    fn free_huge_pages(&self, ptr: NonNull<u8>, size: usize);

    /// The calling thread's NUMA node, or `-1` if unknown/not applicable.
    fn numa_node(&self) -> i32;

    fn numa_node_count(&self) -> usize;

    /// Monotonic clock in milliseconds, used for purge scheduling.
    fn clock_now_ms(&self) -> i64;
}

/// A `std::alloc`-backed [`OsMemory`]. Good enough for tests and for hosts with no
/// lower-level OS binding wired in; real embedders should supply an mmap/VirtualAlloc-backed
/// implementation instead (see the module docs).
pub struct StdOsMemory {
    epoch: Instant,
    numa_node: i32,
    numa_node_count: usize,
}

impl StdOsMemory {
    pub fn new() -> Self {
        StdOsMemory { epoch: Instant::now(), numa_node: -1, numa_node_count: 1 }
    }

    fn layout_for(size: usize, alignment: usize) -> Layout {
        Layout::from_size_align(size, alignment.max(1)).expect("invalid layout for OS allocation")
    }
}

impl Default for StdOsMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl OsMemory for StdOsMemory {
    fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
        commit: bool,
        large: &mut bool,
    ) -> Option<NonNull<u8>> {
        *large = false;
        let layout = Self::layout_for(size, alignment);
        let ptr = unsafe {
            if commit {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };
        NonNull::new(ptr)
    }

    fn alloc_aligned_offset(
        &self,
        size: usize,
        alignment: usize,
        offset: usize,
        commit: bool,
        large: &mut bool,
    ) -> Option<NonNull<u8>> {
        // Over-allocate so a sub-region can satisfy `(ptr + offset) % alignment == 0`. The
        // returned pointer is at most `alignment - 1` bytes above the true `alloc` base, so
        // `free_aligned` can recover that base from the returned pointer alone (see there).
        let padded = size + alignment;
        let base = self.alloc_aligned(padded, alignment, commit, large)?;
        let base_addr = base.as_ptr() as usize;
        let want = (base_addr + offset).next_multiple_of(alignment);
        let adjusted = (want - offset) as *mut u8;
        NonNull::new(adjusted)
    }

    fn free_aligned(&self, ptr: NonNull<u8>, size: usize, alignment: usize, offset: usize, _was_committed: bool) {
        if offset == 0 {
            let layout = Self::layout_for(size, alignment);
            unsafe { dealloc(ptr.as_ptr(), layout) }
            return;
        }
        // `alloc_aligned_offset` returned `base + pad` for some `0 <= pad < alignment`, and
        // `base` is itself `alignment`-aligned — so the low bits of the returned pointer are
        // exactly `pad`, and subtracting them recovers the original `alloc` base and its
        // `size + alignment` padded layout without needing any side-table of outstanding
        // offset allocations.
        let addr = ptr.as_ptr() as usize;
        let base_addr = addr - (addr % alignment);
        let layout = Self::layout_for(size + alignment, alignment);
        unsafe { dealloc(base_addr as *mut u8, layout) }
    }

    fn free_ex(&self, ptr: NonNull<u8>, size: usize, _was_committed: bool) {
        let layout = Self::layout_for(size, 1);
        unsafe { dealloc(ptr.as_ptr(), layout) }
    }

    fn commit(&self, _ptr: NonNull<u8>, _size: usize) -> (bool, bool) {
        // Memory from `std::alloc` is always already committed; nothing to do.
        (true, false)
    }

    fn decommit(&self, _ptr: NonNull<u8>, _size: usize) {
        // No portable stable way to decommit a `std::alloc` allocation; this is a no-op
        // collaborator, consistent with it being out of this crate's scope.
    }

    fn reset(&self, _ptr: NonNull<u8>, _size: usize) {
        // See `decommit`.
    }

    fn alloc_huge_os_pages(
        &self,
        pages: usize,
        _node: i32,
        _timeout_ms: u64,
    ) -> Option<(NonNull<u8>, usize, usize)> {
        if pages == 0 {
            return None;
        }
        const HUGE_PAGE_SIZE: usize = 1024 * 1024 * 1024;
        let size = pages * HUGE_PAGE_SIZE;
        let mut large = true;
        let ptr = self.alloc_aligned(size, HUGE_PAGE_SIZE, true, &mut large)?;
        Some((ptr, pages, size))
    }

    fn free_huge_pages(&self, ptr: NonNull<u8>, size: usize) {
        self.free_ex(ptr, size, true);
    }

    fn numa_node(&self) -> i32 {
        self.numa_node
    }

    fn numa_node_count(&self) -> usize {
        self.numa_node_count
    }

    fn clock_now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }
}

/// A deterministic, in-memory [`OsMemory`] for tests: no real paging, a controllable clock,
/// and configurable NUMA topology.
#[cfg(test)]
pub(crate) struct MockOsMemory {
    pub(crate) clock_ms: AtomicI64,
    pub(crate) numa_node: i32,
    pub(crate) numa_node_count: usize,
    std: StdOsMemory,
}

#[cfg(test)]
impl MockOsMemory {
    pub(crate) fn new() -> Self {
        MockOsMemory {
            clock_ms: AtomicI64::new(0),
            numa_node: -1,
            numa_node_count: 1,
            std: StdOsMemory::new(),
        }
    }

    pub(crate) fn with_numa(node: i32, count: usize) -> Self {
        MockOsMemory { numa_node: node, numa_node_count: count, ..Self::new() }
    }

    pub(crate) fn advance_ms(&self, delta: i64) {
        self.clock_ms.fetch_add(delta, Ordering::Relaxed);
    }
}

#[cfg(test)]
impl OsMemory for MockOsMemory {
    fn alloc_aligned(&self, size: usize, alignment: usize, commit: bool, large: &mut bool) -> Option<NonNull<u8>> {
        self.std.alloc_aligned(size, alignment, commit, large)
    }

    fn alloc_aligned_offset(
        &self,
        size: usize,
        alignment: usize,
        offset: usize,
        commit: bool,
        large: &mut bool,
    ) -> Option<NonNull<u8>> {
        self.std.alloc_aligned_offset(size, alignment, offset, commit, large)
    }

    fn free_aligned(&self, ptr: NonNull<u8>, size: usize, alignment: usize, offset: usize, was_committed: bool) {
        self.std.free_aligned(ptr, size, alignment, offset, was_committed)
    }

    fn free_ex(&self, ptr: NonNull<u8>, size: usize, was_committed: bool) {
        self.std.free_ex(ptr, size, was_committed)
    }

    fn commit(&self, ptr: NonNull<u8>, size: usize) -> (bool, bool) {
        self.std.commit(ptr, size)
    }

    fn decommit(&self, ptr: NonNull<u8>, size: usize) {
        self.std.decommit(ptr, size)
    }

    fn reset(&self, ptr: NonNull<u8>, size: usize) {
        self.std.reset(ptr, size)
    }

    fn alloc_huge_os_pages(&self, pages: usize, node: i32, timeout_ms: u64) -> Option<(NonNull<u8>, usize, usize)> {
        self.std.alloc_huge_os_pages(pages, node, timeout_ms)
    }

    fn free_huge_pages(&self, ptr: NonNull<u8>, size: usize) {
        self.std.free_huge_pages(ptr, size)
    }

    fn numa_node(&self) -> i32 {
        self.numa_node
    }

    fn numa_node_count(&self) -> usize {
        self.numa_node_count
    }

    fn clock_now_ms(&self) -> i64 {
        self.clock_ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_os_memory_round_trips_alloc_free() {
        let os = StdOsMemory::new();
        let mut large = false;
        let ptr = os.alloc_aligned(4096, 4096, true, &mut large).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
        os.free_aligned(ptr, 4096, 4096, 0, true);
    }

    #[test]
    fn std_os_memory_round_trips_offset_alloc_free() {
        // Regression test: the pointer returned for a non-zero offset generally differs from
        // the underlying `alloc` base, so `free_aligned` must recover that base rather than
        // deallocating the adjusted pointer directly.
        let os = StdOsMemory::new();
        let mut large = false;
        let offset = 128;
        let ptr = os.alloc_aligned_offset(4096, 4096, offset, true, &mut large).unwrap();
        assert_eq!((ptr.as_ptr() as usize + offset) % 4096, 0);
        os.free_aligned(ptr, 4096, 4096, offset, true);
    }

    #[test]
    fn mock_clock_advances() {
        let os = MockOsMemory::new();
        assert_eq!(os.clock_now_ms(), 0);
        os.advance_ms(100);
        assert_eq!(os.clock_now_ms(), 100);
    }
}
