//! A lock-free, thread-shared arena subsystem for a general-purpose memory allocator.
//!
//! An arena is a large, contiguous region of OS memory reserved up front and carved into
//! fixed-size blocks. This crate implements the block allocator over a fixed array of arenas
//! (each partitioned by an atomic bitmap), the deferred purge engine that reclaims physical
//! backing without losing the virtual reservation, the arena registry, and the memid encoding
//! that ties them together. See `SPEC_FULL.md` for the full design.

mod allocator;
mod arena;
mod bitmap;
mod config;
mod constants;
mod error;
mod memid;
mod os;
mod purge;
mod registry;

pub use allocator::{AllocRequest, AllocResult, Allocator};
pub use arena::Arena;
pub use bitmap::{AtomicBitmap, BitmapIndex};
pub use config::{ArenaOptions, Verbosity};
pub use constants::{ARENA_MIN_OBJ_SIZE, BLOCK_SIZE, N_MAX, SEGMENT_ALIGN};
pub use error::ArenaError;
pub use memid::{ArenaId, Memid};
pub use os::{OsMemory, StdOsMemory};
