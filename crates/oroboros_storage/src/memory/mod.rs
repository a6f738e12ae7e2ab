//! # Memory Management
//!
//! Block arena for archetype metadata, aligned blocks for chunk data, and
//! generation-checked slot pools for chunks and buffer payloads.
//!
//! ## Design Philosophy
//!
//! - Metadata is allocated once per archetype and freed en masse
//! - Chunk memory is a fixed-size, cache-line aligned block
//! - Objects are addressed by checked handles, never by raw pointers

mod arena;
mod block;
mod pool;

pub use arena::{Arena, ArenaSlice, DEFAULT_ARENA_BLOCK_SIZE};
pub use block::{align_up, AlignedBlock, CacheLine, CACHE_LINE_SIZE};
pub use pool::{PoolHandle, SlotPool};
