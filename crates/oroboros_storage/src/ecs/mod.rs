//! # Entity Storage
//!
//! Entities are grouped by their exact set of component types (archetype) and
//! stored in fixed-size chunks, one contiguous column per type.
//!
//! ## Design Philosophy
//!
//! - Chunk columns are dense: live entities occupy slots `[0, count)`
//! - Entity ids are indices with generation counters; stale ids never alias
//! - Structural changes move whole runs of entities, never single bytes
//! - All chunk memory is plain data behind `bytemuck` casts

pub mod archetype;
pub(crate) mod buffer;
mod chunk;
mod component;
mod entity;
mod entity_table;
mod shared;
mod store;
mod structural;

/// Generation-checked handle to a chunk of an [`EntityStore`].
pub type ChunkId = crate::memory::PoolHandle;

pub use archetype::{ArchetypeFlags, ArchetypeId, ArchetypeRegistry, ArchetypeView};
pub use chunk::Chunk;
pub use component::{
    BufferComponent, BufferElement, CleanupEntity, Component, ComponentKind, SharedComponent,
    TypeIndex, TypeInfo, TypeRegistry,
};
pub use entity::{Entity, EntityLocation};
pub use entity_table::EntityTable;
pub use shared::{SharedComponentStore, SharedValue};
pub use store::EntityStore;
pub use structural::EntityBatch;
