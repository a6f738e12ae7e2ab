//! # OROBOROS Storage
//!
//! Chunked structure-of-arrays entity storage:
//! - Entities grouped by archetype (their exact set of component types)
//! - Fixed-size 16 KiB chunks, one dense column per component type
//! - Structural changes move whole runs of entities and keep chunks dense
//!
//! ## Architecture Rules
//!
//! 1. **Dense chunks** - live entities always occupy slots `[0, count)`
//! 2. **Checked handles** - stale entities and chunks are detected, never aliased
//! 3. **Plain data** - component memory is reached through `bytemuck` casts only
//!
//! ## Example
//!
//! ```rust,ignore
//! use oroboros_storage::{EntityStore, StoreConfig, TypeRegistry};
//!
//! let mut types = TypeRegistry::new();
//! let position = types.register::<Position>()?;
//! let mut store = EntityStore::new(StoreConfig::default(), types.freeze())?;
//!
//! let archetype = store.get_or_create_archetype(&[position])?;
//! let entity = store.create_entity(archetype)?;
//! store.set_component(entity, Position { x: 1.0, y: 2.0, z: 3.0 })?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub mod commands;
pub mod config;
pub mod ecs;
pub mod error;
pub mod memory;
pub mod sync;

pub use commands::CommandBuffer;
pub use config::StoreConfig;
pub use ecs::{
    ArchetypeFlags, ArchetypeId, ArchetypeView, BufferComponent, BufferElement, Chunk, ChunkId,
    CleanupEntity, Component, ComponentKind, Entity, EntityLocation, EntityStore, SharedComponent,
    TypeIndex, TypeInfo, TypeRegistry,
};
pub use error::{StorageError, StorageResult};
pub use sync::{AccessGuard, AccessMode, AccessTracker, SafetyHandle};
