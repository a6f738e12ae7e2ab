//! # Entity Store
//!
//! The central container: owns the archetypes, chunks, identity table, shared
//! values and buffer payloads of one set of entities.
//!
//! Structural changes take `&mut self`. Reads, enabled-bit toggles and
//! access registration work through `&self`, so worker threads can share a
//! store inside `std::thread::scope`.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use super::archetype::{ArchetypeId, ArchetypeRegistry, ArchetypeView};
use super::buffer::{self, BufferHeap, BufferLayout};
use super::chunk::Chunk;
use super::component::{
    BufferComponent, Component, ComponentKind, SharedComponent, TypeIndex, TypeRegistry,
};
use super::entity::{Entity, EntityLocation};
use super::entity_table::EntityTable;
use super::shared::{SharedComponentStore, SharedValue};
use super::structural::{stale_chunk, EntityBatch};
use super::ChunkId;
use crate::commands::CommandBuffer;
use crate::config::StoreConfig;
use crate::error::{StorageError, StorageResult};
use crate::memory::SlotPool;
use crate::sync::{AccessTracker, GlobalVersion, SafetyHandle};

/// Chunked structure-of-arrays entity storage.
///
/// # Example
///
/// ```rust,ignore
/// let mut types = TypeRegistry::new();
/// let position = types.register::<Position>()?;
/// let velocity = types.register::<Velocity>()?;
///
/// let mut store = EntityStore::new(StoreConfig::default(), types.freeze())?;
/// let moving = store.get_or_create_archetype(&[position, velocity])?;
/// let entities = store.create_entities(moving, 10_000)?;
///
/// for &chunk in store.archetype_chunks(moving) {
///     for p in store.chunk_components_mut::<Position>(chunk)? {
///         p.x += 1.0;
///     }
/// }
/// ```
pub struct EntityStore {
    pub(super) config: StoreConfig,
    pub(super) types: Arc<TypeRegistry>,
    pub(super) archetypes: ArchetypeRegistry,
    pub(super) chunks: SlotPool<Chunk>,
    pub(super) entity_table: EntityTable,
    pub(super) shared: SharedComponentStore,
    pub(super) heap: BufferHeap,
    pub(super) version: GlobalVersion,
    pub(super) access: Arc<AccessTracker>,
}

/// Where a type lives inside a chunk.
#[derive(Clone, Copy, Debug)]
struct ColumnRef {
    /// Index among the archetype's columns (enabled bits).
    column: usize,
    /// Index among all the archetype's types (change versions).
    position: usize,
    offset: u32,
    size: u32,
}

#[derive(Clone, Copy)]
enum TypeChange<'a> {
    Add(&'a [TypeIndex]),
    Remove(&'a [TypeIndex]),
}

impl EntityStore {
    /// Creates an empty store for the types in `types`.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidConfig`] if `config` is inconsistent.
    pub fn new(config: StoreConfig, types: Arc<TypeRegistry>) -> StorageResult<Self> {
        config.validate()?;
        let archetypes = ArchetypeRegistry::new(&config, Arc::clone(&types));
        let shared = SharedComponentStore::new(&types);
        let access = AccessTracker::new(types.len());
        tracing::debug!(
            chunk_bytes = config.chunk_bytes,
            types = types.len(),
            "entity store created"
        );
        Ok(Self {
            config,
            types,
            archetypes,
            chunks: SlotPool::new(),
            entity_table: EntityTable::new(),
            shared,
            heap: BufferHeap::new(),
            version: GlobalVersion::new(),
            access,
        })
    }

    /// The configuration the store was built with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The registered component types.
    #[must_use]
    pub fn type_registry(&self) -> &TypeRegistry {
        &self.types
    }

    /// Index of a registered type.
    #[must_use]
    pub fn type_index<T: 'static>(&self) -> Option<TypeIndex> {
        self.types.type_index::<T>()
    }

    /// A new command buffer recording against this store's types.
    #[must_use]
    pub fn command_buffer(&self) -> CommandBuffer {
        CommandBuffer::new(Arc::clone(&self.types), self.config.command_chunk_bytes)
    }

    // =========================================================================
    // Entity lifecycle
    // =========================================================================

    /// Returns the archetype for a set of types, creating it on first use.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] for unregistered types, the
    /// cleanup marker, or too many types.
    /// [`StorageError::CapacityExceeded`] if one entity does not fit a chunk.
    pub fn get_or_create_archetype(&mut self, types: &[TypeIndex]) -> StorageResult<ArchetypeId> {
        self.check_types(types)?;
        self.archetypes.get_or_create(types)
    }

    /// Creates one entity with every component zeroed and enabled.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::create_entities`].
    pub fn create_entity(&mut self, archetype: ArchetypeId) -> StorageResult<Entity> {
        let mut created = self.create_entities(archetype, 1)?;
        created
            .pop()
            .ok_or_else(|| StorageError::structural("no entity created"))
    }

    /// Creates `count` entities in `archetype`.
    ///
    /// Shared components start at their default values.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] for an unknown archetype or
    /// one holding destroyed entities.
    pub fn create_entities(
        &mut self,
        archetype: ArchetypeId,
        count: usize,
    ) -> StorageResult<Vec<Entity>> {
        let view = self.archetype_view(archetype)?;
        if view.flags.is_cleanup_entity {
            return Err(StorageError::structural(format!(
                "archetype {archetype} only holds destroyed entities"
            )));
        }
        let shared_key = vec![0; view.shared.len()];
        self.sync_types(view.types.iter().copied());

        let mut created = Vec::with_capacity(count);
        self.create_in(archetype, &shared_key, count, &mut created)?;
        Ok(created)
    }

    /// Destroys one entity. See [`EntityStore::destroy_entities`].
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`] if `entity` is not live.
    pub fn destroy_entity(&mut self, entity: Entity) -> StorageResult<()> {
        self.destroy_entities(&[entity])
    }

    /// Destroys entities.
    ///
    /// Entities carrying cleanup components stay alive with only those
    /// components plus [`CleanupEntity`](super::CleanupEntity); they are freed
    /// once their last cleanup component is removed. Destroying such an
    /// entity again is a no-op.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`] for the first stale handle; nothing is
    /// destroyed in that case.
    pub fn destroy_entities(&mut self, entities: &[Entity]) -> StorageResult<()> {
        let batches = self.batches_for(entities)?;

        // None = free the rows.
        let mut targets: HashMap<ArchetypeId, Option<ArchetypeId>> = HashMap::new();
        let mut affected = Vec::new();
        for batch in &batches {
            let source = self.live_chunk(batch.chunk)?.archetype();
            if targets.contains_key(&source) {
                continue;
            }
            let view = self.archetypes.view(source);
            affected.extend_from_slice(view.types);
            let target = if view.flags.is_cleanup_entity {
                Some(source)
            } else if view.flags.has_cleanup {
                let mut kept: Vec<TypeIndex> = view
                    .types
                    .iter()
                    .copied()
                    .filter(|&t| self.types.info(t).is_some_and(|info| info.cleanup))
                    .collect();
                kept.push(TypeIndex::CLEANUP_ENTITY);
                Some(self.archetypes.get_or_create(&kept)?)
            } else {
                None
            };
            targets.insert(source, target);
        }

        self.sync_types(affected);
        for batch in batches.into_iter().rev() {
            let source = self.live_chunk(batch.chunk)?.archetype();
            match targets.get(&source).copied().flatten() {
                Some(target) if target == source => {}
                Some(target) => self.move_batch(batch, target, &[])?,
                None => self.destroy_batch(batch)?,
            }
        }
        Ok(())
    }

    /// Creates a copy of `entity` with the same component values, enabled
    /// bits and shared values. Buffer contents are copied. Cleanup components
    /// are not.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`] if `entity` is not live,
    /// [`StorageError::InvalidStructuralRequest`] if it is already destroyed.
    pub fn instantiate(&mut self, entity: Entity) -> StorageResult<Entity> {
        let location = self.locate(entity)?;
        let chunk = self.live_chunk(location.chunk)?;
        let source = chunk.archetype();
        let shared_key = chunk.shared_indices().to_vec();
        let view = self.archetypes.view(source);
        if view.flags.is_cleanup_entity {
            return Err(StorageError::structural(format!(
                "entity {entity} is destroyed"
            )));
        }
        let cleanup: Vec<TypeIndex> = view
            .types
            .iter()
            .copied()
            .filter(|&t| self.types.info(t).is_some_and(|info| info.cleanup))
            .collect();
        self.sync_types(view.types.iter().copied());

        let target = if cleanup.is_empty() {
            source
        } else {
            self.archetypes.with_removed(source, &cleanup)?
        };
        let mut created = Vec::with_capacity(1);
        self.create_in(target, &shared_key, 1, &mut created)?;
        let clone = created[0];
        let destination = self.locate(clone)?;
        self.copy_row(
            location.chunk,
            location.index_in_chunk as usize,
            destination.chunk,
            destination.index_in_chunk as usize,
        )?;
        Ok(clone)
    }

    /// Returns `true` if `entity` is live.
    #[inline]
    #[must_use]
    pub fn exists(&self, entity: Entity) -> bool {
        self.entity_table.exists(entity)
    }

    /// Current location of a live entity.
    #[inline]
    #[must_use]
    pub fn resolve(&self, entity: Entity) -> Option<EntityLocation> {
        self.entity_table.resolve(entity)
    }

    /// Archetype of a live entity.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`] if `entity` is not live.
    pub fn entity_archetype(&self, entity: Entity) -> StorageResult<ArchetypeId> {
        let location = self.locate(entity)?;
        Ok(self.live_chunk(location.chunk)?.archetype())
    }

    // =========================================================================
    // Structural changes
    // =========================================================================

    /// Adds one type to an entity. No-op if already present.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`] or
    /// [`StorageError::InvalidStructuralRequest`].
    pub fn add_component(&mut self, entity: Entity, type_index: TypeIndex) -> StorageResult<()> {
        self.add_components(entity, &[type_index])
    }

    /// Adds a data component and writes its value.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`] or
    /// [`StorageError::InvalidStructuralRequest`].
    pub fn add_component_data<T: Component>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> StorageResult<()> {
        let type_index = self.data_type::<T>()?;
        self.add_components(entity, &[type_index])?;
        self.set_component(entity, value)
    }

    /// Removes one type from an entity.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] if the entity lacks the type.
    pub fn remove_component(
        &mut self,
        entity: Entity,
        type_index: TypeIndex,
    ) -> StorageResult<()> {
        self.check_types(&[type_index])?;
        let source = self.entity_archetype(entity)?;
        if !self.archetypes.view(source).contains(type_index) {
            return Err(StorageError::structural(format!(
                "entity {entity} has no component {type_index}"
            )));
        }
        self.remove_components(entity, &[type_index])
    }

    /// Adds several types to an entity in one move.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`] or
    /// [`StorageError::InvalidStructuralRequest`].
    pub fn add_components(&mut self, entity: Entity, types: &[TypeIndex]) -> StorageResult<()> {
        self.add_components_to_entities(&[entity], types)
    }

    /// Removes several types from an entity in one move. Missing types are
    /// ignored.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`] or
    /// [`StorageError::InvalidStructuralRequest`].
    pub fn remove_components(&mut self, entity: Entity, types: &[TypeIndex]) -> StorageResult<()> {
        self.remove_components_from_entities(&[entity], types)
    }

    /// Adds types to every listed entity.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`] for the first stale handle, or
    /// [`StorageError::InvalidStructuralRequest`]; nothing changes then.
    pub fn add_components_to_entities(
        &mut self,
        entities: &[Entity],
        types: &[TypeIndex],
    ) -> StorageResult<()> {
        self.check_types(types)?;
        let batches = self.batches_for(entities)?;
        self.apply_type_change(batches, TypeChange::Add(types))
    }

    /// Removes types from every listed entity.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::add_components_to_entities`].
    pub fn remove_components_from_entities(
        &mut self,
        entities: &[Entity],
        types: &[TypeIndex],
    ) -> StorageResult<()> {
        self.check_types(types)?;
        let batches = self.batches_for(entities)?;
        self.apply_type_change(batches, TypeChange::Remove(types))
    }

    /// Adds types to every entity of the listed archetypes.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] for unknown archetypes or
    /// invalid types.
    pub fn add_components_to_archetypes(
        &mut self,
        archetypes: &[ArchetypeId],
        types: &[TypeIndex],
    ) -> StorageResult<()> {
        self.check_types(types)?;
        for &archetype in archetypes {
            self.archetype_view(archetype)?;
        }
        let batches = self.batches_for_archetypes(archetypes)?;
        self.apply_type_change(batches, TypeChange::Add(types))
    }

    /// Removes types from every entity of the listed archetypes.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::add_components_to_archetypes`].
    pub fn remove_components_from_archetypes(
        &mut self,
        archetypes: &[ArchetypeId],
        types: &[TypeIndex],
    ) -> StorageResult<()> {
        self.check_types(types)?;
        for &archetype in archetypes {
            self.archetype_view(archetype)?;
        }
        let batches = self.batches_for_archetypes(archetypes)?;
        self.apply_type_change(batches, TypeChange::Remove(types))
    }

    fn apply_type_change(
        &mut self,
        batches: Vec<EntityBatch>,
        change: TypeChange<'_>,
    ) -> StorageResult<()> {
        let changed = match change {
            TypeChange::Add(types) | TypeChange::Remove(types) => types,
        };

        // Every destination exists before the first entity moves.
        let mut targets: HashMap<ArchetypeId, ArchetypeId> = HashMap::new();
        let mut affected = changed.to_vec();
        for batch in &batches {
            let source = self.live_chunk(batch.chunk)?.archetype();
            if let Entry::Vacant(slot) = targets.entry(source) {
                affected.extend_from_slice(self.archetypes.view(source).types);
                let target = match change {
                    TypeChange::Add(types) => self.archetypes.with_added(source, types)?,
                    TypeChange::Remove(types) => self.archetypes.with_removed(source, types)?,
                };
                slot.insert(target);
            }
        }
        if targets.iter().all(|(source, target)| source == target) {
            return Ok(());
        }

        self.sync_types(affected);
        for batch in batches.into_iter().rev() {
            let source = self.live_chunk(batch.chunk)?.archetype();
            let Some(&target) = targets.get(&source) else {
                continue;
            };
            if target == source {
                continue;
            }
            let shared_key = self.shared_key_for(self.live_chunk(batch.chunk)?, target);
            self.move_batch(batch, target, &shared_key)?;
        }
        Ok(())
    }

    // =========================================================================
    // Component data
    // =========================================================================

    /// Reads a data component.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`], or
    /// [`StorageError::InvalidStructuralRequest`] if `T` is not a data
    /// component of the entity.
    pub fn component<T: Component>(&self, entity: Entity) -> StorageResult<&T> {
        let type_index = self.data_type::<T>()?;
        let location = self.locate(entity)?;
        let column = self.entity_column(location.chunk, entity, type_index)?;
        Ok(&self.live_chunk(location.chunk)?.column::<T>(column.offset)
            [location.index_in_chunk as usize])
    }

    /// Writes a data component in place, stamping the chunk's change version.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::component`].
    pub fn component_mut<T: Component>(&mut self, entity: Entity) -> StorageResult<&mut T> {
        let type_index = self.data_type::<T>()?;
        let location = self.locate(entity)?;
        let column = self.entity_column(location.chunk, entity, type_index)?;
        let version = self.version.get();
        let chunk = self
            .chunks
            .get_mut(location.chunk)
            .ok_or_else(|| stale_chunk(location.chunk))?;
        chunk.set_change_version(column.position, version);
        Ok(&mut chunk.column_mut::<T>(column.offset)[location.index_in_chunk as usize])
    }

    /// Overwrites a data component.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::component`].
    pub fn set_component<T: Component>(&mut self, entity: Entity, value: T) -> StorageResult<()> {
        *self.component_mut::<T>(entity)? = value;
        Ok(())
    }

    /// Every value of a data column in one chunk, by slot.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] for a stale chunk or a chunk
    /// without that column.
    pub fn chunk_components<T: Component>(&self, chunk: ChunkId) -> StorageResult<&[T]> {
        let type_index = self.data_type::<T>()?;
        let column = self.chunk_column(chunk, type_index)?;
        Ok(self.live_chunk(chunk)?.column::<T>(column.offset))
    }

    /// Mutable variant of [`EntityStore::chunk_components`]. Stamps the
    /// chunk's change version.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::chunk_components`].
    pub fn chunk_components_mut<T: Component>(
        &mut self,
        chunk: ChunkId,
    ) -> StorageResult<&mut [T]> {
        let type_index = self.data_type::<T>()?;
        let column = self.chunk_column(chunk, type_index)?;
        let version = self.version.get();
        let chunk = self
            .chunks
            .get_mut(chunk)
            .ok_or_else(|| stale_chunk(chunk))?;
        chunk.set_change_version(column.position, version);
        Ok(chunk.column_mut::<T>(column.offset))
    }

    /// Entity ids of one chunk, by slot.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] for a stale chunk.
    pub fn chunk_entities(&self, chunk: ChunkId) -> StorageResult<&[Entity]> {
        Ok(self.live_chunk(chunk)?.entities())
    }

    /// Writes raw component bytes. Used by command playback.
    pub(crate) fn write_component_bytes(
        &mut self,
        entity: Entity,
        type_index: TypeIndex,
        bytes: &[u8],
    ) -> StorageResult<()> {
        let info = self.type_info(type_index)?;
        if info.kind != ComponentKind::Data {
            return Err(StorageError::structural(format!(
                "{} is not a data component",
                info.name
            )));
        }
        if bytes.len() != info.size {
            return Err(StorageError::structural(format!(
                "payload of {} bytes for {} ({} bytes)",
                bytes.len(),
                info.name,
                info.size
            )));
        }
        let location = self.locate(entity)?;
        let column = self.entity_column(location.chunk, entity, type_index)?;
        let version = self.version.get();
        let chunk = self
            .chunks
            .get_mut(location.chunk)
            .ok_or_else(|| stale_chunk(location.chunk))?;
        chunk.set_change_version(column.position, version);
        chunk
            .cell_mut(column.offset, column.size, location.index_in_chunk as usize)
            .copy_from_slice(bytes);
        Ok(())
    }

    // =========================================================================
    // Dynamic buffers
    // =========================================================================

    /// Elements of an entity's buffer.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`], or
    /// [`StorageError::InvalidStructuralRequest`] if the entity has no `B`
    /// buffer.
    pub fn buffer<B: BufferComponent>(&self, entity: Entity) -> StorageResult<&[B::Element]> {
        let (type_index, layout) = self.buffer_type::<B>()?;
        let location = self.locate(entity)?;
        let column = self.entity_column(location.chunk, entity, type_index)?;
        let cell = self.live_chunk(location.chunk)?.cell(
            column.offset,
            column.size,
            location.index_in_chunk as usize,
        );
        Ok(buffer::cast_elements(buffer::elements(
            layout, cell, &self.heap,
        )))
    }

    /// Appends one element to an entity's buffer.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::buffer`].
    pub fn buffer_push<B: BufferComponent>(
        &mut self,
        entity: Entity,
        value: B::Element,
    ) -> StorageResult<()> {
        self.with_buffer::<B>(entity, |layout, cell, heap| {
            buffer::push(layout, cell, heap, bytemuck::bytes_of(&value));
        })
    }

    /// Replaces the contents of an entity's buffer.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::buffer`].
    pub fn set_buffer<B: BufferComponent>(
        &mut self,
        entity: Entity,
        values: &[B::Element],
    ) -> StorageResult<()> {
        self.with_buffer::<B>(entity, |layout, cell, heap| {
            buffer::set(layout, cell, heap, bytemuck::cast_slice(values));
        })
    }

    /// Empties an entity's buffer. A spilled payload is kept for reuse.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::buffer`].
    pub fn clear_buffer<B: BufferComponent>(&mut self, entity: Entity) -> StorageResult<()> {
        self.with_buffer::<B>(entity, |layout, cell, heap| {
            buffer::set(layout, cell, heap, &[]);
        })
    }

    fn with_buffer<B: BufferComponent>(
        &mut self,
        entity: Entity,
        f: impl FnOnce(BufferLayout, &mut [u8], &mut BufferHeap),
    ) -> StorageResult<()> {
        let (type_index, layout) = self.buffer_type::<B>()?;
        let location = self.locate(entity)?;
        let column = self.entity_column(location.chunk, entity, type_index)?;
        let version = self.version.get();
        let chunk = self
            .chunks
            .get_mut(location.chunk)
            .ok_or_else(|| stale_chunk(location.chunk))?;
        chunk.set_change_version(column.position, version);
        let cell = chunk.cell_mut(column.offset, column.size, location.index_in_chunk as usize);
        f(layout, cell, &mut self.heap);
        Ok(())
    }

    fn buffer_type<B: BufferComponent>(&self) -> StorageResult<(TypeIndex, BufferLayout)> {
        let type_index = self.registered::<B>()?;
        let info = self.type_info(type_index)?;
        let layout = BufferLayout::of(info.kind).ok_or_else(|| {
            StorageError::structural(format!("{} is not a buffer component", info.name))
        })?;
        Ok((type_index, layout))
    }

    // =========================================================================
    // Shared components
    // =========================================================================

    /// Shared value of an entity's chunk.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`], or
    /// [`StorageError::InvalidStructuralRequest`] if the entity lacks `T`.
    pub fn shared_component<T: SharedComponent>(&self, entity: Entity) -> StorageResult<&T> {
        let type_index = self.registered::<T>()?;
        let location = self.locate(entity)?;
        let chunk = self.live_chunk(location.chunk)?;
        let position = self
            .archetypes
            .view(chunk.archetype())
            .shared_position(type_index)
            .ok_or_else(|| {
                StorageError::structural(format!(
                    "entity {entity} has no shared component {type_index}"
                ))
            })?;
        self.shared
            .get_typed::<T>(type_index, chunk.shared_indices()[position])
            .ok_or_else(|| {
                StorageError::structural(format!("no shared value for {type_index}"))
            })
    }

    /// Adds a shared component if missing, then sets its value.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`], or
    /// [`StorageError::InvalidStructuralRequest`] if `T` is not registered as
    /// shared.
    pub fn add_shared_component<T: SharedComponent>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> StorageResult<()> {
        let type_index = self.registered::<T>()?;
        self.assign_shared(entity, type_index, Box::new(value), false)
    }

    /// Sets the shared value of an entity, moving it to a chunk holding that
    /// value.
    ///
    /// # Errors
    ///
    /// As [`EntityStore::add_shared_component`], plus
    /// [`StorageError::InvalidStructuralRequest`] if the entity lacks `T`.
    pub fn set_shared_component<T: SharedComponent>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> StorageResult<()> {
        let type_index = self.registered::<T>()?;
        self.assign_shared(entity, type_index, Box::new(value), true)
    }

    /// Type-erased shared value assignment. Used by command playback.
    pub(crate) fn assign_shared(
        &mut self,
        entity: Entity,
        type_index: TypeIndex,
        value: Box<dyn SharedValue>,
        must_exist: bool,
    ) -> StorageResult<()> {
        let info = self.type_info(type_index)?;
        if !info.is_shared() {
            return Err(StorageError::structural(format!(
                "{} is not a shared component",
                info.name
            )));
        }
        if Any::type_id(value.as_any()) != info.type_id {
            return Err(StorageError::structural(format!(
                "value is not a {}",
                info.name
            )));
        }
        let location = self.locate(entity)?;
        let source = self.live_chunk(location.chunk)?.archetype();
        if must_exist && !self.archetypes.view(source).contains(type_index) {
            return Err(StorageError::structural(format!(
                "entity {entity} has no shared component {type_index}"
            )));
        }

        let target = self.archetypes.with_added(source, &[type_index])?;
        let mut shared_key = self.shared_key_for(self.live_chunk(location.chunk)?, target);
        let Some(position) = self.archetypes.view(target).shared_position(type_index) else {
            return Err(StorageError::structural(format!(
                "archetype {target} has no slot for {type_index}"
            )));
        };
        self.sync_types(
            self.archetypes
                .view(source)
                .types
                .iter()
                .copied()
                .chain([type_index]),
        );

        // The temporary reference keeps the value alive until a chunk holds it.
        let index = self.shared.acquire(type_index, value);
        shared_key[position] = index;
        let moved = self.move_batch(
            EntityBatch {
                chunk: location.chunk,
                start: location.index_in_chunk,
                count: 1,
            },
            target,
            &shared_key,
        );
        self.shared.release(index);
        moved
    }

    // =========================================================================
    // Enabled bits
    // =========================================================================

    /// Returns `true` if the entity's component is enabled.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`], or
    /// [`StorageError::InvalidStructuralRequest`] if the entity lacks the type.
    pub fn is_component_enabled(
        &self,
        entity: Entity,
        type_index: TypeIndex,
    ) -> StorageResult<bool> {
        self.type_info(type_index)?;
        let location = self.locate(entity)?;
        let column = self.entity_column(location.chunk, entity, type_index)?;
        Ok(self
            .live_chunk(location.chunk)?
            .enabled()
            .is_enabled(column.column, location.index_in_chunk as usize))
    }

    /// Enables or disables an entity's component. Safe to call from many
    /// threads at once.
    ///
    /// Returns `true` if the bit flipped.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::is_component_enabled`].
    pub fn set_component_enabled(
        &self,
        entity: Entity,
        type_index: TypeIndex,
        enabled: bool,
    ) -> StorageResult<bool> {
        self.type_info(type_index)?;
        let location = self.locate(entity)?;
        let column = self.entity_column(location.chunk, entity, type_index)?;
        Ok(self.live_chunk(location.chunk)?.enabled().set_enabled(
            column.column,
            location.index_in_chunk as usize,
            enabled,
        ))
    }

    /// Snapshot of the enabled-bit words of a chunk column. Bits past the
    /// entity count are zero.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] for a stale chunk or a chunk
    /// without that column.
    pub fn chunk_enabled_bits(
        &self,
        chunk: ChunkId,
        type_index: TypeIndex,
    ) -> StorageResult<Vec<u64>> {
        let column = self.chunk_column(chunk, type_index)?;
        Ok(self.live_chunk(chunk)?.enabled().word_snapshot(column.column))
    }

    /// Number of disabled entities in a chunk column.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::chunk_enabled_bits`].
    pub fn chunk_disabled_count(&self, chunk: ChunkId, type_index: TypeIndex) -> StorageResult<u32> {
        let column = self.chunk_column(chunk, type_index)?;
        Ok(self.live_chunk(chunk)?.enabled().disabled_count(column.column))
    }

    // =========================================================================
    // Change tracking
    // =========================================================================

    /// Current global system version.
    #[inline]
    #[must_use]
    pub fn global_system_version(&self) -> u32 {
        self.version.get()
    }

    /// Advances the global system version. Never returns 0.
    pub fn increment_global_system_version(&mut self) -> u32 {
        self.version.increment()
    }

    /// Version of the last mutable access to a type in a chunk.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] for a stale chunk or a type
    /// the chunk's archetype lacks.
    pub fn chunk_change_version(&self, chunk: ChunkId, type_index: TypeIndex) -> StorageResult<u32> {
        let live = self.live_chunk(chunk)?;
        let position = self
            .archetypes
            .view(live.archetype())
            .type_position(type_index)
            .ok_or_else(|| {
                StorageError::structural(format!(
                    "chunk {} has no component {type_index}",
                    chunk.index()
                ))
            })?;
        Ok(live.change_version(position))
    }

    /// Returns `true` if the type was written in the chunk after `required`.
    ///
    /// # Errors
    ///
    /// See [`EntityStore::chunk_change_version`].
    pub fn did_change(
        &self,
        chunk: ChunkId,
        type_index: TypeIndex,
        required: u32,
    ) -> StorageResult<bool> {
        Ok(crate::sync::did_change(
            self.chunk_change_version(chunk, type_index)?,
            required,
        ))
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Borrowed view of an archetype.
    #[must_use]
    pub fn archetype(&self, id: ArchetypeId) -> Option<ArchetypeView<'_>> {
        self.archetypes.get(id)
    }

    /// Number of archetypes created so far.
    #[must_use]
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Chunks of an archetype. Empty for unknown ids.
    #[must_use]
    pub fn archetype_chunks(&self, id: ArchetypeId) -> &[ChunkId] {
        self.archetypes.get(id).map_or(&[], |view| view.chunks)
    }

    /// A live chunk.
    #[must_use]
    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    /// Number of allocated chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of live entities, destroyed entities awaiting cleanup included.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entity_table.len()
    }

    /// Number of spilled buffer payloads.
    #[must_use]
    pub fn buffer_heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Stored shared values.
    #[must_use]
    pub fn shared_values(&self) -> &SharedComponentStore {
        &self.shared
    }

    /// The tracker jobs register their component access with.
    #[must_use]
    pub fn access_tracker(&self) -> &Arc<AccessTracker> {
        &self.access
    }

    /// A handle that goes stale with the next structural change touching
    /// `type_index`.
    #[must_use]
    pub fn safety_handle(&self, type_index: TypeIndex) -> SafetyHandle {
        self.access.safety_handle(type_index)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    fn locate(&self, entity: Entity) -> StorageResult<EntityLocation> {
        self.entity_table
            .resolve(entity)
            .ok_or(StorageError::InvalidEntity(entity))
    }

    fn archetype_view(&self, id: ArchetypeId) -> StorageResult<ArchetypeView<'_>> {
        self.archetypes
            .get(id)
            .ok_or_else(|| StorageError::structural(format!("unknown archetype {id}")))
    }

    pub(super) fn live_chunk(&self, id: ChunkId) -> StorageResult<&Chunk> {
        self.chunks.get(id).ok_or_else(|| stale_chunk(id))
    }

    fn registered<T: 'static>(&self) -> StorageResult<TypeIndex> {
        self.types.type_index::<T>().ok_or_else(|| {
            StorageError::structural(format!(
                "unregistered component type {}",
                std::any::type_name::<T>()
            ))
        })
    }

    fn data_type<T: Component>(&self) -> StorageResult<TypeIndex> {
        let type_index = self.registered::<T>()?;
        let info = self.type_info(type_index)?;
        if info.kind != ComponentKind::Data {
            return Err(StorageError::structural(format!(
                "{} has no data ({:?})",
                info.name, info.kind
            )));
        }
        Ok(type_index)
    }

    fn check_types(&self, types: &[TypeIndex]) -> StorageResult<()> {
        for &type_index in types {
            self.type_info(type_index)?;
            if type_index == TypeIndex::CLEANUP_ENTITY {
                return Err(StorageError::structural(
                    "the cleanup marker is managed by the store",
                ));
            }
        }
        Ok(())
    }

    fn column_ref(&self, chunk: ChunkId, type_index: TypeIndex) -> Option<ColumnRef> {
        let view = self.archetypes.view(self.chunks.get(chunk)?.archetype());
        let column = view.column_position(type_index)?;
        Some(ColumnRef {
            column,
            position: view.type_position(type_index)?,
            offset: view.offsets[column],
            size: view.sizes[column],
        })
    }

    fn entity_column(
        &self,
        chunk: ChunkId,
        entity: Entity,
        type_index: TypeIndex,
    ) -> StorageResult<ColumnRef> {
        self.column_ref(chunk, type_index).ok_or_else(|| {
            StorageError::structural(format!("entity {entity} has no component {type_index}"))
        })
    }

    fn chunk_column(&self, chunk: ChunkId, type_index: TypeIndex) -> StorageResult<ColumnRef> {
        self.live_chunk(chunk)?;
        self.column_ref(chunk, type_index).ok_or_else(|| {
            StorageError::structural(format!(
                "chunk {} has no column for {type_index}",
                chunk.index()
            ))
        })
    }
}
