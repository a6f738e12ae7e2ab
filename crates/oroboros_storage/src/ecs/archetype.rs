//! # Archetype Registry
//!
//! An archetype is the interned set of component types an entity carries.
//! Entities with the same set live in chunks with the same column layout:
//!
//! ```text
//! Archetype {Position, Velocity}, 16 KiB chunk, 128 B header:
//!
//! capacity = floor(16256 / (12 + 12)) = 677
//!
//! | Position x 677 (8124 B) | Velocity x 677 (8124 B) | 8 B unused |
//! ```
//!
//! Columns are laid out in ascending type index order. Shared types take no
//! column space; a chunk stores one value index per shared type instead.
//!
//! Layout metadata lives in the registry's [`Arena`] and is never freed
//! individually. Add/remove transitions are memoized per archetype.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::component::{TypeIndex, TypeRegistry};
use super::ChunkId;
use crate::config::StoreConfig;
use crate::error::{StorageError, StorageResult};
use crate::memory::{align_up, Arena, ArenaSlice};

/// Entity-only archetypes are sized as if each slot held its 8-byte id.
const ENTITY_ONLY_STRIDE: usize = std::mem::size_of::<u64>();

/// Dense archetype identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(u32);

impl ArchetypeId {
    /// Rebuilds an id from [`ArchetypeId::raw`].
    #[inline]
    #[must_use]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Raw value as a table index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "archetype#{}", self.0)
    }
}

/// Cleanup-related facts about an archetype.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchetypeFlags {
    /// Contains at least one cleanup component.
    pub has_cleanup: bool,
    /// Contains the [`CleanupEntity`](super::CleanupEntity) marker.
    pub is_cleanup_entity: bool,
    /// Contains nothing but the marker: entities landing here are freed.
    pub is_cleanup_complete: bool,
    /// Contains at least one buffer component.
    pub has_buffers: bool,
}

/// One interned component set and its chunks.
struct Archetype {
    types: ArenaSlice<TypeIndex>,
    columns: ArenaSlice<TypeIndex>,
    offsets: ArenaSlice<u32>,
    sizes: ArenaSlice<u32>,
    shared: ArenaSlice<TypeIndex>,
    capacity: u32,
    flags: ArchetypeFlags,
    chunks: Vec<ChunkId>,
    /// Chunks with at least one free slot, per shared value key.
    with_space: HashMap<Box<[u32]>, Vec<ChunkId>>,
    add_edges: HashMap<Box<[TypeIndex]>, ArchetypeId>,
    remove_edges: HashMap<Box<[TypeIndex]>, ArchetypeId>,
}

/// Borrowed view of an archetype's layout and chunks.
#[derive(Clone, Copy, Debug)]
pub struct ArchetypeView<'a> {
    /// Identifier.
    pub id: ArchetypeId,
    /// Every type, ascending.
    pub types: &'a [TypeIndex],
    /// Column types (everything but shared types), ascending.
    pub columns: &'a [TypeIndex],
    /// Byte offset of each column inside the chunk data region.
    pub offsets: &'a [u32],
    /// Bytes per entity of each column.
    pub sizes: &'a [u32],
    /// Shared types, ascending.
    pub shared: &'a [TypeIndex],
    /// Entities per chunk.
    pub capacity: u32,
    /// Cleanup facts.
    pub flags: ArchetypeFlags,
    /// Every chunk of the archetype, in allocation order.
    pub chunks: &'a [ChunkId],
}

impl ArchetypeView<'_> {
    /// Position of `type_index` in [`ArchetypeView::types`].
    #[inline]
    #[must_use]
    pub fn type_position(&self, type_index: TypeIndex) -> Option<usize> {
        self.types.binary_search(&type_index).ok()
    }

    /// Position of `type_index` in [`ArchetypeView::columns`].
    #[inline]
    #[must_use]
    pub fn column_position(&self, type_index: TypeIndex) -> Option<usize> {
        self.columns.binary_search(&type_index).ok()
    }

    /// Position of `type_index` in [`ArchetypeView::shared`].
    #[inline]
    #[must_use]
    pub fn shared_position(&self, type_index: TypeIndex) -> Option<usize> {
        self.shared.binary_search(&type_index).ok()
    }

    /// Returns `true` if the archetype contains `type_index`.
    #[inline]
    #[must_use]
    pub fn contains(&self, type_index: TypeIndex) -> bool {
        self.type_position(type_index).is_some()
    }
}

/// Interns archetypes and memoizes the transitions between them.
pub struct ArchetypeRegistry {
    types: Arc<TypeRegistry>,
    arena: Arena,
    archetypes: Vec<Archetype>,
    lookup: HashMap<Box<[TypeIndex]>, ArchetypeId>,
    data_bytes: usize,
    max_types: usize,
}

impl ArchetypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(config: &StoreConfig, types: Arc<TypeRegistry>) -> Self {
        Self {
            types,
            arena: Arena::new(config.arena_block_bytes),
            archetypes: Vec::new(),
            lookup: HashMap::new(),
            data_bytes: config.chunk_data_bytes(),
            max_types: config.max_archetype_types,
        }
    }

    /// The type registry archetypes are built from.
    #[inline]
    #[must_use]
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Number of archetypes created so far.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    /// Returns `true` if no archetype exists yet.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    /// Bytes of layout metadata allocated in the arena.
    #[inline]
    #[must_use]
    pub fn metadata_bytes(&self) -> usize {
        self.arena.used_bytes()
    }

    /// Returns the archetype for a set of types, creating it on first use.
    ///
    /// Order and duplicates in `types` do not matter.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] for unregistered types or too
    /// many types, [`StorageError::CapacityExceeded`] if a single entity does
    /// not fit in a chunk.
    pub fn get_or_create(&mut self, types: &[TypeIndex]) -> StorageResult<ArchetypeId> {
        let canonical = canonicalize(types);
        if let Some(&id) = self.lookup.get(canonical.as_slice()) {
            return Ok(id);
        }
        self.create(canonical.into_boxed_slice())
    }

    /// The archetype with `added` types on top of `archetype`'s.
    ///
    /// # Errors
    ///
    /// See [`ArchetypeRegistry::get_or_create`].
    pub fn with_added(
        &mut self,
        archetype: ArchetypeId,
        added: &[TypeIndex],
    ) -> StorageResult<ArchetypeId> {
        let key = canonicalize(added).into_boxed_slice();
        if let Some(&id) = self.archetypes[archetype.as_usize()].add_edges.get(&key) {
            return Ok(id);
        }
        let mut union = self.view(archetype).types.to_vec();
        union.extend_from_slice(&key);
        let target = self.get_or_create(&union)?;
        self.archetypes[archetype.as_usize()]
            .add_edges
            .insert(key, target);
        Ok(target)
    }

    /// The archetype with `removed` types taken out of `archetype`'s.
    ///
    /// Types the archetype does not contain are ignored.
    ///
    /// # Errors
    ///
    /// See [`ArchetypeRegistry::get_or_create`].
    pub fn with_removed(
        &mut self,
        archetype: ArchetypeId,
        removed: &[TypeIndex],
    ) -> StorageResult<ArchetypeId> {
        let key = canonicalize(removed).into_boxed_slice();
        if let Some(&id) = self.archetypes[archetype.as_usize()]
            .remove_edges
            .get(&key)
        {
            return Ok(id);
        }
        let remaining: Vec<TypeIndex> = self
            .view(archetype)
            .types
            .iter()
            .copied()
            .filter(|t| key.binary_search(t).is_err())
            .collect();
        let target = self.get_or_create(&remaining)?;
        self.archetypes[archetype.as_usize()]
            .remove_edges
            .insert(key, target);
        Ok(target)
    }

    /// Returns `true` if chunks of `a` can be reinterpreted as chunks of `b`
    /// without moving data.
    #[must_use]
    pub fn is_layout_compatible(&self, a: ArchetypeId, b: ArchetypeId) -> bool {
        if a == b {
            return true;
        }
        let (a, b) = (self.view(a), self.view(b));
        a.capacity == b.capacity && a.columns == b.columns && a.offsets == b.offsets
    }

    /// Borrowed view of an archetype.
    ///
    /// # Panics
    ///
    /// Panics if `id` did not come from this registry.
    #[must_use]
    pub fn view(&self, id: ArchetypeId) -> ArchetypeView<'_> {
        let archetype = &self.archetypes[id.as_usize()];
        ArchetypeView {
            id,
            types: self.arena.slice(archetype.types),
            columns: self.arena.slice(archetype.columns),
            offsets: self.arena.slice(archetype.offsets),
            sizes: self.arena.slice(archetype.sizes),
            shared: self.arena.slice(archetype.shared),
            capacity: archetype.capacity,
            flags: archetype.flags,
            chunks: &archetype.chunks,
        }
    }

    /// Checked variant of [`ArchetypeRegistry::view`].
    #[must_use]
    pub fn get(&self, id: ArchetypeId) -> Option<ArchetypeView<'_>> {
        (id.as_usize() < self.archetypes.len()).then(|| self.view(id))
    }

    /// Iterates over every archetype id.
    pub fn ids(&self) -> impl Iterator<Item = ArchetypeId> {
        (0..self.archetypes.len() as u32).map(ArchetypeId)
    }

    /// First chunk of `id` with a free slot and matching shared values.
    #[must_use]
    pub fn chunk_with_space(&self, id: ArchetypeId, shared_key: &[u32]) -> Option<ChunkId> {
        self.archetypes[id.as_usize()]
            .with_space
            .get(shared_key)
            .and_then(|chunks| chunks.first().copied())
    }

    /// Records a newly allocated (empty) chunk.
    pub fn add_chunk(&mut self, id: ArchetypeId, chunk: ChunkId, shared_key: &[u32]) {
        let archetype = &mut self.archetypes[id.as_usize()];
        archetype.chunks.push(chunk);
        archetype
            .with_space
            .entry(shared_key.into())
            .or_default()
            .push(chunk);
    }

    /// Forgets a released chunk.
    pub fn remove_chunk(&mut self, id: ArchetypeId, chunk: ChunkId, shared_key: &[u32]) {
        let archetype = &mut self.archetypes[id.as_usize()];
        archetype.chunks.retain(|&c| c != chunk);
        Self::forget_space(archetype, chunk, shared_key);
    }

    /// Updates whether `chunk` can accept more entities.
    pub fn set_has_space(
        &mut self,
        id: ArchetypeId,
        chunk: ChunkId,
        shared_key: &[u32],
        has_space: bool,
    ) {
        let archetype = &mut self.archetypes[id.as_usize()];
        if has_space {
            let list = archetype.with_space.entry(shared_key.into()).or_default();
            if !list.contains(&chunk) {
                list.push(chunk);
            }
        } else {
            Self::forget_space(archetype, chunk, shared_key);
        }
    }

    fn forget_space(archetype: &mut Archetype, chunk: ChunkId, shared_key: &[u32]) {
        if let Some(list) = archetype.with_space.get_mut(shared_key) {
            list.retain(|&c| c != chunk);
            if list.is_empty() {
                archetype.with_space.remove(shared_key);
            }
        }
    }

    fn create(&mut self, types: Box<[TypeIndex]>) -> StorageResult<ArchetypeId> {
        if types.len() > self.max_types {
            return Err(StorageError::structural(format!(
                "archetype with {} types exceeds the limit of {}",
                types.len(),
                self.max_types
            )));
        }

        let mut columns = Vec::with_capacity(types.len());
        let mut column_info = Vec::with_capacity(types.len());
        let mut shared = Vec::new();
        let mut flags = ArchetypeFlags::default();
        let mut max_capacity = u32::MAX;
        for &type_index in types.iter() {
            let info = self.types.info(type_index).ok_or_else(|| {
                StorageError::structural(format!("unregistered component type {type_index}"))
            })?;
            flags.has_cleanup |= info.cleanup;
            flags.has_buffers |= info.is_buffer();
            if let Some(limit) = info.max_chunk_capacity {
                max_capacity = max_capacity.min(limit);
            }
            if info.is_shared() {
                shared.push(type_index);
            } else {
                columns.push(type_index);
                column_info.push((info.size, info.align));
            }
        }
        flags.is_cleanup_entity = types.contains(&TypeIndex::CLEANUP_ENTITY);
        flags.is_cleanup_complete = types.len() == 1 && flags.is_cleanup_entity;

        let (capacity, offsets) = self.compute_layout(&column_info, max_capacity)?;
        let sizes: Vec<u32> = column_info.iter().map(|&(size, _)| size as u32).collect();

        let archetype = Archetype {
            types: self.arena.alloc_slice_copy(&types)?,
            columns: self.arena.alloc_slice_copy(&columns)?,
            offsets: self.arena.alloc_slice_copy(&offsets)?,
            sizes: self.arena.alloc_slice_copy(&sizes)?,
            shared: self.arena.alloc_slice_copy(&shared)?,
            capacity,
            flags,
            chunks: Vec::new(),
            with_space: HashMap::new(),
            add_edges: HashMap::new(),
            remove_edges: HashMap::new(),
        };

        let id = ArchetypeId(self.archetypes.len() as u32);
        self.archetypes.push(archetype);
        self.lookup.insert(types, id);
        tracing::debug!(
            archetype = id.0,
            columns = columns.len(),
            shared = shared.len(),
            capacity,
            "archetype created"
        );
        Ok(id)
    }

    /// Largest capacity whose aligned column layout fits the data region.
    fn compute_layout(
        &self,
        columns: &[(usize, usize)],
        max_capacity: u32,
    ) -> StorageResult<(u32, Vec<u32>)> {
        let stride: usize = columns.iter().map(|&(size, _)| size).sum();
        let stride = if stride == 0 { ENTITY_ONLY_STRIDE } else { stride };
        let mut capacity = (self.data_bytes / stride).min(max_capacity as usize);

        while capacity > 0 {
            let mut offsets = Vec::with_capacity(columns.len());
            let mut end = 0usize;
            for &(size, align) in columns {
                end = align_up(end, align);
                offsets.push(end as u32);
                end += size * capacity;
            }
            if end <= self.data_bytes {
                return Ok((capacity as u32, offsets));
            }
            capacity -= 1;
        }

        Err(StorageError::CapacityExceeded {
            requested: stride,
            limit: self.data_bytes,
        })
    }
}

/// Sorts and deduplicates a type list.
fn canonicalize(types: &[TypeIndex]) -> Vec<TypeIndex> {
    let mut canonical = types.to_vec();
    canonical.sort_unstable();
    canonical.dedup();
    canonical
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{Component, SharedComponent};
    use bytemuck::{Pod, Zeroable};

    #[allow(dead_code)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Position([f32; 3]);
    impl Component for Position {}

    #[allow(dead_code)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Velocity([f32; 3]);
    impl Component for Velocity {}

    #[allow(dead_code)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Wide([u64; 3]);
    impl Component for Wide {
        const MAX_CHUNK_CAPACITY: Option<u32> = Some(100);
    }

    #[allow(dead_code)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Terrain([u64; 2048]);
    impl Component for Terrain {}

    #[allow(dead_code)]
    #[derive(Clone, Default, PartialEq, Eq, Hash)]
    struct Team(u8);
    impl SharedComponent for Team {}

    struct Fixture {
        registry: ArchetypeRegistry,
        position: TypeIndex,
        velocity: TypeIndex,
        wide: TypeIndex,
        terrain: TypeIndex,
        team: TypeIndex,
    }

    fn fixture() -> Fixture {
        let mut types = TypeRegistry::new();
        let position = types.register::<Position>().unwrap();
        let velocity = types.register::<Velocity>().unwrap();
        let wide = types.register::<Wide>().unwrap();
        let terrain = types.register::<Terrain>().unwrap();
        let team = types.register_shared::<Team>().unwrap();
        Fixture {
            registry: ArchetypeRegistry::new(&StoreConfig::default(), types.freeze()),
            position,
            velocity,
            wide,
            terrain,
            team,
        }
    }

    #[test]
    fn test_position_velocity_capacity() {
        let mut f = fixture();
        let id = f.registry.get_or_create(&[f.velocity, f.position]).unwrap();
        let view = f.registry.view(id);
        assert_eq!(view.capacity, 677);
        assert_eq!(view.offsets, &[0, 8124]);
        assert!(view.capacity as usize * 24 <= 16_256);
    }

    #[test]
    fn test_interning_ignores_order_and_duplicates() {
        let mut f = fixture();
        let a = f.registry.get_or_create(&[f.position, f.velocity]).unwrap();
        let b = f
            .registry
            .get_or_create(&[f.velocity, f.position, f.velocity])
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(f.registry.len(), 1);
    }

    #[test]
    fn test_add_remove_round_trip() {
        let mut f = fixture();
        let a = f.registry.get_or_create(&[f.position]).unwrap();
        let b = f.registry.with_added(a, &[f.velocity]).unwrap();
        assert_ne!(a, b);
        assert_eq!(f.registry.with_removed(b, &[f.velocity]).unwrap(), a);
        // Memoized.
        assert_eq!(f.registry.with_added(a, &[f.velocity]).unwrap(), b);
        // Unchanged set.
        assert_eq!(f.registry.with_added(b, &[f.position]).unwrap(), b);
    }

    #[test]
    fn test_max_chunk_capacity_clamps() {
        let mut f = fixture();
        let id = f.registry.get_or_create(&[f.wide, f.position]).unwrap();
        assert_eq!(f.registry.view(id).capacity, 100);
    }

    #[test]
    fn test_shared_types_take_no_column() {
        let mut f = fixture();
        let plain = f.registry.get_or_create(&[f.position]).unwrap();
        let shared = f.registry.get_or_create(&[f.position, f.team]).unwrap();
        let view = f.registry.view(shared);
        assert_eq!(view.columns, &[f.position]);
        assert_eq!(view.shared, &[f.team]);
        assert!(f.registry.is_layout_compatible(plain, shared));
    }

    #[test]
    fn test_cleanup_complete_flag() {
        let mut f = fixture();
        let id = f
            .registry
            .get_or_create(&[TypeIndex::CLEANUP_ENTITY])
            .unwrap();
        let flags = f.registry.view(id).flags;
        assert!(flags.is_cleanup_entity);
        assert!(flags.is_cleanup_complete);
        assert!(!flags.has_cleanup);
    }

    #[test]
    fn test_rejects_invalid_requests() {
        let mut f = fixture();
        assert!(matches!(
            f.registry.get_or_create(&[TypeIndex::from_raw(99)]),
            Err(StorageError::InvalidStructuralRequest(_))
        ));

        let config = StoreConfig {
            max_archetype_types: 1,
            ..StoreConfig::default()
        };
        let mut small = ArchetypeRegistry::new(&config, Arc::clone(&f.registry.types));
        assert!(small.get_or_create(&[f.position, f.velocity]).is_err());
        assert!(small.is_empty());
    }

    #[test]
    fn test_oversized_entity_exceeds_capacity() {
        let mut f = fixture();
        assert_eq!(
            f.registry.get_or_create(&[f.terrain, f.position]),
            Err(StorageError::CapacityExceeded {
                requested: 16_396,
                limit: 16_256,
            })
        );
        assert!(f.registry.is_empty());
    }

    #[test]
    fn test_space_tracking_per_shared_key() {
        let mut f = fixture();
        let id = f.registry.get_or_create(&[f.position, f.team]).unwrap();
        let mut pool = crate::memory::SlotPool::new();
        let chunk = pool.insert(());

        f.registry.add_chunk(id, chunk, &[3]);
        assert_eq!(f.registry.chunk_with_space(id, &[3]), Some(chunk));
        assert_eq!(f.registry.chunk_with_space(id, &[0]), None);

        f.registry.set_has_space(id, chunk, &[3], false);
        assert_eq!(f.registry.chunk_with_space(id, &[3]), None);
        f.registry.remove_chunk(id, chunk, &[3]);
        assert!(f.registry.view(id).chunks.is_empty());
    }
}
