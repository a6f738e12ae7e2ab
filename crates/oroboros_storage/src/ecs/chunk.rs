//! # Chunks
//!
//! A chunk is one fixed-size data block owned by one archetype. Entities
//! occupy slots `[0, count)` with no holes; each column stores its values
//! contiguously at the offset the archetype assigned:
//!
//! ```text
//! data:      | col 0 [0..capacity) | col 1 [0..capacity) | ... |
//! entities:  [e0, e1, ..., e(count-1)]
//! versions:  one per archetype type
//! enabled:   one bit per slot per column
//! shared:    one value index per shared type
//! ```
//!
//! Slots past `count` are always zeroed, so newly occupied slots start from
//! zeroed component values.

use bytemuck::Pod;

use super::archetype::{ArchetypeId, ArchetypeView};
use super::entity::Entity;
use crate::memory::AlignedBlock;
use crate::sync::EnabledMask;

/// Fixed-size storage for up to `capacity` entities of one archetype.
pub struct Chunk {
    archetype: ArchetypeId,
    data: AlignedBlock,
    entities: Vec<Entity>,
    capacity: u32,
    shared_indices: Box<[u32]>,
    change_versions: Box<[u32]>,
    enabled: EnabledMask,
}

impl Chunk {
    /// Creates an empty chunk for `archetype`, stamped with `version`.
    pub(crate) fn new(
        archetype: &ArchetypeView<'_>,
        data_bytes: usize,
        shared_indices: &[u32],
        version: u32,
    ) -> Self {
        debug_assert_eq!(shared_indices.len(), archetype.shared.len());
        Self {
            archetype: archetype.id,
            data: AlignedBlock::zeroed(data_bytes),
            entities: Vec::with_capacity(archetype.capacity as usize),
            capacity: archetype.capacity,
            shared_indices: shared_indices.into(),
            change_versions: vec![version; archetype.types.len()].into_boxed_slice(),
            enabled: EnabledMask::new(archetype.columns.len(), archetype.capacity as usize),
        }
    }

    /// Archetype currently owning the chunk.
    #[inline]
    #[must_use]
    pub fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    /// Number of live entities.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.entities.len()
    }

    /// Maximum number of entities.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Number of free slots.
    #[inline]
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.capacity() - self.count()
    }

    /// Returns `true` if no entity is stored.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Returns `true` if every slot is occupied.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count() == self.capacity()
    }

    /// Entity ids, by slot.
    #[inline]
    #[must_use]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Shared value indices, one per shared type of the archetype.
    #[inline]
    #[must_use]
    pub fn shared_indices(&self) -> &[u32] {
        &self.shared_indices
    }

    /// Last-write version of the type at `type_position` in the archetype.
    #[inline]
    #[must_use]
    pub fn change_version(&self, type_position: usize) -> u32 {
        self.change_versions[type_position]
    }

    /// Enabled bits of every column.
    #[inline]
    #[must_use]
    pub fn enabled(&self) -> &EnabledMask {
        &self.enabled
    }

    #[inline]
    pub(crate) fn enabled_mut(&mut self) -> &mut EnabledMask {
        &mut self.enabled
    }

    #[inline]
    pub(crate) fn entities_mut(&mut self) -> &mut Vec<Entity> {
        &mut self.entities
    }

    #[inline]
    pub(crate) fn set_change_version(&mut self, type_position: usize, version: u32) {
        self.change_versions[type_position] = version;
    }

    /// Stamps every type of the archetype.
    pub(crate) fn set_all_change_versions(&mut self, version: u32) {
        self.change_versions.fill(version);
    }

    #[inline]
    pub(crate) fn data(&self) -> &[u8] {
        self.data.bytes()
    }

    #[inline]
    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        self.data.bytes_mut()
    }

    /// Live values of a column.
    #[inline]
    pub(crate) fn column<T: Pod>(&self, offset: u32) -> &[T] {
        self.data.typed(offset as usize, self.count())
    }

    /// Live values of a column, mutably.
    #[inline]
    pub(crate) fn column_mut<T: Pod>(&mut self, offset: u32) -> &mut [T] {
        let count = self.count();
        self.data.typed_mut(offset as usize, count)
    }

    /// Bytes of one column cell.
    #[inline]
    pub(crate) fn cell(&self, offset: u32, size: u32, index: usize) -> &[u8] {
        let start = offset as usize + size as usize * index;
        &self.data.bytes()[start..start + size as usize]
    }

    /// Bytes of one column cell, mutably.
    #[inline]
    pub(crate) fn cell_mut(&mut self, offset: u32, size: u32, index: usize) -> &mut [u8] {
        let start = offset as usize + size as usize * index;
        &mut self.data.bytes_mut()[start..start + size as usize]
    }

    /// Hands the chunk to another archetype with an identical column layout.
    pub(crate) fn retarget(
        &mut self,
        archetype: ArchetypeId,
        shared_indices: &[u32],
        change_versions: Vec<u32>,
    ) {
        self.archetype = archetype;
        self.shared_indices = shared_indices.into();
        self.change_versions = change_versions.into_boxed_slice();
    }
}
