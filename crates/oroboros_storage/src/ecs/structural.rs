//! # Structural Changes
//!
//! Moving entities between archetypes, and keeping chunks dense afterwards.
//!
//! ## Move
//!
//! ```text
//! source chunk:      [a b c d e f g]        batch = [b c d]
//!
//! 1. copy the LAST n of the batch into a destination chunk with space
//! 2. fill the gap with the last entities of the chunk:
//!
//!                    [a b c g e f]  -> [a g e f]   (patch = min(n, after))
//!
//! 3. zero the vacated tail, patch identity entries, release empty chunks
//! ```
//!
//! Taking from the end of the batch keeps the rest of the batch at its
//! original indices, so a batch never has to be re-resolved mid-move.
//! Batches of one call are processed in reverse order for the same reason.
//!
//! When a batch spans a whole chunk and the destination has the same column
//! layout (it differs only in shared types or shared values), the chunk is
//! handed to the destination archetype without touching data.

use super::archetype::ArchetypeId;
use super::buffer;
use super::chunk::Chunk;
use super::component::{TypeIndex, TypeInfo};
use super::entity::Entity;
use super::store::EntityStore;
use super::ChunkId;
use crate::error::{StorageError, StorageResult};

/// A contiguous run of entities inside one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntityBatch {
    /// Chunk holding the run.
    pub chunk: ChunkId,
    /// First slot.
    pub start: u32,
    /// Number of entities.
    pub count: u32,
}

/// Which buffer payloads to free when rows leave a chunk.
#[derive(Clone, Copy, Debug)]
pub(super) enum BufferRelease {
    /// The rows are being destroyed.
    All,
    /// The rows move to this archetype; its buffers keep their payloads.
    MissingIn(ArchetypeId),
}

/// Error for a chunk handle that no longer resolves.
pub(super) fn stale_chunk(id: ChunkId) -> StorageError {
    StorageError::structural(format!(
        "stale chunk {}v{}",
        id.index(),
        id.generation()
    ))
}

impl EntityStore {
    /// Groups live entities into contiguous same-chunk batches, sorted by
    /// chunk and slot. Duplicates are merged.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidEntity`] for the first stale handle.
    pub(super) fn batches_for(&self, entities: &[Entity]) -> StorageResult<Vec<EntityBatch>> {
        let mut slots = Vec::with_capacity(entities.len());
        for &entity in entities {
            let location = self
                .entity_table
                .resolve(entity)
                .ok_or(StorageError::InvalidEntity(entity))?;
            slots.push((location.chunk, location.index_in_chunk));
        }
        slots.sort_unstable();
        slots.dedup();

        let mut batches: Vec<EntityBatch> = Vec::new();
        for (chunk, index) in slots {
            match batches.last_mut() {
                Some(batch) if batch.chunk == chunk && batch.start + batch.count == index => {
                    batch.count += 1;
                }
                _ => batches.push(EntityBatch {
                    chunk,
                    start: index,
                    count: 1,
                }),
            }
        }
        Ok(batches)
    }

    /// One whole-chunk batch per chunk of each archetype.
    pub(super) fn batches_for_archetypes(
        &self,
        archetypes: &[ArchetypeId],
    ) -> StorageResult<Vec<EntityBatch>> {
        let mut batches = Vec::new();
        for &id in archetypes {
            for &chunk in self.archetypes.view(id).chunks {
                batches.push(EntityBatch {
                    chunk,
                    start: 0,
                    count: self.live_chunk(chunk)?.count() as u32,
                });
            }
        }
        batches.sort_unstable();
        batches.dedup();
        Ok(batches)
    }

    /// Waits for outstanding jobs on every type in `types` and invalidates
    /// their safety handles.
    pub(super) fn sync_types(&self, types: impl IntoIterator<Item = TypeIndex>) {
        let mut types: Vec<TypeIndex> = types.into_iter().collect();
        types.sort_unstable();
        types.dedup();
        for type_index in types {
            self.access.complete_read_and_write_dependency(type_index);
            self.access.invalidate(type_index);
        }
    }

    /// Shared value key for moving a row of `chunk` into `destination`.
    ///
    /// Shared types the source lacks start at the default value.
    pub(super) fn shared_key_for(&self, chunk: &Chunk, destination: ArchetypeId) -> Vec<u32> {
        let source = self.archetypes.view(chunk.archetype());
        self.archetypes
            .view(destination)
            .shared
            .iter()
            .map(|&type_index| {
                source
                    .shared_position(type_index)
                    .map_or(0, |position| chunk.shared_indices()[position])
            })
            .collect()
    }

    pub(super) fn type_info(&self, type_index: TypeIndex) -> StorageResult<&TypeInfo> {
        self.types.info(type_index).ok_or_else(|| {
            StorageError::structural(format!("unregistered component type {type_index}"))
        })
    }

    /// Places `count` new entities in chunks of `archetype`, appending their
    /// handles to `out`. All components start zeroed and enabled.
    pub(super) fn create_in(
        &mut self,
        archetype: ArchetypeId,
        shared_key: &[u32],
        count: usize,
        out: &mut Vec<Entity>,
    ) -> StorageResult<()> {
        let version = self.version.get();
        let columns = self.archetypes.view(archetype).columns.len();
        let mut remaining = count;
        while remaining > 0 {
            let id = self.chunk_with_space(archetype, shared_key);
            let chunk = self.chunks.get_mut(id).ok_or_else(|| stale_chunk(id))?;
            let start = chunk.count();
            let n = chunk.free_slots().min(remaining);

            let first = out.len();
            self.entity_table.allocate(n, id, start as u32, out);
            chunk.entities_mut().extend_from_slice(&out[first..]);
            let enabled = chunk.enabled_mut();
            for column in 0..columns {
                for index in start..start + n {
                    enabled.occupy(column, index, true);
                }
            }
            chunk.set_all_change_versions(version);

            self.refresh_space(id)?;
            remaining -= n;
        }
        Ok(())
    }

    /// Moves a batch into `destination` with the given shared values.
    pub(super) fn move_batch(
        &mut self,
        batch: EntityBatch,
        destination: ArchetypeId,
        shared_key: &[u32],
    ) -> StorageResult<()> {
        let source_chunk = self.live_chunk(batch.chunk)?;
        let source = source_chunk.archetype();
        if source == destination && source_chunk.shared_indices() == shared_key {
            return Ok(());
        }
        let whole_chunk = batch.start == 0 && batch.count as usize == source_chunk.count();
        if self.archetypes.view(destination).flags.is_cleanup_complete {
            return self.destroy_batch(batch);
        }
        if whole_chunk && self.archetypes.is_layout_compatible(source, destination) {
            return self.retarget_chunk(batch.chunk, destination, shared_key);
        }

        tracing::trace!(
            from = source.as_usize(),
            to = destination.as_usize(),
            start = batch.start,
            count = batch.count,
            "moving batch"
        );
        let mut remaining = batch.count as usize;
        while remaining > 0 {
            let target = self.chunk_with_space(destination, shared_key);
            let n = self.live_chunk(target)?.free_slots().min(remaining);
            let start = batch.start as usize + remaining - n;
            self.clone_rows(batch.chunk, start, n, target)?;
            self.remove_rows(batch.chunk, start, n, BufferRelease::MissingIn(destination))?;
            remaining -= n;
        }

        if self.live_chunk(batch.chunk)?.is_empty() {
            self.release_chunk(batch.chunk);
        }
        Ok(())
    }

    /// Frees every entity of a batch.
    pub(super) fn destroy_batch(&mut self, batch: EntityBatch) -> StorageResult<()> {
        let start = batch.start as usize;
        let count = batch.count as usize;
        let doomed: Vec<Entity> = self.live_chunk(batch.chunk)?.entities()[start..start + count].to_vec();
        self.remove_rows(batch.chunk, start, count, BufferRelease::All)?;
        self.entity_table.free(&doomed);
        if self.live_chunk(batch.chunk)?.is_empty() {
            self.release_chunk(batch.chunk);
        }
        Ok(())
    }

    /// Copies one row into a freshly created slot, deep-copying buffers.
    pub(super) fn copy_row(
        &mut self,
        source: ChunkId,
        source_index: usize,
        destination: ChunkId,
        destination_index: usize,
    ) -> StorageResult<()> {
        let src_chunk = self.live_chunk(source)?;
        let src_view = self.archetypes.view(src_chunk.archetype());
        let dst_view = self.archetypes.view(self.live_chunk(destination)?.archetype());

        let mut cells = Vec::new();
        for (column, &type_index) in dst_view.columns.iter().enumerate() {
            if let Some(position) = src_view.column_position(type_index) {
                cells.push((
                    column,
                    type_index,
                    src_chunk
                        .cell(src_view.offsets[position], src_view.sizes[position], source_index)
                        .to_vec(),
                    src_chunk.enabled().is_enabled(position, source_index),
                ));
            }
        }

        let dst_chunk = self
            .chunks
            .get_mut(destination)
            .ok_or_else(|| stale_chunk(destination))?;
        for (column, type_index, bytes, enabled) in cells {
            let cell = dst_chunk.cell_mut(
                dst_view.offsets[column],
                dst_view.sizes[column],
                destination_index,
            );
            cell.copy_from_slice(&bytes);
            if self.types.info(type_index).is_some_and(TypeInfo::is_buffer) {
                buffer::deep_copy(cell, &mut self.heap);
            }
            if !enabled {
                dst_chunk
                    .enabled()
                    .set_enabled(column, destination_index, false);
            }
        }
        Ok(())
    }

    fn chunk_with_space(&mut self, archetype: ArchetypeId, shared_key: &[u32]) -> ChunkId {
        match self.archetypes.chunk_with_space(archetype, shared_key) {
            Some(chunk) => chunk,
            None => self.allocate_chunk(archetype, shared_key),
        }
    }

    fn allocate_chunk(&mut self, archetype: ArchetypeId, shared_key: &[u32]) -> ChunkId {
        let view = self.archetypes.view(archetype);
        let chunk = Chunk::new(
            &view,
            self.config.chunk_data_bytes(),
            shared_key,
            self.version.get(),
        );
        for &index in shared_key {
            self.shared.add_ref(index);
        }
        let id = self.chunks.insert(chunk);
        self.archetypes.add_chunk(archetype, id, shared_key);
        tracing::debug!(
            archetype = archetype.as_usize(),
            chunk = id.index(),
            chunks = self.chunks.len(),
            "chunk allocated"
        );
        id
    }

    fn release_chunk(&mut self, id: ChunkId) {
        let Some(chunk) = self.chunks.remove(id) else {
            return;
        };
        debug_assert!(chunk.is_empty(), "releasing a chunk with live entities");
        self.archetypes
            .remove_chunk(chunk.archetype(), id, chunk.shared_indices());
        for &index in chunk.shared_indices() {
            self.shared.release(index);
        }
        tracing::debug!(
            archetype = chunk.archetype().as_usize(),
            chunk = id.index(),
            chunks = self.chunks.len(),
            "chunk released"
        );
    }

    fn refresh_space(&mut self, id: ChunkId) -> StorageResult<()> {
        let chunk = self.chunks.get(id).ok_or_else(|| stale_chunk(id))?;
        self.archetypes.set_has_space(
            chunk.archetype(),
            id,
            chunk.shared_indices(),
            !chunk.is_full(),
        );
        Ok(())
    }

    /// Hands a whole chunk to a layout-compatible archetype.
    fn retarget_chunk(
        &mut self,
        id: ChunkId,
        destination: ArchetypeId,
        shared_key: &[u32],
    ) -> StorageResult<()> {
        let version = self.version.get();
        let chunk = self.live_chunk(id)?;
        let source = chunk.archetype();
        let old_key = chunk.shared_indices().to_vec();
        let src_view = self.archetypes.view(source);
        let dst_view = self.archetypes.view(destination);
        let versions: Vec<u32> = dst_view
            .types
            .iter()
            .map(|&type_index| match src_view.type_position(type_index) {
                Some(position) if dst_view.shared_position(type_index).is_none() => {
                    chunk.change_version(position)
                }
                _ => version,
            })
            .collect();

        for &index in shared_key {
            self.shared.add_ref(index);
        }
        for &index in &old_key {
            self.shared.release(index);
        }
        self.archetypes.remove_chunk(source, id, &old_key);
        self.archetypes.add_chunk(destination, id, shared_key);
        self.chunks
            .get_mut(id)
            .ok_or_else(|| stale_chunk(id))?
            .retarget(destination, shared_key, versions);
        self.refresh_space(id)?;
        tracing::trace!(
            from = source.as_usize(),
            to = destination.as_usize(),
            chunk = id.index(),
            "chunk retargeted in place"
        );
        Ok(())
    }

    /// Appends rows `[start, start + count)` of `source` to `destination`.
    fn clone_rows(
        &mut self,
        source: ChunkId,
        start: usize,
        count: usize,
        destination: ChunkId,
    ) -> StorageResult<()> {
        let version = self.version.get();
        let (src, dst) = self
            .chunks
            .get2_mut(source, destination)
            .ok_or_else(|| stale_chunk(destination))?;
        let src_view = self.archetypes.view(src.archetype());
        let dst_view = self.archetypes.view(dst.archetype());
        let dst_start = dst.count();

        for (column, &type_index) in dst_view.columns.iter().enumerate() {
            let size = dst_view.sizes[column] as usize;
            let Some(position) = src_view.column_position(type_index) else {
                for index in dst_start..dst_start + count {
                    dst.enabled_mut().occupy(column, index, true);
                }
                continue;
            };
            if size > 0 {
                let from = src_view.offsets[position] as usize + start * size;
                let to = dst_view.offsets[column] as usize + dst_start * size;
                dst.data_mut()[to..to + count * size]
                    .copy_from_slice(&src.data()[from..from + count * size]);
            }
            for row in 0..count {
                let enabled = src.enabled().is_enabled(position, start + row);
                dst.enabled_mut().occupy(column, dst_start + row, enabled);
            }
        }

        dst.entities_mut()
            .extend_from_slice(&src.entities()[start..start + count]);
        dst.set_all_change_versions(version);
        for (row, entity) in dst.entities()[dst_start..].iter().enumerate() {
            self.entity_table
                .set_location(entity.index(), destination, (dst_start + row) as u32);
        }
        self.refresh_space(destination)
    }

    /// Removes rows `[start, start + count)` and compacts the chunk.
    fn remove_rows(
        &mut self,
        id: ChunkId,
        start: usize,
        count: usize,
        release: BufferRelease,
    ) -> StorageResult<()> {
        let chunk = self.chunks.get_mut(id).ok_or_else(|| stale_chunk(id))?;
        let view = self.archetypes.view(chunk.archetype());
        let total = chunk.count();
        let end = start + count;
        let patch = count.min(total - end);

        if view.flags.has_buffers {
            let keep = match release {
                BufferRelease::All => None,
                BufferRelease::MissingIn(destination) => Some(self.archetypes.view(destination)),
            };
            for (column, &type_index) in view.columns.iter().enumerate() {
                let is_buffer = self.types.info(type_index).is_some_and(TypeInfo::is_buffer);
                if !is_buffer || keep.is_some_and(|dst| dst.contains(type_index)) {
                    continue;
                }
                for row in start..end {
                    let cell = chunk.cell_mut(view.offsets[column], view.sizes[column], row);
                    buffer::release(cell, &mut self.heap);
                }
            }
        }

        for (column, &size) in view.sizes.iter().enumerate() {
            let size = size as usize;
            if size > 0 {
                let offset = view.offsets[column] as usize;
                let data = chunk.data_mut();
                if patch > 0 {
                    data.copy_within(
                        offset + (total - patch) * size..offset + total * size,
                        offset + start * size,
                    );
                }
                data[offset + (total - count) * size..offset + total * size].fill(0);
            }

            let enabled = chunk.enabled_mut();
            for row in start..end {
                enabled.vacate(column, row);
            }
            for row in 0..patch {
                let from = total - patch + row;
                let bit = enabled.is_enabled(column, from);
                enabled.vacate(column, from);
                enabled.occupy(column, start + row, bit);
            }
        }

        let entities = chunk.entities_mut();
        for row in 0..patch {
            let moved = entities[total - patch + row];
            entities[start + row] = moved;
            self.entity_table
                .set_location(moved.index(), id, (start + row) as u32);
        }
        entities.truncate(total - count);
        self.refresh_space(id)
    }
}
