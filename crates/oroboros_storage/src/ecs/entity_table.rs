//! # Identity Table
//!
//! Maps entity indices to their current chunk location and generation.
//!
//! ```text
//! slot:  [ chunk | index_in_chunk | generation ]
//!
//! live:  chunk = Some(c), index_in_chunk = slot inside c
//! free:  chunk = None,    index_in_chunk = next free slot (-1 ends the list)
//! ```
//!
//! The free list is intrusive, so the table never allocates except to grow.
//! Growth doubles the backing storage and never shrinks it.

use super::entity::{Entity, EntityLocation};
use super::ChunkId;

/// Minimum number of slots allocated on first growth.
const MIN_CAPACITY: usize = 64;

/// End-of-list marker for the intrusive free list.
const FREE_LIST_END: i32 = -1;

#[derive(Clone, Copy, Debug)]
struct EntitySlot {
    chunk: Option<ChunkId>,
    index_in_chunk: i32,
    generation: u32,
}

/// Generation-checked entity slots with an intrusive free list.
pub struct EntityTable {
    slots: Box<[EntitySlot]>,
    free_head: i32,
    live: usize,
}

impl EntityTable {
    /// Creates an empty table. Storage is allocated on first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Box::new([]),
            free_head: FREE_LIST_END,
            live: 0,
        }
    }

    /// Number of slots currently backed by storage.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live entities.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if no entity is live.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Allocates `count` entities placed at consecutive slots of `chunk`
    /// starting at `first_index`, appending their handles to `out`.
    pub fn allocate(
        &mut self,
        count: usize,
        chunk: ChunkId,
        first_index: u32,
        out: &mut Vec<Entity>,
    ) {
        out.reserve(count);
        for i in 0..count {
            if self.free_head == FREE_LIST_END {
                self.grow();
            }
            let index = self.free_head as usize;
            let slot = &mut self.slots[index];
            self.free_head = slot.index_in_chunk;
            slot.chunk = Some(chunk);
            slot.index_in_chunk = (first_index as usize + i) as i32;
            out.push(Entity::new(index as u32, slot.generation));
        }
        self.live += count;
    }

    /// Frees entities, invalidating their handles.
    ///
    /// The slots are pushed in reverse, so the first entity of the batch is
    /// the first one reused. Callers validate the handles beforehand.
    pub fn free(&mut self, entities: &[Entity]) {
        for &entity in entities.iter().rev() {
            let index = entity.index() as usize;
            let slot = &mut self.slots[index];
            debug_assert_eq!(slot.generation, entity.generation(), "freeing stale entity");
            slot.chunk = None;
            slot.generation = next_generation(slot.generation);
            slot.index_in_chunk = self.free_head;
            self.free_head = index as i32;
        }
        self.live -= entities.len();
    }

    /// Returns the location of a live entity. Never panics on stale handles.
    #[inline]
    #[must_use]
    pub fn resolve(&self, entity: Entity) -> Option<EntityLocation> {
        let slot = self.slots.get(entity.index() as usize)?;
        if slot.generation != entity.generation() {
            return None;
        }
        slot.chunk.map(|chunk| EntityLocation {
            chunk,
            index_in_chunk: slot.index_in_chunk as u32,
        })
    }

    /// Checks if an entity is live.
    #[inline]
    #[must_use]
    pub fn exists(&self, entity: Entity) -> bool {
        self.resolve(entity).is_some()
    }

    /// Current generation of a slot, if the slot exists.
    #[inline]
    #[must_use]
    pub fn generation(&self, index: u32) -> Option<u32> {
        self.slots.get(index as usize).map(|slot| slot.generation)
    }

    /// Patches the location of a live entity after a move or compaction.
    #[inline]
    pub fn set_location(&mut self, index: u32, chunk: ChunkId, index_in_chunk: u32) {
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.chunk.is_some(), "patching a free slot");
        slot.chunk = Some(chunk);
        slot.index_in_chunk = index_in_chunk as i32;
    }

    fn grow(&mut self) {
        let old = self.slots.len();
        let new = (old * 2).max(MIN_CAPACITY);
        let mut slots = Vec::with_capacity(new);
        slots.extend_from_slice(&self.slots);
        // Highest index terminates the list.
        slots.extend((old..new).map(|i| EntitySlot {
            chunk: None,
            index_in_chunk: if i + 1 < new { (i + 1) as i32 } else { FREE_LIST_END },
            generation: 1,
        }));
        self.slots = slots.into_boxed_slice();
        self.free_head = old as i32;
        tracing::debug!(capacity = new, "entity table grew");
    }
}

impl Default for EntityTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Next generation after a free. Wraps and skips the reserved `0`.
#[inline]
const fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SlotPool;

    fn chunk_id() -> ChunkId {
        let mut pool = SlotPool::new();
        pool.insert(())
    }

    #[test]
    fn test_allocate_assigns_consecutive_slots() {
        let mut table = EntityTable::new();
        let chunk = chunk_id();
        let mut out = Vec::new();
        table.allocate(3, chunk, 5, &mut out);

        assert_eq!(out.len(), 3);
        assert_eq!(table.len(), 3);
        for (i, &entity) in out.iter().enumerate() {
            let location = table.resolve(entity).unwrap();
            assert_eq!(location.chunk, chunk);
            assert_eq!(location.index_in_chunk, 5 + i as u32);
            assert_eq!(entity.generation(), 1);
        }
    }

    #[test]
    fn test_free_invalidates_and_reuses_in_order() {
        let mut table = EntityTable::new();
        let chunk = chunk_id();
        let mut out = Vec::new();
        table.allocate(4, chunk, 0, &mut out);

        table.free(&[out[2], out[0]]);
        assert!(!table.exists(out[2]));
        assert!(!table.exists(out[0]));
        assert!(table.exists(out[1]));

        let mut reused = Vec::new();
        table.allocate(2, chunk, 0, &mut reused);
        assert_eq!(reused[0].index(), out[2].index());
        assert_eq!(reused[1].index(), out[0].index());
        assert!(reused[0].generation() > out[2].generation());
    }

    #[test]
    fn test_growth_keeps_locations() {
        let mut table = EntityTable::new();
        let chunk = chunk_id();
        let mut out = Vec::new();
        table.allocate(MIN_CAPACITY, chunk, 0, &mut out);
        assert_eq!(table.capacity(), MIN_CAPACITY);

        table.allocate(1, chunk, 64, &mut out);
        assert_eq!(table.capacity(), MIN_CAPACITY * 2);
        assert_eq!(table.resolve(out[10]).unwrap().index_in_chunk, 10);
        assert_eq!(out[64].index(), 64);
    }

    #[test]
    fn test_resolve_out_of_range() {
        let table = EntityTable::new();
        assert!(table.resolve(Entity::new(1000, 1)).is_none());
        assert!(!table.exists(Entity::NULL));
    }

    #[test]
    fn test_generation_skips_zero() {
        assert_eq!(next_generation(u32::MAX), 1);
        assert_eq!(next_generation(1), 2);
    }
}
