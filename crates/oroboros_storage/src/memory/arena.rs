//! # Arena Allocator
//!
//! An append-only block arena backing archetype metadata. Nothing allocated
//! here is ever freed individually: metadata lives until the arena is disposed
//! together with its store.

use std::marker::PhantomData;

use bytemuck::Pod;

use super::block::{align_up, AlignedBlock, CACHE_LINE_SIZE};
use crate::error::{StorageError, StorageResult};

/// Default block size: 64 KiB.
pub const DEFAULT_ARENA_BLOCK_SIZE: usize = 64 * 1024;

/// Handle to a run of `T` values living inside an [`Arena`].
///
/// Handles are plain coordinates (block, offset, length) and are resolved
/// through [`Arena::slice`]. They stay valid until [`Arena::dispose`].
pub struct ArenaSlice<T> {
    block: u32,
    offset: u32,
    len: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ArenaSlice<T> {
    /// An empty slice that resolves without touching any block.
    pub const EMPTY: Self = Self {
        block: 0,
        offset: 0,
        len: 0,
        _marker: PhantomData,
    };

    /// Number of elements.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns `true` if the slice holds no elements.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Clone for ArenaSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArenaSlice<T> {}

impl<T> std::fmt::Debug for ArenaSlice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaSlice")
            .field("block", &self.block)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// A bump-pointer arena made of fixed-size, cache-line aligned blocks.
///
/// Allocation bumps a cursor inside the newest block; when the block is full
/// a fresh one is appended. There is no reset and no per-allocation free.
///
/// # Example
///
/// ```rust,ignore
/// let mut arena = Arena::new(64 * 1024);
/// let offsets = arena.alloc_slice_copy(&[0u32, 8124])?;
/// assert_eq!(arena.slice(offsets), &[0, 8124]);
/// ```
pub struct Arena {
    /// Blocks in allocation order; the last one is the bump target.
    blocks: Vec<AlignedBlock>,
    /// Offset of the next free byte in the last block.
    cursor: usize,
    /// Size of every block in bytes.
    block_size: usize,
    /// Bytes handed out, padding included.
    used: usize,
}

impl Arena {
    /// Creates an empty arena. No block is allocated until first use.
    ///
    /// `block_size` is rounded up to a whole number of cache lines.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            cursor: 0,
            block_size: align_up(block_size.max(CACHE_LINE_SIZE), CACHE_LINE_SIZE),
            used: 0,
        }
    }

    /// Creates an arena with 64 KiB blocks.
    #[must_use]
    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_ARENA_BLOCK_SIZE)
    }

    /// Size of each block in bytes.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks currently owned.
    #[inline]
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes handed out so far, alignment padding included.
    #[inline]
    #[must_use]
    pub const fn used_bytes(&self) -> usize {
        self.used
    }

    /// Reserves `bytes` bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// [`StorageError::CapacityExceeded`] if the request cannot fit in a single
    /// block or asks for more than cache-line alignment.
    pub fn allocate(&mut self, bytes: usize, alignment: usize) -> StorageResult<ArenaSlice<u8>> {
        debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        if alignment > CACHE_LINE_SIZE {
            return Err(StorageError::CapacityExceeded {
                requested: alignment,
                limit: CACHE_LINE_SIZE,
            });
        }
        if bytes > self.block_size {
            return Err(StorageError::CapacityExceeded {
                requested: bytes,
                limit: self.block_size,
            });
        }
        if bytes == 0 {
            return Ok(ArenaSlice::EMPTY);
        }

        let mut offset = align_up(self.cursor, alignment);
        if self.blocks.is_empty() || offset + bytes > self.block_size {
            self.blocks.push(AlignedBlock::zeroed(self.block_size));
            tracing::debug!(
                blocks = self.blocks.len(),
                block_size = self.block_size,
                "arena grew"
            );
            self.cursor = 0;
            offset = 0;
        }

        self.used += offset + bytes - self.cursor;
        self.cursor = offset + bytes;

        Ok(ArenaSlice {
            block: (self.blocks.len() - 1) as u32,
            offset: offset as u32,
            len: bytes as u32,
            _marker: PhantomData,
        })
    }

    /// Reserves a zeroed run of `count` values of `T`.
    ///
    /// # Errors
    ///
    /// See [`Arena::allocate`].
    pub fn alloc_slice<T: Pod>(&mut self, count: usize) -> StorageResult<ArenaSlice<T>> {
        let raw = self.allocate(std::mem::size_of::<T>() * count, std::mem::align_of::<T>())?;
        Ok(ArenaSlice {
            block: raw.block,
            offset: raw.offset,
            len: count as u32,
            _marker: PhantomData,
        })
    }

    /// Copies `values` into the arena.
    ///
    /// # Errors
    ///
    /// See [`Arena::allocate`].
    pub fn alloc_slice_copy<T: Pod>(&mut self, values: &[T]) -> StorageResult<ArenaSlice<T>> {
        let handle = self.alloc_slice::<T>(values.len())?;
        self.slice_mut(handle).copy_from_slice(values);
        Ok(handle)
    }

    /// Resolves a handle to its values.
    ///
    /// # Panics
    ///
    /// Panics if the handle outlived [`Arena::dispose`].
    #[inline]
    #[must_use]
    pub fn slice<T: Pod>(&self, handle: ArenaSlice<T>) -> &[T] {
        if handle.len == 0 || std::mem::size_of::<T>() == 0 {
            return &[];
        }
        self.blocks[handle.block as usize].typed(handle.offset as usize, handle.len as usize)
    }

    /// Resolves a handle to its values, mutably.
    ///
    /// # Panics
    ///
    /// Panics if the handle outlived [`Arena::dispose`].
    #[inline]
    pub fn slice_mut<T: Pod>(&mut self, handle: ArenaSlice<T>) -> &mut [T] {
        if handle.len == 0 || std::mem::size_of::<T>() == 0 {
            return &mut [];
        }
        self.blocks[handle.block as usize].typed_mut(handle.offset as usize, handle.len as usize)
    }

    /// Frees every block. All handles handed out so far become invalid.
    pub fn dispose(&mut self) {
        self.blocks.clear();
        self.blocks.shrink_to_fit();
        self.cursor = 0;
        self.used = 0;
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::with_default_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_allocation() {
        let mut arena = Arena::new(1024);
        let slice = arena.alloc_slice_copy(&[1.0f32, 2.0, 3.0]).unwrap();
        assert_eq!(slice.len(), 3);
        assert_eq!(arena.slice(slice), &[1.0, 2.0, 3.0]);
        assert_eq!(arena.block_count(), 1);
    }

    #[test]
    fn test_arena_alignment() {
        let mut arena = Arena::new(1024);
        let _ = arena.allocate(3, 1).unwrap();
        let aligned = arena.alloc_slice::<u64>(2).unwrap();
        assert_eq!(aligned.offset % 8, 0);
        let line = arena.allocate(10, 64).unwrap();
        assert_eq!(line.offset % 64, 0);
    }

    #[test]
    fn test_arena_appends_blocks() {
        let mut arena = Arena::new(128);
        let first = arena.alloc_slice_copy(&[7u32; 24]).unwrap();
        let second = arena.alloc_slice_copy(&[9u32; 24]).unwrap();
        assert_eq!(arena.block_count(), 2);
        // Older allocations stay readable after growth.
        assert!(arena.slice(first).iter().all(|&v| v == 7));
        assert!(arena.slice(second).iter().all(|&v| v == 9));
    }

    #[test]
    fn test_arena_rejects_oversized() {
        let mut arena = Arena::new(256);
        assert!(matches!(
            arena.allocate(257, 8),
            Err(StorageError::CapacityExceeded {
                requested: 257,
                limit: 256
            })
        ));
        assert!(arena.allocate(16, 128).is_err());
    }

    #[test]
    fn test_arena_dispose() {
        let mut arena = Arena::new(256);
        let _ = arena.alloc_slice::<u32>(8).unwrap();
        assert!(arena.used_bytes() > 0);
        arena.dispose();
        assert_eq!(arena.block_count(), 0);
        assert_eq!(arena.used_bytes(), 0);
        assert!(arena.slice(ArenaSlice::<u32>::EMPTY).is_empty());
    }
}
