//! # Aligned Memory Blocks
//!
//! Every fixed-size region in the engine (arena blocks, chunk data, spilled
//! buffer payloads) is a run of 64-byte cache lines. Byte and typed views are
//! produced with `bytemuck` casts, so no raw pointer math leaves this module.

use bytemuck::{Pod, Zeroable};

/// Size of a cache line in bytes. Also the maximum supported alignment.
pub const CACHE_LINE_SIZE: usize = 64;

/// One cache line of raw storage.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(64))]
pub struct CacheLine([u8; CACHE_LINE_SIZE]);

/// A zero-initialised, 64-byte aligned heap block.
///
/// The block is released back to the system allocator when dropped.
#[derive(Clone)]
pub struct AlignedBlock {
    lines: Box<[CacheLine]>,
    len: usize,
}

impl AlignedBlock {
    /// Allocates a zeroed block of at least `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        let line_count = len.div_ceil(CACHE_LINE_SIZE).max(1);
        Self {
            lines: vec![CacheLine::zeroed(); line_count].into_boxed_slice(),
            len,
        }
    }

    /// Usable length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the block has no usable bytes.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole block as bytes.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.lines)[..self.len]
    }

    /// The whole block as mutable bytes.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut(&mut self.lines)[..len]
    }

    /// Typed view of `count` values starting at byte `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds or `offset` is not aligned for `T`.
    #[inline]
    #[must_use]
    pub fn typed<T: Pod>(&self, offset: usize, count: usize) -> &[T] {
        let size = std::mem::size_of::<T>() * count;
        bytemuck::cast_slice(&self.bytes()[offset..offset + size])
    }

    /// Mutable typed view of `count` values starting at byte `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds or `offset` is not aligned for `T`.
    #[inline]
    pub fn typed_mut<T: Pod>(&mut self, offset: usize, count: usize) -> &mut [T] {
        let size = std::mem::size_of::<T>() * count;
        bytemuck::cast_slice_mut(&mut self.bytes_mut()[offset..offset + size])
    }
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
