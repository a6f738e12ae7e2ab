//! # Entity Handles
//!
//! Entities are opaque identifiers consisting of:
//! - An index into the identity table
//! - A generation counter for safe reuse
//!
//! Generation `0` is never handed out, so [`Entity::NULL`] can never be live.

use std::fmt;

/// Identifier of an entity.
///
/// The ID is split into two parts:
/// - Lower 32 bits: Index into the identity table
/// - Upper 32 bits: Generation counter for detecting stale references
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Entity(u64);

impl Entity {
    /// The null entity. Never live.
    ///
    /// In a [`CommandBuffer`](crate::CommandBuffer) it stands for the entity
    /// most recently created by that buffer.
    pub const NULL: Self = Self::new(0, 0);

    /// Creates an entity handle from index and generation.
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64))
    }

    /// Returns the index portion of the handle.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Returns the generation portion of the handle.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the packed 64-bit representation.
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Rebuilds a handle from [`Entity::to_bits`].
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Checks if this is the null entity.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({self})")
    }
}

/// Where a live entity's data currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLocation {
    /// Chunk holding the entity.
    pub chunk: super::ChunkId,
    /// Slot inside the chunk, in `[0, count)`.
    pub index_in_chunk: u32,
}
