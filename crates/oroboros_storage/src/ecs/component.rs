//! # Component Types
//!
//! Components are pure data containers with no behavior. Every component type
//! used by a store is registered once in a [`TypeRegistry`], which assigns it a
//! dense [`TypeIndex`] and records the layout facts the archetype registry
//! needs. The registry is frozen into an `Arc` and handed to each store.
//!
//! Kinds of component:
//! - **Data**: a `Pod` value stored in a chunk column
//! - **Tag**: zero-sized, membership only
//! - **Buffer**: a growable list of `Pod` elements, inline in the column up to
//!   an internal capacity and spilled to the heap beyond it. Each buffer is
//!   its own marker type, so two buffers may share an element type
//! - **Shared**: one value per chunk, stored in the shared value table
//!
//! Data and tag components may also be registered as *cleanup* components,
//! which keep a destroyed entity alive until they are removed.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use super::buffer::{BufferHeader, BUFFER_HEADER_SIZE};
use super::shared::SharedValue;
use crate::error::{StorageError, StorageResult};
use crate::memory::{align_up, CACHE_LINE_SIZE};

/// Marker trait for chunk-stored components.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone, Copy, Default, Pod, Zeroable)]
/// #[repr(C)]
/// struct Position {
///     x: f32,
///     y: f32,
///     z: f32,
/// }
///
/// impl Component for Position {}
/// ```
pub trait Component: Copy + Pod + Zeroable + Send + Sync + 'static {
    /// Upper bound on entities per chunk for archetypes containing this type.
    const MAX_CHUNK_CAPACITY: Option<u32> = None;
}

/// Element type of a dynamic buffer component.
pub trait BufferElement: Copy + Pod + Zeroable + Send + Sync + 'static {}

macro_rules! impl_buffer_element {
    ($($ty:ty),* $(,)?) => {
        $(impl BufferElement for $ty {})*
    };
}

impl_buffer_element!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Marker type of a dynamic buffer component.
///
/// # Example
///
/// ```rust,ignore
/// struct Waypoints;
///
/// impl BufferComponent for Waypoints {
///     type Element = u32;
///     const INTERNAL_CAPACITY: u32 = 4;
/// }
/// ```
pub trait BufferComponent: Send + Sync + 'static {
    /// Type of one element.
    type Element: BufferElement;
    /// Elements stored inline in the chunk column before spilling.
    const INTERNAL_CAPACITY: u32;
}

/// A component whose value is shared by every entity of a chunk.
pub trait SharedComponent: Clone + PartialEq + Hash + Default + Send + Sync + 'static {}

/// Dense index of a registered component type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
#[repr(transparent)]
pub struct TypeIndex(u32);

impl TypeIndex {
    /// The built-in [`CleanupEntity`] marker. Always registered first.
    pub const CLEANUP_ENTITY: Self = Self(0);

    /// Creates a type index from its raw value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
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

impl fmt::Display for TypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Marker added to destroyed entities that still carry cleanup components.
///
/// An entity whose only remaining type is this marker is freed.
#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupEntity;

/// Storage class of a registered type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentKind {
    /// Plain data in a column.
    Data,
    /// Zero-sized membership marker.
    Tag,
    /// Dynamic buffer: header plus inline elements in the column.
    Buffer {
        /// Size of one element.
        element_size: u32,
        /// Alignment of one element.
        element_align: u32,
        /// Elements stored inline before spilling to the heap.
        internal_capacity: u32,
    },
    /// Per-chunk shared value.
    Shared,
}

/// Layout facts for one registered type.
#[derive(Clone, Debug)]
pub struct TypeInfo {
    /// Rust type name, for diagnostics.
    pub name: &'static str,
    /// Rust type identity.
    pub type_id: TypeId,
    /// Bytes per entity in the chunk column. Zero for tags and shared types.
    pub size: usize,
    /// Column alignment.
    pub align: usize,
    /// Storage class.
    pub kind: ComponentKind,
    /// Keeps destroyed entities alive until removed.
    pub cleanup: bool,
    /// Per-type chunk capacity limit.
    pub max_chunk_capacity: Option<u32>,
    pub(crate) shared_default: Option<fn() -> Box<dyn SharedValue>>,
}

impl TypeInfo {
    /// Returns `true` if the type occupies a chunk column (everything but
    /// shared types; tags have an empty column but still carry enabled bits).
    #[inline]
    #[must_use]
    pub const fn is_column(&self) -> bool {
        !matches!(self.kind, ComponentKind::Shared)
    }

    /// Returns `true` for shared types.
    #[inline]
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(self.kind, ComponentKind::Shared)
    }

    /// Returns `true` for buffer types.
    #[inline]
    #[must_use]
    pub const fn is_buffer(&self) -> bool {
        matches!(self.kind, ComponentKind::Buffer { .. })
    }
}

/// Table of every component type a store may use.
///
/// Built once at startup, then frozen with [`TypeRegistry::freeze`].
///
/// # Example
///
/// ```rust,ignore
/// let mut types = TypeRegistry::new();
/// let position = types.register::<Position>()?;
/// let store = EntityStore::new(StoreConfig::default(), types.freeze())?;
/// ```
pub struct TypeRegistry {
    infos: Vec<TypeInfo>,
    by_type_id: HashMap<TypeId, TypeIndex>,
}

impl TypeRegistry {
    /// Creates a registry holding only the built-in [`CleanupEntity`] marker.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            infos: Vec::new(),
            by_type_id: HashMap::new(),
        };
        registry.push(TypeInfo {
            name: std::any::type_name::<CleanupEntity>(),
            type_id: TypeId::of::<CleanupEntity>(),
            size: 0,
            align: 1,
            kind: ComponentKind::Tag,
            cleanup: false,
            max_chunk_capacity: None,
            shared_default: None,
        });
        registry
    }

    /// Registers a data component (or a tag, if `T` is zero-sized).
    ///
    /// Registering the same type twice with the same kind returns the same index.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] if `T` is already registered
    /// with a different kind.
    pub fn register<T: Component>(&mut self) -> StorageResult<TypeIndex> {
        self.insert(Self::data_info::<T>(false))
    }

    /// Registers a zero-sized tag that needs no `Pod` implementation.
    ///
    /// # Errors
    ///
    /// See [`TypeRegistry::register`].
    pub fn register_tag<T: Send + Sync + 'static>(&mut self) -> StorageResult<TypeIndex> {
        self.insert(TypeInfo {
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            size: 0,
            align: 1,
            kind: ComponentKind::Tag,
            cleanup: false,
            max_chunk_capacity: None,
            shared_default: None,
        })
    }

    /// Registers a cleanup component.
    ///
    /// # Errors
    ///
    /// See [`TypeRegistry::register`].
    pub fn register_cleanup<T: Component>(&mut self) -> StorageResult<TypeIndex> {
        self.insert(Self::data_info::<T>(true))
    }

    /// Registers a dynamic buffer component.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] if the element type is
    /// zero-sized or aligned above 16 bytes, or `B` is already registered
    /// differently.
    pub fn register_buffer<B: BufferComponent>(&mut self) -> StorageResult<TypeIndex> {
        let element_size = std::mem::size_of::<B::Element>();
        let element_align = std::mem::align_of::<B::Element>();
        let internal_capacity = B::INTERNAL_CAPACITY;
        if element_size == 0 {
            return Err(StorageError::structural(format!(
                "buffer element {} is zero-sized",
                std::any::type_name::<B::Element>()
            )));
        }
        if element_align > BUFFER_HEADER_SIZE {
            return Err(StorageError::structural(format!(
                "buffer element {} is aligned to {element_align} bytes",
                std::any::type_name::<B::Element>()
            )));
        }
        let align = element_align.max(std::mem::align_of::<BufferHeader>());
        let size = align_up(
            BUFFER_HEADER_SIZE + element_size * internal_capacity as usize,
            align,
        );
        self.insert(TypeInfo {
            name: std::any::type_name::<B>(),
            type_id: TypeId::of::<B>(),
            size,
            align,
            kind: ComponentKind::Buffer {
                element_size: element_size as u32,
                element_align: element_align as u32,
                internal_capacity,
            },
            cleanup: false,
            max_chunk_capacity: None,
            shared_default: None,
        })
    }

    /// Registers a shared component.
    ///
    /// # Errors
    ///
    /// See [`TypeRegistry::register`].
    pub fn register_shared<T: SharedComponent>(&mut self) -> StorageResult<TypeIndex> {
        fn default_value<T: SharedComponent>() -> Box<dyn SharedValue> {
            Box::new(T::default())
        }

        self.insert(TypeInfo {
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            size: 0,
            align: 1,
            kind: ComponentKind::Shared,
            cleanup: false,
            max_chunk_capacity: None,
            shared_default: Some(default_value::<T>),
        })
    }

    /// Looks up the index of a registered type.
    #[inline]
    #[must_use]
    pub fn type_index<T: 'static>(&self) -> Option<TypeIndex> {
        self.by_type_id.get(&TypeId::of::<T>()).copied()
    }

    /// Returns layout facts for a type index.
    #[inline]
    #[must_use]
    pub fn info(&self, index: TypeIndex) -> Option<&TypeInfo> {
        self.infos.get(index.as_usize())
    }

    /// Number of registered types, the built-in marker included.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Always `false`: the built-in marker is registered on construction.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Iterates over every registered type.
    pub fn iter(&self) -> impl Iterator<Item = (TypeIndex, &TypeInfo)> {
        self.infos
            .iter()
            .enumerate()
            .map(|(i, info)| (TypeIndex(i as u32), info))
    }

    /// Freezes the registry for sharing between stores.
    #[must_use]
    pub fn freeze(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn data_info<T: Component>(cleanup: bool) -> TypeInfo {
        let size = std::mem::size_of::<T>();
        TypeInfo {
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            size,
            align: std::mem::align_of::<T>(),
            kind: if size == 0 {
                ComponentKind::Tag
            } else {
                ComponentKind::Data
            },
            cleanup,
            max_chunk_capacity: T::MAX_CHUNK_CAPACITY,
            shared_default: None,
        }
    }

    fn insert(&mut self, info: TypeInfo) -> StorageResult<TypeIndex> {
        if info.align > CACHE_LINE_SIZE {
            return Err(StorageError::structural(format!(
                "{} is aligned to {} bytes",
                info.name, info.align
            )));
        }
        if let Some(&existing) = self.by_type_id.get(&info.type_id) {
            let known = &self.infos[existing.as_usize()];
            if known.kind == info.kind && known.cleanup == info.cleanup {
                return Ok(existing);
            }
            return Err(StorageError::structural(format!(
                "{} is already registered as {:?}",
                info.name, known.kind
            )));
        }
        Ok(self.push(info))
    }

    fn push(&mut self, info: TypeInfo) -> TypeIndex {
        let index = TypeIndex(self.infos.len() as u32);
        self.by_type_id.insert(info.type_id, index);
        self.infos.push(info);
        index
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
        z: f32,
    }

    impl Component for Position {}

    #[allow(dead_code)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Limited {
        value: u64,
    }

    impl Component for Limited {
        const MAX_CHUNK_CAPACITY: Option<u32> = Some(16);
    }

    #[allow(dead_code)]
    #[derive(Clone, Default, PartialEq, Eq, Hash)]
    struct Team(u8);

    impl SharedComponent for Team {}

    #[allow(dead_code)]
    struct Frozen;

    #[allow(dead_code)]
    struct Waypoints;

    impl BufferComponent for Waypoints {
        type Element = u32;
        const INTERNAL_CAPACITY: u32 = 4;
    }

    #[allow(dead_code)]
    struct Checkpoints;

    impl BufferComponent for Checkpoints {
        type Element = u32;
        const INTERNAL_CAPACITY: u32 = 2;
    }

    #[test]
    fn test_cleanup_marker_is_first() {
        let types = TypeRegistry::new();
        assert_eq!(types.len(), 1);
        assert_eq!(
            types.type_index::<CleanupEntity>(),
            Some(TypeIndex::CLEANUP_ENTITY)
        );
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut types = TypeRegistry::new();
        let a = types.register::<Position>().unwrap();
        let b = types.register::<Position>().unwrap();
        assert_eq!(a, b);
        assert_eq!(types.info(a).unwrap().size, 12);
        assert!(types.register_cleanup::<Position>().is_err());
    }

    #[test]
    fn test_kinds() {
        let mut types = TypeRegistry::new();
        let limited = types.register::<Limited>().unwrap();
        let buffer = types.register_buffer::<Waypoints>().unwrap();
        let team = types.register_shared::<Team>().unwrap();
        let frozen = types.register_tag::<Frozen>().unwrap();

        assert_eq!(types.info(limited).unwrap().max_chunk_capacity, Some(16));
        let info = types.info(buffer).unwrap();
        assert!(info.is_buffer());
        assert_eq!(info.size, BUFFER_HEADER_SIZE + 16);
        assert!(types.info(team).unwrap().is_shared());
        assert!(!types.info(team).unwrap().is_column());
        assert_eq!(types.info(frozen).unwrap().kind, ComponentKind::Tag);
    }

    #[test]
    fn test_buffers_with_same_element_stay_distinct() {
        let mut types = TypeRegistry::new();
        let waypoints = types.register_buffer::<Waypoints>().unwrap();
        let checkpoints = types.register_buffer::<Checkpoints>().unwrap();

        assert_ne!(waypoints, checkpoints);
        assert_eq!(types.type_index::<Waypoints>(), Some(waypoints));
        assert_eq!(types.type_index::<Checkpoints>(), Some(checkpoints));
        assert_eq!(types.type_index::<u32>(), None);
        assert_eq!(types.info(checkpoints).unwrap().size, BUFFER_HEADER_SIZE + 8);
    }
}
