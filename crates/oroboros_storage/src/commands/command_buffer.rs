//! # Command Buffer
//!
//! Structural changes recorded now and applied later, in record order.
//!
//! ## Format
//!
//! ```text
//! chunk:   [record][record]...          (at least `command_chunk_bytes`)
//!
//! record:
//! [4 bytes: tag]
//! [4 bytes: record size, header included, multiple of 8]
//! [8 bytes: entity bits (0 = last entity created by this buffer)]
//! [4 bytes: type index / archetype id]
//! [4 bytes: payload length / shared value slot]
//! [8 bytes: shared value hash]
//! [N bytes: component payload, zero padded]
//! ```
//!
//! Shared values are not plain data, so they live next to the byte chunks as
//! owned boxes and records refer to them by slot.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::ecs::{
    ArchetypeId, Component, ComponentKind, Entity, EntityStore, SharedComponent, SharedValue,
    TypeIndex, TypeRegistry,
};
use crate::error::{StorageError, StorageResult};
use crate::memory::align_up;

/// Size of the fixed record header.
const HEADER_SIZE: usize = std::mem::size_of::<CommandHeader>();

/// Records start at 8-byte boundaries inside a chunk.
const RECORD_ALIGN: usize = 8;

/// `target` of a create record without an archetype.
const NO_ARCHETYPE: u32 = u32::MAX;

/// `aux` of a shared record holding the default value.
const NO_VALUE: u32 = u32::MAX;

/// Command record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
enum CommandTag {
    CreateEntity = 1,
    DestroyEntity = 2,
    AddComponent = 3,
    SetComponent = 4,
    RemoveComponent = 5,
    AddSharedComponent = 6,
    SetSharedComponent = 7,
}

impl CommandTag {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::CreateEntity),
            2 => Some(Self::DestroyEntity),
            3 => Some(Self::AddComponent),
            4 => Some(Self::SetComponent),
            5 => Some(Self::RemoveComponent),
            6 => Some(Self::AddSharedComponent),
            7 => Some(Self::SetSharedComponent),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
struct CommandHeader {
    tag: u32,
    size: u32,
    entity: u64,
    target: u32,
    aux: u32,
    hash: u64,
}

/// Append-only log of deferred structural changes.
///
/// Recording needs `&mut self`; a buffer is filled by one owner and then
/// consumed by [`CommandBuffer::playback`]. [`Entity::NULL`] in a record
/// stands for the entity most recently created by this buffer.
///
/// # Example
///
/// ```rust,ignore
/// let mut commands = store.command_buffer();
/// commands.record_create(Some(moving));
/// commands.record_set_component(Entity::NULL, Position { x: 1.0, y: 0.0, z: 0.0 })?;
/// commands.playback(&mut store)?;
/// ```
pub struct CommandBuffer {
    types: Arc<TypeRegistry>,
    chunk_bytes: usize,
    chunks: Vec<Vec<u8>>,
    shared_values: Vec<Option<Box<dyn SharedValue>>>,
    len: usize,
}

impl CommandBuffer {
    /// Creates an empty buffer. Chunks are allocated on first record.
    #[must_use]
    pub fn new(types: Arc<TypeRegistry>, chunk_bytes: usize) -> Self {
        Self {
            types,
            chunk_bytes: chunk_bytes.max(HEADER_SIZE),
            chunks: Vec::new(),
            shared_values: Vec::new(),
            len: 0,
        }
    }

    /// Number of recorded commands.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing was recorded.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of byte chunks in use.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes used by recorded commands.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Records the creation of an entity. `None` creates it without
    /// components.
    pub fn record_create(&mut self, archetype: Option<ArchetypeId>) {
        self.push(
            CommandHeader {
                tag: CommandTag::CreateEntity as u32,
                target: archetype.map_or(NO_ARCHETYPE, ArchetypeId::raw),
                ..CommandHeader::default()
            },
            &[],
        );
    }

    /// Records the destruction of an entity.
    pub fn record_destroy(&mut self, entity: Entity) {
        self.push(
            CommandHeader {
                tag: CommandTag::DestroyEntity as u32,
                entity: entity.to_bits(),
                ..CommandHeader::default()
            },
            &[],
        );
    }

    /// Records adding a component with its value.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] if `T` is not registered as
    /// data or tag.
    pub fn record_add_component<T: Component>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> StorageResult<()> {
        let type_index = self.component_type::<T>(false)?;
        self.push(
            Self::component_header(CommandTag::AddComponent, entity, type_index),
            bytemuck::bytes_of(&value),
        );
        Ok(())
    }

    /// Records adding a component by type only; its value starts zeroed.
    pub fn record_add_component_type(&mut self, entity: Entity, type_index: TypeIndex) {
        self.push(
            Self::component_header(CommandTag::AddComponent, entity, type_index),
            &[],
        );
    }

    /// Records overwriting a data component.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] if `T` is not registered as
    /// data.
    pub fn record_set_component<T: Component>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> StorageResult<()> {
        let type_index = self.component_type::<T>(true)?;
        self.push(
            Self::component_header(CommandTag::SetComponent, entity, type_index),
            bytemuck::bytes_of(&value),
        );
        Ok(())
    }

    /// Records removing a component.
    pub fn record_remove_component(&mut self, entity: Entity, type_index: TypeIndex) {
        self.push(
            Self::component_header(CommandTag::RemoveComponent, entity, type_index),
            &[],
        );
    }

    /// Records adding a shared component (or setting it, if present).
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] if `T` is not registered.
    pub fn record_add_shared_component<T: SharedComponent>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> StorageResult<()> {
        self.push_shared(CommandTag::AddSharedComponent, entity, value)
    }

    /// Records setting the shared value of an entity that has the component.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidStructuralRequest`] if `T` is not registered.
    pub fn record_set_shared_component<T: SharedComponent>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> StorageResult<()> {
        self.push_shared(CommandTag::SetSharedComponent, entity, value)
    }

    /// Applies every command in order, consuming the buffer.
    ///
    /// # Errors
    ///
    /// [`StorageError::PlaybackFailure`] for the first failing command.
    /// Commands before it stay applied; the buffer is released either way.
    pub fn playback(mut self, store: &mut EntityStore) -> StorageResult<()> {
        let commands = self.len;
        let result = self.replay(store);
        self.dispose();
        match result {
            Ok(()) => {
                tracing::trace!(commands, "command buffer played back");
                Ok(())
            }
            Err((command_index, source)) => {
                tracing::warn!(command_index, commands, error = %source, "command playback failed");
                Err(StorageError::PlaybackFailure {
                    command_index,
                    source: Box::new(source),
                })
            }
        }
    }

    /// Releases every chunk and boxed value without applying anything.
    pub fn dispose(mut self) {
        self.chunks.clear();
        self.shared_values.clear();
        self.len = 0;
    }

    fn component_type<T: Component>(&self, data_only: bool) -> StorageResult<TypeIndex> {
        let type_name = std::any::type_name::<T>();
        let type_index = self.types.type_index::<T>().ok_or_else(|| {
            StorageError::structural(format!("unregistered component type {type_name}"))
        })?;
        let kind = self.types.info(type_index).map(|info| info.kind);
        match kind {
            Some(ComponentKind::Data) => Ok(type_index),
            Some(ComponentKind::Tag) if !data_only => Ok(type_index),
            _ => Err(StorageError::structural(format!(
                "{type_name} cannot be recorded as component data"
            ))),
        }
    }

    fn component_header(tag: CommandTag, entity: Entity, type_index: TypeIndex) -> CommandHeader {
        CommandHeader {
            tag: tag as u32,
            entity: entity.to_bits(),
            target: type_index.raw(),
            ..CommandHeader::default()
        }
    }

    fn push_shared<T: SharedComponent>(
        &mut self,
        tag: CommandTag,
        entity: Entity,
        value: T,
    ) -> StorageResult<()> {
        let type_index = self.types.type_index::<T>().ok_or_else(|| {
            StorageError::structural(format!(
                "unregistered component type {}",
                std::any::type_name::<T>()
            ))
        })?;
        let hash = value.hash_value();
        let slot = if value == T::default() {
            NO_VALUE
        } else {
            let boxed: Box<dyn SharedValue> = Box::new(value);
            self.shared_values.push(Some(boxed));
            (self.shared_values.len() - 1) as u32
        };
        self.push(
            CommandHeader {
                tag: tag as u32,
                entity: entity.to_bits(),
                target: type_index.raw(),
                aux: slot,
                hash,
                ..CommandHeader::default()
            },
            &[],
        );
        Ok(())
    }

    fn push(&mut self, header: CommandHeader, payload: &[u8]) {
        let size = align_up(HEADER_SIZE + payload.len(), RECORD_ALIGN);
        let fits = self
            .chunks
            .last()
            .is_some_and(|chunk| chunk.capacity() - chunk.len() >= size);
        if !fits {
            self.chunks
                .push(Vec::with_capacity(self.chunk_bytes.max(size)));
        }

        let header = CommandHeader {
            size: size as u32,
            aux: if payload.is_empty() {
                header.aux
            } else {
                payload.len() as u32
            },
            ..header
        };
        let last = self.chunks.len() - 1;
        let chunk = &mut self.chunks[last];
        let end = chunk.len() + size;
        chunk.extend_from_slice(bytemuck::bytes_of(&header));
        chunk.extend_from_slice(payload);
        chunk.resize(end, 0);
        self.len += 1;
    }

    fn replay(&mut self, store: &mut EntityStore) -> Result<(), (usize, StorageError)> {
        let chunks = std::mem::take(&mut self.chunks);
        let mut last_entity = Entity::NULL;
        let mut command_index = 0;
        for chunk in &chunks {
            let mut offset = 0;
            while offset < chunk.len() {
                let header: CommandHeader =
                    bytemuck::pod_read_unaligned(&chunk[offset..offset + HEADER_SIZE]);
                let payload: &[u8] = match CommandTag::from_u32(header.tag) {
                    Some(CommandTag::AddComponent | CommandTag::SetComponent) => {
                        let start = offset + HEADER_SIZE;
                        &chunk[start..start + header.aux as usize]
                    }
                    _ => &[],
                };
                self.apply(store, header, payload, &mut last_entity)
                    .map_err(|error| (command_index, error))?;
                offset += header.size as usize;
                command_index += 1;
            }
        }
        Ok(())
    }

    fn apply(
        &mut self,
        store: &mut EntityStore,
        header: CommandHeader,
        payload: &[u8],
        last_entity: &mut Entity,
    ) -> StorageResult<()> {
        let Some(tag) = CommandTag::from_u32(header.tag) else {
            return Err(StorageError::structural(format!(
                "unknown command tag {}",
                header.tag
            )));
        };
        let entity = match Entity::from_bits(header.entity) {
            recorded if recorded.is_null() => *last_entity,
            recorded => recorded,
        };
        let type_index = TypeIndex::from_raw(header.target);

        match tag {
            CommandTag::CreateEntity => {
                let archetype = if header.target == NO_ARCHETYPE {
                    store.get_or_create_archetype(&[])?
                } else {
                    ArchetypeId::from_raw(header.target)
                };
                *last_entity = store.create_entity(archetype)?;
            }
            CommandTag::DestroyEntity => store.destroy_entity(entity)?,
            CommandTag::AddComponent => {
                store.add_component(entity, type_index)?;
                if !payload.is_empty() {
                    store.write_component_bytes(entity, type_index, payload)?;
                }
            }
            CommandTag::SetComponent => store.write_component_bytes(entity, type_index, payload)?,
            CommandTag::RemoveComponent => store.remove_component(entity, type_index)?,
            CommandTag::AddSharedComponent | CommandTag::SetSharedComponent => {
                let value = self.take_shared(store, type_index, header)?;
                store.assign_shared(
                    entity,
                    type_index,
                    value,
                    tag == CommandTag::SetSharedComponent,
                )?;
            }
        }
        Ok(())
    }

    fn take_shared(
        &mut self,
        store: &EntityStore,
        type_index: TypeIndex,
        header: CommandHeader,
    ) -> StorageResult<Box<dyn SharedValue>> {
        if let Some(value) = self
            .shared_values
            .get_mut(header.aux as usize)
            .and_then(Option::take)
        {
            debug_assert_eq!(value.hash_value(), header.hash);
            return Ok(value);
        }
        store
            .type_registry()
            .info(type_index)
            .and_then(|info| info.shared_default)
            .map(|make_default| make_default())
            .ok_or_else(|| {
                StorageError::structural(format!("{type_index} is not a shared component"))
            })
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("commands", &self.len)
            .field("chunks", &self.chunks.len())
            .field("shared_values", &self.shared_values.len())
            .finish()
    }
}
