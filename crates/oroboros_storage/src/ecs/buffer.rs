//! # Dynamic Buffers
//!
//! A buffer component occupies one fixed-size cell per entity in its column:
//!
//! ```text
//! | header (16 B) | inline elements (internal_capacity) | pad |
//! ```
//!
//! While the buffer fits its internal capacity the elements live inline.
//! Beyond that they spill into a heap block owned by the store's
//! [`BufferHeap`]; the header then carries the block's pool handle.
//! A zeroed cell is an empty inline buffer.
//!
//! Moving a cell bitwise transfers ownership of its heap block. Every other
//! way a cell stops existing must go through [`release`].

use bytemuck::{Pod, Zeroable};

use super::component::ComponentKind;
use crate::memory::{AlignedBlock, PoolHandle, SlotPool};

/// Size of the per-cell header.
pub(crate) const BUFFER_HEADER_SIZE: usize = 16;

/// Smallest heap allocation, in elements.
const MIN_HEAP_CAPACITY: usize = 8;

/// Heap payloads of spilled buffers.
pub(crate) type BufferHeap = SlotPool<AlignedBlock>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct BufferHeader {
    len: u32,
    capacity: u32,
    heap_index: u32,
    /// `0` means the elements are inline.
    heap_generation: u32,
}

impl BufferHeader {
    fn heap(self) -> Option<PoolHandle> {
        (self.heap_generation != 0)
            .then(|| PoolHandle::from_raw(self.heap_index, self.heap_generation))
    }
}

/// Element layout of one buffer type.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BufferLayout {
    element_size: usize,
    internal_capacity: usize,
}

impl BufferLayout {
    /// Layout of a buffer kind, `None` for any other kind.
    pub(crate) fn of(kind: ComponentKind) -> Option<Self> {
        match kind {
            ComponentKind::Buffer {
                element_size,
                internal_capacity,
                ..
            } => Some(Self {
                element_size: element_size as usize,
                internal_capacity: internal_capacity as usize,
            }),
            _ => None,
        }
    }
}

fn read_header(cell: &[u8]) -> BufferHeader {
    bytemuck::pod_read_unaligned(&cell[..BUFFER_HEADER_SIZE])
}

fn write_header(cell: &mut [u8], header: BufferHeader) {
    cell[..BUFFER_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
}

/// Number of elements in the buffer.
pub(crate) fn len(cell: &[u8]) -> usize {
    read_header(cell).len as usize
}

/// Element bytes of the buffer.
pub(crate) fn elements<'a>(layout: BufferLayout, cell: &'a [u8], heap: &'a BufferHeap) -> &'a [u8] {
    let header = read_header(cell);
    let bytes = header.len as usize * layout.element_size;
    match header.heap() {
        Some(handle) => heap.get(handle).map_or(&[] as &[u8], |block| &block.bytes()[..bytes]),
        None => &cell[BUFFER_HEADER_SIZE..BUFFER_HEADER_SIZE + bytes],
    }
}

/// Element bytes of the buffer, mutably.
pub(crate) fn elements_mut<'a>(
    layout: BufferLayout,
    cell: &'a mut [u8],
    heap: &'a mut BufferHeap,
) -> &'a mut [u8] {
    let header = read_header(cell);
    let bytes = header.len as usize * layout.element_size;
    match header.heap() {
        Some(handle) => match heap.get_mut(handle) {
            Some(block) => &mut block.bytes_mut()[..bytes],
            None => &mut [],
        },
        None => &mut cell[BUFFER_HEADER_SIZE..BUFFER_HEADER_SIZE + bytes],
    }
}

/// Reinterprets element bytes as `T`. Empty input yields an empty slice.
pub(crate) fn cast_elements<T: Pod>(bytes: &[u8]) -> &[T] {
    if bytes.is_empty() {
        &[]
    } else {
        bytemuck::cast_slice(bytes)
    }
}

/// Grows storage so the buffer can hold `needed` elements.
fn reserve(layout: BufferLayout, cell: &mut [u8], heap: &mut BufferHeap, needed: usize) {
    let header = read_header(cell);
    let capacity = match header.heap() {
        Some(_) => header.capacity as usize,
        None => layout.internal_capacity,
    };
    if needed <= capacity {
        return;
    }

    let new_capacity = needed.max(capacity * 2).max(MIN_HEAP_CAPACITY);
    let mut block = AlignedBlock::zeroed(new_capacity * layout.element_size);
    let existing = elements(layout, cell, heap);
    block.bytes_mut()[..existing.len()].copy_from_slice(existing);

    if let Some(old) = header.heap() {
        heap.remove(old);
    }
    let handle = heap.insert(block);
    write_header(
        cell,
        BufferHeader {
            len: header.len,
            capacity: new_capacity as u32,
            heap_index: handle.index(),
            heap_generation: handle.generation(),
        },
    );
}

/// Appends one element.
pub(crate) fn push(layout: BufferLayout, cell: &mut [u8], heap: &mut BufferHeap, value: &[u8]) {
    debug_assert_eq!(value.len(), layout.element_size);
    let count = len(cell);
    reserve(layout, cell, heap, count + 1);

    let mut header = read_header(cell);
    header.len += 1;
    write_header(cell, header);

    let size = layout.element_size;
    elements_mut(layout, cell, heap)[count * size..(count + 1) * size].copy_from_slice(value);
}

/// Replaces the contents with `values` (a whole number of elements).
pub(crate) fn set(layout: BufferLayout, cell: &mut [u8], heap: &mut BufferHeap, values: &[u8]) {
    debug_assert_eq!(values.len() % layout.element_size, 0);
    let count = values.len() / layout.element_size;

    let mut header = read_header(cell);
    header.len = 0;
    write_header(cell, header);
    reserve(layout, cell, heap, count);

    let mut header = read_header(cell);
    header.len = count as u32;
    write_header(cell, header);
    elements_mut(layout, cell, heap).copy_from_slice(values);
}

/// Frees any heap payload and resets the cell to an empty inline buffer.
pub(crate) fn release(cell: &mut [u8], heap: &mut BufferHeap) {
    if let Some(handle) = read_header(cell).heap() {
        heap.remove(handle);
    }
    write_header(cell, BufferHeader::default());
}

/// Gives a bitwise-copied cell its own heap payload.
pub(crate) fn deep_copy(cell: &mut [u8], heap: &mut BufferHeap) {
    let header = read_header(cell);
    let Some(handle) = header.heap() else {
        return;
    };
    if let Some(block) = heap.get(handle).cloned() {
        let copy = heap.insert(block);
        write_header(
            cell,
            BufferHeader {
                heap_index: copy.index(),
                heap_generation: copy.generation(),
                ..header
            },
        );
    }
}
