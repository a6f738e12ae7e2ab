//! # Shared Component Values
//!
//! A shared component holds one value per chunk. Chunks store an index into
//! this table for each shared type of their archetype:
//!
//! ```text
//! index 0      -> the type's default value (never stored)
//! index 1..n   -> ref-counted values, deduplicated by hash + equality
//! ```
//!
//! A reference is held by every chunk that points at a value. When the last
//! chunk goes away the value is dropped and its index reused.

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;

use super::component::{SharedComponent, TypeIndex, TypeRegistry};

/// Type-erased shared component value.
pub trait SharedValue: Send + Sync + 'static {
    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
    /// Equality against another erased value. Different types are unequal.
    fn eq_dyn(&self, other: &dyn SharedValue) -> bool;
    /// Stable hash of the value within this process.
    fn hash_value(&self) -> u64;
    /// Clones into a new box.
    fn clone_box(&self) -> Box<dyn SharedValue>;
}

impl<T: SharedComponent> SharedValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn SharedValue) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }

    fn hash_value(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn clone_box(&self) -> Box<dyn SharedValue> {
        Box::new(self.clone())
    }
}

struct SharedEntry {
    type_index: TypeIndex,
    hash: u64,
    value: Box<dyn SharedValue>,
    refcount: u32,
}

/// Ref-counted table of shared component values.
pub struct SharedComponentStore {
    /// Slot 0 is a permanent placeholder for "default".
    entries: Vec<Option<SharedEntry>>,
    free: Vec<u32>,
    lookup: HashMap<(TypeIndex, u64), Vec<u32>>,
    /// Default value per registered type; `None` for non-shared types.
    defaults: Vec<Option<Box<dyn SharedValue>>>,
}

impl SharedComponentStore {
    /// Creates a table with the default value of every shared type in `types`.
    #[must_use]
    pub fn new(types: &TypeRegistry) -> Self {
        Self {
            entries: vec![None],
            free: Vec::new(),
            lookup: HashMap::new(),
            defaults: types
                .iter()
                .map(|(_, info)| info.shared_default.map(|make| make()))
                .collect(),
        }
    }

    /// Number of stored (non-default) values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() - 1 - self.free.len()
    }

    /// Returns `true` if only defaults are in use.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds or stores `value` and takes one reference to it.
    ///
    /// Returns `0` without taking a reference if `value` equals the default.
    pub fn acquire(&mut self, type_index: TypeIndex, value: Box<dyn SharedValue>) -> u32 {
        if let Some(Some(default)) = self.defaults.get(type_index.as_usize()) {
            if default.eq_dyn(value.as_ref()) {
                return 0;
            }
        }

        let hash = value.hash_value();
        let key = (type_index, hash);
        if let Some(candidates) = self.lookup.get(&key) {
            for &index in candidates {
                if let Some(entry) = self.entries[index as usize].as_mut() {
                    if entry.value.eq_dyn(value.as_ref()) {
                        entry.refcount += 1;
                        return index;
                    }
                }
            }
        }

        let entry = SharedEntry {
            type_index,
            hash,
            value,
            refcount: 1,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = Some(entry);
                index
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u32
            }
        };
        self.lookup.entry(key).or_default().push(index);
        index
    }

    /// Takes one more reference to a stored value. No-op for `0`.
    pub fn add_ref(&mut self, index: u32) {
        if let Some(Some(entry)) = self.entries.get_mut(index as usize) {
            if index != 0 {
                entry.refcount += 1;
            }
        }
    }

    /// Drops one reference, freeing the value with the last one. No-op for `0`.
    pub fn release(&mut self, index: u32) {
        if index == 0 {
            return;
        }
        let Some(slot) = self.entries.get_mut(index as usize) else {
            return;
        };
        let Some(entry) = slot.as_mut() else {
            return;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }

        let key = (entry.type_index, entry.hash);
        *slot = None;
        self.free.push(index);
        if let Some(candidates) = self.lookup.get_mut(&key) {
            candidates.retain(|&candidate| candidate != index);
            if candidates.is_empty() {
                self.lookup.remove(&key);
            }
        }
    }

    /// Returns the value behind `index` for `type_index`.
    #[must_use]
    pub fn get(&self, type_index: TypeIndex, index: u32) -> Option<&dyn SharedValue> {
        if index == 0 {
            return self
                .defaults
                .get(type_index.as_usize())?
                .as_deref();
        }
        let entry = self.entries.get(index as usize)?.as_ref()?;
        (entry.type_index == type_index).then_some(entry.value.as_ref())
    }

    /// Typed variant of [`SharedComponentStore::get`].
    #[must_use]
    pub fn get_typed<T: SharedComponent>(&self, type_index: TypeIndex, index: u32) -> Option<&T> {
        self.get(type_index, index)?.as_any().downcast_ref()
    }

    /// Current reference count of a stored value.
    #[must_use]
    pub fn refcount(&self, index: u32) -> u32 {
        self.entries
            .get(index as usize)
            .and_then(Option::as_ref)
            .map_or(0, |entry| entry.refcount)
    }
}
