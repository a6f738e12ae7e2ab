//! # Access Tracking
//!
//! Jobs running against a shared `&EntityStore` register which component
//! types they read or write. Structural changes wait for that access to
//! drain before touching memory:
//!
//! ```text
//! job A: read(Position)  ─────────────┐ drop guard
//! job B: write(Velocity) ────┐        │
//! structural change:         wait(V)  wait(P) ... mutate
//! ```
//!
//! Each type also carries a structural version. A [`SafetyHandle`] taken
//! before a structural change that touched its type reports
//! [`StorageError::StaleAccess`].
//!
//! Waiting on a type the calling thread itself holds a guard for deadlocks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::ecs::TypeIndex;
use crate::error::{StorageError, StorageResult};

/// Kind of access held by an [`AccessGuard`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Shared read.
    Read,
    /// Exclusive write.
    Write,
}

#[derive(Clone, Copy, Debug, Default)]
struct TypeAccess {
    readers: u32,
    writers: u32,
}

/// Per-type reader/writer counts and structural versions.
pub struct AccessTracker {
    state: Mutex<Vec<TypeAccess>>,
    released: Condvar,
    structural_versions: Box<[AtomicU32]>,
}

impl AccessTracker {
    /// Creates a tracker for `type_count` component types.
    #[must_use]
    pub fn new(type_count: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(vec![TypeAccess::default(); type_count]),
            released: Condvar::new(),
            structural_versions: (0..type_count).map(|_| AtomicU32::new(1)).collect(),
        })
    }

    /// Registers read access to a type until the guard is dropped.
    #[must_use]
    pub fn read(self: &Arc<Self>, type_index: TypeIndex) -> AccessGuard {
        self.acquire(type_index, AccessMode::Read)
    }

    /// Registers write access to a type until the guard is dropped.
    #[must_use]
    pub fn write(self: &Arc<Self>, type_index: TypeIndex) -> AccessGuard {
        self.acquire(type_index, AccessMode::Write)
    }

    fn acquire(self: &Arc<Self>, type_index: TypeIndex, mode: AccessMode) -> AccessGuard {
        if let Some(access) = self.state.lock().get_mut(type_index.as_usize()) {
            match mode {
                AccessMode::Read => access.readers += 1,
                AccessMode::Write => access.writers += 1,
            }
        }
        AccessGuard {
            tracker: Arc::clone(self),
            type_index,
            mode,
        }
    }

    fn release(&self, type_index: TypeIndex, mode: AccessMode) {
        let mut state = self.state.lock();
        if let Some(access) = state.get_mut(type_index.as_usize()) {
            match mode {
                AccessMode::Read => access.readers -= 1,
                AccessMode::Write => access.writers -= 1,
            }
        }
        drop(state);
        self.released.notify_all();
    }

    /// Blocks until no writer of `type_index` is outstanding.
    pub fn complete_write_dependency(&self, type_index: TypeIndex) {
        let mut state = self.state.lock();
        while state
            .get(type_index.as_usize())
            .is_some_and(|access| access.writers > 0)
        {
            self.released.wait(&mut state);
        }
    }

    /// Blocks until no reader or writer of `type_index` is outstanding.
    pub fn complete_read_and_write_dependency(&self, type_index: TypeIndex) {
        let mut state = self.state.lock();
        while state
            .get(type_index.as_usize())
            .is_some_and(|access| access.readers > 0 || access.writers > 0)
        {
            self.released.wait(&mut state);
        }
    }

    /// Outstanding `(readers, writers)` of a type.
    #[must_use]
    pub fn outstanding(&self, type_index: TypeIndex) -> (u32, u32) {
        self.state
            .lock()
            .get(type_index.as_usize())
            .map_or((0, 0), |access| (access.readers, access.writers))
    }

    /// Captures the current structural version of a type.
    #[must_use]
    pub fn safety_handle(&self, type_index: TypeIndex) -> SafetyHandle {
        SafetyHandle {
            type_index,
            version: self.structural_version(type_index),
        }
    }

    /// Marks every handle of `type_index` taken so far as stale.
    pub(crate) fn invalidate(&self, type_index: TypeIndex) {
        if let Some(version) = self.structural_versions.get(type_index.as_usize()) {
            version.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn structural_version(&self, type_index: TypeIndex) -> u32 {
        self.structural_versions
            .get(type_index.as_usize())
            .map_or(0, |version| version.load(Ordering::Acquire))
    }
}

/// RAII registration of read or write access to one component type.
#[must_use = "access is released when the guard is dropped"]
pub struct AccessGuard {
    tracker: Arc<AccessTracker>,
    type_index: TypeIndex,
    mode: AccessMode,
}

impl AccessGuard {
    /// The guarded type.
    #[must_use]
    pub fn type_index(&self) -> TypeIndex {
        self.type_index
    }

    /// Read or write.
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        self.tracker.release(self.type_index, self.mode);
    }
}

/// Snapshot of a type's structural version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SafetyHandle {
    type_index: TypeIndex,
    version: u32,
}

impl SafetyHandle {
    /// The type this handle guards.
    #[must_use]
    pub fn type_index(self) -> TypeIndex {
        self.type_index
    }

    /// Checks that no structural change touched the type since the handle
    /// was taken.
    ///
    /// # Errors
    ///
    /// [`StorageError::StaleAccess`] if the handle is stale.
    pub fn validate(self, tracker: &AccessTracker) -> StorageResult<()> {
        if tracker.structural_version(self.type_index) == self.version {
            Ok(())
        } else {
            Err(StorageError::StaleAccess {
                type_index: self.type_index,
            })
        }
    }
}
