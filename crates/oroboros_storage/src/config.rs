//! # Store Configuration
//!
//! Sizes that shape chunk capacity and metadata allocation. Loaded once at
//! startup, either from defaults or a TOML file:
//!
//! ```toml
//! chunk_bytes = 16384
//! chunk_header_bytes = 128
//! arena_block_bytes = 65536
//! command_chunk_bytes = 4096
//! max_archetype_types = 128
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{StorageError, StorageResult};
use crate::memory::CACHE_LINE_SIZE;

/// Configuration of an [`EntityStore`](crate::EntityStore).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Total size of one chunk, header included.
    pub chunk_bytes: usize,
    /// Bytes reserved for the chunk header. Not available to columns.
    pub chunk_header_bytes: usize,
    /// Size of each arena block holding archetype metadata.
    pub arena_block_bytes: usize,
    /// Minimum size of a command buffer chunk.
    pub command_chunk_bytes: usize,
    /// Maximum number of component types in one archetype.
    pub max_archetype_types: usize,
}

impl StoreConfig {
    /// Default chunk size: 16 KiB.
    pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;
    /// Default chunk header size.
    pub const DEFAULT_CHUNK_HEADER_BYTES: usize = 128;
    /// Default command buffer chunk size: 4 KiB.
    pub const DEFAULT_COMMAND_CHUNK_BYTES: usize = 4 * 1024;

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidConfig`] on parse or validation failure.
    pub fn from_toml_str(source: &str) -> StorageResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidConfig`] if the file cannot be read or is invalid.
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            StorageError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Bytes of a chunk available to component columns.
    #[inline]
    #[must_use]
    pub const fn chunk_data_bytes(&self) -> usize {
        self.chunk_bytes - self.chunk_header_bytes
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidConfig`] describing the first violated rule.
    pub fn validate(&self) -> StorageResult<()> {
        if self.chunk_header_bytes >= self.chunk_bytes {
            return Err(StorageError::InvalidConfig(format!(
                "chunk_header_bytes ({}) must be smaller than chunk_bytes ({})",
                self.chunk_header_bytes, self.chunk_bytes
            )));
        }
        if self.chunk_bytes > u32::MAX as usize {
            return Err(StorageError::InvalidConfig(
                "chunk_bytes does not fit in 32 bits".to_owned(),
            ));
        }
        if self.arena_block_bytes < CACHE_LINE_SIZE {
            return Err(StorageError::InvalidConfig(format!(
                "arena_block_bytes must be at least {CACHE_LINE_SIZE}"
            )));
        }
        if self.command_chunk_bytes == 0 {
            return Err(StorageError::InvalidConfig(
                "command_chunk_bytes must be non-zero".to_owned(),
            ));
        }
        if self.max_archetype_types == 0 {
            return Err(StorageError::InvalidConfig(
                "max_archetype_types must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: Self::DEFAULT_CHUNK_BYTES,
            chunk_header_bytes: Self::DEFAULT_CHUNK_HEADER_BYTES,
            arena_block_bytes: crate::memory::DEFAULT_ARENA_BLOCK_SIZE,
            command_chunk_bytes: Self::DEFAULT_COMMAND_CHUNK_BYTES,
            max_archetype_types: 128,
        }
    }
}
