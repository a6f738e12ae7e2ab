//! # Storage Error Types
//!
//! All errors that can surface from the storage engine's public operations.
//! Validation happens before any shared state is touched, so an `Err` leaves
//! the store exactly as it was.

use thiserror::Error;

use crate::ecs::{Entity, TypeIndex};

/// Errors that can occur in the storage engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The entity handle is stale (destroyed / recycled) or out of range.
    #[error("invalid entity {0}")]
    InvalidEntity(Entity),

    /// The structural request was rejected before any mutation.
    #[error("invalid structural request: {0}")]
    InvalidStructuralRequest(String),

    /// A fixed-size allocation was asked for more than it can ever hold.
    #[error("capacity exceeded: requested {requested}, limit {limit}")]
    CapacityExceeded {
        /// The requested amount.
        requested: usize,
        /// The hard limit that prevented the request.
        limit: usize,
    },

    /// A recorded command failed during playback. The buffer has already been
    /// released when this is returned.
    #[error("command playback failed at command {command_index}: {source}")]
    PlaybackFailure {
        /// Zero-based index of the failing command in record order.
        command_index: usize,
        /// The error raised by the failing command.
        source: Box<StorageError>,
    },

    /// A safety handle was used after a structural change invalidated it.
    #[error("stale access to component type {type_index}")]
    StaleAccess {
        /// The component type whose layout changed.
        type_index: TypeIndex,
    },

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StorageError {
    /// Shorthand for [`StorageError::InvalidStructuralRequest`].
    pub(crate) fn structural(reason: impl Into<String>) -> Self {
        Self::InvalidStructuralRequest(reason.into())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_failure_message_includes_cause() {
        let err = StorageError::PlaybackFailure {
            command_index: 3,
            source: Box::new(StorageError::InvalidEntity(Entity::new(7, 2))),
        };
        let message = err.to_string();
        assert!(message.contains("command 3"));
        assert!(message.contains("7v2"));
    }

    #[test]
    fn test_capacity_message() {
        let err = StorageError::CapacityExceeded {
            requested: 70_000,
            limit: 65_536,
        };
        assert_eq!(
            err.to_string(),
            "capacity exceeded: requested 70000, limit 65536"
        );
    }
}
