//! Error types for Dossier.
//!
//! Every failure is a typed value. Validation problems are rejected before any
//! state changes, store errors describe a refused mutation, and persistence
//! errors carry enough detail for the write scheduler to decide whether a
//! retry can help.

use thiserror::Error;

use crate::record::EntityId;
use crate::storage::SubstrateError;

/// Validation errors raised before a mutation touches any state.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Entity id cannot be empty")]
    EmptyEntityId,

    #[error("Entity id is {length} bytes, maximum is {max_length}")]
    EntityIdTooLong {
        length: usize,
        max_length: usize,
    },

    #[error("Image name cannot be empty")]
    EmptyImageName,

    #[error("Image payload for '{name}' is empty")]
    EmptyImagePayload {
        name: String,
    },

    #[error("Image index {index} is out of range for entity '{entity_id}' ({len} images)")]
    ImageIndexOutOfRange {
        entity_id: EntityId,
        index: usize,
        len: usize,
    },

    #[error("Value at '{path}' on entity '{entity_id}' is not a finite number")]
    NonFiniteNumber {
        entity_id: EntityId,
        path: String,
    },

    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },
}

impl ValidationError {
    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors returned by record store mutations.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Entity not found: {entity_id}")]
    NotFound {
        entity_id: EntityId,
    },

    #[error("Entity '{entity_id}' already holds the maximum of {max} images")]
    CapacityExceeded {
        entity_id: EntityId,
        max: usize,
    },

    #[error("Imported image list already holds the maximum of {max} images")]
    ImportCapacityExceeded {
        max: usize,
    },

    #[error("Deleted-image history is empty")]
    UndoHistoryEmpty,

    #[error("Mutation of '{entity_id}' failed: {reason}")]
    Mutation {
        entity_id: EntityId,
        reason: String,
    },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Errors raised at the persistence boundary.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("No persisted document under key '{key}'")]
    NotFound {
        key: String,
    },

    #[error("Quota exceeded: document needs {requested} bytes, {available} available")]
    QuotaExceeded {
        requested: u64,
        available: u64,
    },

    #[error("Storage unavailable: {message}")]
    StorageUnavailable {
        message: String,
    },

    #[error("Storage exhausted: {size} bytes after eviction, budget is {budget} bytes")]
    StorageExhausted {
        size: u64,
        budget: u64,
    },

    #[error("Failed to serialize document: {message}")]
    Serialization {
        message: String,
    },

    #[error("Persisted document is corrupted: {message}")]
    Corrupted {
        message: String,
    },

    #[error("Unsupported document version '{found}' (expected '{expected}')")]
    UnsupportedVersion {
        found: String,
        expected: String,
    },
}

impl PersistError {
    /// Returns true when trying the same save again later may succeed.
    ///
    /// Encoding failures are deterministic, so retrying them only delays the
    /// move to the manual-recovery slot.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::QuotaExceeded { .. }
            | Self::StorageUnavailable { .. }
            | Self::StorageExhausted { .. } => true,
            Self::NotFound { .. }
            | Self::Serialization { .. }
            | Self::Corrupted { .. }
            | Self::UnsupportedVersion { .. } => false,
        }
    }
}

impl From<SubstrateError> for PersistError {
    fn from(err: SubstrateError) -> Self {
        match err {
            SubstrateError::QuotaExceeded {
                requested, available, ..
            } => Self::QuotaExceeded {
                requested,
                available,
            },
            SubstrateError::Unavailable(message) => Self::StorageUnavailable { message },
            SubstrateError::Corrupted(message) => Self::Corrupted { message },
        }
    }
}

/// Top-level error type for Dossier.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum DossierError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Batch rolled back: {failed} of {total} entities failed")]
    TransactionFailure {
        total: usize,
        failed: usize,
    },

    #[error("Save worker disconnected")]
    WorkerDisconnected,

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl DossierError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error, directly or through the store.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Store(StoreError::Validation(_))
        )
    }

    /// Returns true if this error came from the persistence boundary.
    #[must_use]
    pub const fn is_persist(&self) -> bool {
        matches!(self, Self::Persist(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Persist(e) => e.is_retryable(),
            Self::WorkerDisconnected => true,
            Self::Validation(_)
            | Self::Store(_)
            | Self::TransactionFailure { .. }
            | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for Dossier operations.
pub type DossierResult<T> = Result<T, DossierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::EntityIdTooLong {
            length: 300,
            max_length: 256,
        };
        let msg = err.to_string();
        assert!(msg.contains("300"));
        assert!(msg.contains("256"));

        let err = ValidationError::config("debounce_ms", "must be greater than zero");
        assert!(err.to_string().contains("debounce_ms"));
    }

    #[test]
    fn test_capacity_exceeded_names_entity() {
        let err = StoreError::CapacityExceeded {
            entity_id: EntityId::new("A").unwrap(),
            max: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("'A'"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn test_substrate_error_conversion() {
        let err: PersistError = SubstrateError::QuotaExceeded {
            key: "doc".to_string(),
            requested: 6,
            available: 5,
        }
        .into();
        assert_eq!(
            err,
            PersistError::QuotaExceeded {
                requested: 6,
                available: 5
            }
        );

        let err: PersistError = SubstrateError::Unavailable("disk gone".to_string()).into();
        assert!(matches!(err, PersistError::StorageUnavailable { .. }));
    }

    #[test]
    fn test_persist_retryability() {
        assert!(PersistError::StorageUnavailable {
            message: "io".to_string()
        }
        .is_retryable());
        assert!(PersistError::StorageExhausted { size: 6, budget: 5 }.is_retryable());
        assert!(!PersistError::Serialization {
            message: "bad".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_dossier_error_classification() {
        let err: DossierError = ValidationError::EmptyEntityId.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());

        let err: DossierError = StoreError::Validation(ValidationError::EmptyImageName).into();
        assert!(err.is_validation());

        let err: DossierError = PersistError::StorageUnavailable {
            message: "offline".to_string(),
        }
        .into();
        assert!(err.is_persist());
        assert!(err.is_retryable());

        let err = DossierError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("unexpected state"));
    }
}
