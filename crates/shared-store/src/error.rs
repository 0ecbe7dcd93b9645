//! Store error type.

use shared_types::{Classified, ErrorClass};
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Underlying storage I/O failed; safe to retry.
    #[error("Store I/O error: {0}")]
    Io(String),

    /// An insert hit an existing row (insert-or-fail collections).
    /// Callers fall back to per-row upsert.
    #[error("Row already exists: {0}")]
    Conflict(String),

    /// An upsert would have changed an immutable hash.
    #[error("Hash mismatch for existing row: {0}")]
    HashMismatch(String),

    /// An update addressed a row that does not exist.
    #[error("Row not found: {0}")]
    NotFound(String),

    /// A value could not be serialized for persistence.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The operation was cancelled by shutdown.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Classified for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Io(_) => ErrorClass::Transient,
            StoreError::Conflict(_)
            | StoreError::HashMismatch(_)
            | StoreError::NotFound(_)
            | StoreError::Serialization(_) => ErrorClass::Invalid,
            StoreError::Cancelled => ErrorClass::Fatal,
        }
    }
}
