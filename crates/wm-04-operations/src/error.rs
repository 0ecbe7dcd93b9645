//! Operations error type.

use shared_connectors::ConnectorError;
use shared_store::StoreError;
use shared_types::{Classified, ErrorClass, OpType};
use thiserror::Error;
use uuid::Uuid;

/// Errors from the operation manager.
#[derive(Debug, Error)]
pub enum OperationsError {
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Connector failure while running the operation.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// No handler registered for the operation type. A wiring bug, not a
    /// runtime condition; propagated fatally.
    #[error("No handler registered for operation type {0:?}")]
    UnregisteredType(OpType),

    /// The operation row does not exist.
    #[error("Operation not found: {0}")]
    NotFound(Uuid),
}

impl Classified for OperationsError {
    fn class(&self) -> ErrorClass {
        match self {
            OperationsError::Store(e) => e.class(),
            OperationsError::Connector(e) => e.class(),
            OperationsError::UnregisteredType(_) => ErrorClass::Fatal,
            OperationsError::NotFound(_) => ErrorClass::Invalid,
        }
    }
}
