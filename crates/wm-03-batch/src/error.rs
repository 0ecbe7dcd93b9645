//! Batch subsystem error type.

use shared_connectors::ConnectorError;
use shared_store::StoreError;
use shared_types::{Classified, ErrorClass, MessageType, TransactionType};
use thiserror::Error;
use wm_04_operations::OperationsError;

/// Errors from batch assembly and dispatch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Operation manager failure.
    #[error(transparent)]
    Operations(#[from] OperationsError),

    /// Connector failure.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// No dispatcher registered for a message's transaction/message type.
    #[error("No dispatcher registered for {tx_type:?}/{msg_type:?}")]
    NoDispatcher {
        tx_type: TransactionType,
        msg_type: MessageType,
    },

    /// A referenced row (group, node identity, blob) is missing.
    #[error("Missing dependency for batch dispatch: {0}")]
    MissingDependency(String),

    /// Payload serialization failure.
    #[error("Batch serialization failed: {0}")]
    Serialization(String),
}

impl Classified for BatchError {
    fn class(&self) -> ErrorClass {
        match self {
            BatchError::Store(e) => e.class(),
            BatchError::Operations(e) => e.class(),
            BatchError::Connector(e) => e.class(),
            BatchError::NoDispatcher { .. } => ErrorClass::Fatal,
            BatchError::MissingDependency(_) | BatchError::Serialization(_) => ErrorClass::Invalid,
        }
    }
}
