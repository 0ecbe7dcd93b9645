//! Connector error type.

use shared_types::{Classified, ErrorClass};
use thiserror::Error;

/// Errors from connector calls.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// The connector runtime could not be reached; safe to retry.
    #[error("Connector network error: {0}")]
    Network(String),

    /// The connector rejected the request as invalid.
    #[error("Connector rejected request: {0}")]
    Rejected(String),

    /// The requested capability is not implemented by this connector.
    #[error("Operation not supported by connector '{0}'")]
    NotSupported(String),
}

impl Classified for ConnectorError {
    fn class(&self) -> ErrorClass {
        match self {
            ConnectorError::Network(_) => ErrorClass::Transient,
            ConnectorError::Rejected(_) => ErrorClass::Invalid,
            ConnectorError::NotSupported(_) => ErrorClass::Fatal,
        }
    }
}
