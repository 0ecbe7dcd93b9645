//! Subscription subsystem error type.

use shared_store::StoreError;
use shared_types::{Classified, ErrorClass};
use thiserror::Error;
use uuid::Uuid;

/// Errors from subscription management and delivery.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A filter field failed to compile as a regular expression.
    #[error("Invalid regex in subscription filter field '{field}': {message}")]
    BadFilter { field: &'static str, message: String },

    /// The named transport is not registered.
    #[error("Unknown event transport '{0}'")]
    UnknownTransport(String),

    /// The subscription does not exist.
    #[error("Unknown subscription {0}")]
    UnknownSubscription(Uuid),

    /// The subscription is already being delivered to another connection.
    #[error("Subscription {0} already active on another connection")]
    AlreadyActive(Uuid),

    /// The connection is not registered.
    #[error("Unknown connection '{0}'")]
    UnknownConnection(String),

    /// Transport delivery failure; safe to retry.
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

impl Classified for SubscriptionError {
    fn class(&self) -> ErrorClass {
        match self {
            SubscriptionError::Store(e) => e.class(),
            SubscriptionError::Delivery(_) => ErrorClass::Transient,
            SubscriptionError::BadFilter { .. }
            | SubscriptionError::UnknownTransport(_)
            | SubscriptionError::UnknownSubscription(_)
            | SubscriptionError::AlreadyActive(_)
            | SubscriptionError::UnknownConnection(_) => ErrorClass::Invalid,
        }
    }
}
