//! # Subscriptions Subsystem
//!
//! Matches the confirmed event stream against durable and ephemeral
//! subscriptions and delivers to registered transports, in per-subscription
//! sequence order, with configurable read-ahead and positive
//! acknowledgements.
//!
//! ## Architecture
//!
//! - **Domain**: compiled regex filters, event enrichment
//! - **Ports**: the transport driven port and the delivery types
//! - **Service**: the subscription manager and the per-connection dispatchers
//!   (each dispatcher is an event-poller instance over the events stream)

pub mod domain;
pub mod error;
pub mod ports;
pub mod service;

pub use domain::filter::CompiledFilter;
pub use error::SubscriptionError;
pub use ports::transport::{
    DeliveryResponse, EnrichedEvent, EventDelivery, MockTransport, SubscriptionTransport,
};
pub use service::manager::SubscriptionManager;
