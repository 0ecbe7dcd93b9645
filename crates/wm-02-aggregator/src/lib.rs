//! # Aggregator Subsystem
//!
//! Turns the raw union of blockchain pin events, off-chain batches and token
//! events into a totally ordered, exactly-once stream of confirmed
//! application messages.
//!
//! ## Architecture
//!
//! - **Domain**: batch state accumulator, next-pin sequencing, batch cache
//! - **Ports**: outbound dependencies (data manager, definition handlers,
//!   operation updates)
//! - **Adapters**: store-backed data manager, definition handler dispatch
//! - **Service**: the aggregation loop itself, and the connector ingest that
//!   feeds it

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod service;

pub use config::AggregatorConf;
pub use domain::batch_state::BatchState;
pub use ports::outbound::{
    DataManager, DefinitionHandler, HandlerAction, HandlerResult, MessageAndData, OperationUpdater,
    ReadRequirement,
};
pub use service::aggregator::Aggregator;
pub use service::event_manager::EventManager;
