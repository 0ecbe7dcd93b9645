//! # Batch Subsystem
//!
//! The outbound half of the pipeline: groups new messages into size-, byte-
//! and time-bounded batches per dispatch key, seals them (transaction
//! submission, masked-pin allocation, manifest generation, persistence), and
//! dispatches sealed batches to the ledger and to group members.
//!
//! ## Architecture
//!
//! - **Domain**: batch work items, the assembly queue and dispatch state
//! - **Service**: the per-key batch processors and their manager, the
//!   transaction helper, the pin submitter and the batch dispatch handlers

pub mod config;
pub mod domain;
pub mod error;
pub mod service;

pub use config::DispatcherOptions;
pub use domain::work::{BatchWork, DispatchState};
pub use error::BatchError;
pub use service::broadcast_dispatch::{BatchUploader, BroadcastBatchDispatcher, MockBatchUploader};
pub use service::manager::{BatchManager, DispatchHandler};
pub use service::pin_submitter::BatchPinSubmitter;
pub use service::private_dispatch::PrivateBatchDispatcher;
pub use service::tx_helper::TransactionHelper;
