//! # Operations Subsystem
//!
//! Every side-effectful external call is wrapped in an `Operation` row with a
//! deterministic input. Re-running a dispatch reuses the existing row, so
//! retries never repeat a side effect; asynchronous connector receipts
//! resolve the row by its id.

pub mod error;
pub mod manager;

pub use error::OperationsError;
pub use manager::{OperationHandler, OperationOutcome, OperationsManager};
