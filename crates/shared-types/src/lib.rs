//! # Shared Types Crate
//!
//! This crate contains all cross-subsystem domain entities for the Weftmesh
//! node: messages, data, batches, pins, events, operations and subscriptions,
//! together with the manifest/wire formats and the context hashing rules.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: every type that crosses a subsystem boundary
//!   is defined here, never re-declared locally.
//! - **Ids, not pointers**: messages, batches and pins reference each other by
//!   id only; object graphs are materialized inside a single store read.
//! - **Opaque payloads**: business data is carried as JSON values; the core
//!   never interprets it beyond the typed-schema validator hook.

pub mod batch;
pub mod bytes32;
pub mod chain_event;
pub mod data;
pub mod errors;
pub mod event;
pub mod hashing;
pub mod identity;
pub mod message;
pub mod operation;
pub mod pin;
pub mod subscription;
pub mod tokens;
pub mod wire;

pub use batch::*;
pub use bytes32::Bytes32;
pub use chain_event::*;
pub use data::*;
pub use errors::*;
pub use event::*;
pub use identity::*;
pub use message::*;
pub use operation::*;
pub use pin::*;
pub use subscription::*;
pub use tokens::*;
pub use wire::*;

/// Unix timestamp in milliseconds.
pub type Timestamp = u64;

/// Current Unix timestamp in milliseconds.
#[must_use]
pub fn now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// A record that carries a store-assigned local sequence number.
///
/// Sequences are strictly increasing in insertion order within one
/// collection, and are the sole basis for poller ordering.
pub trait LocallySequenced {
    /// The local sequence assigned by the store at insert time.
    fn local_sequence(&self) -> i64;
}
