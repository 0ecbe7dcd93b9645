//! # Shared Store Crate
//!
//! Persistence ports for the Weftmesh node. The store is the single
//! consistency authority: every subsystem mutates state only through these
//! traits, and only the store assigns local sequence numbers.
//!
//! ## Hexagonal Architecture
//!
//! - `ports` - the per-collection driven ports plus the `Store` supertrait
//! - `changes` - lossy change notifications for shoulder-tap wakeups
//! - `memory` - the in-memory reference adapter used by tests and
//!   single-process deployments; production adapters implement the same ports

pub mod changes;
pub mod error;
pub mod memory;
pub mod ports;

pub use changes::{ChangeEvent, ChangeType, Collection};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use ports::*;

/// One-stop import for store consumers: the `Store` trait plus every
/// per-collection trait, so collection methods resolve on `dyn Store`.
pub mod prelude {
    pub use crate::ports::{
        BatchCollection, BlobCollection, BlockchainEventCollection, DataCollection,
        DatatypeCollection, EventCollection, GroupCollection, IdentityCollection,
        MessageCollection, NextPinCollection, NonceCollection, OffsetCollection,
        OperationCollection, PinCollection, Store, SubscriptionCollection, TokenCollection,
        TransactionCollection,
    };
}
