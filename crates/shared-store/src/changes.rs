//! Store change notifications.
//!
//! Every mutation emits a `ChangeEvent` on a broadcast channel. Delivery is
//! intentionally lossy (slow subscribers drop events): consumers treat a
//! notification purely as a shoulder-tap and recompute truth from queries.

use serde::{Deserialize, Serialize};
use shared_types::Bytes32;
use uuid::Uuid;

/// The store collections that emit change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Messages,
    Data,
    Blobs,
    Batches,
    Transactions,
    Datatypes,
    Pins,
    Events,
    Operations,
    Subscriptions,
    Identities,
    Groups,
    TokenTransfers,
    BlockchainEvents,
}

/// What happened to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

/// One change notification. Sequenced collections carry the assigned
/// sequence; hash-addressed collections carry the hash instead of an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Collection the change happened in.
    pub collection: Collection,
    /// Kind of change.
    pub change_type: ChangeType,
    /// Namespace, for namespaced collections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Row id, for id-addressed collections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Row hash, for hash-addressed collections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<Bytes32>,
    /// Assigned sequence, for sequenced collections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
}

impl ChangeEvent {
    /// A created-row notification for a sequenced, id-addressed collection.
    #[must_use]
    pub fn created(collection: Collection, id: Uuid, sequence: Option<i64>) -> Self {
        ChangeEvent {
            collection,
            change_type: ChangeType::Created,
            namespace: None,
            id: Some(id),
            hash: None,
            sequence,
        }
    }

    /// An updated-row notification.
    #[must_use]
    pub fn updated(collection: Collection, id: Uuid) -> Self {
        ChangeEvent {
            collection,
            change_type: ChangeType::Updated,
            namespace: None,
            id: Some(id),
            hash: None,
            sequence: None,
        }
    }

    /// A created-row notification for a hash-addressed collection.
    #[must_use]
    pub fn created_hash(collection: Collection, hash: Bytes32) -> Self {
        ChangeEvent {
            collection,
            change_type: ChangeType::Created,
            namespace: None,
            id: None,
            hash: Some(hash),
            sequence: None,
        }
    }
}
