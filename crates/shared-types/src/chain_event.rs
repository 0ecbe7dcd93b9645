//! Events received from blockchain contract listeners.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{LocallySequenced, Timestamp};

/// An event observed on the underlying ledger by a contract listener, or
/// emitted by the batch-pin contract itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockchainEvent {
    /// Local unique id.
    pub id: Uuid,
    /// Store-assigned local sequence.
    #[serde(skip)]
    pub sequence: i64,
    /// Namespace.
    pub namespace: String,
    /// Event name as emitted by the contract.
    pub name: String,
    /// Listener that delivered the event, absent for batch-pin events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener: Option<Uuid>,
    /// Connector-scoped protocol id (block/tx/log coordinates); the
    /// duplicate-suppression key within one listener.
    pub protocol_id: String,
    /// Decoded event payload.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Connector-specific source information.
    #[serde(default)]
    pub info: serde_json::Value,
    /// Transaction correlated with the event, if resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<Uuid>,
    /// When the event was recorded locally.
    pub created: Timestamp,
}

impl LocallySequenced for BlockchainEvent {
    fn local_sequence(&self) -> i64 {
        self.sequence
    }
}
