//! Operations: idempotent records of external side effects.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bytes32::Bytes32;
use crate::data::Blob;
use crate::identity::Identity;
use crate::wire::TransportWrapper;
use crate::Timestamp;

/// The kinds of side-effectful external call the node makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    /// Submit a batch pin to the blockchain connector.
    BlockchainPinBatch,
    /// Transfer a blob to a peer over data exchange.
    DataExchangeSendBlob,
    /// Send a batch payload to a peer over data exchange.
    DataExchangeSendBatch,
    /// Submit a token transfer to the token connector.
    TokenTransfer,
}

/// Operation resolution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    /// Submitted, awaiting a connector receipt.
    Pending,
    /// Completed successfully.
    Succeeded,
    /// Failed; the `error` field carries the reason.
    Failed,
}

/// A persisted operation row.
///
/// The `(tx, op_type, input)` triple is the idempotency key: re-running a
/// dispatch reuses the existing row instead of repeating the side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id; connectors echo it back in async receipts.
    pub id: Uuid,
    /// Namespace.
    pub namespace: String,
    /// Transaction this operation belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<Uuid>,
    /// Operation type.
    #[serde(rename = "type")]
    pub op_type: OpType,
    /// Name of the connector plugin that executes this operation.
    pub plugin: String,
    /// Deterministic input object; part of the idempotency key.
    pub input: serde_json::Value,
    /// Connector-reported output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Status.
    pub status: OpStatus,
    /// Error string for failed operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Successor operation, set when this row was retried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<Uuid>,
    /// Creation time.
    pub created: Timestamp,
    /// Last update time.
    pub updated: Timestamp,
}

impl Operation {
    /// Build a new pending operation.
    #[must_use]
    pub fn new(namespace: &str, tx: Option<Uuid>, op_type: OpType, plugin: &str) -> Self {
        let created = crate::now();
        Operation {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            tx,
            op_type,
            plugin: plugin.to_string(),
            input: serde_json::Value::Null,
            output: None,
            status: OpStatus::Pending,
            error: None,
            retry: None,
            created,
            updated: created,
        }
    }
}

/// The typed payload a handler needs to actually run an operation, resolved
/// from the operation's deterministic input by `prepare_operation`.
#[derive(Debug, Clone)]
pub enum PreparedData {
    /// Anchor a sealed batch: the persisted batch plus its pin contexts in
    /// manifest order.
    BatchPin {
        batch: Box<crate::batch::BatchPersisted>,
        payload_ref: Option<String>,
        contexts: Vec<Bytes32>,
    },
    /// Transfer one blob to one peer node.
    SendBlob { node: Box<Identity>, blob: Blob },
    /// Send a serialized batch (plus group, when embedded) to one peer node.
    SendBatch {
        node: Box<Identity>,
        transport: Box<TransportWrapper>,
    },
}

/// An operation paired with its resolved, typed payload.
#[derive(Debug, Clone)]
pub struct PreparedOperation {
    /// Operation id.
    pub id: Uuid,
    /// Operation type.
    pub op_type: OpType,
    /// Typed payload.
    pub data: PreparedData,
}
