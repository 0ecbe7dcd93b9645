//! Token pools and transfers.
//!
//! The core's interest in tokens is narrow: transfers confirmed on-chain are
//! recorded and emitted as events, and a transfer that names a message hash
//! gates that message's confirmation in the aggregator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bytes32::Bytes32;
use crate::Timestamp;

/// A pool of fungible or non-fungible tokens managed by a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPool {
    /// Unique id.
    pub id: Uuid,
    /// Namespace.
    pub namespace: String,
    /// Pool name.
    pub name: String,
    /// Token connector plugin that manages this pool.
    pub connector: String,
    /// Connector-scoped protocol id of the pool.
    pub protocol_id: String,
    /// Creation time.
    pub created: Timestamp,
}

/// Kinds of token movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenTransferType {
    /// New tokens issued.
    Mint,
    /// Tokens destroyed.
    Burn,
    /// Tokens moved between accounts.
    Transfer,
}

/// A confirmed token transfer reported by a connector.
///
/// `protocol_id` is unique only within one connector; duplicate suppression
/// keys on `(connector, pool, protocol_id)` rather than trusting it globally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTransfer {
    /// Local unique id.
    pub id: Uuid,
    /// Transfer type.
    #[serde(rename = "type")]
    pub transfer_type: TokenTransferType,
    /// Pool the transfer happened in.
    pub pool: Uuid,
    /// Connector-scoped protocol id of the transfer event.
    pub protocol_id: String,
    /// Sending account, absent for mints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Receiving account, absent for burns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Amount moved, as a decimal string.
    pub amount: String,
    /// Message that rides with this transfer, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Uuid>,
    /// Hash of that message; the aggregator requires an exact match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<Bytes32>,
    /// Transaction the transfer belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<Uuid>,
    /// When the transfer was recorded locally.
    pub created: Timestamp,
}
