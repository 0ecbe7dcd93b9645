//! Subscriptions: bindings between the event stream and a transport.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Timestamp;

/// Where a subscription starts reading the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FirstEvent {
    /// Deliver every event from the beginning of the stream.
    Oldest,
    /// Deliver only events recorded after the subscription starts.
    #[default]
    Newest,
    /// Start immediately after an exact sequence.
    Sequence(i64),
}

/// Regular-expression filters matched against each event. All populated
/// fields must match for the event to be dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Regex over the event type name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub events: String,
    /// Regex over the event topic.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    /// Message-level sub-filters.
    #[serde(default, skip_serializing_if = "MessageSubFilter::is_empty")]
    pub message: MessageSubFilter,
    /// Transaction-level sub-filters.
    #[serde(default, skip_serializing_if = "TransactionSubFilter::is_empty")]
    pub transaction: TransactionSubFilter,
    /// Blockchain-event sub-filters.
    #[serde(default, skip_serializing_if = "BlockchainEventSubFilter::is_empty")]
    pub blockchain_event: BlockchainEventSubFilter,
}

/// Filters on the message referenced by an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSubFilter {
    /// Regex over the message tag.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    /// Regex over the message group hash.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// Regex over the author DID.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
}

impl MessageSubFilter {
    /// True when no message filter is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tag.is_empty() && self.group.is_empty() && self.author.is_empty()
    }
}

/// Filters on the transaction referenced by an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSubFilter {
    /// Regex over the transaction type name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tx_type: String,
}

impl TransactionSubFilter {
    /// True when no transaction filter is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tx_type.is_empty()
    }
}

/// Filters on blockchain events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainEventSubFilter {
    /// Regex over the blockchain event name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Regex over the originating listener id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub listener: String,
}

impl BlockchainEventSubFilter {
    /// True when no blockchain-event filter is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.listener.is_empty()
    }
}

/// Delivery options applying across all transports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Where to start reading.
    #[serde(default)]
    pub first_event: FirstEvent,
    /// How many deliveries may be in flight awaiting acknowledgement.
    #[serde(default)]
    pub read_ahead: u16,
    /// Deliver the referenced message and data inline with the event.
    #[serde(default)]
    pub with_data: bool,
}

/// A binding between the namespace event stream and an event transport.
/// Durable subscriptions are persisted; ephemeral ones live only in memory,
/// bound to one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique id.
    pub id: Uuid,
    /// Namespace.
    pub namespace: String,
    /// Name, unique within the namespace.
    pub name: String,
    /// Transport plugin name.
    pub transport: String,
    /// Event filters.
    #[serde(default)]
    pub filter: SubscriptionFilter,
    /// Delivery options.
    #[serde(default)]
    pub options: SubscriptionOptions,
    /// True for connection-scoped, in-memory subscriptions.
    #[serde(default)]
    pub ephemeral: bool,
    /// Creation time.
    pub created: Timestamp,
}
