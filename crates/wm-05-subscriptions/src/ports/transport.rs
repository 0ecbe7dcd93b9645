//! Event transport port and delivery types.

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{BlockchainEvent, Data, Event, Message, Transaction};
use uuid::Uuid;

use crate::error::SubscriptionError;

/// An event joined with the objects it references, as delivered to
/// applications.
#[derive(Debug, Clone)]
pub struct EnrichedEvent {
    /// The event itself.
    pub event: Event,
    /// The referenced message, for message events.
    pub message: Option<Message>,
    /// The message's data, when the subscription asked for it.
    pub data: Vec<Data>,
    /// The referenced transaction, when one is recorded.
    pub transaction: Option<Transaction>,
    /// The referenced blockchain event, for contract-listener events.
    pub blockchain_event: Option<BlockchainEvent>,
}

/// One delivery to a transport: the enriched event plus the subscription it
/// matched.
#[derive(Debug, Clone)]
pub struct EventDelivery {
    /// The enriched event.
    pub enriched: EnrichedEvent,
    /// Matched subscription id.
    pub subscription: Uuid,
    /// Matched subscription namespace/name.
    pub subscription_name: String,
}

/// The application's response to one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// Id of the delivered event.
    pub event: Uuid,
    /// True when the application rejected the event. Rejection is recorded
    /// but does not cause redelivery.
    pub rejected: bool,
}

/// A connected event transport (WebSocket, webhook, AMQP, ...). The
/// transport owns its connections; the dispatcher addresses them by id.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    /// Transport plugin name.
    fn name(&self) -> &str;

    /// Deliver one event to one connection.
    async fn deliver(
        &self,
        connection: &str,
        delivery: EventDelivery,
    ) -> Result<(), SubscriptionError>;
}

/// In-memory transport for tests: records deliveries per connection.
#[derive(Default)]
pub struct MockTransport {
    deliveries: Mutex<Vec<(String, EventDelivery)>>,
}

impl MockTransport {
    /// Create an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All deliveries so far, in order.
    #[must_use]
    pub fn deliveries(&self) -> Vec<(String, EventDelivery)> {
        self.deliveries.lock().clone()
    }
}

#[async_trait]
impl SubscriptionTransport for MockTransport {
    fn name(&self) -> &str {
        "mocktransport"
    }

    async fn deliver(
        &self,
        connection: &str,
        delivery: EventDelivery,
    ) -> Result<(), SubscriptionError> {
        self.deliveries.lock().push((connection.to_string(), delivery));
        Ok(())
    }
}
