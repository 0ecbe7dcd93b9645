//! The per-(connection, subscription) event dispatcher.
//!
//! Each dispatcher is an event-poller instance over the events collection.
//! A page is enriched, filtered and delivered in sequence order; up to
//! `read_ahead` deliveries may be awaiting acknowledgement at once, and the
//! offset only commits once the whole page is acknowledged. Durable
//! subscriptions keep their offset row across connections; ephemeral ones
//! have theirs deleted on teardown.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use shared_store::{Store, StoreError};
use shared_store::prelude::*;
use shared_types::{Event, EventType, Subscription};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::domain::filter::CompiledFilter;
use crate::ports::transport::{
    DeliveryResponse, EnrichedEvent, EventDelivery, SubscriptionTransport,
};

/// The offset row name for a subscription's cursor.
#[must_use]
pub fn subscription_offset_name(id: &Uuid) -> String {
    format!("sub_{id}")
}

/// Poll handlers for one dispatcher.
pub struct EventDispatcher {
    store: Arc<dyn Store>,
    transport: Arc<dyn SubscriptionTransport>,
    connection: String,
    subscription: Subscription,
    filter: CompiledFilter,
    read_ahead: usize,
    acks: tokio::sync::Mutex<mpsc::Receiver<DeliveryResponse>>,
}

impl EventDispatcher {
    /// Build the dispatcher for one connection/subscription pair.
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn SubscriptionTransport>,
        connection: &str,
        subscription: Subscription,
        filter: CompiledFilter,
        acks: mpsc::Receiver<DeliveryResponse>,
    ) -> Arc<Self> {
        let read_ahead = usize::from(subscription.options.read_ahead).max(1);
        Arc::new(EventDispatcher {
            store,
            transport,
            connection: connection.to_string(),
            subscription,
            filter,
            read_ahead,
            acks: tokio::sync::Mutex::new(acks),
        })
    }

    /// Join an event with the objects it references.
    async fn enrich(&self, event: Event) -> Result<EnrichedEvent, StoreError> {
        let mut enriched = EnrichedEvent {
            message: None,
            data: vec![],
            transaction: None,
            blockchain_event: None,
            event,
        };
        let event = &enriched.event;

        match event.event_type {
            EventType::MessageConfirmed | EventType::MessageRejected => {
                enriched.message = self.store.get_message_by_id(&event.reference).await?;
                if self.subscription.options.with_data {
                    if let Some(message) = &enriched.message {
                        let ids: Vec<Uuid> = message.data.iter().map(|d| d.id).collect();
                        enriched.data = self.store.get_data_by_ids(&ids).await?;
                    }
                }
            }
            EventType::BlockchainEventReceived => {
                enriched.blockchain_event =
                    self.store.get_blockchain_event_by_id(&event.reference).await?;
            }
            _ => {}
        }
        if let Some(tx) = event.tx {
            enriched.transaction = self.store.get_transaction_by_id(&tx).await?;
        }
        Ok(enriched)
    }

    /// Wait for one acknowledgement and clear it from the in-flight window.
    async fn wait_ack(&self, inflight: &mut VecDeque<Uuid>) -> Result<(), StoreError> {
        let mut acks = self.acks.lock().await;
        loop {
            let Some(response) = acks.recv().await else {
                // Manager dropped the sender: the connection is gone.
                return Err(StoreError::Cancelled);
            };
            if let Some(at) = inflight.iter().position(|id| *id == response.event) {
                inflight.remove(at);
                if response.rejected {
                    warn!(
                        subscription = %self.subscription.id,
                        event = %response.event,
                        "Delivery rejected by application"
                    );
                }
                return Ok(());
            }
            debug!(
                subscription = %self.subscription.id,
                event = %response.event,
                "Acknowledgement for unknown delivery ignored"
            );
        }
    }
}

#[async_trait]
impl wm_01_event_poller::PollHandlers for EventDispatcher {
    type Item = Event;

    async fn get_items(&self, after: i64, limit: usize) -> Result<Vec<Event>, StoreError> {
        self.store.get_events_after(after, limit).await
    }

    async fn latest_sequence(&self) -> Result<i64, StoreError> {
        self.store.latest_event_sequence().await
    }

    async fn handle_page(&self, events: Vec<Event>) -> Result<bool, StoreError> {
        let mut inflight: VecDeque<Uuid> = VecDeque::with_capacity(self.read_ahead);
        for event in events {
            if event.namespace != self.subscription.namespace {
                continue;
            }
            let enriched = self.enrich(event).await?;
            if !self.filter.matches(&enriched) {
                continue;
            }

            while inflight.len() >= self.read_ahead {
                self.wait_ack(&mut inflight).await?;
            }

            trace!(
                subscription = %self.subscription.id,
                event = %enriched.event.id,
                sequence = enriched.event.sequence,
                "Delivering event"
            );
            let event_id = enriched.event.id;
            let delivery = EventDelivery {
                enriched,
                subscription: self.subscription.id,
                subscription_name: self.subscription.name.clone(),
            };
            self.transport
                .deliver(&self.connection, delivery)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
            inflight.push_back(event_id);
        }

        // The offset commits only after the full page is acknowledged.
        while !inflight.is_empty() {
            self.wait_ack(&mut inflight).await?;
        }
        Ok(false)
    }
}
