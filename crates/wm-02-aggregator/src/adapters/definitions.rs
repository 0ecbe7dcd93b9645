//! Definition broadcast handling.
//!
//! Definition messages are applied in-line on the aggregator so applications
//! are never dispatched events that depend on a definition that has not been
//! processed yet. The dispatcher routes on the message tag; unknown tags are
//! rejected rather than parked, because no later input can make them valid.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use shared_store::{Store, StoreError};
use shared_store::prelude::*;
use shared_types::{Data, Datatype, Event, EventType, Message};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::batch_state::BatchState;
use crate::ports::outbound::{DefinitionHandler, HandlerAction, HandlerResult};

/// Topic definition events are emitted on.
pub const SYSTEM_TOPIC_DEFINITIONS: &str = "wm_definitions";

/// Routes definition broadcasts to per-tag handlers.
pub struct DefinitionDispatcher {
    handlers: HashMap<String, Arc<dyn DefinitionHandler>>,
}

impl DefinitionDispatcher {
    /// An empty dispatcher; every tag rejects until registered.
    #[must_use]
    pub fn new() -> Self {
        DefinitionDispatcher {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for one message tag.
    pub fn register(&mut self, tag: &str, handler: Arc<dyn DefinitionHandler>) {
        self.handlers.insert(tag.to_string(), handler);
    }
}

impl Default for DefinitionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DefinitionHandler for DefinitionDispatcher {
    async fn handle_definition_broadcast(
        &self,
        state: &mut BatchState,
        message: &Message,
        data: &[Data],
        tx: Option<Uuid>,
    ) -> Result<HandlerResult, StoreError> {
        let tag = message.header.tag.as_deref().unwrap_or_default();
        match self.handlers.get(tag) {
            Some(handler) => {
                handler
                    .handle_definition_broadcast(state, message, data, tx)
                    .await
            }
            None => {
                warn!(message = %message.header.id, tag, "Unknown definition tag; rejecting");
                Ok(HandlerResult::action(HandlerAction::Reject))
            }
        }
    }
}

/// Applies `define_datatype` broadcasts.
pub struct DatatypeDefinitionHandler {
    store: Arc<dyn Store>,
}

impl DatatypeDefinitionHandler {
    /// Create a handler over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        DatatypeDefinitionHandler { store }
    }

    fn parse_payload(message: &Message, data: &[Data]) -> Option<Datatype> {
        let value = data.first()?.value.as_ref()?;
        let mut datatype: Datatype = serde_json::from_value(value.clone()).ok()?;
        if datatype.name.is_empty() || datatype.version.is_empty() {
            return None;
        }
        datatype.namespace = message.header.namespace.clone();
        Some(datatype)
    }
}

#[async_trait]
impl DefinitionHandler for DatatypeDefinitionHandler {
    async fn handle_definition_broadcast(
        &self,
        state: &mut BatchState,
        message: &Message,
        data: &[Data],
        tx: Option<Uuid>,
    ) -> Result<HandlerResult, StoreError> {
        let Some(datatype) = Self::parse_payload(message, data) else {
            warn!(message = %message.header.id, "Malformed datatype broadcast; rejecting");
            return Ok(HandlerResult::action(HandlerAction::Reject));
        };

        let existing = self
            .store
            .get_datatype_by_name(&datatype.namespace, &datatype.name, &datatype.version)
            .await?;
        if let Some(existing) = existing {
            warn!(
                message = %message.header.id,
                datatype = %datatype.name,
                version = %datatype.version,
                duplicate_of = %existing.id,
                "Duplicate datatype broadcast; rejecting"
            );
            return Ok(HandlerResult::action(HandlerAction::Reject));
        }

        self.store.upsert_datatype(&datatype).await?;
        info!(
            datatype = %datatype.name,
            version = %datatype.version,
            "Datatype definition applied"
        );

        let namespace = datatype.namespace.clone();
        let datatype_id = datatype.id;
        state.add_finalize(Box::new(move |store| {
            Box::pin(async move {
                let mut event = Event::new(
                    EventType::DatatypeConfirmed,
                    &namespace,
                    datatype_id,
                    tx,
                    Some(SYSTEM_TOPIC_DEFINITIONS.to_string()),
                );
                store.insert_event(&mut event).await
            })
        }));

        Ok(HandlerResult {
            action: HandlerAction::Confirm,
            custom_correlator: Some(datatype_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_store::MemoryStore;
    use shared_types::{
        Bytes32, MessageHeader, MessageState, MessageType, SignerRef, TransactionType,
    };

    fn definition_message(tag: &str) -> Message {
        Message {
            header: MessageHeader {
                id: Uuid::new_v4(),
                cid: None,
                msg_type: MessageType::Definition,
                tx_type: TransactionType::BatchPin,
                signer: SignerRef::default(),
                created: shared_types::now(),
                namespace: "ns1".to_string(),
                topics: vec![SYSTEM_TOPIC_DEFINITIONS.to_string()],
                tag: Some(tag.to_string()),
                group: None,
                data_hash: None,
            },
            hash: Bytes32::new([1; 32]),
            batch: None,
            state: MessageState::Pending,
            confirmed: None,
            data: vec![],
            pins: vec![],
            sequence: 0,
        }
    }

    fn datatype_data(name: &str, version: &str) -> Data {
        let datatype = Datatype {
            id: Uuid::new_v4(),
            namespace: "ns1".to_string(),
            name: name.to_string(),
            version: version.to_string(),
            value: serde_json::json!({"type": "object"}),
            hash: Bytes32::new([2; 32]),
            created: shared_types::now(),
        };
        Data {
            id: Uuid::new_v4(),
            namespace: "ns1".to_string(),
            validator: None,
            value: Some(serde_json::to_value(&datatype).unwrap()),
            blob: None,
            hash: Bytes32::new([3; 32]),
            created: shared_types::now(),
        }
    }

    #[tokio::test]
    async fn test_datatype_broadcast_confirms_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let handler = DatatypeDefinitionHandler::new(store.clone());
        let mut state = BatchState::new();

        let msg = definition_message(crate::ports::outbound::tags::DEFINE_DATATYPE);
        let data = vec![datatype_data("widget", "1")];
        let result = handler
            .handle_definition_broadcast(&mut state, &msg, &data, None)
            .await
            .unwrap();

        assert_eq!(result.action, HandlerAction::Confirm);
        assert!(result.custom_correlator.is_some());
        assert!(store
            .get_datatype_by_name("ns1", "widget", "1")
            .await
            .unwrap()
            .is_some());

        // The finalize closure emits the datatype-confirmed event.
        state.run_finalize(store.as_ref()).await.unwrap();
        let events = store.get_events_after(0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::DatatypeConfirmed);
    }

    #[tokio::test]
    async fn test_duplicate_datatype_rejected() {
        let store = Arc::new(MemoryStore::new());
        let handler = DatatypeDefinitionHandler::new(store.clone());

        let msg = definition_message(crate::ports::outbound::tags::DEFINE_DATATYPE);
        let data = vec![datatype_data("widget", "1")];

        let mut state = BatchState::new();
        let first = handler
            .handle_definition_broadcast(&mut state, &msg, &data, None)
            .await
            .unwrap();
        assert_eq!(first.action, HandlerAction::Confirm);

        let mut state2 = BatchState::new();
        let second = handler
            .handle_definition_broadcast(&mut state2, &msg, &data, None)
            .await
            .unwrap();
        assert_eq!(second.action, HandlerAction::Reject);
    }

    #[tokio::test]
    async fn test_unknown_tag_rejected_by_dispatcher() {
        let dispatcher = DefinitionDispatcher::new();
        let mut state = BatchState::new();
        let msg = definition_message("no_such_definition");
        let result = dispatcher
            .handle_definition_broadcast(&mut state, &msg, &[], None)
            .await
            .unwrap();
        assert_eq!(result.action, HandlerAction::Reject);
    }
}
