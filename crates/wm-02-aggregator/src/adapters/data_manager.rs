//! Store-backed data manager.

use std::sync::Arc;

use async_trait::async_trait;
use shared_store::{Store, StoreError};
use shared_store::prelude::*;
use shared_types::Data;
use tracing::debug;
use uuid::Uuid;

use crate::ports::outbound::{DataManager, MessageAndData, ReadRequirement};

/// Resolves messages and data straight from the store.
pub struct StoreDataManager {
    store: Arc<dyn Store>,
}

impl StoreDataManager {
    /// Create a data manager over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        StoreDataManager { store }
    }
}

#[async_trait]
impl DataManager for StoreDataManager {
    async fn get_message_with_data(
        &self,
        id: &Uuid,
        requirement: ReadRequirement,
    ) -> Result<Option<MessageAndData>, StoreError> {
        let Some(message) = self.store.get_message_by_id(id).await? else {
            return Ok(None);
        };

        let data_ids: Vec<Uuid> = message.data.iter().map(|d| d.id).collect();
        let data = self.store.get_data_by_ids(&data_ids).await?;

        let mut available = data.len() == data_ids.len();
        match requirement {
            ReadRequirement::MaskedPins => {
                available = available && !message.pins.is_empty() && message.pins_aligned();
            }
            ReadRequirement::PublicBlobRefs => {
                // Broadcast attachments must be fetchable from shared
                // storage by every member.
                available = available
                    && data
                        .iter()
                        .all(|d| d.blob.as_ref().map_or(true, |b| b.public.is_some()));
            }
        }
        Ok(Some(MessageAndData {
            message,
            data,
            available,
        }))
    }

    async fn validate_all(&self, namespace: &str, data: &[Data]) -> Result<bool, StoreError> {
        for record in data {
            let Some(validator) = &record.validator else {
                continue;
            };
            let datatype = self
                .store
                .get_datatype_by_name(namespace, &validator.name, &validator.version)
                .await?;
            let Some(datatype) = datatype else {
                debug!(
                    data = %record.id,
                    validator = %validator.name,
                    version = %validator.version,
                    "Datatype not found for typed data"
                );
                return Ok(false);
            };
            // The schema hook: a typed record must carry an inline value for
            // the datatype to apply to.
            if record.value.is_none() {
                debug!(data = %record.id, datatype = %datatype.name, "Typed data has no value");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
