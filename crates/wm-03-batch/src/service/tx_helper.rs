//! Transaction submission helper.

use shared_store::{Store, StoreError};
use shared_store::prelude::*;
use shared_types::{Event, EventType, Transaction, TransactionType};
use tracing::debug;
use uuid::Uuid;

/// Creates transaction rows and their submission events. Shared by the batch
/// processors; must be called inside the caller's transactional group so the
/// transaction commits atomically with the batch that references it.
pub struct TransactionHelper;

impl TransactionHelper {
    /// Insert a new transaction and emit `TransactionSubmitted`.
    pub async fn submit_new_transaction(
        store: &dyn Store,
        namespace: &str,
        tx_type: TransactionType,
    ) -> Result<Uuid, StoreError> {
        let tx = Transaction {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            tx_type,
            created: shared_types::now(),
            blockchain_ids: vec![],
        };
        store.insert_transaction(&tx).await?;

        let mut event = Event::new(
            EventType::TransactionSubmitted,
            namespace,
            tx.id,
            Some(tx.id),
            None,
        );
        store.insert_event(&mut event).await?;
        debug!(tx = %tx.id, ?tx_type, "Transaction submitted");
        Ok(tx.id)
    }
}
