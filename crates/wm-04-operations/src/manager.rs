//! The operation manager.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use shared_store::{Store, StoreError};
use shared_store::prelude::*;
use shared_types::{Operation, OpStatus, OpType, PreparedOperation};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::OperationsError;
use wm_02_aggregator::OperationUpdater;

/// What a handler reports after running an operation.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    /// True when the side effect completed synchronously; the manager then
    /// resolves the row to `Succeeded` immediately. False leaves it pending
    /// for an asynchronous connector receipt.
    pub complete: bool,
    /// Connector outputs to record on the row.
    pub outputs: serde_json::Value,
}

impl OperationOutcome {
    /// An outcome that stays pending for an async receipt.
    #[must_use]
    pub fn pending() -> Self {
        OperationOutcome {
            complete: false,
            outputs: serde_json::Value::Null,
        }
    }
}

/// Implemented by each subsystem that executes a class of operations.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Handler name, for logs.
    fn name(&self) -> &str;

    /// Re-resolve the typed payload from a persisted operation's
    /// deterministic input (used on retry paths).
    async fn prepare_operation(&self, op: &Operation)
        -> Result<PreparedOperation, OperationsError>;

    /// Execute the side effect.
    async fn run_operation(
        &self,
        op: &PreparedOperation,
    ) -> Result<OperationOutcome, OperationsError>;
}

/// The operation manager: registry, idempotent insert, execution and retry.
pub struct OperationsManager {
    store: Arc<dyn Store>,
    handlers: RwLock<HashMap<OpType, Arc<dyn OperationHandler>>>,
}

impl OperationsManager {
    /// Build an empty manager.
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(OperationsManager {
            store,
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// Register one handler for a set of operation types.
    pub fn register_handler(&self, handler: Arc<dyn OperationHandler>, op_types: &[OpType]) {
        let mut handlers = self.handlers.write();
        for op_type in op_types {
            debug!(handler = handler.name(), ?op_type, "Operation handler registered");
            handlers.insert(*op_type, Arc::clone(&handler));
        }
    }

    fn handler_for(&self, op_type: OpType) -> Result<Arc<dyn OperationHandler>, OperationsError> {
        self.handlers
            .read()
            .get(&op_type)
            .cloned()
            .ok_or(OperationsError::UnregisteredType(op_type))
    }

    /// Insert an operation, or swap in the existing row with the same
    /// `(tx, type, input)` so retried dispatches stay idempotent.
    pub async fn add_or_reuse_operation(&self, op: &mut Operation) -> Result<(), OperationsError> {
        if let Some(tx) = op.tx {
            let existing = self.store.get_operations_for_tx(&tx).await?;
            if let Some(found) = existing
                .into_iter()
                .find(|o| o.op_type == op.op_type && o.input == op.input)
            {
                debug!(op = %found.id, op_type = ?found.op_type, "Reusing existing operation");
                *op = found;
                return Ok(());
            }
        }
        self.store.insert_operation(op).await?;
        Ok(())
    }

    /// Run a prepared operation through its handler. Synchronous completion
    /// resolves the row; failures record the error on the row before the
    /// error propagates to the caller's retry logic.
    pub async fn run_operation(&self, op: PreparedOperation) -> Result<(), OperationsError> {
        let handler = self.handler_for(op.op_type)?;
        match handler.run_operation(&op).await {
            Ok(outcome) => {
                if outcome.complete {
                    self.store
                        .resolve_operation(&op.id, OpStatus::Succeeded, None, Some(outcome.outputs))
                        .await?;
                }
                Ok(())
            }
            Err(e) => {
                warn!(op = %op.id, error = %e, "Operation failed");
                self.store
                    .resolve_operation(&op.id, OpStatus::Failed, Some(e.to_string()), None)
                    .await?;
                Err(e)
            }
        }
    }

    /// Retry a failed operation: clone the latest row in its retry chain
    /// under a new id, link predecessor to successor, and re-run.
    pub async fn retry_operation(&self, op_id: Uuid) -> Result<Operation, OperationsError> {
        // Follow the chain to the most recent attempt.
        let mut current = self
            .store
            .get_operation_by_id(&op_id)
            .await?
            .ok_or(OperationsError::NotFound(op_id))?;
        while let Some(successor) = current.retry {
            current = self
                .store
                .get_operation_by_id(&successor)
                .await?
                .ok_or(OperationsError::NotFound(successor))?;
        }

        let mut clone = current.clone();
        clone.id = Uuid::new_v4();
        clone.status = OpStatus::Pending;
        clone.error = None;
        clone.output = None;
        clone.retry = None;
        clone.created = shared_types::now();
        clone.updated = clone.created;
        self.store.insert_operation(&clone).await?;
        self.store
            .set_operation_retry(&current.id, &clone.id)
            .await?;
        info!(predecessor = %current.id, op = %clone.id, "Operation retried");

        let handler = self.handler_for(clone.op_type)?;
        let prepared = handler.prepare_operation(&clone).await?;
        self.run_operation(prepared).await?;
        Ok(clone)
    }
}

#[async_trait]
impl OperationUpdater for OperationsManager {
    async fn submit_operation_update(
        &self,
        op_id: Uuid,
        status: OpStatus,
        error: Option<String>,
        output: serde_json::Value,
    ) -> Result<(), StoreError> {
        debug!(op = %op_id, ?status, "Operation update");
        match self
            .store
            .resolve_operation(&op_id, status, error, Some(output))
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                // Receipt for an operation this node never recorded (e.g. a
                // different node's op id); log and move on.
                warn!(op = %op_id, "Operation update for unknown operation");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use shared_store::MemoryStore;
    use shared_types::PreparedData;

    struct ScriptedHandler {
        complete: bool,
        fail: Mutex<u32>,
        runs: Mutex<u32>,
    }

    impl ScriptedHandler {
        fn new(complete: bool) -> Arc<Self> {
            Arc::new(ScriptedHandler {
                complete,
                fail: Mutex::new(0),
                runs: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl OperationHandler for ScriptedHandler {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn prepare_operation(
            &self,
            op: &Operation,
        ) -> Result<PreparedOperation, OperationsError> {
            Ok(PreparedOperation {
                id: op.id,
                op_type: op.op_type,
                data: PreparedData::SendBlob {
                    node: Box::new(shared_types::Identity {
                        id: Uuid::new_v4(),
                        did: "did:weft:node/x".to_string(),
                        identity_type: shared_types::IdentityType::Node,
                        parent: None,
                        namespace: "ns1".to_string(),
                        name: "x".to_string(),
                        profile: serde_json::Value::Null,
                        created: shared_types::now(),
                    }),
                    blob: shared_types::Blob {
                        hash: shared_types::Bytes32::new([1; 32]),
                        payload_ref: "ref".to_string(),
                        size: 1,
                        created: shared_types::now(),
                        sequence: 0,
                    },
                },
            })
        }

        async fn run_operation(
            &self,
            _op: &PreparedOperation,
        ) -> Result<OperationOutcome, OperationsError> {
            *self.runs.lock() += 1;
            {
                let mut fail = self.fail.lock();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(OperationsError::Connector(
                        shared_connectors::ConnectorError::Network("down".to_string()),
                    ));
                }
            }
            Ok(OperationOutcome {
                complete: self.complete,
                outputs: serde_json::json!({"ok": true}),
            })
        }
    }

    fn new_op(tx: Option<Uuid>) -> Operation {
        let mut op = Operation::new("ns1", tx, OpType::DataExchangeSendBlob, "mockdx");
        op.input = serde_json::json!({"node": "x", "hash": "aa"});
        op
    }

    #[tokio::test]
    async fn test_add_or_reuse_is_idempotent_per_tx_type_input() {
        let store = MemoryStore::new_arc();
        let manager = OperationsManager::new(Arc::clone(&store));
        let tx = Uuid::new_v4();

        let mut first = new_op(Some(tx));
        manager.add_or_reuse_operation(&mut first).await.unwrap();

        let mut second = new_op(Some(tx));
        manager.add_or_reuse_operation(&mut second).await.unwrap();
        assert_eq!(second.id, first.id);

        // A different input under the same tx is a new operation.
        let mut third = new_op(Some(tx));
        third.input = serde_json::json!({"node": "y", "hash": "bb"});
        manager.add_or_reuse_operation(&mut third).await.unwrap();
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_synchronous_completion_resolves_succeeded() {
        let store = MemoryStore::new_arc();
        let manager = OperationsManager::new(Arc::clone(&store));
        let handler = ScriptedHandler::new(true);
        manager.register_handler(handler.clone(), &[OpType::DataExchangeSendBlob]);

        let mut op = new_op(None);
        manager.add_or_reuse_operation(&mut op).await.unwrap();
        let prepared = handler.prepare_operation(&op).await.unwrap();
        manager.run_operation(prepared).await.unwrap();

        let row = store.get_operation_by_id(&op.id).await.unwrap().unwrap();
        assert_eq!(row.status, OpStatus::Succeeded);
        assert!(row.output.is_some());
    }

    #[tokio::test]
    async fn test_async_operation_resolved_by_connector_receipt() {
        let store = MemoryStore::new_arc();
        let manager = OperationsManager::new(Arc::clone(&store));
        let handler = ScriptedHandler::new(false);
        manager.register_handler(handler.clone(), &[OpType::DataExchangeSendBlob]);

        let mut op = new_op(None);
        manager.add_or_reuse_operation(&mut op).await.unwrap();
        let prepared = handler.prepare_operation(&op).await.unwrap();
        manager.run_operation(prepared).await.unwrap();

        // Still pending until the receipt lands.
        let row = store.get_operation_by_id(&op.id).await.unwrap().unwrap();
        assert_eq!(row.status, OpStatus::Pending);

        manager
            .submit_operation_update(op.id, OpStatus::Succeeded, None, serde_json::json!({}))
            .await
            .unwrap();
        let row = store.get_operation_by_id(&op.id).await.unwrap().unwrap();
        assert_eq!(row.status, OpStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_operation_records_error_then_retry_chains() {
        let store = MemoryStore::new_arc();
        let manager = OperationsManager::new(Arc::clone(&store));
        let handler = ScriptedHandler::new(true);
        *handler.fail.lock() = 1;
        manager.register_handler(handler.clone(), &[OpType::DataExchangeSendBlob]);

        let mut op = new_op(None);
        manager.add_or_reuse_operation(&mut op).await.unwrap();
        let prepared = handler.prepare_operation(&op).await.unwrap();
        assert!(manager.run_operation(prepared).await.is_err());

        let failed = store.get_operation_by_id(&op.id).await.unwrap().unwrap();
        assert_eq!(failed.status, OpStatus::Failed);
        assert!(failed.error.is_some());

        // Retry clones the row and links predecessor to successor.
        let clone = manager.retry_operation(op.id).await.unwrap();
        assert_ne!(clone.id, op.id);
        let original = store.get_operation_by_id(&op.id).await.unwrap().unwrap();
        assert_eq!(original.retry, Some(clone.id));
        let row = store.get_operation_by_id(&clone.id).await.unwrap().unwrap();
        assert_eq!(row.status, OpStatus::Succeeded);

        // Retrying the original again follows the chain to the latest row.
        let second = manager.retry_operation(op.id).await.unwrap();
        let latest = store.get_operation_by_id(&clone.id).await.unwrap().unwrap();
        assert_eq!(latest.retry, Some(second.id));
    }

    #[tokio::test]
    async fn test_unregistered_type_is_fatal() {
        let store = MemoryStore::new_arc();
        let manager = OperationsManager::new(store);

        let op = PreparedOperation {
            id: Uuid::new_v4(),
            op_type: OpType::BlockchainPinBatch,
            data: shared_types::PreparedData::BatchPin {
                batch: Box::new(shared_types::BatchPersisted {
                    header: shared_types::BatchHeader {
                        id: Uuid::new_v4(),
                        batch_type: shared_types::BatchType::Broadcast,
                        namespace: "ns1".to_string(),
                        signer: shared_types::SignerRef::default(),
                        group: None,
                        created: 0,
                    },
                    manifest: String::new(),
                    tx: shared_types::TransactionRef {
                        tx_type: shared_types::TransactionType::BatchPin,
                        id: None,
                    },
                    hash: shared_types::Bytes32::default(),
                }),
                payload_ref: None,
                contexts: vec![],
            },
        };
        let err = manager.run_operation(op).await.unwrap_err();
        assert!(matches!(err, OperationsError::UnregisteredType(_)));
        assert_eq!(
            shared_types::Classified::class(&err),
            shared_types::ErrorClass::Fatal
        );
    }
}
