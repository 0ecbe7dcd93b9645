//! Blockchain connector port.

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{BatchPin, BlockchainEvent, OpStatus, VerifierRef, VerifierType};
use uuid::Uuid;

use crate::error::ConnectorError;

/// Operations the node drives on the blockchain runtime.
#[async_trait]
pub trait BlockchainConnector: Send + Sync {
    /// Connector plugin name, used for operation records and registries.
    fn name(&self) -> &str;

    /// The verifier type this chain's signing keys resolve under.
    fn verifier_type(&self) -> VerifierType;

    /// Submit a batch-pin transaction. Completion arrives asynchronously via
    /// `BlockchainCallbacks::operation_update` and, once mined, as a
    /// `batch_pin_complete` event observed by every member.
    async fn submit_batch_pin(
        &self,
        op_id: &Uuid,
        signing_key: &str,
        batch_pin: &BatchPin,
    ) -> Result<(), ConnectorError>;

    /// Invoke a contract method (fire-and-forget, receipt via op update).
    async fn invoke_contract(
        &self,
        op_id: &Uuid,
        signing_key: &str,
        location: &serde_json::Value,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<(), ConnectorError>;

    /// Query a contract method synchronously.
    async fn query_contract(
        &self,
        location: &serde_json::Value,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, ConnectorError>;

    /// Register a contract listener; returns the connector's listener id.
    async fn add_contract_listener(
        &self,
        listener_id: &Uuid,
        location: &serde_json::Value,
        event_name: &str,
    ) -> Result<String, ConnectorError>;

    /// Remove a contract listener by the connector's listener id.
    async fn delete_contract_listener(&self, backend_id: &str) -> Result<(), ConnectorError>;
}

/// Receipts and events the blockchain runtime pushes back into the node.
#[async_trait]
pub trait BlockchainCallbacks: Send + Sync {
    /// A batch pin was mined: one pin row per context must be recorded.
    async fn batch_pin_complete(
        &self,
        batch_pin: BatchPin,
        signer: VerifierRef,
    ) -> Result<(), ConnectorError>;

    /// A contract listener matched an event.
    async fn blockchain_event(&self, event: BlockchainEvent) -> Result<(), ConnectorError>;

    /// Status update for a previously submitted operation.
    async fn operation_update(
        &self,
        op_id: Uuid,
        status: OpStatus,
        tx_hash: Option<String>,
        error: Option<String>,
        info: serde_json::Value,
    ) -> Result<(), ConnectorError>;
}

/// One recorded batch-pin submission.
#[derive(Debug, Clone)]
pub struct SubmittedBatchPin {
    /// Operation id the submission was made under.
    pub op_id: Uuid,
    /// Signing key used.
    pub signing_key: String,
    /// The pin payload.
    pub batch_pin: BatchPin,
}

/// In-memory blockchain connector for tests. Records every submission; the
/// test (or harness) decides when to feed completions back through the
/// registered callbacks.
#[derive(Default)]
pub struct MockBlockchainConnector {
    submissions: Mutex<Vec<SubmittedBatchPin>>,
}

impl MockBlockchainConnector {
    /// Create an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All batch-pin submissions recorded so far.
    #[must_use]
    pub fn submissions(&self) -> Vec<SubmittedBatchPin> {
        self.submissions.lock().clone()
    }

    /// Drain recorded submissions.
    #[must_use]
    pub fn take_submissions(&self) -> Vec<SubmittedBatchPin> {
        std::mem::take(&mut *self.submissions.lock())
    }
}

#[async_trait]
impl BlockchainConnector for MockBlockchainConnector {
    fn name(&self) -> &str {
        "mockchain"
    }

    fn verifier_type(&self) -> VerifierType {
        VerifierType::EthAddress
    }

    async fn submit_batch_pin(
        &self,
        op_id: &Uuid,
        signing_key: &str,
        batch_pin: &BatchPin,
    ) -> Result<(), ConnectorError> {
        self.submissions.lock().push(SubmittedBatchPin {
            op_id: *op_id,
            signing_key: signing_key.to_string(),
            batch_pin: batch_pin.clone(),
        });
        Ok(())
    }

    async fn invoke_contract(
        &self,
        _op_id: &Uuid,
        _signing_key: &str,
        _location: &serde_json::Value,
        _method: &str,
        _params: &serde_json::Value,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn query_contract(
        &self,
        _location: &serde_json::Value,
        _method: &str,
        _params: &serde_json::Value,
    ) -> Result<serde_json::Value, ConnectorError> {
        Ok(serde_json::Value::Null)
    }

    async fn add_contract_listener(
        &self,
        listener_id: &Uuid,
        _location: &serde_json::Value,
        _event_name: &str,
    ) -> Result<String, ConnectorError> {
        Ok(format!("mock-listener-{listener_id}"))
    }

    async fn delete_contract_listener(&self, _backend_id: &str) -> Result<(), ConnectorError> {
        Ok(())
    }
}
