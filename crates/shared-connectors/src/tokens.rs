//! Token connector port.

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{OpStatus, TokenTransfer};
use uuid::Uuid;

use crate::error::ConnectorError;

/// A pool creation announcement from the connector.
#[derive(Debug, Clone)]
pub struct TokenPoolAnnouncement {
    /// Local pool id echoed back by the connector.
    pub pool_id: Uuid,
    /// Connector-scoped protocol id of the created pool.
    pub protocol_id: String,
    /// Connector-specific pool details.
    pub info: serde_json::Value,
}

/// Operations the node drives on a token runtime.
#[async_trait]
pub trait TokenConnector: Send + Sync {
    /// Connector plugin name.
    fn name(&self) -> &str;

    /// Create a token pool; confirmation arrives via `token_pool_created`.
    async fn create_token_pool(
        &self,
        op_id: &Uuid,
        pool_id: &Uuid,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<(), ConnectorError>;

    /// Activate an existing pool so its events are delivered to this node.
    async fn activate_token_pool(
        &self,
        pool_id: &Uuid,
        protocol_id: &str,
    ) -> Result<(), ConnectorError>;

    /// Submit a mint, burn or transfer; confirmation arrives via
    /// `tokens_transferred` and the operation via `token_op_update`.
    async fn submit_transfer(
        &self,
        op_id: &Uuid,
        pool_protocol_id: &str,
        transfer: &TokenTransfer,
    ) -> Result<(), ConnectorError>;
}

/// Events the token runtime pushes back into the node.
#[async_trait]
pub trait TokenCallbacks: Send + Sync {
    /// A pool this node created (or activated) is confirmed on-chain.
    async fn token_pool_created(
        &self,
        connector: &str,
        announcement: TokenPoolAnnouncement,
    ) -> Result<(), ConnectorError>;

    /// A transfer was confirmed on-chain for an active pool.
    async fn tokens_transferred(
        &self,
        connector: &str,
        transfer: TokenTransfer,
    ) -> Result<(), ConnectorError>;

    /// Status update for a previously submitted token operation.
    async fn token_op_update(
        &self,
        op_id: Uuid,
        status: OpStatus,
        error: Option<String>,
        info: serde_json::Value,
    ) -> Result<(), ConnectorError>;
}

/// In-memory token connector for tests; records submissions.
#[derive(Default)]
pub struct MockTokenConnector {
    transfers: Mutex<Vec<(Uuid, TokenTransfer)>>,
}

impl MockTokenConnector {
    /// Create an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All transfer submissions recorded so far.
    #[must_use]
    pub fn transfers(&self) -> Vec<(Uuid, TokenTransfer)> {
        self.transfers.lock().clone()
    }
}

#[async_trait]
impl TokenConnector for MockTokenConnector {
    fn name(&self) -> &str {
        "mocktokens"
    }

    async fn create_token_pool(
        &self,
        _op_id: &Uuid,
        _pool_id: &Uuid,
        _name: &str,
        _config: &serde_json::Value,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn activate_token_pool(
        &self,
        _pool_id: &Uuid,
        _protocol_id: &str,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn submit_transfer(
        &self,
        op_id: &Uuid,
        _pool_protocol_id: &str,
        transfer: &TokenTransfer,
    ) -> Result<(), ConnectorError> {
        self.transfers.lock().push((*op_id, transfer.clone()));
        Ok(())
    }
}
