//! Data-exchange connector port.

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::Bytes32;
use uuid::Uuid;

use crate::error::ConnectorError;

/// Final status of an asynchronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer reached the peer.
    Succeeded,
    /// The transfer failed permanently.
    Failed,
}

/// Operations the node drives on the private data-exchange runtime.
#[async_trait]
pub trait DataExchangeConnector: Send + Sync {
    /// Connector plugin name.
    fn name(&self) -> &str;

    /// Transfer a locally-stored blob to a peer. Completion arrives via
    /// `DataExchangeCallbacks::transfer_result` carrying the operation id.
    async fn transfer_blob(
        &self,
        op_id: &Uuid,
        peer_id: &str,
        payload_ref: &str,
    ) -> Result<(), ConnectorError>;

    /// Send a serialized transport wrapper to a peer.
    async fn send_message(
        &self,
        op_id: &Uuid,
        peer_id: &str,
        payload: &[u8],
    ) -> Result<(), ConnectorError>;
}

/// Events the data-exchange runtime pushes back into the node.
#[async_trait]
pub trait DataExchangeCallbacks: Send + Sync {
    /// A batch payload arrived from a peer. Returns a tracking id when the
    /// payload was accepted for processing.
    async fn message_received(
        &self,
        peer_id: &str,
        payload: &[u8],
    ) -> Result<Option<String>, ConnectorError>;

    /// A blob arrived from a peer and is available at `payload_ref`.
    async fn private_blob_received(
        &self,
        peer_id: &str,
        hash: Bytes32,
        size: i64,
        payload_ref: &str,
    ) -> Result<(), ConnectorError>;

    /// Final status of a transfer initiated by this node.
    async fn transfer_result(
        &self,
        tracking_id: &str,
        status: TransferStatus,
        info: serde_json::Value,
    ) -> Result<(), ConnectorError>;
}

/// One recorded outbound send.
#[derive(Debug, Clone)]
pub enum SentItem {
    /// A blob transfer.
    Blob {
        op_id: Uuid,
        peer_id: String,
        payload_ref: String,
    },
    /// A batch payload send.
    Message {
        op_id: Uuid,
        peer_id: String,
        payload: Vec<u8>,
    },
}

/// In-memory data-exchange connector for tests; records sends in order.
#[derive(Default)]
pub struct MockDataExchangeConnector {
    sent: Mutex<Vec<SentItem>>,
}

impl MockDataExchangeConnector {
    /// Create an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All sends recorded so far, in call order.
    #[must_use]
    pub fn sent(&self) -> Vec<SentItem> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataExchangeConnector for MockDataExchangeConnector {
    fn name(&self) -> &str {
        "mockdx"
    }

    async fn transfer_blob(
        &self,
        op_id: &Uuid,
        peer_id: &str,
        payload_ref: &str,
    ) -> Result<(), ConnectorError> {
        self.sent.lock().push(SentItem::Blob {
            op_id: *op_id,
            peer_id: peer_id.to_string(),
            payload_ref: payload_ref.to_string(),
        });
        Ok(())
    }

    async fn send_message(
        &self,
        op_id: &Uuid,
        peer_id: &str,
        payload: &[u8],
    ) -> Result<(), ConnectorError> {
        self.sent.lock().push(SentItem::Message {
            op_id: *op_id,
            peer_id: peer_id.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}
