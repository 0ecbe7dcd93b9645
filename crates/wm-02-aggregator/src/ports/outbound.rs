//! Outbound (driven) ports for the aggregator.

use async_trait::async_trait;
use shared_store::StoreError;
use shared_types::{Data, Message, OpStatus};
use uuid::Uuid;

use crate::domain::batch_state::BatchState;

/// System message tags the aggregator routes on.
pub mod tags {
    /// A signed identity claim broadcast (bootstrap path).
    pub const IDENTITY_CLAIM: &str = "identity_claim";
    /// A datatype definition broadcast.
    pub const DEFINE_DATATYPE: &str = "define_datatype";
}

/// What must be complete for a message read to count as "available".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRequirement {
    /// Private path: the masked pins must be present and topic-aligned.
    MaskedPins,
    /// Broadcast path: blob-carrying data must carry public payload refs.
    PublicBlobRefs,
}

/// A message with its data, plus whether everything required is present.
#[derive(Debug, Clone)]
pub struct MessageAndData {
    /// The message.
    pub message: Message,
    /// Its resolved data records, in reference order.
    pub data: Vec<Data>,
    /// False when data rows are missing or the read requirement failed.
    pub available: bool,
}

/// Resolves messages with their data, and validates typed payloads.
#[async_trait]
pub trait DataManager: Send + Sync {
    /// Load a message and all of its data.
    async fn get_message_with_data(
        &self,
        id: &Uuid,
        requirement: ReadRequirement,
    ) -> Result<Option<MessageAndData>, StoreError>;

    /// Validate typed data records against their registered datatypes.
    /// Returns false (reject) when a validator reference does not resolve or
    /// the value does not conform.
    async fn validate_all(&self, namespace: &str, data: &[Data]) -> Result<bool, StoreError>;
}

/// What a definition handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    /// Definition applied; confirm the message.
    Confirm,
    /// Definition invalid or duplicate; reject the message.
    Reject,
    /// Dependencies missing; leave the message parked for a later pass.
    Wait,
}

/// Result of handling one definition broadcast.
#[derive(Debug, Clone)]
pub struct HandlerResult {
    /// The decision.
    pub action: HandlerAction,
    /// Optional correlator for the confirm/reject event (e.g. the id of the
    /// object the definition created).
    pub custom_correlator: Option<Uuid>,
}

impl HandlerResult {
    /// Shorthand for a plain decision with no correlator.
    #[must_use]
    pub fn action(action: HandlerAction) -> Self {
        HandlerResult {
            action,
            custom_correlator: None,
        }
    }
}

/// Handles definition broadcasts in-line on the aggregator, so applications
/// never see events that depend on an unapplied definition.
///
/// Returning `Err` with a transient error retries the whole page; `Wait`
/// parks the message without blocking the stream.
#[async_trait]
pub trait DefinitionHandler: Send + Sync {
    /// Apply one definition broadcast.
    async fn handle_definition_broadcast(
        &self,
        state: &mut BatchState,
        message: &Message,
        data: &[Data],
        tx: Option<Uuid>,
    ) -> Result<HandlerResult, StoreError>;
}

/// Receives asynchronous operation status updates from connectors.
#[async_trait]
pub trait OperationUpdater: Send + Sync {
    /// Resolve an operation from a connector receipt.
    async fn submit_operation_update(
        &self,
        op_id: Uuid,
        status: OpStatus,
        error: Option<String>,
        output: serde_json::Value,
    ) -> Result<(), StoreError>;
}
