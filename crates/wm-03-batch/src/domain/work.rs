//! Batch work items and dispatch state.

use shared_types::{BatchManifest, BatchPersisted, Bytes32, Data, Message, TransactionType};

use crate::config::BATCH_PAYLOAD_ESTIMATE_BASE;

/// One message (with its data) queued for batch assembly.
#[derive(Debug, Clone)]
pub struct BatchWork {
    /// The message; `sequence` orders the assembly queue.
    pub message: Message,
    /// The message's resolved data records.
    pub data: Vec<Data>,
}

impl BatchWork {
    /// Estimated contribution to the serialized batch payload.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        let data_sizes: usize = self.data.iter().map(|d| d.value_size()).sum();
        self.message.estimate_size(data_sizes)
    }
}

/// The key a work item routes under: one processor exists per distinct key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessorKey {
    /// Dispatcher name.
    pub dispatcher: String,
    /// Message namespace.
    pub namespace: String,
    /// Transaction type the dispatcher anchors with.
    pub tx_type: TransactionType,
    /// Group hash for private work.
    pub group: Option<Bytes32>,
}

/// A sealed batch handed to a dispatch handler.
#[derive(Debug, Clone)]
pub struct DispatchState {
    /// The persisted batch row.
    pub persisted: BatchPersisted,
    /// The manifest generated at seal time.
    pub manifest: BatchManifest,
    /// The sealed messages, pins populated for private batches.
    pub messages: Vec<Message>,
    /// The sealed data records.
    pub data: Vec<Data>,
    /// Pin contexts in manifest order: masked pins for private batches,
    /// topic hashes for broadcast.
    pub pins: Vec<Bytes32>,
}

/// Estimated payload size of a prospective batch.
#[must_use]
pub fn estimate_batch_size(work: &[BatchWork]) -> usize {
    BATCH_PAYLOAD_ESTIMATE_BASE + work.iter().map(BatchWork::estimate_size).sum::<usize>()
}
