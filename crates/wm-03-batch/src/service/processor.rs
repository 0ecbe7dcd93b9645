//! The per-key batch processor.
//!
//! One processor exists per dispatch key. It drains its assembly queue into
//! size/byte/time-bounded batches, seals each batch in a transactional group
//! (transaction submission, masked-pin allocation, manifest generation,
//! persistence, messages to `Sent`), dispatches it through the registered
//! handler with retry, and tears itself down after the dispose timeout.

use std::collections::HashMap;
use std::sync::Arc;

use shared_store::{Store, StoreError};
use shared_store::prelude::*;
use shared_types::hashing::{masked_context, masked_pin, unmasked_context};
use shared_types::{
    BatchHeader, BatchPersisted, Bytes32, Classified, Data, Event, EventType, Message,
    MessageState, Nonce, SignerRef, TransactionRef, TransactionType,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{DispatcherOptions, BATCH_PAYLOAD_ESTIMATE_BASE};
use crate::domain::queue::AssemblyQueue;
use crate::domain::work::{BatchWork, DispatchState, ProcessorKey};
use crate::error::BatchError;
use crate::service::manager::DispatchHandler;
use crate::service::tx_helper::TransactionHelper;
use wm_01_event_poller::Retry;

/// Configuration for one processor instance.
#[derive(Debug, Clone)]
pub struct BatchProcessorConf {
    /// The routing key this processor serves.
    pub key: ProcessorKey,
    /// Signer stamped onto sealed batches.
    pub signer: SignerRef,
    /// Assembly bounds.
    pub options: DispatcherOptions,
}

/// The processor task.
pub struct BatchProcessor {
    conf: BatchProcessorConf,
    store: Arc<dyn Store>,
    dispatch: Arc<dyn DispatchHandler>,
    retry: Retry,
    queue: Arc<AssemblyQueue>,
    shutdown: watch::Receiver<bool>,
    quiesce_tx: mpsc::Sender<ProcessorKey>,
}

impl BatchProcessor {
    /// Build a processor over an existing queue.
    pub fn new(
        conf: BatchProcessorConf,
        store: Arc<dyn Store>,
        dispatch: Arc<dyn DispatchHandler>,
        retry: Retry,
        queue: Arc<AssemblyQueue>,
        shutdown: watch::Receiver<bool>,
        quiesce_tx: mpsc::Sender<ProcessorKey>,
    ) -> Self {
        BatchProcessor {
            conf,
            store,
            dispatch,
            retry,
            queue,
            shutdown,
            quiesce_tx,
        }
    }

    /// Spawn the processor loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(mut self) {
        let key = self.conf.key.clone();
        debug!(
            dispatcher = %key.dispatcher,
            namespace = %key.namespace,
            group = key.group.map(|g| g.to_string()).unwrap_or_default(),
            "Batch processor started"
        );

        let options = self.conf.options.clone();
        let mut deadline: Option<Instant> = None;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let (count, bytes) = self.queue.stats();
            if count == 0 {
                deadline = None;
                tokio::select! {
                    _ = self.queue.arrived() => {
                        deadline = Some(Instant::now() + options.batch_timeout);
                        continue;
                    }
                    _ = tokio::time::sleep(options.dispose_timeout) => {
                        debug!(dispatcher = %key.dispatcher, "Batch processor quiescing");
                        let _ = self.quiesce_tx.send(key.clone()).await;
                        break;
                    }
                    _ = self.shutdown.changed() => break,
                }
            }

            let full = count >= options.batch_max_size
                || bytes + BATCH_PAYLOAD_ESTIMATE_BASE >= options.batch_max_bytes;
            if !full {
                let until = *deadline.get_or_insert_with(|| Instant::now() + options.batch_timeout);
                tokio::select! {
                    _ = self.queue.arrived() => continue,
                    _ = tokio::time::sleep_until(until) => {}
                    _ = self.shutdown.changed() => break,
                }
            }

            let page = self
                .queue
                .take_page(options.batch_max_size, options.batch_max_bytes);
            deadline = None;
            if page.is_empty() {
                continue;
            }
            if !self.seal_and_dispatch(page).await {
                break;
            }
        }
        debug!(dispatcher = %key.dispatcher, "Batch processor stopped");
    }

    /// Seal and dispatch one page, retrying transient failures until
    /// shutdown. Returns false when the loop must exit.
    async fn seal_and_dispatch(&mut self, work: Vec<BatchWork>) -> bool {
        let mut attempt: u32 = 0;
        let state = loop {
            match self.seal_batch(&work).await {
                Ok(state) => break state,
                Err(e) if e.is_transient() => {
                    if !self.retry.wait(attempt, &mut self.shutdown).await {
                        return false;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(error = %e, "Batch seal failed unrecoverably");
                    return true;
                }
            }
        };
        info!(
            batch = %state.persisted.header.id,
            messages = state.messages.len(),
            pins = state.pins.len(),
            "Batch sealed"
        );

        attempt = 0;
        loop {
            match self.dispatch.dispatch(&state).await {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    if !self.retry.wait(attempt, &mut self.shutdown).await {
                        return false;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(batch = %state.persisted.header.id, error = %e, "Batch dispatch failed unrecoverably");
                    return true;
                }
            }
        }

        if self.conf.key.tx_type == TransactionType::Unpinned {
            attempt = 0;
            loop {
                match self.mark_unpinned_confirmed(&state).await {
                    Ok(()) => break,
                    Err(e) if e.is_transient() => {
                        if !self.retry.wait(attempt, &mut self.shutdown).await {
                            return false;
                        }
                        attempt += 1;
                    }
                    Err(e) => {
                        error!(batch = %state.persisted.header.id, error = %e, "Unpinned confirm failed");
                        return true;
                    }
                }
            }
        }
        true
    }

    /// Seal one page into a persisted batch within a transactional group.
    async fn seal_batch(&self, work: &[BatchWork]) -> Result<DispatchState, BatchError> {
        let conf = &self.conf;
        let mut messages: Vec<Message> = work.iter().map(|w| w.message.clone()).collect();

        // Data records may be shared between messages; persist each once.
        let mut data: Vec<Data> = Vec::new();
        let mut seen: HashMap<Uuid, ()> = HashMap::new();
        for item in work {
            for record in &item.data {
                if seen.insert(record.id, ()).is_none() {
                    data.push(record.clone());
                }
            }
        }

        let mut contexts: Vec<Bytes32> = Vec::new();
        let mut sealed: Option<(BatchPersisted, shared_types::BatchManifest)> = None;
        {
            let messages_ref = &mut messages;
            let contexts_ref = &mut contexts;
            let sealed_ref = &mut sealed;
            let data_ref = &data;
            self.store
                .run_as_group(Box::new(move |store| {
                    Box::pin(async move {
                        let tx_id = TransactionHelper::submit_new_transaction(
                            store,
                            &conf.key.namespace,
                            conf.key.tx_type,
                        )
                        .await?;

                        if let Some(group) = conf.key.group {
                            // Masked pins: one per message-topic, in manifest
                            // order, each consuming the next context nonce.
                            for message in messages_ref.iter_mut() {
                                let mut pins = Vec::with_capacity(message.header.topics.len());
                                for topic in &message.header.topics {
                                    let context = masked_context(&group, topic);
                                    let nonce = store
                                        .upsert_nonce_next(&Nonce {
                                            context,
                                            nonce: 0,
                                            group,
                                            topic: topic.clone(),
                                        })
                                        .await?;
                                    let pin = masked_pin(
                                        &group,
                                        topic,
                                        &message.header.signer.author,
                                        nonce,
                                    );
                                    pins.push(format!("{pin}:{nonce}"));
                                    contexts_ref.push(pin);
                                }
                                message.pins = pins;
                                store
                                    .update_message_pins(&message.header.id, &message.pins)
                                    .await?;
                            }
                        } else {
                            for message in messages_ref.iter() {
                                for topic in &message.header.topics {
                                    contexts_ref.push(unmasked_context(topic));
                                }
                            }
                        }

                        let header = BatchHeader {
                            id: Uuid::new_v4(),
                            batch_type: conf.options.batch_type,
                            namespace: conf.key.namespace.clone(),
                            signer: conf.signer.clone(),
                            group: conf.key.group,
                            created: shared_types::now(),
                        };
                        let tx_ref = TransactionRef {
                            tx_type: conf.key.tx_type,
                            id: Some(tx_id),
                        };
                        let (persisted, manifest) =
                            BatchPersisted::seal(header, tx_ref, messages_ref, data_ref)
                                .map_err(|e| StoreError::Serialization(e.to_string()))?;
                        store.upsert_batch(&persisted).await?;

                        let ids: Vec<Uuid> =
                            messages_ref.iter().map(|m| m.header.id).collect();
                        store
                            .update_messages_batch(&ids, persisted.header.id, MessageState::Sent)
                            .await?;
                        *sealed_ref = Some((persisted, manifest));
                        Ok(())
                    })
                }))
                .await?;
        }

        let (persisted, manifest) = sealed.expect("seal group completed");
        Ok(DispatchState {
            persisted,
            manifest,
            messages,
            data,
            pins: contexts,
        })
    }

    /// Unpinned sends have no on-chain confirmation: the messages confirm as
    /// soon as the batch is handed to the transport.
    async fn mark_unpinned_confirmed(&self, state: &DispatchState) -> Result<(), BatchError> {
        let messages = &state.messages;
        let tx_id = state.persisted.tx.id;
        self.store
            .run_as_group(Box::new(move |store| {
                Box::pin(async move {
                    let now = shared_types::now();
                    for message in messages {
                        store
                            .update_message_state(
                                &message.header.id,
                                MessageState::Confirmed,
                                Some(now),
                            )
                            .await?;
                        for topic in &message.header.topics {
                            let mut event = Event::new(
                                EventType::MessageConfirmed,
                                &message.header.namespace,
                                message.header.id,
                                tx_id,
                                Some(topic.clone()),
                            );
                            event.correlator = message.header.cid;
                            store.insert_event(&mut event).await?;
                        }
                    }
                    Ok(())
                })
            }))
            .await?;
        Ok(())
    }
}
