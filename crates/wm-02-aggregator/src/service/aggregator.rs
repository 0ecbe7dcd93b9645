//! The pin-ordered aggregation loop.
//!
//! Consumes pages of undispatched pins in local sequence order. For each pin
//! it resolves the owning batch and message, decides readiness per topic
//! (next-pin match for masked contexts, topic-block check for unmasked),
//! attempts dispatch, and queues the outcome into the page's batch state.
//! All outcomes commit in one transactional group per page, including the
//! poller offset.
//!
//! Late-arriving input (a blob, an off-chain batch, a token transfer) queues
//! a batch rewind: the poller re-reads from just before the earliest
//! undispatched pin of the affected batches.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_store::{Store, StoreError};
use shared_store::prelude::*;
use shared_types::hashing::unmasked_context;
use shared_types::{
    BatchManifest, BatchPersisted, Bytes32, Data, IdentityType, MaskedPin, Message, MessageState,
    MessageType, Event, EventType, Pin, VerifierRef, VerifierType,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::AggregatorConf;
use crate::domain::batch_cache::BatchCache;
use crate::domain::batch_state::{BatchState, NextPinRef};
use crate::ports::outbound::{
    tags, DataManager, DefinitionHandler, HandlerAction, ReadRequirement,
};
use wm_01_event_poller::{EventPoller, OffsetCommitter, PollHandlers, ShoulderTap};

/// The aggregator service.
pub struct Aggregator {
    conf: AggregatorConf,
    store: Arc<dyn Store>,
    data: Arc<dyn DataManager>,
    definitions: Arc<dyn DefinitionHandler>,
    verifier_type: VerifierType,
    batch_cache: Mutex<BatchCache>,
    tap: ShoulderTap,
    rewind_tx: mpsc::Sender<Uuid>,
    rewind_rx: StdMutex<Option<mpsc::Receiver<Uuid>>>,
    queued_tx: mpsc::Sender<Uuid>,
    queued_rx: tokio::sync::Mutex<mpsc::Receiver<Uuid>>,
    committer: OnceLock<Arc<OffsetCommitter>>,
}

impl Aggregator {
    /// Build the aggregator. `verifier_type` comes from the blockchain
    /// connector, so pin signers resolve under the right key space.
    pub fn new(
        conf: AggregatorConf,
        store: Arc<dyn Store>,
        data: Arc<dyn DataManager>,
        definitions: Arc<dyn DefinitionHandler>,
        verifier_type: VerifierType,
    ) -> Arc<Self> {
        let (rewind_tx, rewind_rx) = mpsc::channel(1);
        let (queued_tx, queued_rx) = mpsc::channel(conf.batch_size.max(1));
        Arc::new(Aggregator {
            batch_cache: Mutex::new(BatchCache::new(
                conf.batch_cache_bytes,
                conf.batch_cache_ttl,
            )),
            conf,
            store,
            data,
            definitions,
            verifier_type,
            tap: ShoulderTap::new(),
            rewind_tx,
            rewind_rx: StdMutex::new(Some(rewind_rx)),
            queued_tx,
            queued_rx: tokio::sync::Mutex::new(queued_rx),
            committer: OnceLock::new(),
        })
    }

    /// Start the poller and the rewind listener. Returns the spawned task
    /// handles.
    pub fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, String> {
        let poller = EventPoller::new(
            self.conf.poller_conf(),
            Arc::clone(&self.store),
            Arc::clone(self),
            self.tap.clone(),
            shutdown.clone(),
        )?;
        let _ = self.committer.set(poller.offset_committer());

        let mut handles = vec![poller.spawn()];
        let listener = Arc::clone(self);
        let mut listener_shutdown = shutdown;
        let mut rewind_rx = self
            .rewind_rx
            .lock()
            .expect("rewind receiver lock")
            .take()
            .ok_or("aggregator already started")?;
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_batch = rewind_rx.recv() => {
                        let Some(batch) = maybe_batch else { break };
                        if listener.queued_tx.send(batch).await.is_err() {
                            break;
                        }
                        listener.tap.tap();
                    }
                    _ = listener_shutdown.changed() => break,
                }
            }
            debug!("Aggregator rewind listener stopped");
        }));
        Ok(handles)
    }

    /// The tap that wakes the pin poller (new pins arrived).
    #[must_use]
    pub fn shoulder_tap(&self) -> ShoulderTap {
        self.tap.clone()
    }

    /// Queue a rewind for one batch whose inputs may now be complete.
    pub async fn queue_batch_rewind(&self, batch: Uuid) {
        if self.rewind_tx.send(batch).await.is_err() {
            debug!(batch = %batch, "Rewind channel closed; dropping rewind");
        }
    }

    /// A blob arrived: rewind every batch holding an unconfirmed message
    /// that references it.
    pub async fn rewind_for_blob_arrival(&self, blob_hash: &Bytes32) -> Result<(), StoreError> {
        let mut batches: HashSet<Uuid> = HashSet::new();
        let refs = self.store.get_data_refs_for_blob(blob_hash).await?;
        for data_ref in refs {
            let messages = self
                .store
                .get_messages_for_data(&data_ref.id, true)
                .await?;
            for message in messages {
                if let Some(batch) = message.batch {
                    batches.insert(batch);
                }
            }
        }
        for batch in batches {
            info!(batch = %batch, blob = %blob_hash, "Batch references received blob; rewinding");
            self.queue_batch_rewind(batch).await;
        }
        Ok(())
    }

    /// Resolve `(batch, manifest)` for a pin, through the cache. `None`
    /// parks the pin: batch missing, hash mismatch, or unusable manifest.
    async fn get_batch_for_pin(
        &self,
        store: &dyn Store,
        pin: &Pin,
    ) -> Result<Option<(BatchPersisted, BatchManifest)>, StoreError> {
        let key = (pin.batch, pin.batch_hash);
        if let Some(hit) = self.batch_cache.lock().get(&key) {
            return Ok(Some(hit));
        }
        let Some(batch) = store.get_batch_by_id(&pin.batch).await? else {
            return Ok(None);
        };
        if batch.hash != pin.batch_hash {
            error!(
                batch = %pin.batch,
                off_chain = %batch.hash,
                on_chain = %pin.batch_hash,
                "Batch hash does not match the pin"
            );
            return Ok(None);
        }
        let Some(manifest) = batch.extract_manifest() else {
            error!(batch = %pin.batch, pin = %pin.hash, "Batch manifest could not be extracted; pin parked");
            return Ok(None);
        };
        self.batch_cache
            .lock()
            .put(key, batch.clone(), manifest.clone());
        Ok(Some((batch, manifest)))
    }

    /// Process one page of pins against a fresh batch state.
    async fn process_pins(
        &self,
        store: &dyn Store,
        pins: &[Pin],
        state: &mut BatchState,
    ) -> Result<(), StoreError> {
        let mut current: Option<(BatchPersisted, BatchManifest)> = None;
        // One message produces one pin per topic; process it once per page.
        let mut dup_msg_check: HashSet<Uuid> = HashSet::new();

        for pin in pins {
            let matches_current = current
                .as_ref()
                .map_or(false, |(b, _)| b.header.id == pin.batch && b.hash == pin.batch_hash);
            if !matches_current {
                current = self.get_batch_for_pin(store, pin).await?;
            }
            let Some((batch, manifest)) = &current else {
                debug!(
                    sequence = pin.sequence,
                    batch = %pin.batch,
                    index = pin.index,
                    masked = pin.masked,
                    "Pin batch unavailable"
                );
                continue;
            };

            let Some((entry, base_index)) = manifest.entry_for_pin_index(pin.index) else {
                error!(
                    sequence = pin.sequence,
                    batch = %pin.batch,
                    pin_count = manifest.pin_count(),
                    index = pin.index,
                    "Pin outside of manifest range"
                );
                continue;
            };

            debug!(
                sequence = pin.sequence,
                batch = %pin.batch,
                message = %entry.id,
                index = pin.index,
                base_index,
                masked = pin.masked,
                "Aggregating pin"
            );
            if !dup_msg_check.insert(entry.id) {
                continue;
            }

            let batch_id = batch.header.id;
            let tx_id = manifest.tx.id;
            let entry_id = entry.id;
            self.process_message(store, batch_id, tx_id, pin, base_index, entry_id, state)
                .await?;
        }

        if let (Some(committer), Some(last)) = (self.committer.get(), pins.last()) {
            committer.commit_in_group(store, last.sequence).await?;
        }
        Ok(())
    }

    /// Decide readiness and attempt dispatch for one message.
    #[allow(clippy::too_many_arguments)]
    async fn process_message(
        &self,
        store: &dyn Store,
        batch_id: Uuid,
        tx_id: Option<Uuid>,
        pin: &Pin,
        base_index: i64,
        message_id: Uuid,
        state: &mut BatchState,
    ) -> Result<(), StoreError> {
        let requirement = if pin.masked {
            ReadRequirement::MaskedPins
        } else {
            ReadRequirement::PublicBlobRefs
        };
        let Some(loaded) = self.data.get_message_with_data(&message_id, requirement).await?
        else {
            error!(message = %message_id, batch = %batch_id, "Message in manifest not found");
            return Ok(());
        };
        if !loaded.available {
            error!(message = %message_id, batch = %batch_id, "Message is missing data");
            return Ok(());
        }
        let (message, data) = (loaded.message, loaded.data);

        let mut unmasked_contexts: Vec<Bytes32> = Vec::new();
        let mut next_pins: Vec<NextPinRef> = Vec::new();
        if pin.masked {
            if message.header.group.is_none() || !message.pins_aligned() || message.pins.is_empty()
            {
                error!(
                    message = %message.header.id,
                    batch = %batch_id,
                    pins = message.pins.len(),
                    topics = message.header.topics.len(),
                    "Message has invalid pin data"
                );
                return Ok(());
            }
            for (i, pin_str) in message.pins.iter().enumerate() {
                let parsed = match MaskedPin::parse(pin_str) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        error!(
                            message = %message.header.id,
                            batch = %batch_id,
                            index = i,
                            pin = %pin_str,
                            "Message has invalid masked pin"
                        );
                        return Ok(());
                    }
                };
                let topic = &message.header.topics[i];
                let Some(next_pin) = state
                    .check_masked_context_ready(store, &message, topic, &parsed.hash)
                    .await?
                else {
                    return Ok(());
                };
                next_pins.push(next_pin);
            }
        } else {
            for topic in &message.header.topics {
                let context = unmasked_context(topic);
                unmasked_contexts.push(context);
                let ready = state
                    .check_unmasked_context_ready(store, context, pin.sequence)
                    .await?;
                if !ready {
                    // Do not overtake the blocked message; park behind it.
                    for context in unmasked_contexts {
                        state.set_context_blocked_by(context, pin.sequence);
                    }
                    return Ok(());
                }
            }
        }

        debug!(
            message = %message.header.id,
            broadcast_contexts = unmasked_contexts.len(),
            private_pins = message.pins.len(),
            "Attempting dispatch"
        );
        let outcome = self
            .attempt_message_dispatch(store, &message, &data, tx_id, state, pin)
            .await?;

        match outcome {
            Some(new_state) => {
                for next_pin in &next_pins {
                    state.increment_next_pin(next_pin);
                }
                state.mark_message_dispatched(batch_id, &message, base_index, new_state);
            }
            None => {
                for context in unmasked_contexts {
                    state.set_context_blocked_by(context, pin.sequence);
                }
            }
        }
        Ok(())
    }

    /// Verify the pin signer is the message key, and that the key resolves
    /// back to the claimed author identity. Identity-claim broadcasts with an
    /// unregistered key are deferred to the definition handler; private
    /// messages may carry keys that are not registered.
    async fn check_onchain_consistency(
        &self,
        store: &dyn Store,
        message: &Message,
        pin: &Pin,
    ) -> Result<bool, StoreError> {
        let signer = &message.header.signer;
        if signer.key.is_empty() || signer.key != pin.signer {
            error!(
                message = %message.header.id,
                key = %signer.key,
                pin_signer = %pin.signer,
                "Message key does not match the signer of the pin"
            );
            return Ok(false);
        }

        let verifier = VerifierRef {
            verifier_type: self.verifier_type,
            value: pin.signer.clone(),
        };
        let resolved = store
            .find_identity_for_verifier(
                &[IdentityType::Org, IdentityType::Custom],
                &message.header.namespace,
                &verifier,
            )
            .await?;

        match resolved {
            None => {
                let claim = message.header.msg_type == MessageType::Definition
                    && message.header.tag.as_deref() == Some(tags::IDENTITY_CLAIM);
                if claim {
                    // Bootstrap: the claim handler verifies this identity.
                    return Ok(true);
                }
                if message.header.msg_type != MessageType::Private {
                    error!(
                        message = %message.header.id,
                        author = %signer.author,
                        "Author could not be resolved for non-private message"
                    );
                    return Ok(false);
                }
                Ok(true)
            }
            Some(identity) => {
                if signer.author.is_empty() || identity.did != signer.author {
                    error!(
                        message = %message.header.id,
                        author = %signer.author,
                        resolved = %identity.did,
                        "Author does not match identity registered to key"
                    );
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    /// Every blob referenced by the data must already be in the local store.
    async fn resolve_blobs(&self, store: &dyn Store, data: &[Data]) -> Result<bool, StoreError> {
        for record in data {
            let Some(blob_ref) = &record.blob else {
                continue;
            };
            let blob = store.get_blob_matching_hash(&blob_ref.hash).await?;
            match blob {
                Some(blob) => {
                    debug!(blob = %blob.hash, payload_ref = %blob.payload_ref, "Blob found locally");
                }
                None => {
                    debug!(blob = %blob_ref.hash, data = %record.id, "Blob not yet available");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Attempt dispatch. `Ok(None)` leaves the message parked; `Ok(Some)`
    /// carries the decided terminal state.
    async fn attempt_message_dispatch(
        &self,
        store: &dyn Store,
        message: &Message,
        data: &[Data],
        tx_id: Option<Uuid>,
        state: &mut BatchState,
        pin: &Pin,
    ) -> Result<Option<MessageState>, StoreError> {
        if !self.check_onchain_consistency(store, message, pin).await? {
            return Ok(None);
        }
        if !self.resolve_blobs(store, data).await? {
            return Ok(None);
        }

        // Transfer-carrying messages wait for the matching token transfer.
        if message.header.msg_type.carries_transfer() {
            let transfers = store
                .get_token_transfers_for_message(&message.header.id)
                .await?;
            match transfers.first() {
                None => {
                    debug!(message = %message.header.id, "Transfer for message not yet available");
                    return Ok(None);
                }
                Some(transfer) if transfer.message_hash != Some(message.hash) => {
                    error!(
                        message = %message.header.id,
                        message_hash = %message.hash,
                        "Message hash does not match hash recorded in transfer"
                    );
                    return Ok(None);
                }
                Some(_) => {}
            }
        }

        let mut valid = true;
        let mut custom_correlator: Option<Uuid> = None;
        match message.header.msg_type {
            MessageType::Definition => {
                // Definition broadcasts apply in-line, before any app event.
                let result = self
                    .definitions
                    .handle_definition_broadcast(state, message, data, tx_id)
                    .await?;
                info!(
                    tag = message.header.tag.as_deref().unwrap_or_default(),
                    message = %message.header.id,
                    action = ?result.action,
                    "Definition broadcast handled"
                );
                match result.action {
                    HandlerAction::Wait => return Ok(None),
                    HandlerAction::Confirm => valid = true,
                    HandlerAction::Reject => valid = false,
                }
                custom_correlator = result.custom_correlator;
            }
            MessageType::GroupInit => {
                // The group was applied while resolving the context.
            }
            _ if !data.is_empty() => {
                valid = self
                    .data
                    .validate_all(&message.header.namespace, data)
                    .await?;
            }
            _ => {}
        }

        let (new_state, event_type) = if valid {
            (MessageState::Confirmed, EventType::MessageConfirmed)
        } else {
            (MessageState::Rejected, EventType::MessageRejected)
        };

        let topics = message.header.topics.clone();
        let namespace = message.header.namespace.clone();
        let message_id = message.header.id;
        let correlator = custom_correlator.or(message.header.cid);
        state.add_finalize(Box::new(move |store| {
            Box::pin(async move {
                // One event per topic; events cover a single topic.
                for topic in topics {
                    let mut event =
                        Event::new(event_type, &namespace, message_id, tx_id, Some(topic));
                    event.correlator = correlator;
                    store.insert_event(&mut event).await?;
                }
                Ok(())
            })
        }));

        Ok(Some(new_state))
    }
}

#[async_trait]
impl PollHandlers for Aggregator {
    type Item = Pin;

    async fn get_items(&self, after: i64, limit: usize) -> Result<Vec<Pin>, StoreError> {
        self.store.get_pins_after(after, limit, true).await
    }

    async fn latest_sequence(&self) -> Result<i64, StoreError> {
        self.store.latest_pin_sequence().await
    }

    async fn handle_page(&self, pins: Vec<Pin>) -> Result<bool, StoreError> {
        let mut state = BatchState::new();
        {
            let state_ref = &mut state;
            let pins_ref = &pins;
            self.store
                .run_as_group(Box::new(move |store| {
                    Box::pin(async move {
                        self.process_pins(store, pins_ref, state_ref).await?;
                        if !state_ref.has_pre_finalize() {
                            state_ref.run_finalize(store).await?;
                        }
                        Ok(())
                    })
                }))
                .await?;
        }

        if state.has_pre_finalize() {
            state.run_pre_finalize().await?;
            let state_ref = &mut state;
            self.store
                .run_as_group(Box::new(move |store| {
                    Box::pin(async move { state_ref.run_finalize(store).await })
                }))
                .await?;
        }
        Ok(false)
    }

    async fn maybe_rewind(&self) -> Result<Option<i64>, StoreError> {
        let mut batches: Vec<Uuid> = Vec::new();
        {
            let mut queued = self.queued_rx.lock().await;
            while let Ok(batch) = queued.try_recv() {
                debug!(batch = %batch, "Rewinding for batch");
                batches.push(batch);
            }
        }
        if batches.is_empty() {
            return Ok(None);
        }
        match self.store.earliest_undispatched_pin(&batches).await {
            // Offset lands one behind the first pin we want re-delivered.
            Ok(Some(sequence)) => Ok(Some(sequence - 1)),
            Ok(None) => Ok(None),
            Err(e) => {
                // Keep the batch ids; the poller will retry after backoff.
                for batch in batches {
                    let _ = self.queued_tx.try_send(batch);
                }
                Err(e)
            }
        }
    }
}
