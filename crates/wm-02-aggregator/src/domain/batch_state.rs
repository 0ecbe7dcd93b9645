//! Per-page batch state: readiness tracking and deferred outcomes.
//!
//! One `BatchState` lives for one pin page. While the page is processed it
//! accumulates:
//!
//! - unmasked context blocks (a parked message blocks its topics so later
//!   messages on the same topic cannot overtake it)
//! - masked next-pin expectations, loaded once per context and advanced as
//!   messages dispatch
//! - pending confirms and finalize/pre-finalize closures
//!
//! At the end of the page the engine runs all finalize closures and flushes
//! the accumulated row updates in a single transactional group. If any
//! pre-finalize callbacks were registered, they run outside any transaction
//! between the handler group and the finalize group, preserving at-most-once
//! external effects with at-least-once commit retries.

use std::collections::HashMap;

use futures::future::BoxFuture;
use shared_store::{Store, StoreError};
use shared_store::prelude::*;
use shared_types::hashing::masked_pin;
use shared_types::{Bytes32, Message, MessageState, NextPin, Timestamp};
use tracing::{debug, error};
use uuid::Uuid;

/// A deferred store mutation, run inside the finalize transactional group.
pub type FinalizeFn =
    Box<dyn for<'s> FnOnce(&'s dyn Store) -> BoxFuture<'s, Result<(), StoreError>> + Send>;

/// A deferred non-store side effect, run between the two groups.
pub type PreFinalizeFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), StoreError>> + Send>;

/// Readiness state of one unmasked context within this page.
struct ContextState {
    /// Sequence of the earliest undispatched pin blocking this context, when
    /// one exists.
    blocked_by: Option<i64>,
}

/// Loaded next-pin rows for one masked context, plus which rows were
/// advanced during this page.
struct MaskedContext {
    group: Bytes32,
    topic: String,
    next_pins: Vec<NextPin>,
    dirty: Vec<bool>,
}

/// Reference to one next-pin row inside the page state, handed back by the
/// readiness check so the caller can advance it after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextPinRef {
    context: Bytes32,
    index: usize,
}

/// A message whose outcome was decided during this page.
struct DispatchedMessage {
    batch: Uuid,
    message: Uuid,
    base_index: i64,
    topic_count: usize,
    new_state: MessageState,
}

/// The per-page accumulator.
#[derive(Default)]
pub struct BatchState {
    unmasked_contexts: HashMap<Bytes32, ContextState>,
    masked_contexts: HashMap<Bytes32, MaskedContext>,
    pending_confirms: HashMap<Uuid, Message>,
    dispatched: Vec<DispatchedMessage>,
    finalize: Vec<FinalizeFn>,
    pre_finalize: Vec<PreFinalizeFn>,
}

impl BatchState {
    /// Fresh state for one page.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a finalize closure (store mutations).
    pub fn add_finalize(&mut self, f: FinalizeFn) {
        self.finalize.push(f);
    }

    /// Register a pre-finalize callback (non-store side effects).
    pub fn add_pre_finalize(&mut self, f: PreFinalizeFn) {
        self.pre_finalize.push(f);
    }

    /// True when any pre-finalize callbacks are registered.
    #[must_use]
    pub fn has_pre_finalize(&self) -> bool {
        !self.pre_finalize.is_empty()
    }

    /// Record a message awaiting confirmation in this page.
    pub fn pending_confirm(&mut self, message: Message) {
        self.pending_confirms.insert(message.header.id, message);
    }

    /// A message already queued for confirmation in this page.
    #[must_use]
    pub fn get_pending_confirm(&self, id: &Uuid) -> Option<&Message> {
        self.pending_confirms.get(id)
    }

    /// Whether a message on an unmasked context may dispatch: it must not be
    /// preceded by an earlier undispatched pin on the same context, either
    /// parked in this page or left over from an earlier one.
    pub async fn check_unmasked_context_ready(
        &mut self,
        store: &dyn Store,
        context: Bytes32,
        pin_sequence: i64,
    ) -> Result<bool, StoreError> {
        if !self.unmasked_contexts.contains_key(&context) {
            let blocked_by = store
                .earliest_undispatched_pin_for_context(&context, pin_sequence)
                .await?;
            self.unmasked_contexts
                .insert(context, ContextState { blocked_by });
        }
        let state = self.unmasked_contexts.get(&context).expect("inserted above");
        let blocked = state.blocked_by.is_some_and(|seq| seq < pin_sequence);
        Ok(!blocked)
    }

    /// Mark an unmasked context blocked by a parked pin, so later messages on
    /// the same topic in this page cannot overtake it.
    pub fn set_context_blocked_by(&mut self, context: Bytes32, sequence: i64) {
        let state = self
            .unmasked_contexts
            .entry(context)
            .or_insert(ContextState { blocked_by: None });
        match state.blocked_by {
            Some(existing) if existing <= sequence => {}
            _ => state.blocked_by = Some(sequence),
        }
    }

    /// Whether a masked pin is the expected next pin for its context.
    ///
    /// Returns the row to advance when ready; `None` parks the message
    /// (out-of-order arrival, unknown group, or a pin that matches no
    /// member's expectation).
    pub async fn check_masked_context_ready(
        &mut self,
        store: &dyn Store,
        message: &Message,
        topic: &str,
        pin_hash: &Bytes32,
    ) -> Result<Option<NextPinRef>, StoreError> {
        let Some(group) = message.header.group else {
            return Ok(None);
        };
        let context = shared_types::hashing::masked_context(&group, topic);

        if !self.masked_contexts.contains_key(&context) {
            let mut rows = store.get_next_pins_for_context(&context).await?;
            if rows.is_empty() {
                rows = match self
                    .attempt_context_init(store, message, topic, &context, pin_hash)
                    .await?
                {
                    Some(rows) => rows,
                    None => return Ok(None),
                };
            }
            let dirty = vec![false; rows.len()];
            self.masked_contexts.insert(
                context,
                MaskedContext {
                    group,
                    topic: topic.to_string(),
                    next_pins: rows,
                    dirty,
                },
            );
        }

        let masked = self.masked_contexts.get(&context).expect("inserted above");
        let index = masked.next_pins.iter().position(|np| np.hash == *pin_hash);
        match index {
            Some(index) => Ok(Some(NextPinRef { context, index })),
            None => {
                debug!(
                    message = %message.header.id,
                    topic,
                    pin = %pin_hash,
                    "Masked pin does not match any next-pin expectation; parking"
                );
                Ok(None)
            }
        }
    }

    /// First message on a context: seed a next-pin row at nonce 0 for every
    /// group member, verifying the arriving pin is one of the zero-nonce
    /// expectations.
    async fn attempt_context_init(
        &mut self,
        store: &dyn Store,
        message: &Message,
        topic: &str,
        context: &Bytes32,
        pin_hash: &Bytes32,
    ) -> Result<Option<Vec<NextPin>>, StoreError> {
        let group_hash = message.header.group.expect("caller checked");
        let Some(group) = store.get_group_by_hash(&group_hash).await? else {
            debug!(
                message = %message.header.id,
                group = %group_hash,
                "Group not found for first message on context; parking"
            );
            return Ok(None);
        };

        let mut rows: Vec<NextPin> = group
            .members
            .iter()
            .map(|member| NextPin {
                context: *context,
                identity: member.identity.clone(),
                hash: masked_pin(&group_hash, topic, &member.identity, 0),
                nonce: 0,
                sequence: 0,
            })
            .collect();

        if !rows.iter().any(|row| row.hash == *pin_hash) {
            error!(
                message = %message.header.id,
                topic,
                pin = %pin_hash,
                "First pin on context matches no group member at nonce 0"
            );
            return Ok(None);
        }

        for row in rows.iter_mut() {
            store.insert_next_pin(row).await?;
        }
        Ok(Some(rows))
    }

    /// Advance a next-pin row after its message dispatched: bump the nonce
    /// and recompute the masked hash. The store write happens at finalize.
    pub fn increment_next_pin(&mut self, next_pin: &NextPinRef) {
        let Some(masked) = self.masked_contexts.get_mut(&next_pin.context) else {
            return;
        };
        let (group, topic) = (masked.group, masked.topic.clone());
        if let Some(row) = masked.next_pins.get_mut(next_pin.index) {
            row.nonce += 1;
            row.hash = masked_pin(&group, &topic, &row.identity, row.nonce);
            masked.dirty[next_pin.index] = true;
        }
    }

    /// Queue a decided message outcome for the finalize flush.
    pub fn mark_message_dispatched(
        &mut self,
        batch: Uuid,
        message: &Message,
        base_index: i64,
        new_state: MessageState,
    ) {
        if new_state == MessageState::Confirmed {
            self.pending_confirm(message.clone());
        }
        self.dispatched.push(DispatchedMessage {
            batch,
            message: message.header.id,
            base_index,
            topic_count: message.header.topics.len(),
            new_state,
        });
    }

    /// Run all pre-finalize callbacks, in registration order.
    pub async fn run_pre_finalize(&mut self) -> Result<(), StoreError> {
        for f in self.pre_finalize.drain(..) {
            f().await?;
        }
        Ok(())
    }

    /// Run finalize closures then flush accumulated row updates. Must be
    /// called inside a transactional group.
    pub async fn run_finalize(&mut self, store: &dyn Store) -> Result<(), StoreError> {
        for f in self.finalize.drain(..) {
            f(store).await?;
        }
        self.flush_pins(store).await
    }

    async fn flush_pins(&mut self, store: &dyn Store) -> Result<(), StoreError> {
        let confirmed_time: Timestamp = shared_types::now();
        for d in self.dispatched.drain(..) {
            let indexes: Vec<i64> = (d.base_index..d.base_index + d.topic_count as i64).collect();
            store.set_pins_dispatched(&d.batch, &indexes).await?;
            let confirmed = matches!(
                d.new_state,
                MessageState::Confirmed | MessageState::Rejected
            )
            .then_some(confirmed_time);
            store
                .update_message_state(&d.message, d.new_state, confirmed)
                .await?;
        }
        for masked in self.masked_contexts.values_mut() {
            for (index, dirty) in masked.dirty.iter_mut().enumerate() {
                if *dirty {
                    let row = &masked.next_pins[index];
                    store
                        .update_next_pin(row.sequence, row.nonce, row.hash)
                        .await?;
                    *dirty = false;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_store::MemoryStore;
    use shared_types::hashing::{masked_context, unmasked_context};
    use shared_types::{
        Group, GroupMember, MessageHeader, MessageType, Pin, SignerRef, TransactionType,
    };

    const IDENT_A: &str = "did:weft:org/a";
    const IDENT_B: &str = "did:weft:org/b";

    fn private_message(group: Bytes32, topics: &[&str]) -> Message {
        Message {
            header: MessageHeader {
                id: Uuid::new_v4(),
                cid: None,
                msg_type: MessageType::Private,
                tx_type: TransactionType::BatchPin,
                signer: SignerRef {
                    author: IDENT_A.to_string(),
                    key: "0xaaa".to_string(),
                },
                created: shared_types::now(),
                namespace: "ns1".to_string(),
                topics: topics.iter().map(|t| t.to_string()).collect(),
                tag: None,
                group: Some(group),
                data_hash: None,
            },
            hash: Bytes32::new([1; 32]),
            batch: None,
            state: MessageState::Pending,
            confirmed: None,
            data: vec![],
            pins: vec![],
            sequence: 0,
        }
    }

    async fn seed_group(store: &dyn Store, hash: Bytes32) {
        let group = Group {
            hash,
            namespace: "ns1".to_string(),
            name: None,
            members: vec![
                GroupMember {
                    identity: IDENT_A.to_string(),
                    node: Uuid::new_v4(),
                },
                GroupMember {
                    identity: IDENT_B.to_string(),
                    node: Uuid::new_v4(),
                },
            ],
            created: shared_types::now(),
        };
        store.upsert_group(&group).await.unwrap();
    }

    #[tokio::test]
    async fn test_masked_context_init_seeds_all_members_at_nonce_zero() {
        let store = MemoryStore::new();
        let group = Bytes32::new([7; 32]);
        seed_group(&store, group).await;

        let msg = private_message(group, &["t"]);
        let mut state = BatchState::new();

        let zero_pin = masked_pin(&group, "t", IDENT_A, 0);
        let next = state
            .check_masked_context_ready(&store, &msg, "t", &zero_pin)
            .await
            .unwrap();
        assert!(next.is_some());

        let context = masked_context(&group, "t");
        let rows = store.get_next_pins_for_context(&context).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.nonce == 0));
    }

    #[tokio::test]
    async fn test_out_of_order_masked_pin_parks() {
        let store = MemoryStore::new();
        let group = Bytes32::new([7; 32]);
        seed_group(&store, group).await;

        let msg = private_message(group, &["t"]);
        let mut state = BatchState::new();

        // Nonce 1 arrives before nonce 0: no expectation matches.
        let early_pin = masked_pin(&group, "t", IDENT_A, 1);
        let next = state
            .check_masked_context_ready(&store, &msg, "t", &early_pin)
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_increment_advances_expectation() {
        let store = MemoryStore::new();
        let group = Bytes32::new([7; 32]);
        seed_group(&store, group).await;

        let msg = private_message(group, &["t"]);
        let mut state = BatchState::new();

        let zero_pin = masked_pin(&group, "t", IDENT_A, 0);
        let next = state
            .check_masked_context_ready(&store, &msg, "t", &zero_pin)
            .await
            .unwrap()
            .unwrap();
        state.increment_next_pin(&next);
        state.run_finalize(&store).await.unwrap();

        // The store row now expects nonce 1.
        let context = masked_context(&group, "t");
        let rows = store.get_next_pins_for_context(&context).await.unwrap();
        let row_a = rows.iter().find(|r| r.identity == IDENT_A).unwrap();
        assert_eq!(row_a.nonce, 1);
        assert_eq!(row_a.hash, masked_pin(&group, "t", IDENT_A, 1));

        // A fresh page matches the advanced pin, not the consumed one.
        let mut next_page = BatchState::new();
        assert!(next_page
            .check_masked_context_ready(&store, &msg, "t", &zero_pin)
            .await
            .unwrap()
            .is_none());
        let one_pin = masked_pin(&group, "t", IDENT_A, 1);
        assert!(next_page
            .check_masked_context_ready(&store, &msg, "t", &one_pin)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_unmasked_block_prevents_overtake_within_page() {
        let store = MemoryStore::new();
        let context = unmasked_context("t1");
        let mut state = BatchState::new();

        assert!(state
            .check_unmasked_context_ready(&store, context, 5)
            .await
            .unwrap());
        state.set_context_blocked_by(context, 5);

        // A later pin on the same context is now blocked.
        assert!(!state
            .check_unmasked_context_ready(&store, context, 6)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unmasked_block_found_from_prior_page_in_store() {
        let store = MemoryStore::new();
        let context = unmasked_context("t1");
        let batch = Uuid::new_v4();

        // A parked (undispatched) pin from an earlier page.
        let mut pins = vec![Pin {
            sequence: 0,
            masked: false,
            hash: context,
            batch,
            batch_hash: Bytes32::new([2; 32]),
            index: 0,
            signer: "0xaaa".to_string(),
            dispatched: false,
            created: shared_types::now(),
        }];
        store.insert_pins(&mut pins).await.unwrap();
        let parked_seq = pins[0].sequence;

        let mut state = BatchState::new();
        assert!(!state
            .check_unmasked_context_ready(&store, context, parked_seq + 10)
            .await
            .unwrap());

        // The parked pin itself is not blocked by its own sequence.
        let mut fresh = BatchState::new();
        assert!(fresh
            .check_unmasked_context_ready(&store, context, parked_seq)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_finalize_flush_marks_pins_and_message() {
        let store = MemoryStore::new();
        let batch = Uuid::new_v4();
        let mut msg = private_message(Bytes32::new([7; 32]), &["t1", "t2"]);
        store.upsert_message(&mut msg).await.unwrap();

        let mut pins: Vec<Pin> = (0..2)
            .map(|i| Pin {
                sequence: 0,
                masked: true,
                hash: Bytes32::new([i as u8 + 1; 32]),
                batch,
                batch_hash: Bytes32::new([2; 32]),
                index: i,
                signer: "0xaaa".to_string(),
                dispatched: false,
                created: shared_types::now(),
            })
            .collect();
        store.insert_pins(&mut pins).await.unwrap();

        let mut state = BatchState::new();
        state.mark_message_dispatched(batch, &msg, 0, MessageState::Confirmed);
        state.run_finalize(&store).await.unwrap();

        let stored = store
            .get_message_by_id(&msg.header.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, MessageState::Confirmed);
        assert!(stored.confirmed.is_some());

        let remaining = store.get_pins_after(0, 10, true).await.unwrap();
        assert!(remaining.is_empty());
    }
}
