//! Aggregation service tests: page processing against the in-memory store.

use std::sync::Arc;

use shared_store::{MemoryStore, Store};
use shared_store::prelude::*;
use shared_types::hashing::{masked_pin, unmasked_context};
use shared_types::{
    BatchHeader, BatchPersisted, BatchType, Bytes32, Data, DataRef, EventType, Group, GroupMember,
    Identity, IdentityType, Message, MessageHeader, MessageState, MessageType, Pin, SignerRef,
    TokenPool, TokenTransfer, TokenTransferType, TransactionRef, TransactionType, Verifier,
    VerifierRef, VerifierType,
};
use uuid::Uuid;
use wm_01_event_poller::PollHandlers;

use crate::adapters::data_manager::StoreDataManager;
use crate::adapters::definitions::DefinitionDispatcher;
use crate::config::AggregatorConf;
use crate::service::aggregator::Aggregator;

const AUTHOR: &str = "did:weft:org/abc";
const KEY: &str = "0xabc";
const MEMBER_B: &str = "did:weft:org/def";

struct Fixture {
    store: Arc<dyn Store>,
    aggregator: Arc<Aggregator>,
}

async fn fixture() -> Fixture {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let data = Arc::new(StoreDataManager::new(Arc::clone(&store)));
    let definitions = Arc::new(DefinitionDispatcher::new());
    let aggregator = Aggregator::new(
        AggregatorConf::default(),
        Arc::clone(&store),
        data,
        definitions,
        VerifierType::EthAddress,
    );

    // Register the signing identity used by most tests.
    let identity = Identity {
        id: Uuid::new_v4(),
        did: AUTHOR.to_string(),
        identity_type: IdentityType::Org,
        parent: None,
        namespace: "ns1".to_string(),
        name: "abc".to_string(),
        profile: serde_json::Value::Null,
        created: shared_types::now(),
    };
    store.upsert_identity(&identity).await.unwrap();
    store
        .upsert_verifier(&Verifier {
            verifier: VerifierRef {
                verifier_type: VerifierType::EthAddress,
                value: KEY.to_string(),
            },
            identity: identity.id,
            namespace: "ns1".to_string(),
            created: shared_types::now(),
        })
        .await
        .unwrap();

    Fixture { store, aggregator }
}

fn message(msg_type: MessageType, topics: &[&str], group: Option<Bytes32>) -> Message {
    Message {
        header: MessageHeader {
            id: Uuid::new_v4(),
            cid: None,
            msg_type,
            tx_type: TransactionType::BatchPin,
            signer: SignerRef {
                author: AUTHOR.to_string(),
                key: KEY.to_string(),
            },
            created: shared_types::now(),
            namespace: "ns1".to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            tag: None,
            group,
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

/// Seal a batch for the messages and persist everything the aggregator will
/// read: the batch row and the messages assigned to it.
async fn persist_batch(
    store: &dyn Store,
    batch_type: BatchType,
    group: Option<Bytes32>,
    messages: &mut [Message],
    data: &[Data],
) -> BatchPersisted {
    let header = BatchHeader {
        id: Uuid::new_v4(),
        batch_type,
        namespace: "ns1".to_string(),
        signer: SignerRef {
            author: AUTHOR.to_string(),
            key: KEY.to_string(),
        },
        group,
        created: shared_types::now(),
    };
    let tx = TransactionRef {
        tx_type: TransactionType::BatchPin,
        id: Some(Uuid::new_v4()),
    };
    let (persisted, _) = BatchPersisted::seal(header, tx, messages, data).unwrap();
    store.upsert_batch(&persisted).await.unwrap();
    for message in messages.iter_mut() {
        message.batch = Some(persisted.header.id);
        store.upsert_message(message).await.unwrap();
    }
    for record in data {
        store.upsert_data(record).await.unwrap();
    }
    persisted
}

async fn insert_pin(store: &dyn Store, batch: &BatchPersisted, index: i64, hash: Bytes32, masked: bool) -> Pin {
    let mut pins = vec![Pin {
        sequence: 0,
        masked,
        hash,
        batch: batch.header.id,
        batch_hash: batch.hash,
        index,
        signer: KEY.to_string(),
        dispatched: false,
        created: shared_types::now(),
    }];
    store.insert_pins(&mut pins).await.unwrap();
    pins.remove(0)
}

async fn seed_group(store: &dyn Store, hash: Bytes32) {
    store
        .upsert_group(&Group {
            hash,
            namespace: "ns1".to_string(),
            name: None,
            members: vec![
                GroupMember {
                    identity: AUTHOR.to_string(),
                    node: Uuid::new_v4(),
                },
                GroupMember {
                    identity: MEMBER_B.to_string(),
                    node: Uuid::new_v4(),
                },
            ],
            created: shared_types::now(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unmasked_broadcast_single_topic_confirms() {
    let f = fixture().await;

    let mut messages = vec![message(MessageType::Broadcast, &["t1"], None)];
    let batch = persist_batch(f.store.as_ref(), BatchType::Broadcast, None, &mut messages, &[]).await;
    let pin = insert_pin(f.store.as_ref(), &batch, 0, unmasked_context("t1"), false).await;

    f.aggregator.handle_page(vec![pin]).await.unwrap();

    let events = f.store.get_events_after(0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::MessageConfirmed);
    assert_eq!(events[0].reference, messages[0].header.id);
    assert_eq!(events[0].topic.as_deref(), Some("t1"));
    assert_eq!(events[0].sequence, 1);

    let stored = f
        .store
        .get_message_by_id(&messages[0].header.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, MessageState::Confirmed);
    assert!(stored.confirmed.is_some());

    // No undispatched pins remain.
    assert!(f.store.get_pins_after(0, 10, true).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_pin_page_dispatches_once_with_event_per_topic() {
    let f = fixture().await;
    let group = Bytes32::new([9; 32]);
    seed_group(f.store.as_ref(), group).await;

    let mut msg = message(MessageType::Private, &["t1", "t2"], Some(group));
    msg.pins = vec![
        format!("{}:0", masked_pin(&group, "t1", AUTHOR, 0)),
        format!("{}:0", masked_pin(&group, "t2", AUTHOR, 0)),
    ];
    let mut messages = vec![msg];
    let batch =
        persist_batch(f.store.as_ref(), BatchType::Private, Some(group), &mut messages, &[]).await;

    let pin0 = insert_pin(
        f.store.as_ref(),
        &batch,
        0,
        masked_pin(&group, "t1", AUTHOR, 0),
        true,
    )
    .await;
    let pin1 = insert_pin(
        f.store.as_ref(),
        &batch,
        1,
        masked_pin(&group, "t2", AUTHOR, 0),
        true,
    )
    .await;
    let max_seq = pin1.sequence;

    f.aggregator.handle_page(vec![pin0, pin1]).await.unwrap();

    // One dispatch, two events (one per topic).
    let events = f.store.get_events_after(0, 10).await.unwrap();
    assert_eq!(events.len(), 2);
    let topics: Vec<&str> = events.iter().filter_map(|e| e.topic.as_deref()).collect();
    assert_eq!(topics, vec!["t1", "t2"]);

    // Next pins advanced per topic.
    for topic in ["t1", "t2"] {
        let context = shared_types::hashing::masked_context(&group, topic);
        let rows = f.store.get_next_pins_for_context(&context).await.unwrap();
        let author_row = rows.iter().find(|r| r.identity == AUTHOR).unwrap();
        assert_eq!(author_row.nonce, 1);
        assert_eq!(author_row.hash, masked_pin(&group, topic, AUTHOR, 1));
    }

    // Both pins dispatched, none left behind.
    assert!(f.store.get_pins_after(0, 10, true).await.unwrap().is_empty());
    assert!(max_seq >= 2);
}

#[tokio::test]
async fn test_pin_with_missing_batch_is_parked() {
    let f = fixture().await;

    let mut pins = vec![Pin {
        sequence: 0,
        masked: false,
        hash: unmasked_context("t1"),
        batch: Uuid::new_v4(), // no such batch
        batch_hash: Bytes32::new([2; 32]),
        index: 0,
        signer: KEY.to_string(),
        dispatched: false,
        created: shared_types::now(),
    }];
    f.store.insert_pins(&mut pins).await.unwrap();

    f.aggregator.handle_page(pins.clone()).await.unwrap();

    assert!(f.store.get_events_after(0, 10).await.unwrap().is_empty());
    // The pin stays undispatched, waiting for the batch and a rewind.
    assert_eq!(f.store.get_pins_after(0, 10, true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_batch_hash_mismatch_parks_pin() {
    let f = fixture().await;

    let mut messages = vec![message(MessageType::Broadcast, &["t1"], None)];
    let batch = persist_batch(f.store.as_ref(), BatchType::Broadcast, None, &mut messages, &[]).await;

    let mut tampered = batch.clone();
    tampered.hash = Bytes32::new([0xee; 32]);
    let pin = insert_pin(f.store.as_ref(), &tampered, 0, unmasked_context("t1"), false).await;

    f.aggregator.handle_page(vec![pin]).await.unwrap();

    assert!(f.store.get_events_after(0, 10).await.unwrap().is_empty());
    assert_eq!(f.store.get_pins_after(0, 10, true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_signer_mismatch_blocks_dispatch() {
    let f = fixture().await;

    let mut messages = vec![message(MessageType::Broadcast, &["t1"], None)];
    let batch = persist_batch(f.store.as_ref(), BatchType::Broadcast, None, &mut messages, &[]).await;

    let mut pins = vec![Pin {
        sequence: 0,
        masked: false,
        hash: unmasked_context("t1"),
        batch: batch.header.id,
        batch_hash: batch.hash,
        index: 0,
        signer: "0xintruder".to_string(),
        dispatched: false,
        created: shared_types::now(),
    }];
    f.store.insert_pins(&mut pins).await.unwrap();

    f.aggregator.handle_page(pins).await.unwrap();

    assert!(f.store.get_events_after(0, 10).await.unwrap().is_empty());
    let stored = f
        .store
        .get_message_by_id(&messages[0].header.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, MessageState::Pending);
}

#[tokio::test]
async fn test_typed_data_without_datatype_rejects() {
    let f = fixture().await;

    let data = Data {
        id: Uuid::new_v4(),
        namespace: "ns1".to_string(),
        validator: Some(shared_types::DatatypeRef {
            name: "missing".to_string(),
            version: "1".to_string(),
        }),
        value: Some(serde_json::json!({"a": 1})),
        blob: None,
        hash: Bytes32::new([3; 32]),
        created: shared_types::now(),
    };
    let mut msg = message(MessageType::Broadcast, &["t1"], None);
    msg.data = vec![DataRef {
        id: data.id,
        hash: data.hash,
    }];
    let mut messages = vec![msg];
    let batch = persist_batch(
        f.store.as_ref(),
        BatchType::Broadcast,
        None,
        &mut messages,
        std::slice::from_ref(&data),
    )
    .await;
    let pin = insert_pin(f.store.as_ref(), &batch, 0, unmasked_context("t1"), false).await;

    f.aggregator.handle_page(vec![pin]).await.unwrap();

    let events = f.store.get_events_after(0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::MessageRejected);

    let stored = f
        .store
        .get_message_by_id(&messages[0].header.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, MessageState::Rejected);
}

#[tokio::test]
async fn test_transfer_message_waits_for_matching_transfer() {
    let f = fixture().await;

    let mut messages = vec![message(MessageType::TransferBroadcast, &["t1"], None)];
    let batch = persist_batch(f.store.as_ref(), BatchType::Broadcast, None, &mut messages, &[]).await;
    let pin = insert_pin(f.store.as_ref(), &batch, 0, unmasked_context("t1"), false).await;

    // No transfer yet: parked.
    f.aggregator.handle_page(vec![pin.clone()]).await.unwrap();
    assert!(f.store.get_events_after(0, 10).await.unwrap().is_empty());

    // Record the transfer with the matching message hash.
    let pool = TokenPool {
        id: Uuid::new_v4(),
        namespace: "ns1".to_string(),
        name: "pool1".to_string(),
        connector: "mocktokens".to_string(),
        protocol_id: "p1".to_string(),
        created: shared_types::now(),
    };
    f.store.upsert_token_pool(&pool).await.unwrap();
    f.store
        .insert_token_transfer(&TokenTransfer {
            id: Uuid::new_v4(),
            transfer_type: TokenTransferType::Transfer,
            pool: pool.id,
            protocol_id: "tx-0".to_string(),
            from: Some("acct1".to_string()),
            to: Some("acct2".to_string()),
            amount: "10".to_string(),
            message: Some(messages[0].header.id),
            message_hash: Some(messages[0].hash),
            tx: None,
            created: shared_types::now(),
        })
        .await
        .unwrap();

    // Next pass confirms.
    f.aggregator.handle_page(vec![pin]).await.unwrap();
    let events = f.store.get_events_after(0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::MessageConfirmed);
}

#[tokio::test]
async fn test_topic_block_holds_later_message_until_rewind() {
    let f = fixture().await;

    // M3 references a blob that has not arrived; M4 is complete. Both on t1.
    let blob_hash = Bytes32::new([0xbb; 32]);
    let blocked_data = Data {
        id: Uuid::new_v4(),
        namespace: "ns1".to_string(),
        validator: None,
        value: None,
        blob: Some(shared_types::BlobRef {
            hash: blob_hash,
            size: 16,
            name: None,
            public: Some("shared/ref".to_string()),
        }),
        hash: Bytes32::new([4; 32]),
        created: shared_types::now(),
    };
    let mut m3 = message(MessageType::Broadcast, &["t1"], None);
    m3.data = vec![DataRef {
        id: blocked_data.id,
        hash: blocked_data.hash,
    }];
    let m4 = message(MessageType::Broadcast, &["t1"], None);
    let mut messages = vec![m3, m4];
    let batch = persist_batch(
        f.store.as_ref(),
        BatchType::Broadcast,
        None,
        &mut messages,
        std::slice::from_ref(&blocked_data),
    )
    .await;

    let pin3 = insert_pin(f.store.as_ref(), &batch, 0, unmasked_context("t1"), false).await;
    let pin4 = insert_pin(f.store.as_ref(), &batch, 1, unmasked_context("t1"), false).await;

    // First pass: neither confirms; M3 blocks the topic for M4.
    f.aggregator
        .handle_page(vec![pin3.clone(), pin4.clone()])
        .await
        .unwrap();
    assert!(f.store.get_events_after(0, 10).await.unwrap().is_empty());
    assert_eq!(f.store.get_pins_after(0, 10, true).await.unwrap().len(), 2);

    // Blob arrives; redelivery confirms both, in order.
    let mut blob = shared_types::Blob {
        hash: blob_hash,
        payload_ref: "local/blob".to_string(),
        size: 16,
        created: shared_types::now(),
        sequence: 0,
    };
    f.store.insert_blob(&mut blob).await.unwrap();

    f.aggregator.handle_page(vec![pin3, pin4]).await.unwrap();
    let events = f.store.get_events_after(0, 10).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].reference, messages[0].header.id);
    assert_eq!(events[1].reference, messages[1].header.id);
    assert!(events[0].sequence < events[1].sequence);
}

#[tokio::test]
async fn test_out_of_order_masked_pins_confirm_in_order_after_rewind() {
    let f = fixture().await;
    let group = Bytes32::new([9; 32]);
    seed_group(f.store.as_ref(), group).await;

    // Two consecutive private messages from the same author on topic t.
    let mut first = message(MessageType::Private, &["t"], Some(group));
    first.pins = vec![masked_pin(&group, "t", AUTHOR, 0).to_string()];
    let mut second = message(MessageType::Private, &["t"], Some(group));
    second.pins = vec![masked_pin(&group, "t", AUTHOR, 1).to_string()];

    let mut batch1_msgs = vec![first];
    let batch1 = persist_batch(
        f.store.as_ref(),
        BatchType::Private,
        Some(group),
        &mut batch1_msgs,
        &[],
    )
    .await;
    let mut batch2_msgs = vec![second];
    let batch2 = persist_batch(
        f.store.as_ref(),
        BatchType::Private,
        Some(group),
        &mut batch2_msgs,
        &[],
    )
    .await;

    // The nonce-1 pin lands first: nothing confirms.
    let pin_late = insert_pin(
        f.store.as_ref(),
        &batch2,
        0,
        masked_pin(&group, "t", AUTHOR, 1),
        true,
    )
    .await;
    f.aggregator.handle_page(vec![pin_late.clone()]).await.unwrap();
    assert!(f.store.get_events_after(0, 10).await.unwrap().is_empty());

    // The nonce-0 pin arrives and confirms its message.
    let pin_first = insert_pin(
        f.store.as_ref(),
        &batch1,
        0,
        masked_pin(&group, "t", AUTHOR, 0),
        true,
    )
    .await;
    f.aggregator.handle_page(vec![pin_first]).await.unwrap();

    // The rewind redelivers the parked nonce-1 pin, which now matches.
    f.aggregator.handle_page(vec![pin_late]).await.unwrap();

    let events = f.store.get_events_after(0, 10).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].reference, batch1_msgs[0].header.id);
    assert_eq!(events[1].reference, batch2_msgs[0].header.id);
    assert!(events[0].sequence < events[1].sequence);
}
