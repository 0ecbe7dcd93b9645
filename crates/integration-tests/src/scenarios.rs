//! End-to-end pipeline scenarios.

use std::time::Duration;

use shared_connectors::{
    BlockchainCallbacks, DataExchangeCallbacks, SentItem, TokenCallbacks,
};
use shared_store::prelude::*;
use shared_types::hashing::{masked_context, masked_pin, unmasked_context};
use shared_types::{
    BatchHeader, BatchPersisted, BatchPin, BatchType, BlobRef, Bytes32, Data, DataRef, EventType,
    Message, MessageState, MessageType, SignerRef, TokenPool, TokenTransfer, TokenTransferType,
    TransactionRef, TransactionType, TransportWrapper, VerifierRef, VerifierType,
};
use uuid::Uuid;
use wm_03_batch::BatchWork;

use crate::harness::{wait_until, TestNode, AUTHOR, KEY, LOCAL_NODE};

/// Seal a batch out-of-band (as a remote node would) and return the
/// persisted form plus the serialized transport payload.
fn remote_batch(
    group: Option<Bytes32>,
    messages: Vec<Message>,
    data: Vec<Data>,
) -> (BatchPersisted, Vec<u8>) {
    let header = BatchHeader {
        id: Uuid::new_v4(),
        batch_type: if group.is_some() {
            BatchType::Private
        } else {
            BatchType::Broadcast
        },
        namespace: "ns1".to_string(),
        signer: SignerRef {
            author: AUTHOR.to_string(),
            key: KEY.to_string(),
        },
        group,
        created: shared_types::now(),
    };
    let tx_ref = TransactionRef {
        tx_type: TransactionType::BatchPin,
        id: Some(Uuid::new_v4()),
    };
    let (persisted, _manifest) = BatchPersisted::seal(header, tx_ref, &messages, &data).unwrap();
    let batch = persisted.hydrate(messages, data);
    let payload = serde_json::to_vec(&TransportWrapper { group: None, batch }).unwrap();
    (persisted, payload)
}

#[tokio::test]
async fn test_broadcast_single_topic_end_to_end() {
    let node = TestNode::start().await;
    node.seed_identity(AUTHOR, KEY).await;

    let mut message = node.message(MessageType::Broadcast, TransactionType::BatchPin, &["t1"], None);
    node.store.upsert_message(&mut message).await.unwrap();
    node.orchestrator
        .batch_manager()
        .submit_new_work(BatchWork {
            message: message.clone(),
            data: vec![],
        })
        .await
        .unwrap();

    // The batch seals, uploads to shared storage and submits its pin.
    node.wait_for_submissions(1).await;
    assert_eq!(node.uploader.uploads().len(), 1);
    let submission = &node.blockchain.submissions()[0];
    assert!(submission.batch_pin.payload_ref.is_some());
    assert_eq!(submission.batch_pin.contexts, vec![unmasked_context("t1")]);

    // Mining the pin drives aggregation through to the application event.
    node.mine_pins().await;
    let confirmed = node.wait_for_events(EventType::MessageConfirmed, 1).await;
    assert_eq!(confirmed[0].reference, message.header.id);
    assert_eq!(confirmed[0].topic.as_deref(), Some("t1"));

    let stored = node
        .store
        .get_message_by_id(&message.header.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, MessageState::Confirmed);
    assert!(stored.confirmed.is_some());

    // Offset settles at the last pin consumed.
    let latest_pin = node.store.latest_pin_sequence().await.unwrap();
    let n = &node;
    wait_until(
        move || async move { n.aggregator_offset().await >= latest_pin },
        "aggregator offset commit",
    )
    .await;

    node.stop().await;
}

#[tokio::test]
async fn test_private_two_topic_batch_confirms_exactly_once_per_topic() {
    let node = TestNode::start().await;
    node.seed_identity(AUTHOR, KEY).await;
    let local = node.seed_node(LOCAL_NODE, "peer-local").await;
    let remote = node.seed_node("did:weft:node/beta", "peer-beta").await;
    let group = node
        .seed_group(&[
            (AUTHOR.to_string(), local.id),
            ("did:weft:org/beta".to_string(), remote.id),
        ])
        .await;

    let mut message = node.message(
        MessageType::Private,
        TransactionType::BatchPin,
        &["t1", "t2"],
        Some(group),
    );
    node.store.upsert_message(&mut message).await.unwrap();
    node.orchestrator
        .batch_manager()
        .submit_new_work(BatchWork {
            message: message.clone(),
            data: vec![],
        })
        .await
        .unwrap();

    // Private dispatch sends the batch to the remote peer only, then pins.
    node.wait_for_submissions(1).await;
    let sent = node.exchange.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        SentItem::Message { peer_id, .. } => assert_eq!(peer_id, "peer-beta"),
        other => panic!("expected batch send, got {other:?}"),
    }
    let submission = &node.blockchain.submissions()[0];
    assert!(submission.batch_pin.payload_ref.is_none());
    assert_eq!(
        submission.batch_pin.contexts,
        vec![
            masked_pin(&group, "t1", AUTHOR, 0),
            masked_pin(&group, "t2", AUTHOR, 0),
        ]
    );

    node.mine_pins().await;
    let confirmed = node.wait_for_events(EventType::MessageConfirmed, 2).await;

    // Exactly one confirm event per topic, sequences ascending.
    assert_eq!(confirmed.len(), 2);
    assert_eq!(confirmed[0].topic.as_deref(), Some("t1"));
    assert_eq!(confirmed[1].topic.as_deref(), Some("t2"));
    assert!(confirmed[0].sequence < confirmed[1].sequence);
    for event in &confirmed {
        assert_eq!(event.reference, message.header.id);
    }

    // Each context's next-pin expectation advanced to nonce 1.
    for topic in ["t1", "t2"] {
        let rows = node
            .store
            .get_next_pins_for_context(&masked_context(&group, topic))
            .await
            .unwrap();
        let author_row = rows.iter().find(|r| r.identity == AUTHOR).unwrap();
        assert_eq!(author_row.nonce, 1);
        assert_eq!(author_row.hash, masked_pin(&group, topic, AUTHOR, 1));
    }

    // Offset = max pin sequence consumed.
    let latest_pin = node.store.latest_pin_sequence().await.unwrap();
    let n = &node;
    wait_until(
        move || async move { n.aggregator_offset().await >= latest_pin },
        "aggregator offset commit",
    )
    .await;

    node.stop().await;
}

#[tokio::test]
async fn test_parked_pins_confirm_in_order_as_batches_arrive_off_chain() {
    let node = TestNode::start().await;
    node.seed_identity(AUTHOR, KEY).await;
    let group = node
        .seed_group(&[
            (AUTHOR.to_string(), Uuid::new_v4()),
            ("did:weft:org/beta".to_string(), Uuid::new_v4()),
        ])
        .await;

    // Two consecutive private messages on one topic, sealed remotely.
    let mut first = node.message(MessageType::Private, TransactionType::BatchPin, &["t"], Some(group));
    first.pins = vec![format!("{}:0", masked_pin(&group, "t", AUTHOR, 0))];
    let mut second = node.message(MessageType::Private, TransactionType::BatchPin, &["t"], Some(group));
    second.pins = vec![format!("{}:1", masked_pin(&group, "t", AUTHOR, 1))];

    let (batch1, payload1) = remote_batch(Some(group), vec![first.clone()], vec![]);
    let (batch2, payload2) = remote_batch(Some(group), vec![second.clone()], vec![]);

    let event_manager = node.orchestrator.event_manager();
    let signer = VerifierRef {
        verifier_type: VerifierType::EthAddress,
        value: KEY.to_string(),
    };

    // The second message's pin lands first, and before either batch has
    // arrived off-chain: everything parks.
    event_manager
        .batch_pin_complete(
            BatchPin {
                tx_id: batch2.tx.id.unwrap(),
                batch_id: batch2.header.id,
                batch_hash: batch2.hash,
                payload_ref: None,
                contexts: vec![masked_pin(&group, "t", AUTHOR, 1)],
            },
            signer.clone(),
        )
        .await
        .unwrap();
    event_manager
        .batch_pin_complete(
            BatchPin {
                tx_id: batch1.tx.id.unwrap(),
                batch_id: batch1.header.id,
                batch_hash: batch1.hash,
                payload_ref: None,
                contexts: vec![masked_pin(&group, "t", AUTHOR, 0)],
            },
            signer,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(node.events_of_type(EventType::MessageConfirmed).await.is_empty());

    // Batch 1 arrives over data exchange: its rewind confirms message 1.
    event_manager
        .message_received("peer-beta", &payload1)
        .await
        .unwrap();
    let confirmed = node.wait_for_events(EventType::MessageConfirmed, 1).await;
    assert_eq!(confirmed[0].reference, first.header.id);

    // Batch 2 arrives: the parked nonce-1 pin now matches and confirms.
    event_manager
        .message_received("peer-beta", &payload2)
        .await
        .unwrap();
    let confirmed = node.wait_for_events(EventType::MessageConfirmed, 2).await;
    assert_eq!(confirmed[1].reference, second.header.id);
    assert!(confirmed[0].sequence < confirmed[1].sequence);

    node.stop().await;
}

#[tokio::test]
async fn test_topic_block_resolves_on_blob_arrival() {
    let node = TestNode::start().await;
    node.seed_identity(AUTHOR, KEY).await;

    // M3 references a blob that has not arrived; M4 is complete; both on t1.
    let blob_hash = Bytes32::new([0xb1; 32]);
    let blocked_data = Data {
        id: Uuid::new_v4(),
        namespace: "ns1".to_string(),
        validator: None,
        value: None,
        blob: Some(BlobRef {
            hash: blob_hash,
            size: 64,
            name: None,
            public: Some("shared/blob".to_string()),
        }),
        hash: Bytes32::new([0xd1; 32]),
        created: shared_types::now(),
    };
    let mut m3 = node.message(MessageType::Broadcast, TransactionType::BatchPin, &["t1"], None);
    m3.data = vec![DataRef {
        id: blocked_data.id,
        hash: blocked_data.hash,
    }];
    let m4 = node.message(MessageType::Broadcast, TransactionType::BatchPin, &["t1"], None);

    let (batch, _) = remote_batch(None, vec![m3.clone(), m4.clone()], vec![blocked_data.clone()]);
    node.store.upsert_batch(&batch).await.unwrap();
    for msg in [&m3, &m4] {
        let mut row = msg.clone();
        row.batch = Some(batch.header.id);
        row.state = MessageState::Pending;
        node.store.upsert_message(&mut row).await.unwrap();
    }
    node.store.upsert_data(&blocked_data).await.unwrap();

    node.orchestrator
        .event_manager()
        .batch_pin_complete(
            BatchPin {
                tx_id: batch.tx.id.unwrap(),
                batch_id: batch.header.id,
                batch_hash: batch.hash,
                payload_ref: Some("shared/batch".to_string()),
                contexts: vec![unmasked_context("t1"), unmasked_context("t1")],
            },
            VerifierRef {
                verifier_type: VerifierType::EthAddress,
                value: KEY.to_string(),
            },
        )
        .await
        .unwrap();

    // Neither message confirms: M3 is missing its blob and blocks the topic
    // for M4.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(node.events_of_type(EventType::MessageConfirmed).await.is_empty());

    // The blob arrives: the rewind confirms both, in pin order.
    node.orchestrator
        .event_manager()
        .private_blob_received("peer-beta", blob_hash, 64, "local/blob")
        .await
        .unwrap();
    let confirmed = node.wait_for_events(EventType::MessageConfirmed, 2).await;
    assert_eq!(confirmed[0].reference, m3.header.id);
    assert_eq!(confirmed[1].reference, m4.header.id);
    assert!(confirmed[0].sequence < confirmed[1].sequence);

    node.stop().await;
}

#[tokio::test]
async fn test_transfer_carrying_message_waits_for_token_event() {
    let node = TestNode::start().await;
    node.seed_identity(AUTHOR, KEY).await;

    let m5 = node.message(
        MessageType::TransferBroadcast,
        TransactionType::BatchPin,
        &["t1"],
        None,
    );
    let (batch, _) = remote_batch(None, vec![m5.clone()], vec![]);
    node.store.upsert_batch(&batch).await.unwrap();
    let mut row = m5.clone();
    row.batch = Some(batch.header.id);
    row.state = MessageState::Pending;
    node.store.upsert_message(&mut row).await.unwrap();

    node.orchestrator
        .event_manager()
        .batch_pin_complete(
            BatchPin {
                tx_id: batch.tx.id.unwrap(),
                batch_id: batch.header.id,
                batch_hash: batch.hash,
                payload_ref: Some("shared/batch".to_string()),
                contexts: vec![unmasked_context("t1")],
            },
            VerifierRef {
                verifier_type: VerifierType::EthAddress,
                value: KEY.to_string(),
            },
        )
        .await
        .unwrap();

    // No matching token transfer yet: the message stays pending.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(node.events_of_type(EventType::MessageConfirmed).await.is_empty());

    // The transfer confirms on-chain, carrying the message hash.
    let pool = TokenPool {
        id: Uuid::new_v4(),
        namespace: "ns1".to_string(),
        name: "pool1".to_string(),
        connector: "mocktokens".to_string(),
        protocol_id: "0xpool".to_string(),
        created: shared_types::now(),
    };
    node.store.upsert_token_pool(&pool).await.unwrap();
    node.orchestrator
        .event_manager()
        .tokens_transferred(
            "mocktokens",
            TokenTransfer {
                id: Uuid::new_v4(),
                transfer_type: TokenTransferType::Transfer,
                pool: pool.id,
                protocol_id: "000/001".to_string(),
                from: Some("acct1".to_string()),
                to: Some("acct2".to_string()),
                amount: "25".to_string(),
                message: Some(m5.header.id),
                message_hash: Some(m5.hash),
                tx: None,
                created: shared_types::now(),
            },
        )
        .await
        .unwrap();

    // The transfer event lands, and the rewound message confirms.
    node.wait_for_events(EventType::TransferConfirmed, 1).await;
    let confirmed = node.wait_for_events(EventType::MessageConfirmed, 1).await;
    assert_eq!(confirmed[0].reference, m5.header.id);

    node.stop().await;
}
