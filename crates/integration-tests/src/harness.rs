//! Test harness: a full in-memory node with mock connectors and fast
//! timings, plus seeding and wait helpers.

use std::sync::Arc;
use std::time::Duration;

use node_runtime::{NodeConfig, Orchestrator};
use shared_connectors::{
    BlockchainCallbacks, MockBlockchainConnector, MockDataExchangeConnector, MockTokenConnector,
};
use shared_store::{MemoryStore, Store};
use shared_store::prelude::*;
use shared_types::{
    Bytes32, Event, EventType, Group, GroupMember, Identity, IdentityType, Message, MessageHeader,
    MessageState, MessageType, SignerRef, TransactionType, Verifier, VerifierRef, VerifierType,
};
use uuid::Uuid;
use wm_03_batch::MockBatchUploader;

/// Default test author and key.
pub const AUTHOR: &str = "did:weft:org/alpha";
/// Signing key registered for [`AUTHOR`].
pub const KEY: &str = "0xalpha";
/// This node's node identity.
pub const LOCAL_NODE: &str = "did:weft:node/alpha";

/// A running single-node test fixture.
pub struct TestNode {
    /// The node under test.
    pub orchestrator: Orchestrator,
    /// Direct store access for seeding and assertions.
    pub store: Arc<dyn Store>,
    /// The mock ledger; drained by [`TestNode::mine_pins`].
    pub blockchain: Arc<MockBlockchainConnector>,
    /// The mock private transport.
    pub exchange: Arc<MockDataExchangeConnector>,
    /// The mock shared-storage uploader.
    pub uploader: Arc<MockBatchUploader>,
}

fn fast_config() -> NodeConfig {
    let mut config = NodeConfig {
        namespace: "ns1".to_string(),
        signer: SignerRef {
            author: AUTHOR.to_string(),
            key: KEY.to_string(),
        },
        local_node_did: LOCAL_NODE.to_string(),
        ..NodeConfig::default()
    };
    config.aggregator.batch_timeout = Duration::from_millis(5);
    config.aggregator.poll_timeout = Duration::from_millis(100);
    config.aggregator.retry.initial_delay = Duration::from_millis(1);
    config.aggregator.retry.maximum_delay = Duration::from_millis(10);
    config.broadcast_batch.batch_timeout = Duration::from_millis(20);
    config.private_batch.batch_timeout = Duration::from_millis(20);
    config.subscriptions.poll_timeout = Duration::from_millis(100);
    config.batch_retry.initial_delay = Duration::from_millis(1);
    config.batch_retry.maximum_delay = Duration::from_millis(10);
    config
}

impl TestNode {
    /// Build and start a node.
    pub async fn start() -> TestNode {
        let store = MemoryStore::new_arc();
        let blockchain = Arc::new(MockBlockchainConnector::new());
        let exchange = Arc::new(MockDataExchangeConnector::new());
        let uploader = Arc::new(MockBatchUploader::new());
        let mut orchestrator = Orchestrator::new(
            fast_config(),
            Arc::clone(&store),
            blockchain.clone(),
            exchange.clone(),
            Arc::new(MockTokenConnector::new()),
            uploader.clone(),
        );
        orchestrator.start().await.expect("node start");
        TestNode {
            orchestrator,
            store,
            blockchain,
            exchange,
            uploader,
        }
    }

    /// Register an org identity with its signing key.
    pub async fn seed_identity(&self, did: &str, key: &str) -> Identity {
        let identity = Identity {
            id: Uuid::new_v4(),
            did: did.to_string(),
            identity_type: IdentityType::Org,
            parent: None,
            namespace: "ns1".to_string(),
            name: did.to_string(),
            profile: serde_json::Value::Null,
            created: shared_types::now(),
        };
        self.store.upsert_identity(&identity).await.unwrap();
        self.store
            .upsert_verifier(&Verifier {
                verifier: VerifierRef {
                    verifier_type: VerifierType::EthAddress,
                    value: key.to_string(),
                },
                identity: identity.id,
                namespace: "ns1".to_string(),
                created: shared_types::now(),
            })
            .await
            .unwrap();
        identity
    }

    /// Register a node identity with a data-exchange peer id.
    pub async fn seed_node(&self, did: &str, peer: &str) -> Identity {
        let node = Identity {
            id: Uuid::new_v4(),
            did: did.to_string(),
            identity_type: IdentityType::Node,
            parent: None,
            namespace: "ns1".to_string(),
            name: did.to_string(),
            profile: serde_json::json!({ "id": peer }),
            created: shared_types::now(),
        };
        self.store.upsert_identity(&node).await.unwrap();
        node
    }

    /// Register a private group over `(member did, node id)` pairs.
    pub async fn seed_group(&self, members: &[(String, Uuid)]) -> Bytes32 {
        let members: Vec<GroupMember> = members
            .iter()
            .map(|(identity, node)| GroupMember {
                identity: identity.clone(),
                node: *node,
            })
            .collect();
        let hash = Group::compute_hash("ns1", None, &members);
        self.store
            .upsert_group(&Group {
                hash,
                namespace: "ns1".to_string(),
                name: None,
                members,
                created: shared_types::now(),
            })
            .await
            .unwrap();
        hash
    }

    /// A ready-to-send message from the default author.
    #[must_use]
    pub fn message(
        &self,
        msg_type: MessageType,
        tx_type: TransactionType,
        topics: &[&str],
        group: Option<Bytes32>,
    ) -> Message {
        Message {
            header: MessageHeader {
                id: Uuid::new_v4(),
                cid: None,
                msg_type,
                tx_type,
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
            hash: Bytes32::new([0x11; 32]),
            batch: None,
            state: MessageState::Ready,
            confirmed: None,
            data: vec![],
            pins: vec![],
            sequence: 0,
        }
    }

    /// "Mine" every batch pin submitted to the mock ledger: deliver each
    /// back through the blockchain callbacks as a completed pin event.
    pub async fn mine_pins(&self) {
        for submission in self.blockchain.take_submissions() {
            self.orchestrator
                .event_manager()
                .batch_pin_complete(
                    submission.batch_pin,
                    VerifierRef {
                        verifier_type: VerifierType::EthAddress,
                        value: submission.signing_key,
                    },
                )
                .await
                .expect("pin completion");
        }
    }

    /// Wait until at least `count` pin submissions reached the mock ledger.
    pub async fn wait_for_submissions(&self, count: usize) {
        let this = self;
        wait_until(
            move || async move { this.blockchain.submissions().len() >= count },
            &format!("{count} pin submissions"),
        )
        .await;
    }

    /// Wait until `count` events of one type exist, returning them in
    /// sequence order.
    pub async fn wait_for_events(&self, event_type: EventType, count: usize) -> Vec<Event> {
        let this = self;
        wait_until(
            move || async move { this.events_of_type(event_type).await.len() >= count },
            &format!("{count} {event_type:?} events"),
        )
        .await;
        self.events_of_type(event_type).await
    }

    /// All events of one type, in sequence order.
    pub async fn events_of_type(&self, event_type: EventType) -> Vec<Event> {
        self.store
            .get_events_after(0, 1000)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// The aggregator's committed offset.
    pub async fn aggregator_offset(&self) -> i64 {
        self.store
            .get_offset(wm_02_aggregator::config::AGGREGATOR_OFFSET_NAME)
            .await
            .unwrap()
            .map(|o| o.current)
            .unwrap_or(0)
    }

    /// Stop the node.
    pub async fn stop(mut self) {
        self.orchestrator.stop().await;
    }
}

/// Poll `condition` until it holds, or panic after two seconds.
pub async fn wait_until<F, Fut>(condition: F, what: &str)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
