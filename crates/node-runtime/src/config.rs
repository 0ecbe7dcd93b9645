//! Node configuration.

use shared_types::SignerRef;
use wm_01_event_poller::Retry;
use wm_02_aggregator::AggregatorConf;
use wm_03_batch::DispatcherOptions;
use wm_05_subscriptions::service::manager::SubscriptionManagerConf;

/// Top-level configuration for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Default namespace for locally-originated work.
    pub namespace: String,
    /// This node's organization identity and signing key.
    pub signer: SignerRef,
    /// DID of this node's own node identity (private sends skip it).
    pub local_node_did: String,
    /// Aggregator tuning.
    pub aggregator: AggregatorConf,
    /// Bounds for pinned broadcast batches.
    pub broadcast_batch: DispatcherOptions,
    /// Bounds for pinned private batches.
    pub private_batch: DispatcherOptions,
    /// Subscription delivery tuning.
    pub subscriptions: SubscriptionManagerConf,
    /// Backoff for outbound seal/dispatch retries.
    pub batch_retry: Retry,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            namespace: "default".to_string(),
            signer: SignerRef {
                author: "did:weft:org/local".to_string(),
                key: "0x0".to_string(),
            },
            local_node_did: "did:weft:node/local".to_string(),
            aggregator: AggregatorConf::default(),
            broadcast_batch: DispatcherOptions {
                batch_type: shared_types::BatchType::Broadcast,
                ..DispatcherOptions::default()
            },
            private_batch: DispatcherOptions {
                batch_type: shared_types::BatchType::Private,
                ..DispatcherOptions::default()
            },
            subscriptions: SubscriptionManagerConf::default(),
            batch_retry: Retry::default(),
        }
    }
}
