//! The orchestrator: subsystem construction, wiring and lifecycle.

use std::sync::Arc;

use shared_connectors::{BlockchainConnector, DataExchangeConnector, TokenConnector};
use shared_store::{ChangeEvent, Collection, Store};
use shared_types::{MessageType, OpType, TransactionType};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::NodeConfig;
use wm_02_aggregator::adapters::data_manager::StoreDataManager;
use wm_02_aggregator::adapters::definitions::{DatatypeDefinitionHandler, DefinitionDispatcher};
use wm_02_aggregator::ports::outbound::tags;
use wm_02_aggregator::{Aggregator, EventManager};
use wm_03_batch::{
    BatchManager, BatchPinSubmitter, BatchUploader, BroadcastBatchDispatcher,
    PrivateBatchDispatcher,
};
use wm_04_operations::OperationsManager;
use wm_05_subscriptions::SubscriptionManager;

/// Owns every subsystem of one node.
pub struct Orchestrator {
    config: NodeConfig,
    store: Arc<dyn Store>,
    aggregator: Arc<Aggregator>,
    event_manager: Arc<EventManager>,
    operations: Arc<OperationsManager>,
    batch_manager: Arc<BatchManager>,
    subscriptions: Arc<SubscriptionManager>,
    tokens: Arc<dyn TokenConnector>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Construct and wire all subsystems. Connectors and the shared-storage
    /// uploader are supplied by the embedder.
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn Store>,
        blockchain: Arc<dyn BlockchainConnector>,
        exchange: Arc<dyn DataExchangeConnector>,
        tokens: Arc<dyn TokenConnector>,
        uploader: Arc<dyn BatchUploader>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Phase 2: aggregation.
        info!("Wiring aggregation: data manager, definitions, aggregator");
        let data_manager = Arc::new(StoreDataManager::new(Arc::clone(&store)));
        let mut definitions = DefinitionDispatcher::new();
        definitions.register(
            tags::DEFINE_DATATYPE,
            Arc::new(DatatypeDefinitionHandler::new(Arc::clone(&store))),
        );
        let aggregator = Aggregator::new(
            config.aggregator.clone(),
            Arc::clone(&store),
            data_manager,
            Arc::new(definitions),
            blockchain.verifier_type(),
        );

        // Phase 3: outbound.
        info!("Wiring outbound: operations, pin submitter, dispatchers, batch manager");
        let operations = OperationsManager::new(Arc::clone(&store));
        let event_manager = EventManager::new(
            Arc::clone(&store),
            Arc::clone(&aggregator),
            operations.clone(),
        );

        let pin_submitter = BatchPinSubmitter::new(
            Arc::clone(&store),
            Arc::clone(&operations),
            Arc::clone(&blockchain),
        );
        operations.register_handler(pin_submitter.clone(), &[OpType::BlockchainPinBatch]);

        let broadcast_dispatch =
            BroadcastBatchDispatcher::new(uploader, Arc::clone(&pin_submitter));
        let private_dispatch = PrivateBatchDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&operations),
            exchange,
            Arc::clone(&pin_submitter),
            &config.local_node_did,
        );
        operations.register_handler(
            private_dispatch.clone(),
            &[OpType::DataExchangeSendBlob, OpType::DataExchangeSendBatch],
        );

        let batch_manager = BatchManager::new(
            Arc::clone(&store),
            config.signer.clone(),
            config.batch_retry.clone(),
            shutdown_rx.clone(),
        );
        batch_manager.register_dispatcher(
            "pinned_broadcast",
            TransactionType::BatchPin,
            &[
                MessageType::Broadcast,
                MessageType::Definition,
                MessageType::TransferBroadcast,
            ],
            config.broadcast_batch.clone(),
            broadcast_dispatch,
        );
        batch_manager.register_dispatcher(
            "pinned_private",
            TransactionType::BatchPin,
            &[
                MessageType::GroupInit,
                MessageType::Private,
                MessageType::TransferPrivate,
            ],
            config.private_batch.clone(),
            Arc::clone(&private_dispatch) as Arc<dyn wm_03_batch::DispatchHandler>,
        );
        batch_manager.register_dispatcher(
            "unpinned_private",
            TransactionType::Unpinned,
            &[MessageType::Private],
            config.private_batch.clone(),
            private_dispatch as Arc<dyn wm_03_batch::DispatchHandler>,
        );

        // Phase 4: delivery.
        info!("Wiring delivery: subscription manager");
        let subscriptions = SubscriptionManager::new(
            config.subscriptions.clone(),
            Arc::clone(&store),
            shutdown_rx,
        );

        Orchestrator {
            config,
            store,
            aggregator,
            event_manager,
            operations,
            batch_manager,
            subscriptions,
            tokens,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Start every long-lived task.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        info!(namespace = %self.config.namespace, "Starting node runtime");
        let shutdown = self.shutdown_tx.subscribe();

        self.tasks.extend(
            self.aggregator
                .start(shutdown.clone())
                .map_err(|e| anyhow::anyhow!(e))?,
        );
        self.tasks.push(self.batch_manager.start());
        self.tasks.push(self.subscriptions.start().await?);

        // Pins inserted by any path (not just this node's event manager)
        // wake the aggregator via store change notifications.
        let tap = self.aggregator.shoulder_tap();
        let mut changes = self.store.subscribe_changes();
        let mut change_shutdown = shutdown;
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(ChangeEvent { collection: Collection::Pins, .. }) => tap.tap(),
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => tap.tap(),
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = change_shutdown.changed() => break,
                }
            }
            debug!("Pin wakeup listener stopped");
        }));

        info!("Node runtime started ({} tasks)", self.tasks.len());
        Ok(())
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn stop(&mut self) {
        info!("Stopping node runtime");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("Node runtime stopped");
    }

    /// The store this node runs over.
    #[must_use]
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// The aggregator service.
    #[must_use]
    pub fn aggregator(&self) -> Arc<Aggregator> {
        Arc::clone(&self.aggregator)
    }

    /// The connector-facing event manager (register with connectors).
    #[must_use]
    pub fn event_manager(&self) -> Arc<EventManager> {
        Arc::clone(&self.event_manager)
    }

    /// The operation manager.
    #[must_use]
    pub fn operations(&self) -> Arc<OperationsManager> {
        Arc::clone(&self.operations)
    }

    /// The outbound batch manager.
    #[must_use]
    pub fn batch_manager(&self) -> Arc<BatchManager> {
        Arc::clone(&self.batch_manager)
    }

    /// The subscription manager.
    #[must_use]
    pub fn subscriptions(&self) -> Arc<SubscriptionManager> {
        Arc::clone(&self.subscriptions)
    }

    /// The token connector (driven by the node API layer for pool and
    /// transfer submissions).
    #[must_use]
    pub fn token_connector(&self) -> Arc<dyn TokenConnector> {
        Arc::clone(&self.tokens)
    }

    /// The node's configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}
