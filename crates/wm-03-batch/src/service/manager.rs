//! The batch manager: dispatcher registry and processor lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shared_store::Store;
use shared_types::{MessageType, SignerRef, TransactionType};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::DispatcherOptions;
use crate::domain::queue::AssemblyQueue;
use crate::domain::work::{BatchWork, DispatchState, ProcessorKey};
use crate::error::BatchError;
use crate::service::processor::{BatchProcessor, BatchProcessorConf};
use wm_01_event_poller::Retry;

const QUIESCE_CHANNEL_CAPACITY: usize = 16;

/// Receives sealed batches for delivery (pin submission, private transfer).
#[async_trait]
pub trait DispatchHandler: Send + Sync {
    /// Deliver one sealed batch.
    async fn dispatch(&self, state: &DispatchState) -> Result<(), BatchError>;
}

struct RegisteredDispatcher {
    name: String,
    options: DispatcherOptions,
    handler: Arc<dyn DispatchHandler>,
}

struct ProcessorHandle {
    queue: Arc<AssemblyQueue>,
    dispatcher: Arc<RegisteredDispatcher>,
    task: JoinHandle<()>,
}

/// Routes new work to per-key processors, spawning and reaping them on
/// demand.
pub struct BatchManager {
    store: Arc<dyn Store>,
    signer: SignerRef,
    retry: Retry,
    routes: RwLock<HashMap<(TransactionType, MessageType), Arc<RegisteredDispatcher>>>,
    processors: Mutex<HashMap<ProcessorKey, ProcessorHandle>>,
    quiesce_tx: mpsc::Sender<ProcessorKey>,
    quiesce_rx: StdMutex<Option<mpsc::Receiver<ProcessorKey>>>,
    shutdown: watch::Receiver<bool>,
}

impl BatchManager {
    /// Build the manager. `signer` identifies this node on sealed batches.
    pub fn new(
        store: Arc<dyn Store>,
        signer: SignerRef,
        retry: Retry,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (quiesce_tx, quiesce_rx) = mpsc::channel(QUIESCE_CHANNEL_CAPACITY);
        Arc::new(BatchManager {
            store,
            signer,
            retry,
            routes: RwLock::new(HashMap::new()),
            processors: Mutex::new(HashMap::new()),
            quiesce_tx,
            quiesce_rx: StdMutex::new(Some(quiesce_rx)),
            shutdown,
        })
    }

    /// Register a dispatcher for the message types it assembles, under the
    /// transaction type it anchors with.
    pub fn register_dispatcher(
        &self,
        name: &str,
        tx_type: TransactionType,
        msg_types: &[MessageType],
        options: DispatcherOptions,
        handler: Arc<dyn DispatchHandler>,
    ) {
        let dispatcher = Arc::new(RegisteredDispatcher {
            name: name.to_string(),
            options,
            handler,
        });
        let mut routes = self.routes.write();
        for msg_type in msg_types {
            debug!(dispatcher = name, ?tx_type, ?msg_type, "Batch dispatcher registered");
            routes.insert((tx_type, *msg_type), Arc::clone(&dispatcher));
        }
    }

    /// Start the processor reaper. Quiesced processors are removed, unless
    /// work raced in during teardown, in which case they are respawned over
    /// the same queue.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut quiesce_rx = self
            .quiesce_rx
            .lock()
            .expect("quiesce receiver lock")
            .take()
            .expect("batch manager already started");
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_key = quiesce_rx.recv() => {
                        let Some(key) = maybe_key else { break };
                        manager.reap(key);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Batch manager reaper stopped");
        })
    }

    fn reap(&self, key: ProcessorKey) {
        let mut processors = self.processors.lock();
        let (is_empty, dispatcher, queue) = {
            let Some(handle) = processors.get(&key) else {
                return;
            };
            (
                handle.queue.is_empty(),
                Arc::clone(&handle.dispatcher),
                Arc::clone(&handle.queue),
            )
        };
        if is_empty {
            info!(dispatcher = %key.dispatcher, namespace = %key.namespace, "Batch processor disposed");
            processors.remove(&key);
        } else {
            // Work arrived while the processor was quiescing; respawn over
            // the same queue so nothing is lost.
            let task = self.spawn_processor(&key, &dispatcher, Arc::clone(&queue));
            processors.insert(
                key,
                ProcessorHandle {
                    queue,
                    dispatcher,
                    task,
                },
            );
        }
    }

    fn spawn_processor(
        &self,
        key: &ProcessorKey,
        dispatcher: &Arc<RegisteredDispatcher>,
        queue: Arc<AssemblyQueue>,
    ) -> JoinHandle<()> {
        BatchProcessor::new(
            BatchProcessorConf {
                key: key.clone(),
                signer: self.signer.clone(),
                options: dispatcher.options.clone(),
            },
            Arc::clone(&self.store),
            Arc::clone(&dispatcher.handler),
            self.retry.clone(),
            queue,
            self.shutdown.clone(),
            self.quiesce_tx.clone(),
        )
        .spawn()
    }

    /// Route one work item to its processor, spawning it if needed. Blocks
    /// while the processor's queue is over its byte budget.
    pub async fn submit_new_work(&self, work: BatchWork) -> Result<(), BatchError> {
        let header = &work.message.header;
        let route_key = (header.tx_type, header.msg_type);
        let dispatcher = self
            .routes
            .read()
            .get(&route_key)
            .cloned()
            .ok_or(BatchError::NoDispatcher {
                tx_type: header.tx_type,
                msg_type: header.msg_type,
            })?;

        let key = ProcessorKey {
            dispatcher: dispatcher.name.clone(),
            namespace: header.namespace.clone(),
            tx_type: header.tx_type,
            group: header.group,
        };

        let queue = {
            let mut processors = self.processors.lock();
            match processors.get(&key) {
                Some(handle) => Arc::clone(&handle.queue),
                None => {
                    let queue =
                        Arc::new(AssemblyQueue::new(dispatcher.options.batch_max_bytes));
                    let task = self.spawn_processor(&key, &dispatcher, Arc::clone(&queue));
                    processors.insert(
                        key.clone(),
                        ProcessorHandle {
                            queue: Arc::clone(&queue),
                            dispatcher: Arc::clone(&dispatcher),
                            task,
                        },
                    );
                    queue
                }
            }
        };

        queue.add(work).await;
        Ok(())
    }

    /// Number of live processors (for tests and introspection).
    #[must_use]
    pub fn processor_count(&self) -> usize {
        self.processors.lock().len()
    }
}
