//! The subscription manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use shared_store::{ChangeEvent, Collection, Store};
use shared_store::prelude::*;
use shared_types::{Subscription, SubscriptionFilter, SubscriptionOptions};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::filter::CompiledFilter;
use crate::error::SubscriptionError;
use crate::ports::transport::{DeliveryResponse, SubscriptionTransport};
use crate::service::dispatcher::{subscription_offset_name, EventDispatcher};
use wm_01_event_poller::{EventPoller, EventPollerConf, Retry, ShoulderTap};

const ACK_CHANNEL_CAPACITY: usize = 64;

/// Delivery configuration shared by all dispatchers.
#[derive(Debug, Clone)]
pub struct SubscriptionManagerConf {
    /// Events per dispatcher poll page.
    pub batch_size: usize,
    /// Idle poll timeout per dispatcher.
    pub poll_timeout: Duration,
    /// Backoff for transient store and delivery errors.
    pub retry: Retry,
}

impl Default for SubscriptionManagerConf {
    fn default() -> Self {
        SubscriptionManagerConf {
            batch_size: 25,
            poll_timeout: Duration::from_secs(30),
            retry: Retry::default(),
        }
    }
}

struct ActiveDispatcher {
    subscription: Uuid,
    connection: String,
    ephemeral: bool,
    ack_tx: mpsc::Sender<DeliveryResponse>,
    tap: ShoulderTap,
    stop: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

/// Owns durable subscription definitions and the live dispatchers bound to
/// transport connections. One mutex guards the registry maps; dispatchers
/// themselves run without it.
pub struct SubscriptionManager {
    conf: SubscriptionManagerConf,
    store: Arc<dyn Store>,
    transports: RwLock<HashMap<String, Arc<dyn SubscriptionTransport>>>,
    durable_subs: Mutex<HashMap<Uuid, Subscription>>,
    active: Mutex<Vec<ActiveDispatcher>>,
    shutdown: watch::Receiver<bool>,
}

impl SubscriptionManager {
    /// Build the manager.
    pub fn new(
        conf: SubscriptionManagerConf,
        store: Arc<dyn Store>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(SubscriptionManager {
            conf,
            store,
            transports: RwLock::new(HashMap::new()),
            durable_subs: Mutex::new(HashMap::new()),
            active: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// Register a transport plugin by name.
    pub fn register_transport(&self, transport: Arc<dyn SubscriptionTransport>) {
        self.transports
            .write()
            .insert(transport.name().to_string(), transport);
    }

    /// Restore durable subscriptions from the store and start the wakeup
    /// listener that taps dispatchers when new events are inserted.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, SubscriptionError> {
        let restored = self.store.get_subscriptions().await?;
        {
            let mut durable = self.durable_subs.lock();
            for sub in restored {
                // A bad persisted filter is skipped, never fatal at startup.
                match CompiledFilter::compile(&sub.filter) {
                    Ok(_) => {
                        debug!(subscription = %sub.id, name = %sub.name, "Restored subscription");
                        durable.insert(sub.id, sub);
                    }
                    Err(e) => {
                        warn!(subscription = %sub.id, error = %e, "Skipping unrestorable subscription")
                    }
                }
            }
        }

        let manager = Arc::clone(self);
        let mut changes = self.store.subscribe_changes();
        let mut shutdown = self.shutdown.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => {
                        match change {
                            Ok(ChangeEvent { collection: Collection::Events, .. }) => {
                                manager.tap_all();
                            }
                            Ok(_) => {}
                            // Lossy channel: lagging just means a wakeup was
                            // collapsed; truth is recomputed from queries.
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                                manager.tap_all();
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Subscription wakeup listener stopped");
        }))
    }

    fn tap_all(&self) {
        for dispatcher in self.active.lock().iter() {
            dispatcher.tap.tap();
        }
    }

    /// Validate and persist a durable subscription.
    pub async fn create_subscription(
        &self,
        subscription: Subscription,
    ) -> Result<(), SubscriptionError> {
        CompiledFilter::compile(&subscription.filter)?;
        if !self
            .transports
            .read()
            .contains_key(&subscription.transport)
        {
            return Err(SubscriptionError::UnknownTransport(
                subscription.transport.clone(),
            ));
        }
        self.store.upsert_subscription(&subscription).await?;
        info!(subscription = %subscription.id, name = %subscription.name, "Subscription created");
        self.durable_subs
            .lock()
            .insert(subscription.id, subscription);
        Ok(())
    }

    /// Delete a durable subscription, stopping any live dispatcher and
    /// discarding its offset.
    pub async fn delete_subscription(&self, id: &Uuid) -> Result<(), SubscriptionError> {
        self.durable_subs.lock().remove(id);
        self.stop_dispatchers(|d| d.subscription == *id);
        self.store.delete_subscription_by_id(id).await?;
        self.store
            .delete_offset(&subscription_offset_name(id))
            .await?;
        Ok(())
    }

    /// Bind a durable subscription to a connection and start delivering.
    /// A subscription delivers to at most one connection at a time.
    pub fn activate(
        self: &Arc<Self>,
        connection: &str,
        subscription_id: &Uuid,
    ) -> Result<(), SubscriptionError> {
        let subscription = self
            .durable_subs
            .lock()
            .get(subscription_id)
            .cloned()
            .ok_or(SubscriptionError::UnknownSubscription(*subscription_id))?;
        {
            let active = self.active.lock();
            if active.iter().any(|d| d.subscription == *subscription_id) {
                return Err(SubscriptionError::AlreadyActive(*subscription_id));
            }
        }
        self.spawn_dispatcher(connection, subscription)
    }

    /// Create a connection-scoped, in-memory subscription starting at the
    /// configured first-event anchor. Dies with the connection.
    pub fn ephemeral_subscription(
        self: &Arc<Self>,
        connection: &str,
        transport: &str,
        namespace: &str,
        filter: SubscriptionFilter,
        options: SubscriptionOptions,
    ) -> Result<Uuid, SubscriptionError> {
        let id = Uuid::new_v4();
        let subscription = Subscription {
            id,
            namespace: namespace.to_string(),
            name: format!("eph_{connection}_{id}"),
            transport: transport.to_string(),
            filter,
            options,
            ephemeral: true,
            created: shared_types::now(),
        };
        self.spawn_dispatcher(connection, subscription)?;
        Ok(id)
    }

    fn spawn_dispatcher(
        self: &Arc<Self>,
        connection: &str,
        subscription: Subscription,
    ) -> Result<(), SubscriptionError> {
        let filter = CompiledFilter::compile(&subscription.filter)?;
        let transport = self
            .transports
            .read()
            .get(&subscription.transport)
            .cloned()
            .ok_or_else(|| SubscriptionError::UnknownTransport(subscription.transport.clone()))?;

        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let tap = ShoulderTap::new();

        let sub_id = subscription.id;
        let ephemeral = subscription.ephemeral;
        let first_event = subscription.options.first_event;
        let handlers = EventDispatcher::new(
            Arc::clone(&self.store),
            transport,
            connection,
            subscription,
            filter,
            ack_rx,
        );
        let poller = EventPoller::new(
            EventPollerConf {
                event_batch_size: self.conf.batch_size,
                event_batch_timeout: Duration::ZERO,
                event_poll_timeout: self.conf.poll_timeout,
                first_event,
                offset_name: subscription_offset_name(&sub_id),
                retry: self.conf.retry.clone(),
            },
            Arc::clone(&self.store),
            handlers,
            tap.clone(),
            stop_rx,
        )
        .map_err(|e| SubscriptionError::BadFilter {
            field: "options",
            message: e,
        })?;

        info!(subscription = %sub_id, connection, ephemeral, "Event dispatcher started");
        let task = poller.spawn();
        self.active.lock().push(ActiveDispatcher {
            subscription: sub_id,
            connection: connection.to_string(),
            ephemeral,
            ack_tx,
            tap,
            stop: stop_tx,
            _task: task,
        });
        Ok(())
    }

    /// Route one delivery acknowledgement to its dispatcher.
    pub async fn delivery_response(
        &self,
        connection: &str,
        subscription_id: &Uuid,
        response: DeliveryResponse,
    ) -> Result<(), SubscriptionError> {
        let ack_tx = {
            let active = self.active.lock();
            active
                .iter()
                .find(|d| d.connection == connection && d.subscription == *subscription_id)
                .map(|d| d.ack_tx.clone())
        }
        .ok_or_else(|| SubscriptionError::UnknownConnection(connection.to_string()))?;
        ack_tx
            .send(response)
            .await
            .map_err(|e| SubscriptionError::Delivery(e.to_string()))
    }

    /// Tear down every dispatcher bound to a closed connection. Ephemeral
    /// subscriptions lose their offset; durable ones keep it for the next
    /// connection.
    pub async fn connection_closed(&self, connection: &str) {
        let removed = self.stop_dispatchers(|d| d.connection == connection);
        for dispatcher in removed {
            if dispatcher.ephemeral {
                let name = subscription_offset_name(&dispatcher.subscription);
                if let Err(e) = self.store.delete_offset(&name).await {
                    warn!(offset = %name, error = %e, "Ephemeral offset cleanup failed");
                }
            }
        }
    }

    fn stop_dispatchers<F: Fn(&ActiveDispatcher) -> bool>(
        &self,
        predicate: F,
    ) -> Vec<ActiveDispatcher> {
        let mut active = self.active.lock();
        let mut removed = Vec::new();
        let mut index = 0;
        while index < active.len() {
            if predicate(&active[index]) {
                let dispatcher = active.remove(index);
                let _ = dispatcher.stop.send(true);
                info!(
                    subscription = %dispatcher.subscription,
                    connection = %dispatcher.connection,
                    "Event dispatcher stopped"
                );
                removed.push(dispatcher);
            } else {
                index += 1;
            }
        }
        removed
    }

    /// Number of live dispatchers (for tests and introspection).
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}
