//! The poll loop.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use shared_store::{Store, StoreError};
use shared_store::prelude::*;
use shared_types::{Classified, ErrorClass, FirstEvent, LocallySequenced, Offset};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::config::EventPollerConf;
use crate::tap::ShoulderTap;

/// The callbacks one poller instance drives.
///
/// `handle_page` is invoked with at most one page in flight; returning an
/// error triggers backoff and redelivery of the same page. Returning
/// `Ok(true)` requests an immediate re-poll regardless of page fullness.
#[async_trait]
pub trait PollHandlers: Send + Sync + 'static {
    /// The locally-sequenced item this poller reads.
    type Item: LocallySequenced + Send + Sync + 'static;

    /// Items with sequence strictly greater than `after`, ascending, capped.
    async fn get_items(&self, after: i64, limit: usize) -> Result<Vec<Self::Item>, StoreError>;

    /// The highest sequence currently assigned (for first-event `Newest`).
    async fn latest_sequence(&self) -> Result<i64, StoreError>;

    /// Process one page.
    async fn handle_page(&self, items: Vec<Self::Item>) -> Result<bool, StoreError>;

    /// Called before each query; returning `Some(offset)` moves the
    /// in-memory polling position there before reading.
    async fn maybe_rewind(&self) -> Result<Option<i64>, StoreError> {
        Ok(None)
    }
}

/// Commits a poller's offset row. Handlers that finalize work inside a
/// transactional group use `commit_in_group` so the offset moves atomically
/// with their mutations; the poller itself falls back to `commit` for pages
/// the handler did not commit.
pub struct OffsetCommitter {
    store: Arc<dyn Store>,
    name: String,
    row_id: AtomicI64,
    committed: AtomicI64,
}

impl OffsetCommitter {
    fn new(store: Arc<dyn Store>, name: &str) -> Self {
        OffsetCommitter {
            store,
            name: name.to_string(),
            row_id: AtomicI64::new(0),
            committed: AtomicI64::new(0),
        }
    }

    fn bind(&self, row_id: i64, current: i64) {
        self.row_id.store(row_id, Ordering::SeqCst);
        self.committed.store(current, Ordering::SeqCst);
    }

    /// The last committed sequence.
    #[must_use]
    pub fn committed(&self) -> i64 {
        self.committed.load(Ordering::SeqCst)
    }

    /// Commit inside a transactional group. Skips the write when `sequence`
    /// would move the offset backwards.
    pub async fn commit_in_group(
        &self,
        store: &dyn Store,
        sequence: i64,
    ) -> Result<(), StoreError> {
        if sequence <= self.committed() {
            return Ok(());
        }
        store
            .update_offset(self.row_id.load(Ordering::SeqCst), sequence)
            .await?;
        self.committed.fetch_max(sequence, Ordering::SeqCst);
        Ok(())
    }

    /// Commit outside any group.
    pub async fn commit(&self, sequence: i64) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        self.commit_in_group(store.as_ref(), sequence).await
    }

    /// The offset row name this committer writes.
    #[must_use]
    pub fn offset_name(&self) -> &str {
        &self.name
    }
}

/// A single-writer poll loop over one locally-sequenced collection.
pub struct EventPoller<H: PollHandlers> {
    conf: EventPollerConf,
    store: Arc<dyn Store>,
    handlers: Arc<H>,
    tap: ShoulderTap,
    shutdown: watch::Receiver<bool>,
    committer: Arc<OffsetCommitter>,
}

impl<H: PollHandlers> EventPoller<H> {
    /// Build a poller. Fails on invalid configuration.
    pub fn new(
        conf: EventPollerConf,
        store: Arc<dyn Store>,
        handlers: Arc<H>,
        tap: ShoulderTap,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, String> {
        conf.validate()?;
        let committer = Arc::new(OffsetCommitter::new(Arc::clone(&store), &conf.offset_name));
        Ok(EventPoller {
            conf,
            store,
            handlers,
            tap,
            shutdown,
            committer,
        })
    }

    /// The committer for this poller's offset row.
    #[must_use]
    pub fn offset_committer(&self) -> Arc<OffsetCommitter> {
        Arc::clone(&self.committer)
    }

    /// The tap that wakes this poller.
    #[must_use]
    pub fn shoulder_tap(&self) -> ShoulderTap {
        self.tap.clone()
    }

    /// Spawn the loop as a task. The task exits when the shutdown signal
    /// fires or a fatal error surfaces.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(mut self) {
        let offset_name = self.conf.offset_name.clone();
        debug!(offset = %offset_name, "Event poller starting");

        let Some(mut polling_offset) = self.load_offset().await else {
            debug!(offset = %offset_name, "Event poller cancelled during startup");
            return;
        };
        debug!(offset = %offset_name, polling_offset, "Event poller initialized");

        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Late-arriving data may have unparked earlier sequences.
            match self.handlers.maybe_rewind().await {
                Ok(Some(new_offset)) => {
                    debug!(offset = %offset_name, new_offset, "Rewinding polling position");
                    polling_offset = new_offset;
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    if !self.conf.retry.wait(attempt, &mut self.shutdown).await {
                        break;
                    }
                    attempt += 1;
                    continue;
                }
                Err(e) => {
                    error!(offset = %offset_name, error = %e, "Rewind check failed fatally");
                    break;
                }
            }

            let page = match self
                .handlers
                .get_items(polling_offset, self.conf.event_batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) if e.is_transient() => {
                    if !self.conf.retry.wait(attempt, &mut self.shutdown).await {
                        break;
                    }
                    attempt += 1;
                    continue;
                }
                Err(e) => {
                    error!(offset = %offset_name, error = %e, "Item query failed fatally");
                    break;
                }
            };

            if page.is_empty() {
                if !self.wait_for_work().await {
                    break;
                }
                continue;
            }

            trace!(
                offset = %offset_name,
                first = page.first().map(|i| i.local_sequence()).unwrap_or_default(),
                count = page.len(),
                "Dispatching page"
            );
            let full_page = page.len() >= self.conf.event_batch_size;
            let page_max = page.last().map(|i| i.local_sequence()).unwrap_or(0);

            match self.handlers.handle_page(page).await {
                Ok(repoll) => {
                    attempt = 0;
                    if self.committer.committed() < page_max {
                        if let Err(e) = self.committer.commit(page_max).await {
                            error!(offset = %offset_name, error = %e, "Offset commit failed");
                            if !self.conf.retry.wait(attempt, &mut self.shutdown).await {
                                break;
                            }
                            attempt += 1;
                            continue;
                        }
                    }
                    polling_offset = page_max;
                    if !full_page && !repoll && !self.wait_for_work().await {
                        break;
                    }
                }
                Err(e) if e.class() != ErrorClass::Fatal => {
                    // Redeliver the same page after backing off. Handler
                    // errors retry indefinitely; only cancellation exits.
                    error!(offset = %offset_name, error = %e, "Handler failed; page will be redelivered");
                    if !self.conf.retry.wait(attempt, &mut self.shutdown).await {
                        break;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(offset = %offset_name, error = %e, "Handler failed fatally");
                    break;
                }
            }
        }
        debug!(offset = %offset_name, "Event poller stopped");
    }

    /// Sleep until tapped, or until the poll timeout forces a cycle anyway.
    /// Returns `false` on shutdown.
    async fn wait_for_work(&mut self) -> bool {
        tokio::select! {
            _ = self.tap.tapped() => {
                // Give a page a moment to accumulate behind the wakeup.
                if !self.conf.event_batch_timeout.is_zero() {
                    tokio::time::sleep(self.conf.event_batch_timeout).await;
                }
                true
            }
            _ = tokio::time::sleep(self.conf.event_poll_timeout) => true,
            _ = self.shutdown.changed() => false,
        }
    }

    /// Load the committed offset, creating it per the first-event policy on
    /// first run. Returns `None` on shutdown.
    async fn load_offset(&mut self) -> Option<i64> {
        let mut attempt: u32 = 0;
        loop {
            match self.try_load_offset().await {
                Ok(current) => return Some(current),
                Err(e) if e.is_transient() => {
                    if !self.conf.retry.wait(attempt, &mut self.shutdown).await {
                        return None;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(offset = %self.conf.offset_name, error = %e, "Offset init failed");
                    return None;
                }
            }
        }
    }

    async fn try_load_offset(&self) -> Result<i64, StoreError> {
        if let Some(row) = self.store.get_offset(&self.conf.offset_name).await? {
            self.committer.bind(row.row_id, row.current);
            return Ok(row.current);
        }
        let start = match self.conf.first_event {
            FirstEvent::Oldest => 0,
            FirstEvent::Newest => self.handlers.latest_sequence().await?,
            FirstEvent::Sequence(n) => n,
        };
        let mut row = Offset {
            name: self.conf.offset_name.clone(),
            current: start,
            row_id: 0,
        };
        self.store.upsert_offset(&mut row).await?;
        self.committer.bind(row.row_id, start);
        Ok(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use shared_store::MemoryStore;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Clone, Debug)]
    struct SeqItem(i64);

    impl LocallySequenced for SeqItem {
        fn local_sequence(&self) -> i64 {
            self.0
        }
    }

    struct TestHandlers {
        items: Mutex<Vec<SeqItem>>,
        seen: Mutex<Vec<i64>>,
        fail_next: Mutex<u32>,
        pages: tokio::sync::mpsc::UnboundedSender<Vec<i64>>,
        rewind_to: Mutex<Option<i64>>,
    }

    impl TestHandlers {
        fn new(
            items: Vec<i64>,
        ) -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<Vec<i64>>) {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            (
                Arc::new(TestHandlers {
                    items: Mutex::new(items.into_iter().map(SeqItem).collect()),
                    seen: Mutex::new(vec![]),
                    fail_next: Mutex::new(0),
                    pages: tx,
                    rewind_to: Mutex::new(None),
                }),
                rx,
            )
        }

        fn add_item(&self, seq: i64) {
            self.items.lock().push(SeqItem(seq));
        }
    }

    #[async_trait]
    impl PollHandlers for TestHandlers {
        type Item = SeqItem;

        async fn get_items(&self, after: i64, limit: usize) -> Result<Vec<SeqItem>, StoreError> {
            let mut page: Vec<SeqItem> = self
                .items
                .lock()
                .iter()
                .filter(|i| i.0 > after)
                .cloned()
                .collect();
            page.sort_by_key(|i| i.0);
            page.truncate(limit);
            Ok(page)
        }

        async fn latest_sequence(&self) -> Result<i64, StoreError> {
            Ok(self.items.lock().iter().map(|i| i.0).max().unwrap_or(0))
        }

        async fn handle_page(&self, items: Vec<SeqItem>) -> Result<bool, StoreError> {
            {
                let mut fails = self.fail_next.lock();
                if *fails > 0 {
                    *fails -= 1;
                    return Err(StoreError::Io("injected".to_string()));
                }
            }
            let sequences: Vec<i64> = items.iter().map(|i| i.0).collect();
            self.seen.lock().extend(&sequences);
            let _ = self.pages.send(sequences);
            Ok(false)
        }

        async fn maybe_rewind(&self) -> Result<Option<i64>, StoreError> {
            Ok(self.rewind_to.lock().take())
        }
    }

    fn fast_conf(name: &str) -> EventPollerConf {
        EventPollerConf {
            event_batch_size: 3,
            event_batch_timeout: Duration::ZERO,
            event_poll_timeout: Duration::from_millis(20),
            first_event: FirstEvent::Oldest,
            offset_name: name.to_string(),
            retry: Retry {
                initial_delay: Duration::from_millis(1),
                maximum_delay: Duration::from_millis(5),
                factor: 2.0,
            },
        }
    }

    use crate::retry::Retry;

    #[tokio::test]
    async fn test_pages_delivered_in_order_and_offset_committed() {
        let store = MemoryStore::new_arc();
        let (handlers, mut pages) = TestHandlers::new(vec![1, 2, 3, 4, 5]);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let poller = EventPoller::new(
            fast_conf("test_order"),
            Arc::clone(&store),
            Arc::clone(&handlers),
            ShoulderTap::new(),
            stop_rx,
        )
        .unwrap();
        let committer = poller.offset_committer();
        let _task = poller.spawn();

        // Full first page of 3, then the remainder.
        let first = timeout(Duration::from_secs(1), pages.recv()).await.unwrap();
        assert_eq!(first, Some(vec![1, 2, 3]));
        let second = timeout(Duration::from_secs(1), pages.recv()).await.unwrap();
        assert_eq!(second, Some(vec![4, 5]));

        // Offset settles at the max consumed sequence.
        timeout(Duration::from_secs(1), async {
            while committer.committed() < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(store.get_offset("test_order").await.unwrap().unwrap().current, 5);
    }

    #[tokio::test]
    async fn test_first_event_newest_skips_existing() {
        let store = MemoryStore::new_arc();
        let (handlers, mut pages) = TestHandlers::new(vec![1, 2, 3]);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let mut conf = fast_conf("test_newest");
        conf.first_event = FirstEvent::Newest;
        let poller = EventPoller::new(
            conf,
            store,
            Arc::clone(&handlers),
            ShoulderTap::new(),
            stop_rx,
        )
        .unwrap();
        let tap = poller.shoulder_tap();
        let _task = poller.spawn();

        // Nothing delivered for the pre-existing items.
        assert!(timeout(Duration::from_millis(50), pages.recv()).await.is_err());

        // The next item after startup is the first one consumed.
        handlers.add_item(4);
        tap.tap();
        let page = timeout(Duration::from_secs(1), pages.recv()).await.unwrap();
        assert_eq!(page, Some(vec![4]));
    }

    #[tokio::test]
    async fn test_handler_errors_backoff_and_redeliver() {
        let store = MemoryStore::new_arc();
        let (handlers, mut pages) = TestHandlers::new(vec![7]);
        *handlers.fail_next.lock() = 2;
        let (_stop_tx, stop_rx) = watch::channel(false);

        let poller = EventPoller::new(
            fast_conf("test_retry"),
            store,
            Arc::clone(&handlers),
            ShoulderTap::new(),
            stop_rx,
        )
        .unwrap();
        let _task = poller.spawn();

        // Eventually the page lands despite two injected failures.
        let page = timeout(Duration::from_secs(1), pages.recv()).await.unwrap();
        assert_eq!(page, Some(vec![7]));
    }

    #[tokio::test]
    async fn test_rewind_moves_polling_position_back() {
        let store = MemoryStore::new_arc();
        let (handlers, mut pages) = TestHandlers::new(vec![1, 2]);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let poller = EventPoller::new(
            fast_conf("test_rewind"),
            store,
            Arc::clone(&handlers),
            ShoulderTap::new(),
            stop_rx,
        )
        .unwrap();
        let tap = poller.shoulder_tap();
        let _task = poller.spawn();

        let first = timeout(Duration::from_secs(1), pages.recv()).await.unwrap();
        assert_eq!(first, Some(vec![1, 2]));

        // Rewind to before sequence 1; both items are redelivered.
        *handlers.rewind_to.lock() = Some(0);
        tap.tap();
        let replay = timeout(Duration::from_secs(1), pages.recv()).await.unwrap();
        assert_eq!(replay, Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let store = MemoryStore::new_arc();
        let (handlers, _pages) = TestHandlers::new(vec![]);
        let (stop_tx, stop_rx) = watch::channel(false);

        let poller = EventPoller::new(
            fast_conf("test_shutdown"),
            store,
            handlers,
            ShoulderTap::new(),
            stop_rx,
        )
        .unwrap();
        let task = poller.spawn();

        stop_tx.send(true).unwrap();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
