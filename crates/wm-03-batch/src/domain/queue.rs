//! The assembly queue: an insertion-sorted, byte-budgeted buffer between
//! producers and one batch processor.

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::BATCH_PAYLOAD_ESTIMATE_BASE;
use crate::domain::work::BatchWork;

struct QueueInner {
    work: Vec<BatchWork>,
    bytes: usize,
}

/// Work queue for one processor. Producers block (asynchronously) while the
/// queued bytes exceed the budget; the processor frees space as it seals.
pub struct AssemblyQueue {
    inner: Mutex<QueueInner>,
    byte_budget: usize,
    arrival: Notify,
    space: Notify,
}

impl AssemblyQueue {
    /// Create a queue with the given byte budget.
    #[must_use]
    pub fn new(byte_budget: usize) -> Self {
        AssemblyQueue {
            inner: Mutex::new(QueueInner {
                work: Vec::new(),
                bytes: 0,
            }),
            byte_budget,
            arrival: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Queue one work item, blocking while the queue is over budget. Items
    /// are kept sorted by message sequence regardless of arrival order.
    pub async fn add(&self, work: BatchWork) {
        let mut work = Some(work);
        loop {
            // Register for the space wakeup before checking, so a take_page
            // racing between the check and the await cannot be missed.
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if inner.bytes <= self.byte_budget {
                    let item = work.take().expect("work consumed once");
                    let size = item.estimate_size();
                    let at = inner
                        .work
                        .partition_point(|w| w.message.sequence <= item.message.sequence);
                    inner.work.insert(at, item);
                    inner.bytes += size;
                    drop(inner);
                    self.arrival.notify_one();
                    return;
                }
            }
            notified.await;
        }
    }

    /// Take the next batch page: up to `max_size` items whose cumulative
    /// estimate stays within `max_bytes` (always at least one). The item
    /// that would cross the byte bound stays queued and opens the next batch.
    pub fn take_page(&self, max_size: usize, max_bytes: usize) -> Vec<BatchWork> {
        let mut inner = self.inner.lock();
        let mut taken = Vec::new();
        let mut total = BATCH_PAYLOAD_ESTIMATE_BASE;
        while !inner.work.is_empty() && taken.len() < max_size {
            let next_size = inner.work[0].estimate_size();
            if !taken.is_empty() && total + next_size > max_bytes {
                break;
            }
            let work = inner.work.remove(0);
            inner.bytes -= next_size;
            total += next_size;
            taken.push(work);
        }
        drop(inner);
        if !taken.is_empty() {
            self.space.notify_waiters();
        }
        taken
    }

    /// Current (count, bytes) of queued work.
    #[must_use]
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.work.len(), inner.bytes)
    }

    /// True when no work is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().work.is_empty()
    }

    /// Wait until new work arrives.
    pub async fn arrived(&self) {
        self.arrival.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{
        Bytes32, MessageHeader, MessageState, MessageType, SignerRef, TransactionType,
    };
    use uuid::Uuid;

    fn work(sequence: i64) -> BatchWork {
        BatchWork {
            message: shared_types::Message {
                header: MessageHeader {
                    id: Uuid::new_v4(),
                    cid: None,
                    msg_type: MessageType::Broadcast,
                    tx_type: TransactionType::BatchPin,
                    signer: SignerRef::default(),
                    created: shared_types::now(),
                    namespace: "ns1".to_string(),
                    topics: vec!["t1".to_string()],
                    tag: None,
                    group: None,
                    data_hash: None,
                },
                hash: Bytes32::new([1; 32]),
                batch: None,
                state: MessageState::Ready,
                confirmed: None,
                data: vec![],
                pins: vec![],
                sequence,
            },
            data: vec![],
        }
    }

    #[tokio::test]
    async fn test_insertion_sorted_by_sequence() {
        let queue = AssemblyQueue::new(1024 * 1024);
        for seq in [202, 200, 201, 150] {
            queue.add(work(seq)).await;
        }
        let page = queue.take_page(10, 1024 * 1024);
        let sequences: Vec<i64> = page.iter().map(|w| w.message.sequence).collect();
        assert_eq!(sequences, vec![150, 200, 201, 202]);
    }

    #[tokio::test]
    async fn test_page_respects_size_bound() {
        let queue = AssemblyQueue::new(1024 * 1024);
        for seq in 0..5 {
            queue.add(work(seq)).await;
        }
        let page = queue.take_page(2, 1024 * 1024);
        assert_eq!(page.len(), 2);
        let (remaining, _) = queue.stats();
        assert_eq!(remaining, 3);
    }

    #[tokio::test]
    async fn test_byte_bound_crossing_item_opens_next_batch() {
        let queue = AssemblyQueue::new(1024 * 1024);
        queue.add(work(1)).await;
        queue.add(work(2)).await;

        // Budget fits the envelope plus one message only.
        let one = work(0).estimate_size();
        let page = queue.take_page(10, BATCH_PAYLOAD_ESTIMATE_BASE + one + 100);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].message.sequence, 1);

        let rest = queue.take_page(10, 1024 * 1024);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].message.sequence, 2);
    }

    #[tokio::test]
    async fn test_producer_blocks_until_space_frees() {
        use std::sync::Arc;
        use std::time::Duration;

        // Budget below one item: the second add must wait for take_page.
        let queue = Arc::new(AssemblyQueue::new(1));
        queue.add(work(1)).await; // first add always succeeds at empty

        let blocked = Arc::clone(&queue);
        let producer = tokio::spawn(async move { blocked.add(work(2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let page = queue.take_page(10, 1024 * 1024);
        assert_eq!(page.len(), 1);
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should unblock")
            .unwrap();
    }
}
