//! Priority Queue (§4.2.1): four bounded sub-queues indexed by
//! `MessagePriority`, polled in descending priority order.
//!
//! Grounded on `examples/original_source/management_platform/scheduler/queue.py`'s
//! `PriorityTaskQueue` (heap-per-priority, bounded capacity, blocking
//! `get()` that polls at a fixed interval), adapted here to `Message`
//! instead of `QueuedTask`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use shared::model::{Message, MessagePriority};
use tokio::sync::Mutex;
use tokio::time::sleep;

const TOTAL_CAPACITY: usize = 10_000;
const PRIORITY_LEVELS: usize = 4;
const PER_QUEUE_CAPACITY: usize = TOTAL_CAPACITY / PRIORITY_LEVELS;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected_full: u64,
    pub expired_on_enqueue: u64,
    pub expired_on_dequeue: u64,
}

fn priority_index(priority: MessagePriority) -> usize {
    match priority {
        MessagePriority::Urgent => 0,
        MessagePriority::High => 1,
        MessagePriority::Normal => 2,
        MessagePriority::Low => 3,
    }
}

struct Inner {
    queues: [VecDeque<Message>; PRIORITY_LEVELS],
    stats: QueueStats,
}

/// Single queueing layer shared by the dispatch loop and every producer
/// (distributor, status updater, result collector's ack path).
pub struct PriorityQueue {
    inner: Mutex<Inner>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: Default::default(),
                stats: QueueStats::default(),
            }),
        }
    }

    /// Checks expiry before insertion; rejects if the message's sub-queue
    /// is at capacity.
    pub async fn enqueue(&self, message: Message) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        if message.is_expired(now) {
            inner.stats.expired_on_enqueue += 1;
            return false;
        }
        let idx = priority_index(message.priority);
        if inner.queues[idx].len() >= PER_QUEUE_CAPACITY {
            inner.stats.rejected_full += 1;
            return false;
        }
        inner.queues[idx].push_back(message);
        inner.stats.enqueued += 1;
        true
    }

    /// Polls sub-queues in descending priority order; re-checks expiry on
    /// dequeue and silently drops (and counts) expired messages.
    async fn try_dequeue(&self) -> Option<Message> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        for idx in 0..PRIORITY_LEVELS {
            while let Some(message) = inner.queues[idx].pop_front() {
                if message.is_expired(now) {
                    inner.stats.expired_on_dequeue += 1;
                    continue;
                }
                inner.stats.dequeued += 1;
                return Some(message);
            }
        }
        None
    }

    /// Blocking dequeue: polls every 100ms up to `timeout`.
    pub async fn dequeue_blocking(&self, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_dequeue().await {
                return Some(message);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(tokio::time::Instant::now()))).await;
        }
    }

    pub async fn stats(&self) -> QueueStats {
        self.inner.lock().await.stats
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.queues.iter().map(|q| q.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn message(priority: MessagePriority) -> Message {
        Message {
            id: Uuid::new_v4(),
            message_type: "task_assignment".into(),
            priority,
            sender: "orchestrator".into(),
            recipient: None,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn dequeues_in_descending_priority_order() {
        let queue = PriorityQueue::new();
        queue.enqueue(message(MessagePriority::Low)).await;
        queue.enqueue(message(MessagePriority::Urgent)).await;
        queue.enqueue(message(MessagePriority::Normal)).await;

        assert_eq!(queue.dequeue_blocking(Duration::from_millis(10)).await.unwrap().priority, MessagePriority::Urgent);
        assert_eq!(queue.dequeue_blocking(Duration::from_millis(10)).await.unwrap().priority, MessagePriority::Normal);
        assert_eq!(queue.dequeue_blocking(Duration::from_millis(10)).await.unwrap().priority, MessagePriority::Low);
    }

    #[tokio::test]
    async fn expired_message_rejected_on_enqueue() {
        let queue = PriorityQueue::new();
        let mut m = message(MessagePriority::High);
        m.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(!queue.enqueue(m).await);
        assert_eq!(queue.stats().await.expired_on_enqueue, 1);
    }

    #[tokio::test]
    async fn expired_message_dropped_on_dequeue() {
        let queue = PriorityQueue::new();
        let mut m = message(MessagePriority::High);
        m.expires_at = Some(Utc::now() + chrono::Duration::milliseconds(20));
        queue.enqueue(m).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(queue.dequeue_blocking(Duration::from_millis(50)).await.is_none());
        assert_eq!(queue.stats().await.expired_on_dequeue, 1);
    }

    #[tokio::test]
    async fn blocking_dequeue_times_out_on_empty_queue() {
        let queue = PriorityQueue::new();
        let start = tokio::time::Instant::now();
        assert!(queue.dequeue_blocking(Duration::from_millis(150)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
