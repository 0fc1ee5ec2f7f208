//! Main/retry/delayed queues (§4.3.1) behind one mutex — mirrors the
//! Message Dispatcher's `PriorityQueue` idiom (`dispatcher::queue`): one
//! lock around the heap(s) plus a dedup set, never exposed directly.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use shared::model::QueuedTask;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Max-heap entry: higher `priority` first, ties broken by earlier
/// `scheduled_time` (oldest first), matching §5's "FIFO within a priority
/// level is not guaranteed — tie-break by scheduled-time" allowance.
#[derive(Debug, Clone)]
struct MainEntry(QueuedTask);

impl PartialEq for MainEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.scheduled_time == other.0.scheduled_time
    }
}
impl Eq for MainEntry {}
impl PartialOrd for MainEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MainEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.scheduled_time.cmp(&self.0.scheduled_time))
    }
}

/// Min-heap entry on `execute_at`.
#[derive(Debug, Clone)]
struct DelayedEntry {
    execute_at: DateTime<Utc>,
    task: QueuedTask,
}
impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.execute_at == other.execute_at
    }
}
impl Eq for DelayedEntry {}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so `BinaryHeap` (a max-heap) pops the earliest `execute_at`
        other.execute_at.cmp(&self.execute_at)
    }
}

struct Inner {
    main: BinaryHeap<MainEntry>,
    retry: VecDeque<QueuedTask>,
    delayed: BinaryHeap<DelayedEntry>,
    /// Every task id currently present in any of the three queues above
    /// (§4.3.7: a task id never appears in two queues simultaneously).
    queued_ids: HashSet<Uuid>,
}

pub struct SchedulerQueues {
    inner: Mutex<Inner>,
}

impl SchedulerQueues {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                main: BinaryHeap::new(),
                retry: VecDeque::new(),
                delayed: BinaryHeap::new(),
                queued_ids: HashSet::new(),
            }),
        }
    }

    pub async fn contains(&self, task_id: Uuid) -> bool {
        self.inner.lock().await.queued_ids.contains(&task_id)
    }

    /// Enqueues onto the main priority queue. No-op (returns `false`) if
    /// the task id is already queued anywhere.
    pub async fn enqueue_main(&self, task: QueuedTask) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.queued_ids.insert(task.task_id) {
            return false;
        }
        inner.main.push(MainEntry(task));
        true
    }

    /// Enqueues onto the retry queue with a delay (§4.3.2: failed dispatch
    /// re-enqueues on retry with a 60s delay) by routing through the
    /// delayed queue first; the 1Hz delayed-queue pump migrates it into
    /// retry once `execute_at` elapses.
    pub async fn enqueue_retry_delayed(&self, task: QueuedTask, execute_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.queued_ids.insert(task.task_id) {
            return false;
        }
        inner.delayed.push(DelayedEntry { execute_at, task });
        true
    }

    /// Migrates every delayed entry whose `execute_at` has elapsed into the
    /// retry queue. Runs at 1Hz from its own task (§4.3.1).
    pub async fn pump_delayed(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().await;
        let mut moved = 0;
        while let Some(top) = inner.delayed.peek() {
            if top.execute_at > now {
                break;
            }
            let entry = inner.delayed.pop().expect("peeked Some");
            inner.retry.push_back(entry.task);
            moved += 1;
        }
        moved
    }

    /// Pops retry first, then main (§4.3.2 drain step). Removes the id
    /// from the dedup set since the task is leaving the queue system.
    pub async fn pop_next(&self) -> Option<QueuedTask> {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.retry.pop_front() {
            inner.queued_ids.remove(&task.task_id);
            return Some(task);
        }
        if let Some(MainEntry(task)) = inner.main.pop() {
            inner.queued_ids.remove(&task.task_id);
            return Some(task);
        }
        None
    }

    pub async fn len(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock().await;
        (inner.main.len(), inner.retry.len(), inner.delayed.len())
    }
}

impl Default for SchedulerQueues {
    fn default() -> Self {
        Self::new()
    }
}
