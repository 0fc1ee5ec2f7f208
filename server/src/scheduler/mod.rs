//! Task Scheduler (§4.3): drives periodic execution of tasks under a
//! global concurrency cap via two concurrent loops plus a reaper.

pub mod priority;
pub mod queues;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::model::{QueuedTask, ResultStatus, Task, TaskResult, TaskStatus};
use shared::repository::{TaskRepository, TaskResultRepository};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocator::TaskAllocator;
use crate::dispatcher::distributor::{Strategy, TaskDistributor};
use self::priority::derive_priority;
use self::queues::SchedulerQueues;

const DISCOVER_LIMIT: usize = 100;
const RETRY_DELAY_SECONDS: i64 = 60;

#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerStats {
    pub total_executed: u64,
    pub total_timeout: u64,
    pub total_failed: u64,
    pub dispatch_failures: u64,
}

/// Executing-set and start-times, guarded by one mutex (§5: "Scheduler
/// executing-set and start-times: single mutex; reaper acquires it for the
/// duration of timeout scans").
struct ExecutionState {
    executing: HashMap<Uuid, QueuedTask>,
    start_times: HashMap<Uuid, DateTime<Utc>>,
}

pub struct TaskScheduler {
    tasks: Arc<dyn TaskRepository>,
    results: Arc<dyn TaskResultRepository>,
    allocator: Arc<TaskAllocator>,
    distributor: Arc<TaskDistributor>,
    queues: SchedulerQueues,
    execution: Mutex<ExecutionState>,
    stats: RwLock<SchedulerStats>,
    max_concurrent: usize,
    check_interval: Duration,
    reaper_interval: Duration,
    task_timeout: chrono::Duration,
}

impl TaskScheduler {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        results: Arc<dyn TaskResultRepository>,
        allocator: Arc<TaskAllocator>,
        distributor: Arc<TaskDistributor>,
        max_concurrent: usize,
        check_interval: Duration,
        reaper_interval: Duration,
        task_timeout: Duration,
    ) -> Self {
        Self {
            tasks,
            results,
            allocator,
            distributor,
            queues: SchedulerQueues::new(),
            execution: Mutex::new(ExecutionState {
                executing: HashMap::new(),
                start_times: HashMap::new(),
            }),
            stats: RwLock::new(SchedulerStats::default()),
            max_concurrent,
            check_interval,
            reaper_interval,
            task_timeout: chrono::Duration::from_std(task_timeout).unwrap_or(chrono::Duration::seconds(300)),
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        *self.stats.read().await
    }

    /// §4.3.2 step 1: pull due tasks, compute priority, enqueue, advance
    /// `next_run`.
    async fn discover(&self) {
        let now = Utc::now();
        let due = match self.tasks.list_due(now, DISCOVER_LIMIT).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "failed to query due tasks");
                return;
            }
        };

        for task in due {
            if self.queues.contains(task.id).await {
                continue;
            }
            if self.execution.lock().await.executing.contains_key(&task.id) {
                continue;
            }

            let priority = derive_priority(&task, now);
            let queued = QueuedTask::new(task.id, priority, now);
            self.queues.enqueue_main(queued).await;

            let next_run = now + chrono::Duration::seconds(task.frequency_seconds as i64);
            if let Err(e) = self.tasks.set_next_run(task.id, Some(next_run)).await {
                warn!(task_id = %task.id, error = %e, "failed to advance next_run");
            }
        }
    }

    /// §4.3.2 step 2: while under the concurrency cap, pop retry then main
    /// and dispatch.
    async fn drain(&self) {
        loop {
            if self.execution.lock().await.executing.len() >= self.max_concurrent {
                break;
            }
            let Some(queued) = self.queues.pop_next().await else {
                break;
            };

            let task = match self.tasks.get(queued.task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    debug!(task_id = %queued.task_id, "queued task no longer exists, dropping");
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %queued.task_id, error = %e, "failed to load task for dispatch");
                    continue;
                }
            };

            if !self.dispatch_one(&task, queued.clone()).await {
                self.stats.write().await.dispatch_failures += 1;
                let mut retried = queued;
                retried.retry_count += 1;
                let execute_at = Utc::now() + chrono::Duration::seconds(RETRY_DELAY_SECONDS);
                self.queues.enqueue_retry_delayed(retried, execute_at).await;
            }
        }
    }

    /// §4.3.3: ask the allocator for an agent, record it, dispatch via the
    /// distributor. Returns whether dispatch succeeded.
    async fn dispatch_one(&self, task: &Task, mut queued: QueuedTask) -> bool {
        let Some(agent_id) = self.allocator.select_agent(task, &[]).await else {
            return false;
        };

        queued.assigned_agent_id = Some(agent_id);
        {
            let mut state = self.execution.lock().await;
            state.start_times.insert(task.id, Utc::now());
            state.executing.insert(task.id, queued);
        }

        let sent = self.distributor.dispatch(task, agent_id, Strategy::LoadBased).await;
        if !sent {
            let mut state = self.execution.lock().await;
            state.executing.remove(&task.id);
            state.start_times.remove(&task.id);
        }
        sent
    }

    /// §4.3.5, real-completion path: the Result Collector has already
    /// persisted the `TaskResult` for a frame received over the wire; this
    /// only clears this task's executing slot and updates scheduler stats,
    /// so the two don't double-persist the same result.
    pub async fn record_completion(&self, task_id: Uuid, status: ResultStatus) {
        {
            let mut state = self.execution.lock().await;
            state.executing.remove(&task_id);
            state.start_times.remove(&task_id);
        }

        let mut stats = self.stats.write().await;
        stats.total_executed += 1;
        match status {
            ResultStatus::Success => {}
            ResultStatus::Timeout => stats.total_timeout += 1,
            ResultStatus::Error => stats.total_failed += 1,
        }
    }

    /// §4.3.5: synthetic/internally-generated results (currently only the
    /// reaper's timeouts) that have no collector-side persistence of their
    /// own, so this path persists them itself before clearing state.
    pub async fn handle_task_result(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        status: ResultStatus,
        duration_ms: f64,
        metrics: HashMap<String, serde_json::Value>,
        error: Option<String>,
    ) {
        let result = TaskResult {
            id: Uuid::new_v4(),
            task_id,
            agent_id,
            executed_at: Utc::now(),
            duration_ms,
            status,
            error,
            metrics,
            raw_data: None,
        };
        if let Err(e) = self.results.append(&result).await {
            warn!(%task_id, error = %e, "failed to persist task result");
        }

        self.record_completion(task_id, status).await;
    }

    /// Reaper loop body (§4.3.2): sweeps the executing-set under its own
    /// critical section, independent of the scheduling loop. A timed-out
    /// task is recorded as a TIMEOUT result, then reassignment is attempted
    /// (§4.4.4) before the task is considered finally dropped.
    async fn reap_timeouts(&self) {
        let now = Utc::now();
        let timed_out: Vec<(Uuid, Uuid)> = {
            let state = self.execution.lock().await;
            state
                .start_times
                .iter()
                .filter(|(_, started)| now - **started > self.task_timeout)
                .filter_map(|(task_id, _)| {
                    state
                        .executing
                        .get(task_id)
                        .and_then(|q| q.assigned_agent_id.map(|agent_id| (*task_id, agent_id)))
                })
                .collect()
        };

        for (task_id, agent_id) in timed_out {
            info!(%task_id, %agent_id, "task execution timed out, reaping");
            self.handle_task_result(
                task_id,
                agent_id,
                ResultStatus::Timeout,
                self.task_timeout.num_milliseconds() as f64,
                HashMap::new(),
                Some("execution timed out".to_string()),
            )
            .await;

            self.reassign_after_timeout(task_id, agent_id).await;
        }
    }

    /// §4.4.4: on agent failure, exclude the failed agent and re-run the
    /// allocation pipeline; if another eligible agent is found, redispatch
    /// the task to it and re-enter the executing set.
    async fn reassign_after_timeout(&self, task_id: Uuid, failed_agent: Uuid) {
        let task = match self.tasks.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                warn!(%task_id, error = %e, "failed to load task for reassignment");
                return;
            }
        };

        let Some(new_agent) = self.allocator.reassign(&task, failed_agent).await else {
            return;
        };

        let mut queued = QueuedTask::new(task.id, task.priority, Utc::now());
        queued.assigned_agent_id = Some(new_agent);
        {
            let mut state = self.execution.lock().await;
            state.start_times.insert(task.id, Utc::now());
            state.executing.insert(task.id, queued);
        }

        let sent = self.distributor.dispatch(&task, new_agent, Strategy::LoadBased).await;
        if !sent {
            let mut state = self.execution.lock().await;
            state.executing.remove(&task.id);
            state.start_times.remove(&task.id);
            warn!(%task_id, %new_agent, "failed to redispatch reassigned task");
        } else {
            info!(%task_id, %failed_agent, %new_agent, "task reassigned after timeout");
        }
    }

    // --- Administrative operations (§4.3.6), all idempotent. ---

    pub async fn pause_task(&self, task_id: Uuid) -> bool {
        self.tasks.set_status(task_id, TaskStatus::Paused).await.is_ok()
    }

    pub async fn resume_task(&self, task_id: Uuid) -> bool {
        self.tasks.set_status(task_id, TaskStatus::Active).await.is_ok()
    }

    /// Cancels a task: stops its in-flight execution (telling the agent, if
    /// assigned), drops it from the queues, and pauses it so the scheduler
    /// does not immediately re-discover it.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        let assigned_agent = {
            let mut state = self.execution.lock().await;
            let queued = state.executing.remove(&task_id);
            state.start_times.remove(&task_id);
            queued.and_then(|q| q.assigned_agent_id)
        };
        if let Some(agent_id) = assigned_agent {
            self.distributor.cancel_task(task_id, agent_id).await;
        }
        self.tasks.set_status(task_id, TaskStatus::Paused).await.is_ok()
    }

    pub async fn update_task_priority(&self, task_id: Uuid, priority: i32) -> bool {
        self.tasks.set_priority(task_id, priority).await.is_ok()
    }

    /// Constructs a URGENT `QueuedTask` and dispatches it immediately,
    /// bypassing the queues entirely.
    pub async fn force_execute_task(&self, task_id: Uuid) -> bool {
        let task = match self.tasks.get(task_id).await {
            Ok(Some(task)) => task,
            _ => return false,
        };
        let queued = QueuedTask::new(task_id, shared::model::MessagePriority::Urgent as i32, Utc::now());
        self.dispatch_one(&task, queued).await
    }

    /// Spawns the scheduling loop, the 1Hz delayed-queue pump, and the
    /// reaper loop as independent tasks, each with its own shutdown
    /// subscription (§5: cooperative, task-concurrent scheduling model).
    pub fn spawn_loops(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let scheduler = Arc::clone(self);
        let mut rx = shutdown.subscribe();
        let check_interval = self.check_interval;
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.discover().await;
                        scheduler.drain().await;
                    }
                    _ = rx.recv() => {
                        debug!("scheduling loop received shutdown signal");
                        break;
                    }
                }
            }
        }));

        let scheduler = Arc::clone(self);
        let mut rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.queues.pump_delayed(Utc::now()).await;
                    }
                    _ = rx.recv() => {
                        debug!("delayed-queue pump received shutdown signal");
                        break;
                    }
                }
            }
        }));

        let scheduler = Arc::clone(self);
        let mut rx = shutdown.subscribe();
        let reaper_interval = self.reaper_interval;
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(reaper_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.reap_timeouts().await;
                    }
                    _ = rx.recv() => {
                        debug!("reaper loop received shutdown signal");
                        break;
                    }
                }
            }
        }));

        handles
    }
}
