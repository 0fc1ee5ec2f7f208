//! Result Collector (§4.2.3): handles incoming `TASK_RESULT` frames.
//!
//! Grounded on `examples/original_source/management_platform/api/message_dispatcher.py`'s
//! result-handling path (dedup by task id, persist, ack, notify named
//! handlers) combined with the teacher's "handler exceptions are logged,
//! never fatal" idiom from `server/src/health_monitor.rs`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::model::{ResultStatus, TaskResult, TaskStatus};
use shared::protocol::{frame_type, Frame, TaskResultAckPayload, TaskResultPayload};
use shared::repository::{TaskRepository, TaskResultRepository};
use tokio::sync::RwLock;
use tracing::{error, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;

pub struct PendingResult {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub status: ResultStatus,
    pub error: Option<String>,
    pub execution_time: f64,
    pub received_at: DateTime<Utc>,
}

pub type ResultHandler = Arc<dyn Fn(&PendingResult) + Send + Sync>;

#[derive(Default)]
pub struct CollectorStats {
    pub received: u64,
    pub duplicates: u64,
    pub persisted: u64,
    pub persist_failures: u64,
}

pub struct ResultCollector {
    connections: Arc<ConnectionManager>,
    tasks: Arc<dyn TaskRepository>,
    results: Arc<dyn TaskResultRepository>,
    seen: RwLock<HashSet<Uuid>>,
    pending: RwLock<Vec<PendingResult>>,
    handlers: RwLock<Vec<ResultHandler>>,
    stats: RwLock<CollectorStats>,
}

impl ResultCollector {
    pub fn new(
        connections: Arc<ConnectionManager>,
        tasks: Arc<dyn TaskRepository>,
        results: Arc<dyn TaskResultRepository>,
    ) -> Self {
        Self {
            connections,
            tasks,
            results,
            seen: RwLock::new(HashSet::new()),
            pending: RwLock::new(Vec::new()),
            handlers: RwLock::new(Vec::new()),
            stats: RwLock::new(CollectorStats::default()),
        }
    }

    pub async fn register_handler(&self, handler: ResultHandler) {
        self.handlers.write().await.push(handler);
    }

    /// Handles one `TASK_RESULT` frame end to end (§4.2.3).
    pub async fn handle_task_result(&self, agent_id: Uuid, frame: Frame) {
        let Ok(payload): Result<TaskResultPayload, _> = serde_json::from_value(frame.data) else {
            warn!("malformed task_result frame");
            return;
        };

        {
            let mut stats = self.stats.write().await;
            stats.received += 1;
        }

        {
            let mut seen = self.seen.write().await;
            if !seen.insert(payload.task_id) {
                self.stats.write().await.duplicates += 1;
                return;
            }
        }

        let received_at = Utc::now();
        let pending = PendingResult {
            task_id: payload.task_id,
            agent_id,
            status: payload.status,
            error: payload.error_message.clone(),
            execution_time: payload.execution_time,
            received_at,
        };

        // §5: "result ACKs are sent before handlers run" — the agent may
        // observe the ack before persistence completes.
        let ack = Frame::new(
            frame_type::TASK_RESULT_ACK,
            serde_json::json!(TaskResultAckPayload {
                task_id: payload.task_id,
                received: true,
            }),
        );
        self.connections.send(agent_id, ack).await;

        let metrics = payload
            .metrics
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let result = TaskResult {
            id: Uuid::new_v4(),
            task_id: payload.task_id,
            agent_id,
            executed_at: received_at,
            duration_ms: payload.execution_time,
            status: payload.status,
            error: payload.error_message,
            metrics,
            raw_data: payload.raw_data,
        };

        self.pending.write().await.push(pending);

        match self.results.append(&result).await {
            Ok(()) => {
                self.stats.write().await.persisted += 1;
                let new_status = match result.status {
                    ResultStatus::Success => TaskStatus::Completed,
                    ResultStatus::Timeout | ResultStatus::Error => TaskStatus::Failed,
                };
                if let Err(e) = self.tasks.set_status(result.task_id, new_status).await {
                    error!(task_id = %result.task_id, error = %e, "failed to update task status after result");
                }
            }
            Err(e) => {
                self.stats.write().await.persist_failures += 1;
                error!(task_id = %result.task_id, error = %e, "failed to persist task result");
            }
        }

        // §4.2.3: every registered named result handler runs; a panic in
        // one must not prevent the others from running.
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            let handler = Arc::clone(handler);
            let summary = PendingResult {
                task_id: result.task_id,
                agent_id: result.agent_id,
                status: result.status,
                error: result.error.clone(),
                execution_time: result.duration_ms,
                received_at,
            };
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&summary))) {
                error!(?panic, task_id = %result.task_id, "result handler panicked");
            }
        }

        // `seen` only guards against this one execution's result arriving
        // twice (e.g. a retransmitted frame) while it's being processed —
        // a recurring task's next real result must not be misclassified as
        // a duplicate, so drop the id once processing is done.
        self.seen.write().await.remove(&result.task_id);
    }

    pub async fn stats(&self) -> (u64, u64, u64, u64) {
        let s = self.stats.read().await;
        (s.received, s.duplicates, s.persisted, s.persist_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shared::model::{Agent, AgentStatus, LoadSnapshot, Task};
    use shared::repository::AgentRepository;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    struct StubAgents;
    #[async_trait]
    impl AgentRepository for StubAgents {
        async fn get(&self, _: Uuid) -> shared::Result<Option<Agent>> {
            Ok(None)
        }
        async fn upsert(&self, _: &Agent) -> shared::Result<()> {
            Ok(())
        }
        async fn update_status(&self, _: Uuid, _: AgentStatus) -> shared::Result<()> {
            Ok(())
        }
        async fn update_heartbeat(&self, _: Uuid, _: DateTime<Utc>) -> shared::Result<()> {
            Ok(())
        }
        async fn update_load(&self, _: Uuid, _: LoadSnapshot) -> shared::Result<()> {
            Ok(())
        }
        async fn list_online(&self) -> shared::Result<Vec<Agent>> {
            Ok(vec![])
        }
        async fn api_key_for(&self, _: Uuid) -> shared::Result<Option<String>> {
            Ok(None)
        }
    }

    struct StubTasks {
        statuses: Mutex<HashMap<Uuid, TaskStatus>>,
    }
    #[async_trait]
    impl TaskRepository for StubTasks {
        async fn get(&self, _: Uuid) -> shared::Result<Option<Task>> {
            Ok(None)
        }
        async fn list_by_user(&self, _: Uuid) -> shared::Result<Vec<Task>> {
            Ok(vec![])
        }
        async fn list_due(&self, _: DateTime<Utc>, _: usize) -> shared::Result<Vec<Task>> {
            Ok(vec![])
        }
        async fn set_status(&self, task_id: Uuid, status: TaskStatus) -> shared::Result<()> {
            self.statuses.lock().await.insert(task_id, status);
            Ok(())
        }
        async fn set_next_run(&self, _: Uuid, _: Option<DateTime<Utc>>) -> shared::Result<()> {
            Ok(())
        }
        async fn set_priority(&self, _: Uuid, _: i32) -> shared::Result<()> {
            Ok(())
        }
    }

    struct StubResults {
        appended: Mutex<Vec<TaskResult>>,
    }
    #[async_trait]
    impl TaskResultRepository for StubResults {
        async fn append(&self, result: &TaskResult) -> shared::Result<()> {
            self.appended.lock().await.push(result.clone());
            Ok(())
        }
        async fn recent_for_agent(&self, _: Uuid, _: DateTime<Utc>) -> shared::Result<Vec<TaskResult>> {
            Ok(vec![])
        }
    }

    fn result_frame(task_id: Uuid, status: ResultStatus) -> Frame {
        let payload = TaskResultPayload {
            task_id,
            result: serde_json::json!({}),
            status,
            error_message: None,
            execution_time: 12.5,
            metrics: None,
            raw_data: None,
        };
        Frame::new(frame_type::TASK_RESULT, serde_json::to_value(payload).unwrap())
    }

    /// `seen` only guards the window while one result is being processed —
    /// simulate a retransmitted frame for the same in-flight execution by
    /// pre-populating `seen` directly, rather than two sequential awaited
    /// calls (which would both complete, and shouldn't dedup each other —
    /// see `a_later_result_for_the_same_recurring_task_is_not_treated_as_a_duplicate`).
    #[tokio::test]
    async fn an_in_flight_duplicate_is_dropped() {
        let connections = Arc::new(ConnectionManager::new(1, Arc::new(StubAgents), "key".into()));
        let tasks = Arc::new(StubTasks { statuses: Mutex::new(HashMap::new()) });
        let results = Arc::new(StubResults { appended: Mutex::new(Vec::new()) });
        let collector = ResultCollector::new(connections, tasks, results.clone());

        let task_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        collector.seen.write().await.insert(task_id);

        collector.handle_task_result(agent_id, result_frame(task_id, ResultStatus::Success)).await;

        let (_received, duplicates, persisted, _failures) = collector.stats().await;
        assert_eq!(duplicates, 1);
        assert_eq!(persisted, 0);
        assert_eq!(results.appended.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn a_later_result_for_the_same_recurring_task_is_not_treated_as_a_duplicate() {
        let connections = Arc::new(ConnectionManager::new(1, Arc::new(StubAgents), "key".into()));
        let tasks = Arc::new(StubTasks { statuses: Mutex::new(HashMap::new()) });
        let results = Arc::new(StubResults { appended: Mutex::new(Vec::new()) });
        let collector = ResultCollector::new(connections, tasks, results.clone());

        let task_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        collector.handle_task_result(agent_id, result_frame(task_id, ResultStatus::Success)).await;
        collector.handle_task_result(agent_id, result_frame(task_id, ResultStatus::Success)).await;

        let (_received, duplicates, persisted, _failures) = collector.stats().await;
        assert_eq!(duplicates, 0);
        assert_eq!(persisted, 2);
        assert_eq!(results.appended.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn success_marks_task_completed_failure_marks_task_failed() {
        let connections = Arc::new(ConnectionManager::new(1, Arc::new(StubAgents), "key".into()));
        let tasks = Arc::new(StubTasks { statuses: Mutex::new(HashMap::new()) });
        let results = Arc::new(StubResults { appended: Mutex::new(Vec::new()) });
        let collector = ResultCollector::new(connections, tasks.clone(), results);

        let ok_task = Uuid::new_v4();
        let failed_task = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        collector.handle_task_result(agent_id, result_frame(ok_task, ResultStatus::Success)).await;
        collector.handle_task_result(agent_id, result_frame(failed_task, ResultStatus::Error)).await;

        let statuses = tasks.statuses.lock().await;
        assert_eq!(statuses.get(&ok_task), Some(&TaskStatus::Completed));
        assert_eq!(statuses.get(&failed_task), Some(&TaskStatus::Failed));
    }
}
