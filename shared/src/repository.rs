//! Opaque persistence interfaces consumed by the orchestration core (§6.3).
//!
//! "No DDL is mandated" — these traits are the seam; `server::repository`
//! carries the one concrete implementation this workspace ships.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{Agent, AgentStatus, Task, TaskResult};

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn get(&self, agent_id: Uuid) -> crate::Result<Option<Agent>>;
    async fn upsert(&self, agent: &Agent) -> crate::Result<()>;
    async fn update_status(&self, agent_id: Uuid, status: AgentStatus) -> crate::Result<()>;
    async fn update_heartbeat(&self, agent_id: Uuid, at: DateTime<Utc>) -> crate::Result<()>;
    async fn update_load(
        &self,
        agent_id: Uuid,
        load: crate::model::LoadSnapshot,
    ) -> crate::Result<()>;
    async fn list_online(&self) -> crate::Result<Vec<Agent>>;
    /// Looks up the agent's stored API key for the auth handshake (§4.1.2).
    async fn api_key_for(&self, agent_id: Uuid) -> crate::Result<Option<String>>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get(&self, task_id: Uuid) -> crate::Result<Option<Task>>;
    async fn list_by_user(&self, user_id: Uuid) -> crate::Result<Vec<Task>>;
    /// Tasks with `status = active ∧ (next_run ≤ now ∨ next_run = nil)`,
    /// capped at `limit` (§4.3.2 discover step).
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> crate::Result<Vec<Task>>;
    async fn set_status(&self, task_id: Uuid, status: crate::model::TaskStatus) -> crate::Result<()>;
    async fn set_next_run(&self, task_id: Uuid, next_run: Option<DateTime<Utc>>) -> crate::Result<()>;
    async fn set_priority(&self, task_id: Uuid, priority: i32) -> crate::Result<()>;
}

#[async_trait]
pub trait TaskResultRepository: Send + Sync {
    async fn append(&self, result: &TaskResult) -> crate::Result<()>;
    /// Results for `agent_id` in the last `since` window, used by the
    /// allocator's performance scoring (§4.4.2).
    async fn recent_for_agent(
        &self,
        agent_id: Uuid,
        since: DateTime<Utc>,
    ) -> crate::Result<Vec<TaskResult>>;
}
