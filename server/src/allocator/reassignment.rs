//! Reassignment Manager (§4.4.4): tracks per-task reassignment history and
//! reruns allocation when an agent fails, excluding that agent.
//!
//! Grounded on `examples/original_source/management_platform/scheduler/allocator.py`'s
//! `ReassignmentTracker` (bounded per-task history, time-based purge).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_HISTORY_PER_TASK: usize = 3;
const RETENTION: chrono::Duration = chrono::Duration::days(7);

#[derive(Debug, Clone)]
pub struct ReassignmentEntry {
    pub from_agent: Uuid,
    pub to_agent: Option<Uuid>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Held as a whole map under one lock (§5 "shared-state discipline": the
/// reassignment history is guarded as a whole map, not per-task).
pub struct ReassignmentManager {
    history: RwLock<HashMap<Uuid, Vec<ReassignmentEntry>>>,
}

impl ReassignmentManager {
    pub fn new() -> Self {
        Self {
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Records a reassignment attempt and returns the exclusion set to pass
    /// to the next allocation attempt (every agent already tried for this
    /// task within the retained window).
    pub async fn record(&self, task_id: Uuid, from_agent: Uuid, to_agent: Option<Uuid>, reason: &str) -> Vec<Uuid> {
        let now = Utc::now();
        let mut history = self.history.write().await;
        let entries = history.entry(task_id).or_default();

        entries.retain(|e| now - e.at <= RETENTION);
        entries.push(ReassignmentEntry {
            from_agent,
            to_agent,
            reason: reason.to_string(),
            at: now,
        });
        if entries.len() > MAX_HISTORY_PER_TASK {
            let overflow = entries.len() - MAX_HISTORY_PER_TASK;
            entries.drain(0..overflow);
        }

        if to_agent.is_none() {
            warn!(%task_id, %from_agent, reason, "reassignment failed to find a replacement agent");
        } else {
            info!(%task_id, %from_agent, ?to_agent, reason, "task reassigned");
        }

        entries.iter().map(|e| e.from_agent).collect()
    }

    /// True once a task has exhausted its reassignment budget within the
    /// retention window.
    pub async fn exhausted(&self, task_id: Uuid) -> bool {
        let now = Utc::now();
        let history = self.history.read().await;
        match history.get(&task_id) {
            Some(entries) => entries.iter().filter(|e| now - e.at <= RETENTION).count() >= MAX_HISTORY_PER_TASK,
            None => false,
        }
    }

    pub async fn history_for(&self, task_id: Uuid) -> Vec<ReassignmentEntry> {
        self.history.read().await.get(&task_id).cloned().unwrap_or_default()
    }

    /// Drops entries older than the retention window across all tasks.
    /// Intended to run on a periodic sweep alongside the other maintenance
    /// loops.
    pub async fn purge_expired(&self) {
        let now = Utc::now();
        let mut history = self.history.write().await;
        history.retain(|_, entries| {
            entries.retain(|e| now - e.at <= RETENTION);
            !entries.is_empty()
        });
    }
}

impl Default for ReassignmentManager {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedReassignmentManager = Arc<ReassignmentManager>;
