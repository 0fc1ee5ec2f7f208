//! Connection Recovery (§4.1.5): per-agent reconnection loop with
//! exponential backoff, started on unexpected disconnect.
//!
//! Grounded on the teacher's `tokio::spawn` + `broadcast` shutdown idiom
//! (`main.rs`'s periodic tasks); the backoff formula itself is
//! `shared::utils::recovery_backoff_seconds`, deliberately matching this
//! spec's `base · multiplier^(k−1)` rather than the teacher's own
//! `calculate_backoff_delay` (see DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;

use shared::repository::AgentRepository;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_SECONDS: u64 = 5;
const BACKOFF_MULTIPLIER: u64 = 2;

/// Tracks in-flight recovery tasks so concurrent requests for the same
/// agent are coalesced (§4.1.5) and a successful reconnect can cancel a
/// pending loop (§4.1.6).
#[derive(Default)]
pub struct RecoveryRegistry {
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl RecoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a recovery loop for `agent_id` unless one is already running.
    /// `is_reconnected` is polled once per attempt; on success the loop
    /// exits without marking the agent offline.
    pub async fn start<F, Fut>(
        self: &Arc<Self>,
        agent_id: Uuid,
        agents: Arc<dyn AgentRepository>,
        is_reconnected: F,
    ) where
        F: Fn(Uuid) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send,
    {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&agent_id) {
            return;
        }

        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut recovered = false;
            for attempt in 1..=MAX_ATTEMPTS {
                let delay = shared::utils::recovery_backoff_seconds(attempt, BASE_DELAY_SECONDS, BACKOFF_MULTIPLIER);
                tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                if is_reconnected(agent_id).await {
                    info!(%agent_id, attempt, "agent recovered on its own");
                    recovered = true;
                    break;
                }
            }

            if !recovered {
                info!(%agent_id, "recovery attempts exhausted, marking agent offline");
                let _ = agents
                    .update_status(agent_id, shared::model::AgentStatus::Offline)
                    .await;
            }

            registry.tasks.lock().await.remove(&agent_id);
        });

        tasks.insert(agent_id, handle);
    }

    /// Cancels any pending recovery loop for `agent_id` (called on
    /// successful `add_connection`, §4.1.6).
    pub async fn cancel(&self, agent_id: Uuid) {
        if let Some(handle) = self.tasks.lock().await.remove(&agent_id) {
            handle.abort();
        }
    }

    pub async fn is_recovering(&self, agent_id: Uuid) -> bool {
        self.tasks.lock().await.contains_key(&agent_id)
    }
}
