//! Heartbeat Manager (§4.1.3): periodic liveness checks over authenticated
//! connections, plus inbound heartbeat-frame handling.
//!
//! Grounded on the teacher's `main.rs` periodic-task idiom (`tokio::select!`
//! against a shared `broadcast::Receiver<()>` shutdown signal) applied to
//! `examples/original_source/management_platform/api/connection_manager.py`'s
//! heartbeat sweep over `ConnectionInfo.last_heartbeat`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shared::model::ConnectionState;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::pool::ConnectionPool;

pub const HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
pub const HEARTBEAT_TIMEOUT_SECONDS: i64 = 90;
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

/// Callback invoked once an agent crosses `MAX_MISSED_HEARTBEATS`; breaks
/// the cycle the source closes with `set_timeout_callback` (§7 redesign
/// note): the heartbeat sweep only needs the capability to tear a
/// connection down, not the whole `ConnectionManager`.
#[async_trait::async_trait]
pub trait TimeoutHandler: Send + Sync {
    async fn on_heartbeat_timeout(&self, session_id: Uuid, agent_id: Uuid);
}

/// One sweep over all authenticated connections; increments misses for the
/// stale ones and invokes `on_timeout` for any that crossed the threshold.
pub async fn sweep(pool: &Arc<RwLock<ConnectionPool>>, on_timeout: &dyn TimeoutHandler) {
    let now = Utc::now();
    let timed_out: Vec<(Uuid, Uuid)> = {
        let mut pool = pool.write().await;
        let agents = pool.connected_agents();
        let mut timed_out = Vec::new();
        for agent_id in agents {
            let session_ids: Vec<Uuid> = pool
                .get_agent_connections(agent_id)
                .into_iter()
                .filter(|c| c.state == ConnectionState::Authenticated)
                .map(|c| c.session_id)
                .collect();
            for session_id in session_ids {
                let Some(conn) = pool.get_mut(session_id) else { continue };
                let last = conn.last_heartbeat_received.unwrap_or(conn.connected_at);
                if (now - last).num_seconds() <= HEARTBEAT_TIMEOUT_SECONDS {
                    continue;
                }
                conn.missed_heartbeats += 1;
                if conn.missed_heartbeats >= MAX_MISSED_HEARTBEATS {
                    timed_out.push((session_id, agent_id));
                } else {
                    warn!(%agent_id, missed = conn.missed_heartbeats, "missed heartbeat");
                }
            }
        }
        timed_out
    };

    for (session_id, agent_id) in timed_out {
        info!(%agent_id, %session_id, "heartbeat timeout threshold reached");
        on_timeout.on_heartbeat_timeout(session_id, agent_id).await;
    }
}

/// Handles an inbound `heartbeat` frame: resets misses, records receipt,
/// returns the timestamp to echo back in `heartbeat_response`.
pub async fn handle_heartbeat(pool: &Arc<RwLock<ConnectionPool>>, session_id: Uuid) -> Option<chrono::DateTime<Utc>> {
    let mut pool = pool.write().await;
    let conn = pool.get_mut(session_id)?;
    let now = Utc::now();
    conn.last_heartbeat_received = Some(now);
    conn.missed_heartbeats = 0;
    Some(now)
}

pub fn interval() -> tokio::time::Interval {
    tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECONDS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(AtomicUsize);

    #[async_trait::async_trait]
    impl TimeoutHandler for CountingHandler {
        async fn on_heartbeat_timeout(&self, _session_id: Uuid, _agent_id: Uuid) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sweep_flags_stale_connections_after_three_misses() {
        let pool = Arc::new(RwLock::new(ConnectionPool::new(1)));
        let agent_id = Uuid::new_v4();
        let stale_time = Utc::now() - chrono::Duration::seconds(HEARTBEAT_TIMEOUT_SECONDS + 1);
        {
            let mut pool = pool.write().await;
            let mut conn = Connection::new(Uuid::new_v4(), agent_id, stale_time);
            conn.state = ConnectionState::Authenticated;
            conn.last_heartbeat_received = Some(stale_time);
            pool.add(conn);
        }

        let handler = CountingHandler(AtomicUsize::new(0));
        sweep(&pool, &handler).await;
        sweep(&pool, &handler).await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);
        sweep(&pool, &handler).await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inbound_heartbeat_resets_misses() {
        let pool = Arc::new(RwLock::new(ConnectionPool::new(1)));
        let agent_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        {
            let mut pool = pool.write().await;
            let mut conn = Connection::new(session_id, agent_id, Utc::now());
            conn.missed_heartbeats = 2;
            pool.add(conn);
        }
        assert!(handle_heartbeat(&pool, session_id).await.is_some());
        let pool = pool.read().await;
        assert_eq!(pool.get(session_id).unwrap().missed_heartbeats, 0);
    }
}
