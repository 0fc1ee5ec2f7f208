//! Connection Pool (§4.1.1): bookkeeping for live duplex channels.
//!
//! Mirrors the teacher's `ConnectionPool`-style bounded-history struct
//! (`server/src/database.rs`'s own lazily-populated maps), adapted from
//! `examples/original_source/management_platform/api/connection_manager.py`'s
//! `ConnectionPool` (per-agent connection lists, a single active-connection
//! map, and a FIFO-capped event history).

use std::collections::HashMap;

use chrono::Utc;
use shared::model::{Connection, ConnectionState};
use uuid::Uuid;

const CONNECTION_HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub event: &'static str,
    pub reason: Option<String>,
    pub at: chrono::DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub peak_connections: u64,
    pub connection_attempts: u64,
    pub failed_connections: u64,
    pub disconnections: u64,
    pub heartbeat_timeouts: u64,
}

/// Serializes all mutating operations behind the caller's lock (§5: "all
/// mutating ops are serialized per-pool; reads may be concurrent" — we hold
/// this invariant by requiring `&mut self` for every mutation and wrapping
/// the whole pool in one `tokio::sync::RwLock` at the `ConnectionManager`
/// layer, rather than locking per-field here).
pub struct ConnectionPool {
    max_connections_per_agent: u32,
    by_agent: HashMap<Uuid, Vec<Uuid>>,
    connections: HashMap<Uuid, Connection>,
    history: std::collections::VecDeque<ConnectionEvent>,
    stats: PoolStats,
}

impl ConnectionPool {
    pub fn new(max_connections_per_agent: u32) -> Self {
        Self {
            max_connections_per_agent,
            by_agent: HashMap::new(),
            connections: HashMap::new(),
            history: std::collections::VecDeque::new(),
            stats: PoolStats::default(),
        }
    }

    /// Rejects if the agent already has `max_connections_per_agent` live
    /// entries.
    pub fn add(&mut self, conn: Connection) -> bool {
        self.stats.connection_attempts += 1;
        let entries = self.by_agent.entry(conn.agent_id).or_default();
        if entries.len() as u32 >= self.max_connections_per_agent {
            self.stats.failed_connections += 1;
            return false;
        }
        entries.push(conn.session_id);
        self.push_event(conn.session_id, conn.agent_id, "connected", None);
        self.connections.insert(conn.session_id, conn);
        self.stats.total_connections += 1;
        self.stats.active_connections = self.connections.len() as u64;
        self.stats.peak_connections = self.stats.peak_connections.max(self.stats.active_connections);
        true
    }

    pub fn remove(&mut self, session_id: Uuid, reason: &str) -> Option<Connection> {
        let conn = self.connections.remove(&session_id)?;
        if let Some(entries) = self.by_agent.get_mut(&conn.agent_id) {
            entries.retain(|id| *id != session_id);
            if entries.is_empty() {
                self.by_agent.remove(&conn.agent_id);
            }
        }
        self.stats.disconnections += 1;
        if reason == "heartbeat_timeout" {
            self.stats.heartbeat_timeouts += 1;
        }
        self.stats.active_connections = self.connections.len() as u64;
        self.push_event(session_id, conn.agent_id, "disconnected", Some(reason.to_string()));
        Some(conn)
    }

    pub fn get(&self, session_id: Uuid) -> Option<&Connection> {
        self.connections.get(&session_id)
    }

    pub fn get_mut(&mut self, session_id: Uuid) -> Option<&mut Connection> {
        self.connections.get_mut(&session_id)
    }

    pub fn get_agent_connections(&self, agent_id: Uuid) -> Vec<&Connection> {
        self.by_agent
            .get(&agent_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id))
            .collect()
    }

    /// First authenticated connection for the agent; else the first one.
    pub fn primary(&self, agent_id: Uuid) -> Option<&Connection> {
        let conns = self.get_agent_connections(agent_id);
        conns
            .iter()
            .find(|c| c.state == ConnectionState::Authenticated)
            .or_else(|| conns.first())
            .copied()
    }

    pub fn is_connected(&self, agent_id: Uuid) -> bool {
        self.by_agent.get(&agent_id).map(|v| !v.is_empty()).unwrap_or(false)
    }

    pub fn connected_agents(&self) -> Vec<Uuid> {
        self.by_agent.keys().copied().collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    fn push_event(&mut self, session_id: Uuid, agent_id: Uuid, event: &'static str, reason: Option<String>) {
        if self.history.len() >= CONNECTION_HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(ConnectionEvent {
            session_id,
            agent_id,
            event,
            reason,
            at: Utc::now(),
        });
    }
}
