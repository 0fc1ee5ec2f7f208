//! Core data model: Agent, Connection, Task, QueuedTask, Message, TaskResult.
//!
//! These are plain data types; the runtime resources that back a live
//! `Connection` (the duplex channel's send handle) live in
//! `server::connection::pool`, not here — this module only holds the
//! persisted/observable attributes of a connection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Measurement protocol a Task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Http,
    Https,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Icmp => "icmp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Http => "http",
            Protocol::Https => "https",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
    Maintenance,
}

/// A point-in-time resource load sample.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub load_average: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Geo {
    pub country: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// A remote process that executes measurement tasks on behalf of the
/// orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub geo: Geo,
    pub isp: Option<String>,
    pub version: String,
    /// Protocol tags this agent declares support for. Empty means "assumed
    /// universal" (see allocator capability check, §4.4.1).
    #[serde(default)]
    pub capabilities: Vec<Protocol>,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    /// Row creation time. Distinct from `registered_at`, which tracks the
    /// agent's own registration handshake.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    pub availability: f64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    #[serde(default)]
    pub load: LoadSnapshot,
    pub max_concurrent: u32,
    pub enabled: bool,
}

impl Agent {
    /// An agent is *available* iff `enabled ∧ status ∈ {online, busy} ∧
    /// now − last_heartbeat ≤ 5 min` (§3 cross-entity invariant).
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        if !matches!(self.status, AgentStatus::Online | AgentStatus::Busy) {
            return false;
        }
        match self.last_heartbeat {
            Some(ts) => now - ts <= chrono::Duration::minutes(5),
            None => false,
        }
    }

    /// True if this agent declares the protocol, or declares none at all
    /// (assumed universal per §4.4.1.2).
    pub fn supports(&self, protocol: Protocol) -> bool {
        self.capabilities.is_empty() || self.capabilities.contains(&protocol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Authenticated,
    Disconnecting,
    Disconnected,
    Error,
}

/// The observable attributes of one authenticated duplex session between
/// the orchestrator and a specific agent. The live send handle is kept
/// alongside this struct by the connection pool, not inside it, so that
/// this type stays plain data (cloneable, loggable, testable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub authenticated_at: Option<DateTime<Utc>>,
    pub last_heartbeat_sent: Option<DateTime<Utc>>,
    pub last_heartbeat_received: Option<DateTime<Utc>>,
    pub missed_heartbeats: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    #[serde(default)]
    pub capabilities: Vec<Protocol>,
    pub version: String,
    #[serde(default)]
    pub load: LoadSnapshot,
}

impl Connection {
    pub fn new(session_id: Uuid, agent_id: Uuid, connected_at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            agent_id,
            state: ConnectionState::Connecting,
            connected_at,
            authenticated_at: None,
            last_heartbeat_sent: None,
            last_heartbeat_received: None,
            missed_heartbeats: 0,
            messages_sent: 0,
            messages_received: 0,
            capabilities: Vec::new(),
            version: "unknown".to_string(),
            load: LoadSnapshot::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

/// A recurring measurement task owned by a user of the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    #[serde(default)]
    pub description: Option<String>,
    pub protocol: Protocol,
    pub target: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Seconds, validated to `[10, 86400]`.
    pub frequency_seconds: u32,
    /// Seconds, validated to `[1, 300]`.
    pub timeout_seconds: u32,
    pub priority: i32,
    pub status: TaskStatus,
    pub next_run: Option<DateTime<Utc>>,
    pub preferred_location: Option<String>,
    pub preferred_isp: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub const MIN_FREQUENCY_SECONDS: u32 = 10;
    pub const MAX_FREQUENCY_SECONDS: u32 = 86_400;
    pub const MIN_TIMEOUT_SECONDS: u32 = 1;
    pub const MAX_TIMEOUT_SECONDS: u32 = 300;

    /// A task may be dispatched only when `status = active ∧ (next_run ≤
    /// now ∨ next_run = nil)` (§3).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Active && self.next_run.map(|t| t <= now).unwrap_or(true)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if !(Self::MIN_FREQUENCY_SECONDS..=Self::MAX_FREQUENCY_SECONDS)
            .contains(&self.frequency_seconds)
        {
            return Err(crate::OrchestratorError::Validation(format!(
                "frequency_seconds must be between {} and {}, got {}",
                Self::MIN_FREQUENCY_SECONDS,
                Self::MAX_FREQUENCY_SECONDS,
                self.frequency_seconds
            ))
            .into());
        }
        if !(Self::MIN_TIMEOUT_SECONDS..=Self::MAX_TIMEOUT_SECONDS).contains(&self.timeout_seconds)
        {
            return Err(crate::OrchestratorError::Validation(format!(
                "timeout_seconds must be between {} and {}, got {}",
                Self::MIN_TIMEOUT_SECONDS,
                Self::MAX_TIMEOUT_SECONDS,
                self.timeout_seconds
            ))
            .into());
        }
        if let Some(port) = self.port {
            if port == 0 {
                return Err(crate::OrchestratorError::Validation(
                    "port must be between 1 and 65535, got 0".to_string(),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// A task instance living inside one of the scheduler's queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_id: Uuid,
    pub attempt: u32,
    pub priority: i32,
    pub scheduled_time: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub assigned_agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl QueuedTask {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(task_id: Uuid, priority: i32, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            task_id,
            attempt: 0,
            priority,
            scheduled_time,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            assigned_agent_id: None,
            created_at: scheduled_time,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessagePriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

/// An ephemeral envelope routed by the Message Dispatcher between the
/// orchestrator and agents. Distinct from `protocol::Frame`: a `Message`
/// is the dispatcher's internal queueing unit; a `Frame` is the wire
/// representation sent to/from an agent's duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub message_type: String,
    pub priority: MessagePriority,
    pub sender: String,
    /// `None` means broadcast.
    pub recipient: Option<Uuid>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Message {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now > e).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Timeout,
    Error,
}

/// Immutable, append-only record of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub status: ResultStatus,
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: HashMap<String, serde_json::Value>,
    pub raw_data: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(status: AgentStatus, enabled: bool, last_heartbeat: Option<DateTime<Utc>>) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "a1".into(),
            address: "10.0.0.1".into(),
            geo: Geo::default(),
            isp: None,
            version: "1.0".into(),
            capabilities: vec![],
            status,
            last_heartbeat,
            registered_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            availability: 1.0,
            success_rate: 1.0,
            avg_response_time_ms: 10.0,
            load: LoadSnapshot::default(),
            max_concurrent: 10,
            enabled,
        }
    }

    #[test]
    fn agent_availability_requires_recent_heartbeat() {
        let now = Utc::now();
        let stale = agent(AgentStatus::Online, true, Some(now - chrono::Duration::minutes(6)));
        assert!(!stale.is_available(now));
        let fresh = agent(AgentStatus::Online, true, Some(now - chrono::Duration::minutes(1)));
        assert!(fresh.is_available(now));
    }

    #[test]
    fn agent_availability_requires_enabled_and_status() {
        let now = Utc::now();
        let disabled = agent(AgentStatus::Online, false, Some(now));
        assert!(!disabled.is_available(now));
        let maintenance = agent(AgentStatus::Maintenance, true, Some(now));
        assert!(!maintenance.is_available(now));
        let busy = agent(AgentStatus::Busy, true, Some(now));
        assert!(busy.is_available(now));
    }

    #[test]
    fn task_frequency_boundaries() {
        let mut t = base_task();
        t.frequency_seconds = 10;
        assert!(t.validate().is_ok());
        t.frequency_seconds = 9;
        assert!(t.validate().is_err());
    }

    #[test]
    fn task_timeout_boundaries() {
        let mut t = base_task();
        t.timeout_seconds = 300;
        assert!(t.validate().is_ok());
        t.timeout_seconds = 301;
        assert!(t.validate().is_err());
    }

    #[test]
    fn task_port_boundary() {
        let mut t = base_task();
        t.port = Some(0);
        assert!(t.validate().is_err());
        t.port = Some(1);
        assert!(t.validate().is_ok());
    }

    fn base_task() -> Task {
        Task {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            description: None,
            protocol: Protocol::Http,
            target: "example.com".into(),
            port: Some(80),
            parameters: HashMap::new(),
            frequency_seconds: 60,
            timeout_seconds: 10,
            priority: 0,
            status: TaskStatus::Active,
            next_run: None,
            preferred_location: None,
            preferred_isp: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn message_expiry() {
        let now = Utc::now();
        let mut m = Message {
            id: Uuid::new_v4(),
            message_type: "task_assignment".into(),
            priority: MessagePriority::High,
            sender: "orchestrator".into(),
            recipient: None,
            payload: serde_json::json!({}),
            created_at: now,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            retry_count: 0,
            max_retries: 3,
        };
        assert!(m.is_expired(now));
        m.expires_at = Some(now + chrono::Duration::seconds(1));
        assert!(!m.is_expired(now));
    }
}
