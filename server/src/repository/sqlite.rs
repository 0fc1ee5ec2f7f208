//! SQLite-backed implementation of the agent/task/task-result repositories.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use shared::model::{Agent, AgentStatus, LoadSnapshot, Task, TaskResult, TaskStatus};
use shared::repository::{AgentRepository, TaskRepository, TaskResultRepository};
use uuid::Uuid;

const DATABASE_FILE: &str = "orchestrator.db";

/// A single SQLite connection behind a mutex, in the teacher's
/// `ServerDatabase` idiom: one struct owning the connection, one
/// `initialize()` that creates tables idempotently.
pub struct SqliteRepositories {
    conn: Mutex<Connection>,
}

impl SqliteRepositories {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
        }
        let conn = Connection::open(data_dir.join(DATABASE_FILE))
            .context("failed to open orchestrator database")?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.initialize()?;
        Ok(repo)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.initialize()?;
        Ok(repo)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL,
                country TEXT,
                city TEXT,
                latitude REAL,
                longitude REAL,
                isp TEXT,
                version TEXT NOT NULL,
                capabilities TEXT NOT NULL,
                status TEXT NOT NULL,
                last_heartbeat INTEGER,
                registered_at INTEGER NOT NULL,
                availability REAL NOT NULL,
                success_rate REAL NOT NULL,
                avg_response_time_ms REAL NOT NULL,
                cpu_usage REAL NOT NULL DEFAULT 0,
                memory_usage REAL NOT NULL DEFAULT 0,
                disk_usage REAL NOT NULL DEFAULT 0,
                load_average REAL NOT NULL DEFAULT 0,
                max_concurrent INTEGER NOT NULL,
                enabled INTEGER NOT NULL,
                api_key TEXT,
                created_at INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0
            )
            "#,
            [],
        )
        .context("failed to create agents table")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                owner_user_id TEXT NOT NULL,
                description TEXT,
                protocol TEXT NOT NULL,
                target TEXT NOT NULL,
                port INTEGER,
                parameters TEXT NOT NULL,
                frequency_seconds INTEGER NOT NULL,
                timeout_seconds INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                status TEXT NOT NULL,
                next_run INTEGER,
                preferred_location TEXT,
                preferred_isp TEXT,
                created_at INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0
            )
            "#,
            [],
        )
        .context("failed to create tasks table")?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status_next_run ON tasks(status, next_run)",
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS task_results (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                executed_at INTEGER NOT NULL,
                duration_ms REAL NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                metrics TEXT NOT NULL,
                raw_data TEXT
            )
            "#,
            [],
        )
        .context("failed to create task_results table")?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_results_agent_time ON task_results(agent_id, executed_at)",
            [],
        )?;

        Ok(())
    }

    /// Seeds a task row directly. Outside the narrow `TaskRepository`
    /// trait because task creation is owned by a system this orchestration
    /// core doesn't implement (§6.3: "no DDL is mandated" — tasks arrive
    /// already persisted); kept here, in the agent `upsert`'s idiom, so
    /// integration tests can seed one without a full admin API.
    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO tasks (
                id, owner_user_id, description, protocol, target, port, parameters,
                frequency_seconds, timeout_seconds, priority, status, next_run,
                preferred_location, preferred_isp, created_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
            ON CONFLICT(id) DO UPDATE SET
                description=excluded.description, protocol=excluded.protocol, target=excluded.target,
                port=excluded.port, parameters=excluded.parameters, frequency_seconds=excluded.frequency_seconds,
                timeout_seconds=excluded.timeout_seconds, priority=excluded.priority, status=excluded.status,
                next_run=excluded.next_run, preferred_location=excluded.preferred_location,
                preferred_isp=excluded.preferred_isp, updated_at=excluded.updated_at
            "#,
            params![
                task.id.to_string(),
                task.owner_user_id.to_string(),
                task.description,
                protocol_str(task.protocol),
                task.target,
                task.port,
                serde_json::to_string(&task.parameters).unwrap_or_default(),
                task.frequency_seconds,
                task.timeout_seconds,
                task.priority,
                task_status_str(task.status),
                task.next_run.map(|t| t.timestamp()),
                task.preferred_location,
                task.preferred_isp,
                task.created_at.timestamp(),
                task.updated_at.timestamp(),
            ],
        )
        .context("failed to insert task")?;
        Ok(())
    }

    fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<Agent> {
        let id: String = row.get("id")?;
        let status: String = row.get("status")?;
        let capabilities: String = row.get("capabilities")?;
        let last_heartbeat: Option<i64> = row.get("last_heartbeat")?;
        let registered_at: i64 = row.get("registered_at")?;
        let created_at: i64 = row.get("created_at")?;
        let updated_at: i64 = row.get("updated_at")?;
        Ok(Agent {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            name: row.get("name")?,
            address: row.get("address")?,
            geo: shared::model::Geo {
                country: row.get("country")?,
                city: row.get("city")?,
                latitude: row.get("latitude")?,
                longitude: row.get("longitude")?,
            },
            isp: row.get("isp")?,
            version: row.get("version")?,
            capabilities: serde_json::from_str(&capabilities).unwrap_or_default(),
            status: match status.as_str() {
                "online" => AgentStatus::Online,
                "busy" => AgentStatus::Busy,
                "maintenance" => AgentStatus::Maintenance,
                _ => AgentStatus::Offline,
            },
            last_heartbeat: last_heartbeat.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            registered_at: DateTime::from_timestamp(registered_at, 0).unwrap_or_else(Utc::now),
            created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
            availability: row.get("availability")?,
            success_rate: row.get("success_rate")?,
            avg_response_time_ms: row.get("avg_response_time_ms")?,
            load: LoadSnapshot {
                cpu_usage: row.get("cpu_usage")?,
                memory_usage: row.get("memory_usage")?,
                disk_usage: row.get("disk_usage")?,
                load_average: row.get("load_average")?,
            },
            max_concurrent: row.get("max_concurrent")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
        })
    }
}

#[async_trait]
impl AgentRepository for SqliteRepositories {
    async fn get(&self, agent_id: Uuid) -> Result<Option<Agent>> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.query_row(
            "SELECT * FROM agents WHERE id = ?1",
            params![agent_id.to_string()],
            Self::row_to_agent,
        )
        .optional()
        .context("failed to look up agent")
    }

    async fn upsert(&self, agent: &Agent) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO agents (
                id, name, address, country, city, latitude, longitude, isp, version,
                capabilities, status, last_heartbeat, registered_at, availability,
                success_rate, avg_response_time_ms, cpu_usage, memory_usage, disk_usage,
                load_average, max_concurrent, enabled, created_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24)
            ON CONFLICT(id) DO UPDATE SET
                name=excluded.name, address=excluded.address, country=excluded.country,
                city=excluded.city, latitude=excluded.latitude, longitude=excluded.longitude,
                isp=excluded.isp, version=excluded.version, capabilities=excluded.capabilities,
                status=excluded.status, last_heartbeat=excluded.last_heartbeat,
                availability=excluded.availability, success_rate=excluded.success_rate,
                avg_response_time_ms=excluded.avg_response_time_ms, cpu_usage=excluded.cpu_usage,
                memory_usage=excluded.memory_usage, disk_usage=excluded.disk_usage,
                load_average=excluded.load_average, max_concurrent=excluded.max_concurrent,
                enabled=excluded.enabled, updated_at=excluded.updated_at
            "#,
            params![
                agent.id.to_string(),
                agent.name,
                agent.address,
                agent.geo.country,
                agent.geo.city,
                agent.geo.latitude,
                agent.geo.longitude,
                agent.isp,
                agent.version,
                serde_json::to_string(&agent.capabilities).unwrap_or_default(),
                status_str(agent.status),
                agent.last_heartbeat.map(|t| t.timestamp()),
                agent.registered_at.timestamp(),
                agent.availability,
                agent.success_rate,
                agent.avg_response_time_ms,
                agent.load.cpu_usage,
                agent.load.memory_usage,
                agent.load.disk_usage,
                agent.load.load_average,
                agent.max_concurrent,
                agent.enabled as i64,
                agent.created_at.timestamp(),
                agent.updated_at.timestamp(),
            ],
        )
        .context("failed to upsert agent")?;
        Ok(())
    }

    async fn update_status(&self, agent_id: Uuid, status: AgentStatus) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "UPDATE agents SET status = ?1 WHERE id = ?2",
            params![status_str(status), agent_id.to_string()],
        )
        .context("failed to update agent status")?;
        Ok(())
    }

    async fn update_heartbeat(&self, agent_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "UPDATE agents SET last_heartbeat = ?1 WHERE id = ?2",
            params![at.timestamp(), agent_id.to_string()],
        )
        .context("failed to update agent heartbeat")?;
        Ok(())
    }

    async fn update_load(&self, agent_id: Uuid, load: LoadSnapshot) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "UPDATE agents SET cpu_usage=?1, memory_usage=?2, disk_usage=?3, load_average=?4 WHERE id=?5",
            params![
                load.cpu_usage,
                load.memory_usage,
                load.disk_usage,
                load.load_average,
                agent_id.to_string()
            ],
        )
        .context("failed to update agent load")?;
        Ok(())
    }

    async fn list_online(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn.prepare("SELECT * FROM agents WHERE status = 'online' OR status = 'busy'")?;
        let rows = stmt
            .query_map([], Self::row_to_agent)
            .context("failed to query online agents")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read agent rows")
    }

    async fn api_key_for(&self, agent_id: Uuid) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.query_row(
            "SELECT api_key FROM agents WHERE id = ?1",
            params![agent_id.to_string()],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .context("failed to look up agent api key")
        .map(Option::flatten)
    }
}

fn status_str(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Online => "online",
        AgentStatus::Offline => "offline",
        AgentStatus::Busy => "busy",
        AgentStatus::Maintenance => "maintenance",
    }
}

fn protocol_str(protocol: shared::model::Protocol) -> &'static str {
    match protocol {
        shared::model::Protocol::Icmp => "icmp",
        shared::model::Protocol::Tcp => "tcp",
        shared::model::Protocol::Udp => "udp",
        shared::model::Protocol::Http => "http",
        shared::model::Protocol::Https => "https",
    }
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Active => "active",
        TaskStatus::Paused => "paused",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let id: String = row.get("id")?;
    let owner: String = row.get("owner_user_id")?;
    let protocol: String = row.get("protocol")?;
    let status: String = row.get("status")?;
    let parameters: String = row.get("parameters")?;
    let next_run: Option<i64> = row.get("next_run")?;
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;
    Ok(Task {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        owner_user_id: Uuid::parse_str(&owner).unwrap_or_default(),
        description: row.get("description")?,
        protocol: match protocol.as_str() {
            "icmp" => shared::model::Protocol::Icmp,
            "tcp" => shared::model::Protocol::Tcp,
            "udp" => shared::model::Protocol::Udp,
            "https" => shared::model::Protocol::Https,
            _ => shared::model::Protocol::Http,
        },
        target: row.get("target")?,
        port: row.get::<_, Option<i64>>("port")?.map(|p| p as u16),
        parameters: serde_json::from_str(&parameters).unwrap_or_default(),
        frequency_seconds: row.get("frequency_seconds")?,
        timeout_seconds: row.get("timeout_seconds")?,
        priority: row.get("priority")?,
        status: match status.as_str() {
            "paused" => TaskStatus::Paused,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Active,
        },
        next_run: next_run.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        preferred_location: row.get("preferred_location")?,
        preferred_isp: row.get("preferred_isp")?,
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl TaskRepository for SqliteRepositories {
    async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![task_id.to_string()],
            row_to_task,
        )
        .optional()
        .context("failed to look up task")
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn.prepare("SELECT * FROM tasks WHERE owner_user_id = ?1")?;
        let rows = stmt.query_map(params![user_id.to_string()], row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read task rows")
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks WHERE status = 'active' AND (next_run IS NULL OR next_run <= ?1) LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now.timestamp(), limit as i64], row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read due task rows")
    }

    async fn set_status(&self, task_id: Uuid, status: TaskStatus) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![task_status_str(status), Utc::now().timestamp(), task_id.to_string()],
        )
        .context("failed to update task status")?;
        Ok(())
    }

    async fn set_next_run(&self, task_id: Uuid, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "UPDATE tasks SET next_run = ?1, updated_at = ?2 WHERE id = ?3",
            params![next_run.map(|t| t.timestamp()), Utc::now().timestamp(), task_id.to_string()],
        )
        .context("failed to update task next_run")?;
        Ok(())
    }

    async fn set_priority(&self, task_id: Uuid, priority: i32) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "UPDATE tasks SET priority = ?1, updated_at = ?2 WHERE id = ?3",
            params![priority, Utc::now().timestamp(), task_id.to_string()],
        )
        .context("failed to update task priority")?;
        Ok(())
    }
}

#[async_trait]
impl TaskResultRepository for SqliteRepositories {
    async fn append(&self, result: &TaskResult) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO task_results (id, task_id, agent_id, executed_at, duration_ms, status, error, metrics, raw_data)
            VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
            "#,
            params![
                result.id.to_string(),
                result.task_id.to_string(),
                result.agent_id.to_string(),
                result.executed_at.timestamp(),
                result.duration_ms,
                match result.status {
                    shared::model::ResultStatus::Success => "success",
                    shared::model::ResultStatus::Timeout => "timeout",
                    shared::model::ResultStatus::Error => "error",
                },
                result.error,
                serde_json::to_string(&result.metrics).unwrap_or_default(),
                result.raw_data.as_ref().map(|v| v.to_string()),
            ],
        )
        .context("failed to append task result")?;
        Ok(())
    }

    async fn recent_for_agent(&self, agent_id: Uuid, since: DateTime<Utc>) -> Result<Vec<TaskResult>> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT * FROM task_results WHERE agent_id = ?1 AND executed_at >= ?2 ORDER BY executed_at DESC",
        )?;
        let rows = stmt.query_map(params![agent_id.to_string(), since.timestamp()], |row| {
            let id: String = row.get("id")?;
            let task_id: String = row.get("task_id")?;
            let agent_id: String = row.get("agent_id")?;
            let executed_at: i64 = row.get("executed_at")?;
            let status: String = row.get("status")?;
            let metrics: String = row.get("metrics")?;
            let raw_data: Option<String> = row.get("raw_data")?;
            Ok(TaskResult {
                id: Uuid::parse_str(&id).unwrap_or_default(),
                task_id: Uuid::parse_str(&task_id).unwrap_or_default(),
                agent_id: Uuid::parse_str(&agent_id).unwrap_or_default(),
                executed_at: DateTime::from_timestamp(executed_at, 0).unwrap_or_else(Utc::now),
                duration_ms: row.get("duration_ms")?,
                status: match status.as_str() {
                    "timeout" => shared::model::ResultStatus::Timeout,
                    "error" => shared::model::ResultStatus::Error,
                    _ => shared::model::ResultStatus::Success,
                },
                error: row.get("error")?,
                metrics: serde_json::from_str(&metrics).unwrap_or_default(),
                raw_data: raw_data.and_then(|s| serde_json::from_str(&s).ok()),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read task result rows")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::Geo;

    fn sample_agent() -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "agent-1".into(),
            address: "10.0.0.5".into(),
            geo: Geo::default(),
            isp: None,
            version: "1.0".into(),
            capabilities: vec![shared::model::Protocol::Http],
            status: AgentStatus::Online,
            last_heartbeat: Some(Utc::now()),
            registered_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            availability: 0.9,
            success_rate: 0.95,
            avg_response_time_ms: 50.0,
            load: LoadSnapshot::default(),
            max_concurrent: 10,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let repo = SqliteRepositories::in_memory().unwrap();
        let agent = sample_agent();
        repo.upsert(&agent).await.unwrap();
        let fetched = repo.get(agent.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, agent.name);
        assert_eq!(fetched.capabilities, agent.capabilities);
    }

    #[tokio::test]
    async fn list_online_filters_by_status() {
        let repo = SqliteRepositories::in_memory().unwrap();
        let mut online = sample_agent();
        online.status = AgentStatus::Online;
        repo.upsert(&online).await.unwrap();
        let mut offline = sample_agent();
        offline.id = Uuid::new_v4();
        offline.status = AgentStatus::Offline;
        repo.upsert(&offline).await.unwrap();

        let agents = repo.list_online().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, online.id);
    }
}
