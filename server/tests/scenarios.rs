//! End-to-end coverage for the six operational scenarios (§8): happy-path
//! dispatch, heartbeat timeout recovery, priority ordering, load-based
//! selection, reassignment on timeout, and queue expiry.
//!
//! Scenarios 1 and 5 drive the real object graph (`Server::build`) over a
//! loopback WebSocket, the way the teacher's `server/src/tests/main_tests.rs`
//! spins up a real `ServerDatabase` against a tempfile. `connection::transport::serve`
//! binds its own listener and never exposes the resolved port, so the harness
//! below replicates its accept-loop body directly against an OS-assigned
//! `127.0.0.1:0` instead of reusing it.
//!
//! Scenario 2 (heartbeat timeout) is deliberately NOT driven over the wire:
//! `heartbeat::sweep`'s staleness check is wall-clock (`chrono::Utc::now`),
//! not tokio's pausable virtual clock, so fast-forwarding past the real
//! 90-second/3-miss threshold would cost ~270s of actual wall time per test
//! run. Instead this composes the real `ConnectionPool` + `heartbeat::sweep`
//! + `RecoveryRegistry` directly, injecting a stale timestamp the way
//! `heartbeat.rs`'s own unit test does, and uses `tokio::time::pause`/
//! `advance` for the (sleep-based, virtual-clock-respecting) recovery
//! backoff.
//!
//! Scenarios 3, 4, and 6 exercise single components (`PriorityQueue`,
//! `TaskAllocator`) directly, the same way their own colocated unit tests do.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use shared::model::{
    Agent, AgentStatus, Connection as WireConnection, ConnectionState, Geo, LoadSnapshot, Message,
    MessagePriority, Protocol, ResultStatus, Task, TaskResult, TaskStatus,
};
use shared::protocol::{
    frame_type, AuthPayload, AuthResponsePayload, Frame, TaskAssignmentPayload, TaskResultAckPayload,
    TaskResultPayload,
};
use shared::repository::{AgentRepository, TaskResultRepository};

use server::allocator::scoring::{FilterThresholds, ScoringWeights};
use server::allocator::{AllocatorConfig, TaskAllocator};
use server::connection::heartbeat::{self, TimeoutHandler};
use server::connection::pool::ConnectionPool;
use server::connection::recovery::RecoveryRegistry;
use server::connection::transport::Channel;
use server::connection::ConnectionManager;
use server::dispatcher::queue::PriorityQueue;
use server::repository::SqliteRepositories;
use server::Server;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// --- Shared harness -------------------------------------------------------

fn write_server_config(dir: &Path, shared_api_key: &str, task_timeout_seconds: u64, reaper_interval_seconds: u64) -> PathBuf {
    let path = dir.join("server.toml");
    let contents = format!(
        r#"
listen_address = "127.0.0.1:0"
shared_api_key = "{shared_api_key}"
task_timeout_seconds = {task_timeout_seconds}
reaper_interval_seconds = {reaper_interval_seconds}
scheduler_check_interval_seconds = 1
"#
    );
    std::fs::write(&path, contents).expect("write server.toml");
    path
}

/// Replicates `connection::transport::serve`'s accept loop against a
/// manually-bound ephemeral port, since `serve` doesn't expose the address
/// it bound.
async fn spawn_test_listener(connections: Arc<ConnectionManager>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("resolve bound address");
    tokio::spawn(async move {
        loop {
            let (stream, _peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws_stream) => {
                    let channel = Channel::new(ws_stream);
                    let connections = Arc::clone(&connections);
                    tokio::spawn(async move {
                        connections.handle_channel(channel).await;
                    });
                }
                Err(_) => continue,
            }
        }
    });
    addr
}

async fn connect_client(addr: SocketAddr) -> ClientStream {
    let (stream, _response) = connect_async(format!("ws://{addr}")).await.expect("client connect");
    stream
}

async fn send_frame(stream: &mut ClientStream, frame: &Frame) {
    let text = serde_json::to_string(frame).expect("serialize frame");
    stream.send(WsMessage::Text(text.into())).await.expect("send frame");
}

async fn recv_frame(stream: &mut ClientStream, timeout: Duration) -> Option<Frame> {
    let fut = async {
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(serde_json::from_str(&text).expect("parse frame")),
                Some(Ok(WsMessage::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, fut).await.unwrap_or(None)
}

/// Reimplements `connection::auth::compute_signature`, which is private to
/// the crate it authenticates for.
fn compute_signature(agent_id: Uuid, api_key: &str, timestamp: DateTime<Utc>, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.to_string().as_bytes());
    hasher.update(api_key.as_bytes());
    hasher.update(timestamp.timestamp().to_string().as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

async fn authenticate(stream: &mut ClientStream, agent_id: Uuid, api_key: &str) {
    let now = Utc::now();
    let nonce = format!("nonce-{agent_id}");
    let signature = compute_signature(agent_id, api_key, now, &nonce);
    let payload = AuthPayload {
        agent_id,
        timestamp: now,
        nonce,
        signature,
        version: None,
    };
    send_frame(stream, &Frame::new(frame_type::AUTH, json!(payload))).await;

    let resp = recv_frame(stream, Duration::from_secs(5)).await.expect("auth response");
    assert_eq!(resp.frame_type, frame_type::AUTH_RESPONSE);
    let resp_payload: AuthResponsePayload = serde_json::from_value(resp.data).expect("auth response payload");
    assert!(resp_payload.success, "auth handshake should succeed: {:?}", resp_payload.error);
}

fn test_agent(id: Uuid, load: LoadSnapshot, country: Option<&str>) -> Agent {
    let now = Utc::now();
    Agent {
        id,
        name: format!("agent-{id}"),
        address: "127.0.0.1:9000".to_string(),
        geo: Geo {
            country: country.map(str::to_string),
            city: None,
            latitude: None,
            longitude: None,
        },
        isp: None,
        version: "1.0.0".to_string(),
        capabilities: vec![Protocol::Http],
        status: AgentStatus::Online,
        last_heartbeat: Some(now),
        registered_at: now,
        created_at: now,
        updated_at: now,
        availability: 0.95,
        success_rate: 0.95,
        avg_response_time_ms: 40.0,
        load,
        max_concurrent: 10,
        enabled: true,
    }
}

fn test_task(id: Uuid, owner: Uuid, preferred_location: Option<&str>) -> Task {
    let now = Utc::now();
    Task {
        id,
        owner_user_id: owner,
        description: Some("scenario probe".to_string()),
        protocol: Protocol::Http,
        target: "example.com".to_string(),
        port: Some(443),
        parameters: HashMap::new(),
        frequency_seconds: 60,
        timeout_seconds: 30,
        priority: 5,
        status: TaskStatus::Active,
        next_run: None,
        preferred_location: preferred_location.map(str::to_string),
        preferred_isp: None,
        created_at: now,
        updated_at: now,
    }
}

// --- Scenario 1: happy-path dispatch and result collection ---------------

#[tokio::test]
async fn scenario_1_happy_path_dispatch_and_result() {
    let data_dir = tempfile::tempdir().expect("data dir");
    let config_dir = tempfile::tempdir().expect("config dir");
    let api_key = "scenario-1-shared-key";
    let config_path = write_server_config(config_dir.path(), api_key, 300, 30);

    let agent_id = Uuid::new_v4();
    let owner_id = Uuid::new_v4();
    let task_id = Uuid::new_v4();

    let seed = SqliteRepositories::new(data_dir.path()).expect("seed db");
    seed.upsert(&test_agent(
        agent_id,
        LoadSnapshot { cpu_usage: 10.0, memory_usage: 15.0, disk_usage: 5.0, load_average: 0.2 },
        None,
    ))
    .await
    .expect("seed agent");
    seed.insert_task(&test_task(task_id, owner_id, None)).await.expect("seed task");

    let mut server = Server::new(config_path, data_dir.path().to_path_buf()).expect("construct server");
    let handles = server.build().await.expect("build server");
    let addr = spawn_test_listener(Arc::clone(&handles.connections)).await;

    // Let the async handler registrations (`ConnectionManager::register_handler`
    // spawns rather than awaiting) settle before a frame can arrive.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = connect_client(addr).await;
    authenticate(&mut client, agent_id, api_key).await;

    assert!(handles.scheduler.force_execute_task(task_id).await, "force-dispatch should succeed");

    let assignment = recv_frame(&mut client, Duration::from_secs(5))
        .await
        .expect("task assignment frame");
    assert_eq!(assignment.frame_type, frame_type::TASK_ASSIGNMENT);
    let assignment_payload: TaskAssignmentPayload =
        serde_json::from_value(assignment.data).expect("task assignment payload");
    assert_eq!(assignment_payload.task_id, task_id);
    assert_eq!(assignment_payload.protocol, "http");

    let result_payload = TaskResultPayload {
        task_id,
        result: json!({ "latency_ms": 12.5 }),
        status: ResultStatus::Success,
        error_message: None,
        execution_time: 12.5,
        metrics: None,
        raw_data: None,
    };
    send_frame(&mut client, &Frame::new(frame_type::TASK_RESULT, json!(result_payload))).await;

    let ack = recv_frame(&mut client, Duration::from_secs(5)).await.expect("task result ack");
    assert_eq!(ack.frame_type, frame_type::TASK_RESULT_ACK);
    let ack_payload: TaskResultAckPayload = serde_json::from_value(ack.data).expect("ack payload");
    assert_eq!(ack_payload.task_id, task_id);
    assert!(ack_payload.received);

    // `record_completion` runs in a spawned task off the collector's result
    // handler hook; give it a moment to clear the scheduler's executing slot.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = handles.scheduler.stats().await;
    assert_eq!(stats.total_executed, 1);
    assert_eq!(stats.total_timeout, 0);
    assert_eq!(stats.total_failed, 0);

    let (received, duplicates, persisted, persist_failures) = handles.collector.stats().await;
    assert_eq!(received, 1);
    assert_eq!(duplicates, 0);
    assert_eq!(persisted, 1);
    assert_eq!(persist_failures, 0);
}

// --- Scenario 2: heartbeat timeout drives recovery, then offline ---------

struct StubAgents {
    marked_offline: Arc<AtomicBool>,
}

#[async_trait]
impl AgentRepository for StubAgents {
    async fn get(&self, _agent_id: Uuid) -> shared::Result<Option<Agent>> {
        Ok(None)
    }
    async fn upsert(&self, _agent: &Agent) -> shared::Result<()> {
        Ok(())
    }
    async fn update_status(&self, _agent_id: Uuid, status: AgentStatus) -> shared::Result<()> {
        if status == AgentStatus::Offline {
            self.marked_offline.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
    async fn update_heartbeat(&self, _agent_id: Uuid, _at: DateTime<Utc>) -> shared::Result<()> {
        Ok(())
    }
    async fn update_load(&self, _agent_id: Uuid, _load: LoadSnapshot) -> shared::Result<()> {
        Ok(())
    }
    async fn list_online(&self) -> shared::Result<Vec<Agent>> {
        Ok(vec![])
    }
    async fn api_key_for(&self, _agent_id: Uuid) -> shared::Result<Option<String>> {
        Ok(None)
    }
}

/// Mirrors `ConnectionManager::remove_connection`'s "heartbeat_timeout"
/// branch without needing the whole connection manager.
struct StartsRecovery {
    recovery: Arc<RecoveryRegistry>,
    agents: Arc<dyn AgentRepository>,
}

#[async_trait]
impl TimeoutHandler for StartsRecovery {
    async fn on_heartbeat_timeout(&self, _session_id: Uuid, agent_id: Uuid) {
        self.recovery
            .start(agent_id, Arc::clone(&self.agents), |_agent_id| async { false })
            .await;
    }
}

#[tokio::test]
async fn scenario_2_heartbeat_timeout_triggers_recovery_then_offline() {
    let pool = Arc::new(RwLock::new(ConnectionPool::new(1)));
    let agent_id = Uuid::new_v4();
    let stale_time = Utc::now() - chrono::Duration::seconds(heartbeat::HEARTBEAT_TIMEOUT_SECONDS + 1);
    {
        let mut pool = pool.write().await;
        let mut conn = WireConnection::new(Uuid::new_v4(), agent_id, stale_time);
        conn.state = ConnectionState::Authenticated;
        conn.last_heartbeat_received = Some(stale_time);
        pool.add(conn);
    }

    let marked_offline = Arc::new(AtomicBool::new(false));
    let agents: Arc<dyn AgentRepository> = Arc::new(StubAgents { marked_offline: Arc::clone(&marked_offline) });
    let recovery = Arc::new(RecoveryRegistry::new());
    let handler = StartsRecovery { recovery: Arc::clone(&recovery), agents: Arc::clone(&agents) };

    tokio::time::pause();

    heartbeat::sweep(&pool, &handler).await;
    heartbeat::sweep(&pool, &handler).await;
    assert!(!recovery.is_recovering(agent_id).await, "recovery shouldn't start before the third miss");

    heartbeat::sweep(&pool, &handler).await;
    assert!(recovery.is_recovering(agent_id).await, "third miss should start recovery");

    tokio::time::advance(Duration::from_secs(5 + 10 + 20 + 1)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    assert!(marked_offline.load(Ordering::SeqCst), "agent should be marked offline once recovery is exhausted");
    assert!(!recovery.is_recovering(agent_id).await, "recovery task should have cleaned itself up");
}

// --- Scenario 3: priority queue dequeues in descending priority order ----

fn test_message(priority: MessagePriority) -> Message {
    Message {
        id: Uuid::new_v4(),
        message_type: frame_type::TASK_ASSIGNMENT.to_string(),
        priority,
        sender: "orchestrator".to_string(),
        recipient: None,
        payload: json!({}),
        created_at: Utc::now(),
        expires_at: None,
        retry_count: 0,
        max_retries: 3,
    }
}

#[tokio::test]
async fn scenario_3_priority_queue_dequeues_urgent_first() {
    let queue = PriorityQueue::new();
    assert!(queue.enqueue(test_message(MessagePriority::Low)).await);
    assert!(queue.enqueue(test_message(MessagePriority::Normal)).await);
    assert!(queue.enqueue(test_message(MessagePriority::Urgent)).await);
    assert!(queue.enqueue(test_message(MessagePriority::High)).await);

    let order = [MessagePriority::Urgent, MessagePriority::High, MessagePriority::Normal, MessagePriority::Low];
    for expected in order {
        let message = queue.dequeue_blocking(Duration::from_millis(200)).await.expect("message present");
        assert_eq!(message.priority, expected);
    }
    assert!(queue.is_empty().await);
}

// --- Scenario 4: allocator selects the lightest-loaded eligible agent ----

struct AllocatorStubAgents {
    online: Vec<Agent>,
}

#[async_trait]
impl AgentRepository for AllocatorStubAgents {
    async fn get(&self, agent_id: Uuid) -> shared::Result<Option<Agent>> {
        Ok(self.online.iter().find(|a| a.id == agent_id).cloned())
    }
    async fn upsert(&self, _agent: &Agent) -> shared::Result<()> {
        Ok(())
    }
    async fn update_status(&self, _agent_id: Uuid, _status: AgentStatus) -> shared::Result<()> {
        Ok(())
    }
    async fn update_heartbeat(&self, _agent_id: Uuid, _at: DateTime<Utc>) -> shared::Result<()> {
        Ok(())
    }
    async fn update_load(&self, _agent_id: Uuid, _load: LoadSnapshot) -> shared::Result<()> {
        Ok(())
    }
    async fn list_online(&self) -> shared::Result<Vec<Agent>> {
        Ok(self.online.clone())
    }
    async fn api_key_for(&self, _agent_id: Uuid) -> shared::Result<Option<String>> {
        Ok(None)
    }
}

struct EmptyResults;

#[async_trait]
impl TaskResultRepository for EmptyResults {
    async fn append(&self, _result: &TaskResult) -> shared::Result<()> {
        Ok(())
    }
    async fn recent_for_agent(&self, _agent_id: Uuid, _since: DateTime<Utc>) -> shared::Result<Vec<TaskResult>> {
        Ok(vec![])
    }
}

fn allocator_config() -> AllocatorConfig {
    AllocatorConfig {
        weights: ScoringWeights { location: 0.3, performance: 0.3, load: 0.4 },
        thresholds: FilterThresholds { max_agent_load: 0.9, min_agent_availability: 0.5 },
        smart_thresholds: FilterThresholds { max_agent_load: 0.95, min_agent_availability: 0.3 },
    }
}

#[tokio::test]
async fn scenario_4_selects_lightest_loaded_agent() {
    let heavy = test_agent(Uuid::new_v4(), LoadSnapshot { cpu_usage: 80.0, memory_usage: 70.0, disk_usage: 60.0, load_average: 3.0 }, None);
    let light = test_agent(Uuid::new_v4(), LoadSnapshot { cpu_usage: 30.0, memory_usage: 40.0, disk_usage: 20.0, load_average: 0.5 }, None);
    let medium = test_agent(Uuid::new_v4(), LoadSnapshot { cpu_usage: 60.0, memory_usage: 50.0, disk_usage: 40.0, load_average: 1.5 }, None);
    let light_id = light.id;

    let agents: Arc<dyn AgentRepository> = Arc::new(AllocatorStubAgents { online: vec![heavy, light, medium] });
    let results: Arc<dyn TaskResultRepository> = Arc::new(EmptyResults);
    let allocator = TaskAllocator::new(agents, results, allocator_config());

    let task = test_task(Uuid::new_v4(), Uuid::new_v4(), None);
    let selected = allocator.select_agent(&task, &[]).await.expect("an eligible agent");
    assert_eq!(selected, light_id);
}

// --- Scenario 5: timeout triggers reassignment to another agent ---------

#[tokio::test]
async fn scenario_5_reassigns_task_after_agent_timeout() {
    let data_dir = tempfile::tempdir().expect("data dir");
    let config_dir = tempfile::tempdir().expect("config dir");
    let api_key = "scenario-5-shared-key";
    // Small timeout/reaper interval so the real reaper loop reassigns within
    // a handful of real seconds instead of the production 300s/30s defaults.
    let config_path = write_server_config(config_dir.path(), api_key, 1, 1);

    let agent_a = Uuid::new_v4();
    let agent_b = Uuid::new_v4();
    let owner_id = Uuid::new_v4();
    let task_id = Uuid::new_v4();

    let seed = SqliteRepositories::new(data_dir.path()).expect("seed db");
    let light_load = LoadSnapshot { cpu_usage: 10.0, memory_usage: 10.0, disk_usage: 10.0, load_average: 0.1 };
    // Agent A is strictly preferred on the first dispatch (location match);
    // the exclusion list on reassignment then forces agent B regardless.
    seed.upsert(&test_agent(agent_a, light_load, Some("PL"))).await.expect("seed agent a");
    seed.upsert(&test_agent(agent_b, light_load, None)).await.expect("seed agent b");
    seed.insert_task(&test_task(task_id, owner_id, Some("PL"))).await.expect("seed task");

    let mut server = Server::new(config_path, data_dir.path().to_path_buf()).expect("construct server");
    let handles = server.build().await.expect("build server");
    let addr = spawn_test_listener(Arc::clone(&handles.connections)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client_a = connect_client(addr).await;
    authenticate(&mut client_a, agent_a, api_key).await;
    let mut client_b = connect_client(addr).await;
    authenticate(&mut client_b, agent_b, api_key).await;

    assert!(handles.scheduler.force_execute_task(task_id).await, "force-dispatch should succeed");

    let first_assignment = recv_frame(&mut client_a, Duration::from_secs(5))
        .await
        .expect("agent A should receive the initial assignment");
    let first_payload: TaskAssignmentPayload =
        serde_json::from_value(first_assignment.data).expect("assignment payload");
    assert_eq!(first_payload.task_id, task_id);

    assert!(
        recv_frame(&mut client_b, Duration::from_millis(300)).await.is_none(),
        "agent B shouldn't see an assignment before the reaper reassigns"
    );

    // Agent A never replies; wait for the real reaper loop (1s task_timeout,
    // 1s reaper_interval) to reap and reassign.
    let reassignment = recv_frame(&mut client_b, Duration::from_secs(10))
        .await
        .expect("agent B should receive the reassigned task");
    assert_eq!(reassignment.frame_type, frame_type::TASK_ASSIGNMENT);
    let reassignment_payload: TaskAssignmentPayload =
        serde_json::from_value(reassignment.data).expect("reassignment payload");
    assert_eq!(reassignment_payload.task_id, task_id);

    let history = handles.allocator.reassignment_manager().history_for(task_id).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_agent, agent_a);
    assert_eq!(history[0].to_agent, Some(agent_b));

    let stats = handles.scheduler.stats().await;
    assert_eq!(stats.total_timeout, 1);
}

// --- Scenario 6: expired messages never surface from the queue ----------

#[tokio::test]
async fn scenario_6_expired_message_is_dropped_not_delivered() {
    let queue = PriorityQueue::new();

    let mut already_expired = test_message(MessagePriority::High);
    already_expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
    assert!(!queue.enqueue(already_expired).await, "an already-expired message is rejected on enqueue");
    assert_eq!(queue.stats().await.expired_on_enqueue, 1);

    let mut expires_soon = test_message(MessagePriority::Urgent);
    expires_soon.expires_at = Some(Utc::now() + chrono::Duration::milliseconds(30));
    assert!(queue.enqueue(expires_soon).await);

    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(
        queue.dequeue_blocking(Duration::from_millis(100)).await.is_none(),
        "the message should have expired before it could be dequeued"
    );
    assert_eq!(queue.stats().await.expired_on_dequeue, 1);
    assert!(queue.is_empty().await);
}
