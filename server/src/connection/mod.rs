//! Agent Connection Manager (§4.1): the public contract gluing together
//! the connection pool, auth handshake, heartbeat manager, load monitor,
//! and recovery registry.

pub mod auth;
pub mod heartbeat;
pub mod load_monitor;
pub mod pool;
pub mod recovery;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use shared::model::{AgentStatus, Connection, ConnectionState};
use shared::protocol::{frame_type, AuthResponsePayload, DisconnectPayload, Frame, HeartbeatResponsePayload};
use shared::repository::AgentRepository;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use self::load_monitor::LoadMonitor;
use self::pool::ConnectionPool;
use self::recovery::RecoveryRegistry;
use self::transport::Channel;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_FAILED_REASON: &str = "send_failed";

/// Handlers for message types not built into `on_message` (§4.1.6): keyed
/// by frame type, invoked with the raw payload.
pub type MessageHandler = Arc<dyn Fn(Uuid, serde_json::Value) + Send + Sync>;

struct LiveChannel {
    sender: mpsc::Sender<Frame>,
}

/// Owns the pool, the load monitor, the recovery registry, and the map of
/// live send handles a `Connection`'s plain-data counterpart doesn't carry
/// (§3's "the live channel handle lives in the connection pool, not here").
pub struct ConnectionManager {
    pool: Arc<RwLock<ConnectionPool>>,
    load_monitor: Arc<RwLock<LoadMonitor>>,
    recovery: Arc<RecoveryRegistry>,
    agents: Arc<dyn AgentRepository>,
    channels: Arc<RwLock<HashMap<Uuid, LiveChannel>>>,
    handlers: Arc<RwLock<HashMap<String, MessageHandler>>>,
    shared_api_key: String,
}

impl ConnectionManager {
    pub fn new(max_connections_per_agent: u32, agents: Arc<dyn AgentRepository>, shared_api_key: String) -> Self {
        Self {
            pool: Arc::new(RwLock::new(ConnectionPool::new(max_connections_per_agent))),
            load_monitor: Arc::new(RwLock::new(LoadMonitor::new())),
            recovery: Arc::new(RecoveryRegistry::new()),
            agents,
            channels: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            shared_api_key,
        }
    }

    pub fn register_handler(&self, frame_type: impl Into<String>, handler: MessageHandler) {
        let handlers = Arc::clone(&self.handlers);
        let frame_type = frame_type.into();
        tokio::spawn(async move {
            handlers.write().await.insert(frame_type, handler);
        });
    }

    /// Runs one accepted channel end-to-end: the auth handshake (§4.1.2),
    /// then a read loop routing frames to `on_message` until the channel
    /// closes.
    pub async fn handle_channel(self: &Arc<Self>, mut channel: Channel) {
        let auth_result = tokio::time::timeout(AUTH_TIMEOUT, channel.recv()).await;

        let frame = match auth_result {
            Ok(Ok(Some(frame))) if frame.frame_type == frame_type::AUTH => frame,
            _ => {
                warn!("auth handshake timed out or first frame was not an auth frame");
                return;
            }
        };

        let payload: shared::protocol::AuthPayload = match serde_json::from_value(frame.data) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed auth frame");
                return;
            }
        };

        let agent_id = payload.agent_id;
        let api_key = self
            .agents
            .api_key_for(agent_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| self.shared_api_key.clone());

        let now = Utc::now();
        if let Err(e) = auth::verify(&payload, &api_key, now) {
            let resp = Frame::new(
                frame_type::AUTH_RESPONSE,
                json!(AuthResponsePayload {
                    success: false,
                    session_id: None,
                    error: Some(e.to_string()),
                }),
            );
            let _ = channel.send(&resp).await;
            channel.close().await;
            return;
        }

        let session_id = Uuid::new_v4();
        let conn = Connection {
            state: ConnectionState::Authenticated,
            authenticated_at: Some(now),
            ..Connection::new(session_id, agent_id, now)
        };

        if !self.add_connection(conn).await {
            let resp = Frame::new(
                frame_type::AUTH_RESPONSE,
                json!(AuthResponsePayload {
                    success: false,
                    session_id: None,
                    error: Some("connection pool full for this agent".to_string()),
                }),
            );
            let _ = channel.send(&resp).await;
            channel.close().await;
            return;
        }

        self.recovery.cancel(agent_id).await;
        let _ = self.agents.update_status(agent_id, AgentStatus::Online).await;

        let resp = Frame::new(
            frame_type::AUTH_RESPONSE,
            json!(AuthResponsePayload {
                success: true,
                session_id: Some(session_id),
                error: None,
            }),
        );
        if channel.send(&resp).await.is_err() {
            self.remove_connection(session_id, SEND_FAILED_REASON).await;
            return;
        }

        let (tx, mut rx) = mpsc::channel::<Frame>(64);
        self.channels.write().await.insert(session_id, LiveChannel { sender: tx });

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(frame) => {
                            if channel.send(&frame).await.is_err() {
                                self.remove_connection(session_id, SEND_FAILED_REASON).await;
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = channel.recv() => {
                    match incoming {
                        Ok(Some(frame)) => self.on_message(session_id, frame).await,
                        Ok(None) => {
                            self.remove_connection(session_id, "connection_error").await;
                            break;
                        }
                        Err(e) => {
                            warn!(%session_id, error = %e, "channel read error");
                            self.remove_connection(session_id, "network_error").await;
                            break;
                        }
                    }
                }
            }
        }

        self.channels.write().await.remove(&session_id);
    }

    /// §4.1.6: places the connection in the pool; caller has already
    /// authenticated.
    async fn add_connection(&self, conn: Connection) -> bool {
        self.pool.write().await.add(conn)
    }

    /// §4.1.6: transitions to disconnecting, emits a best-effort
    /// `disconnect` frame, removes from the pool, marks the agent offline,
    /// and for "unexpected" reasons schedules recovery.
    pub async fn remove_connection(self: &Arc<Self>, session_id: Uuid, reason: &str) -> bool {
        let agent_id = {
            let mut pool = self.pool.write().await;
            if let Some(conn) = pool.get_mut(session_id) {
                conn.state = ConnectionState::Disconnecting;
            }
            let Some(conn) = pool.remove(session_id, reason) else {
                return false;
            };
            conn.agent_id
        };

        if let Some(live) = self.channels.read().await.get(&session_id) {
            let disconnect = Frame::new(
                frame_type::DISCONNECT,
                json!(DisconnectPayload {
                    reason: reason.to_string(),
                    timestamp: Utc::now(),
                }),
            );
            let _ = live.sender.send(disconnect).await;
        }

        let _ = self.agents.update_status(agent_id, AgentStatus::Offline).await;

        if matches!(reason, "heartbeat_timeout" | "connection_error" | "network_error") {
            let pool = Arc::clone(&self.pool);
            let agents = Arc::clone(&self.agents);
            self.recovery
                .start(agent_id, Arc::clone(&self.agents), move |agent_id| {
                    let pool = Arc::clone(&pool);
                    let agents = Arc::clone(&agents);
                    async move {
                        if pool.read().await.is_connected(agent_id) {
                            return true;
                        }
                        matches!(agents.get(agent_id).await, Ok(Some(a)) if a.status == AgentStatus::Online)
                    }
                })
                .await;
        }

        true
    }

    /// §4.1.6: primary-connection-only send; augments a missing `id` or
    /// `timestamp`.
    pub async fn send(self: &Arc<Self>, agent_id: Uuid, mut frame: Frame) -> bool {
        let session_id = {
            let pool = self.pool.read().await;
            match pool.primary(agent_id) {
                Some(conn) => conn.session_id,
                None => return false,
            }
        };

        let sender = {
            let channels = self.channels.read().await;
            match channels.get(&session_id) {
                Some(live) => live.sender.clone(),
                None => return false,
            }
        };

        if frame.id.is_nil() {
            frame.id = Uuid::new_v4();
        }

        if sender.send(frame).await.is_err() {
            self.remove_connection(session_id, SEND_FAILED_REASON).await;
            return false;
        }

        let mut pool = self.pool.write().await;
        if let Some(conn) = pool.get_mut(session_id) {
            conn.messages_sent += 1;
        }
        true
    }

    /// §4.1.6: broadcasts to every connected agent not in `exclude`,
    /// returning the successful send count.
    pub async fn broadcast(self: &Arc<Self>, frame: Frame, exclude: &[Uuid]) -> usize {
        let agent_ids: Vec<Uuid> = {
            let pool = self.pool.read().await;
            pool.connected_agents()
                .into_iter()
                .filter(|id| !exclude.contains(id))
                .collect()
        };

        let mut successes = 0;
        for agent_id in agent_ids {
            if self.send(agent_id, frame.clone()).await {
                successes += 1;
            }
        }
        successes
    }

    /// §4.1.6: updates recv counters, then routes by frame type.
    pub async fn on_message(self: &Arc<Self>, session_id: Uuid, frame: Frame) {
        {
            let mut pool = self.pool.write().await;
            if let Some(conn) = pool.get_mut(session_id) {
                conn.messages_received += 1;
            }
        }

        match frame.frame_type.as_str() {
            frame_type::HEARTBEAT => self.handle_heartbeat_frame(session_id, frame).await,
            frame_type::RESOURCE_REPORT => self.handle_resource_report(session_id, frame).await,
            frame_type::AGENT_REGISTER => {
                // Registration is handled at connection time in this design;
                // an in-band re-register is acknowledged without re-running
                // the handshake.
                let agent_id = {
                    let pool = self.pool.read().await;
                    pool.get(session_id).map(|c| c.agent_id)
                };
                if let Some(agent_id) = agent_id {
                    let resp = Frame::new(
                        frame_type::AGENT_REGISTER_RESPONSE,
                        json!({ "success": true }),
                    );
                    self.send(agent_id, resp).await;
                }
            }
            other => {
                let handler = self.handlers.read().await.get(other).cloned();
                match handler {
                    Some(handler) => handler(session_id, frame.data),
                    None => {
                        warn!(frame_type = other, "no handler registered for frame type");
                        if let Some(live) = self.channels.read().await.get(&session_id) {
                            let err = Frame::new(
                                frame_type::ERROR,
                                json!(shared::protocol::ErrorPayload {
                                    error: format!("unknown frame type: {other}"),
                                    original_message_id: Some(frame.id),
                                }),
                            );
                            let _ = live.sender.send(err).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_heartbeat_frame(self: &Arc<Self>, session_id: Uuid, frame: Frame) {
        let Some(server_time) = heartbeat::handle_heartbeat(&self.pool, session_id).await else {
            return;
        };
        let agent_id = {
            let pool = self.pool.read().await;
            pool.get(session_id).map(|c| c.agent_id)
        };
        let Some(agent_id) = agent_id else { return };
        let resp = Frame::new(
            frame_type::HEARTBEAT_RESPONSE,
            json!(HeartbeatResponsePayload {
                agent_id,
                server_time,
                original_message_id: frame.id,
            }),
        );
        self.send(agent_id, resp).await;
    }

    async fn handle_resource_report(self: &Arc<Self>, session_id: Uuid, frame: Frame) {
        let Ok(payload): Result<shared::protocol::ResourceReportPayload, _> =
            serde_json::from_value(frame.data)
        else {
            return;
        };
        let agent_id = {
            let pool = self.pool.read().await;
            pool.get(session_id).map(|c| c.agent_id)
        };
        let Some(agent_id) = agent_id else { return };

        let load = shared::model::LoadSnapshot {
            cpu_usage: payload.resources.cpu_usage,
            memory_usage: payload.resources.memory_usage,
            disk_usage: payload.resources.disk_usage,
            load_average: payload.resources.load_average,
        };

        {
            let mut pool = self.pool.write().await;
            if let Some(conn) = pool.get_mut(session_id) {
                conn.load = load;
            }
        }
        self.load_monitor.write().await.record(agent_id, load);
        let _ = self.agents.update_load(agent_id, load).await;

        let resp = Frame::new(
            frame_type::RESOURCE_REPORT_ACK,
            json!(shared::protocol::ResourceReportAckPayload { received: true }),
        );
        self.send(agent_id, resp).await;
    }

    pub async fn is_connected(&self, agent_id: Uuid) -> bool {
        self.pool.read().await.is_connected(agent_id)
    }

    /// Resolves a connection's session id to its owning agent id, for
    /// handlers registered via `register_handler` that only see the
    /// session (§4.1.6).
    pub async fn agent_id_for_session(&self, session_id: Uuid) -> Option<Uuid> {
        self.pool.read().await.get(session_id).map(|c| c.agent_id)
    }

    pub async fn available_agents(&self) -> Vec<Uuid> {
        let connected = self.pool.read().await.connected_agents();
        let monitor = self.load_monitor.read().await;
        connected
            .into_iter()
            .filter(|id| !monitor.is_overloaded(*id))
            .collect()
    }

    /// Spawns the heartbeat sweep loop; stops when `shutdown` fires.
    pub fn spawn_heartbeat_loop(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = heartbeat::interval();
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        heartbeat::sweep(&manager.pool, &manager).await;
                    }
                    _ = shutdown.recv() => {
                        info!("heartbeat loop received shutdown signal");
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl heartbeat::TimeoutHandler for Arc<ConnectionManager> {
    async fn on_heartbeat_timeout(&self, session_id: Uuid, _agent_id: Uuid) {
        let manager = Arc::clone(self);
        manager.remove_connection(session_id, "heartbeat_timeout").await;
    }
}
