//! Task Distributor (§4.2.2): picks an agent for a task under a
//! distribution strategy and sends the `TASK_ASSIGNMENT` frame.
//!
//! Grounded on `examples/original_source/management_platform/scheduler/allocator.py`'s
//! scoring helpers, reused here at dispatch time for the dispatcher's own
//! (distinct, simpler) strategy selection — the allocator's full scoring
//! pipeline in `server::allocator` is the one actually used by the
//! scheduler (§4.3.3); this module's `location_based` strategy remains the
//! spec's named placeholder (§4.2.2, "currently first agent").

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use shared::model::{Message, MessagePriority, Protocol, Task};
use shared::protocol::TaskAssignmentPayload;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::ConnectionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LoadBased,
    LocationBased,
    CapabilityBased,
}

#[derive(Debug, Default)]
pub struct DistributorStats {
    pub distribution_failures: u64,
    pub per_agent: HashMap<Uuid, u64>,
    pub per_strategy: HashMap<&'static str, u64>,
}

pub struct TaskDistributor {
    connections: Arc<ConnectionManager>,
    round_robin_cursor: AtomicUsize,
    stats: RwLock<DistributorStats>,
}

fn load_score(cpu: f64, mem: f64, disk: f64) -> f64 {
    0.5 * cpu + 0.3 * mem + 0.2 * disk
}

const NO_LOAD_DATA_SCORE: f64 = 50.0;

impl TaskDistributor {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            round_robin_cursor: AtomicUsize::new(0),
            stats: RwLock::new(DistributorStats::default()),
        }
    }

    fn strategy_name(strategy: Strategy) -> &'static str {
        match strategy {
            Strategy::RoundRobin => "round_robin",
            Strategy::LoadBased => "load_based",
            Strategy::LocationBased => "location_based",
            Strategy::CapabilityBased => "capability_based",
        }
    }

    /// Chooses one agent id from `candidates` according to `strategy`.
    /// `loads` carries per-agent load samples for `load_based`/
    /// `capability_based`; agents absent from it score `NO_LOAD_DATA_SCORE`.
    pub fn select_agent(
        &self,
        candidates: &[Uuid],
        loads: &HashMap<Uuid, (f64, f64, f64)>,
        protocol: Protocol,
        capabilities: &HashMap<Uuid, Vec<Protocol>>,
        strategy: Strategy,
    ) -> Option<Uuid> {
        if candidates.is_empty() {
            return None;
        }

        match strategy {
            Strategy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::SeqCst) % candidates.len();
                Some(candidates[idx])
            }
            Strategy::LoadBased => self.lowest_load_score(candidates, loads),
            Strategy::LocationBased => candidates.first().copied(),
            Strategy::CapabilityBased => {
                let filtered: Vec<Uuid> = candidates
                    .iter()
                    .filter(|id| {
                        capabilities
                            .get(id)
                            .map(|caps| caps.is_empty() || caps.contains(&protocol))
                            .unwrap_or(true)
                    })
                    .copied()
                    .collect();
                if filtered.is_empty() {
                    self.lowest_load_score(candidates, loads)
                } else {
                    self.lowest_load_score(&filtered, loads)
                }
            }
        }
    }

    fn lowest_load_score(&self, candidates: &[Uuid], loads: &HashMap<Uuid, (f64, f64, f64)>) -> Option<Uuid> {
        candidates
            .iter()
            .min_by(|a, b| {
                let score_a = loads.get(a).map(|(c, m, d)| load_score(*c, *m, *d)).unwrap_or(NO_LOAD_DATA_SCORE);
                let score_b = loads.get(b).map(|(c, m, d)| load_score(*c, *m, *d)).unwrap_or(NO_LOAD_DATA_SCORE);
                score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
    }

    /// Constructs and sends the `TASK_ASSIGNMENT` message. Returns whether
    /// the send succeeded.
    pub async fn dispatch(&self, task: &Task, agent_id: Uuid, strategy: Strategy) -> bool {
        let payload = TaskAssignmentPayload {
            task_id: task.id,
            protocol: task.protocol.to_string(),
            target: task.target.clone(),
            port: task.port,
            parameters: serde_json::to_value(&task.parameters).unwrap_or(serde_json::Value::Null),
            timeout: task.timeout_seconds,
            assigned_at: Utc::now(),
        };

        let message = Message {
            id: Uuid::new_v4(),
            message_type: shared::protocol::frame_type::TASK_ASSIGNMENT.to_string(),
            priority: MessagePriority::High,
            sender: "orchestrator".to_string(),
            recipient: Some(agent_id),
            payload: serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null),
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + chrono::Duration::minutes(5)),
            retry_count: 0,
            max_retries: 3,
        };

        let frame = shared::protocol::Frame::new(
            shared::protocol::frame_type::TASK_ASSIGNMENT,
            message.payload.clone(),
        );

        let sent = self.connections.send(agent_id, frame).await;
        let mut stats = self.stats.write().await;
        if sent {
            *stats.per_agent.entry(agent_id).or_insert(0) += 1;
            *stats.per_strategy.entry(Self::strategy_name(strategy)).or_insert(0) += 1;
        } else {
            stats.distribution_failures += 1;
        }
        sent
    }

    pub async fn cancel_task(&self, task_id: Uuid, agent_id: Uuid) -> bool {
        let payload = shared::protocol::TaskCancelPayload {
            task_id,
            cancelled_at: Utc::now(),
        };
        let frame = shared::protocol::Frame::new(
            shared::protocol::frame_type::TASK_CANCEL,
            serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null),
        );
        self.connections.send(agent_id, frame).await
    }
}
