//! Task Allocator (§4.4): agent scoring and selection, reassignment on
//! failure, advisory load balancing, and batch allocation.

pub mod load_balancer;
pub mod reassignment;
pub mod scoring;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use shared::model::{Agent, Task};
use shared::repository::{AgentRepository, TaskResultRepository};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use self::load_balancer::{ratios_from_counts, LoadBalancer, MoveSuggestion};
use self::reassignment::ReassignmentManager;
use self::scoring::{is_eligible_candidate, passes_filters, score_agent, FilterThresholds, ScoringWeights};

#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    pub weights: ScoringWeights,
    pub thresholds: FilterThresholds,
    pub smart_thresholds: FilterThresholds,
}

#[derive(Debug, Default)]
pub struct AllocatorStats {
    pub allocations: u64,
    pub allocation_failures: u64,
    pub smart_fallbacks: u64,
}

/// Picks an agent for one task at a time, keeps reassignment history on
/// failure, and exposes advisory rebalance suggestions. A single instance
/// is shared between the scheduler's dispatch loop and any administrative
/// reassignment trigger.
pub struct TaskAllocator {
    agents: Arc<dyn AgentRepository>,
    results: Arc<dyn TaskResultRepository>,
    config: AllocatorConfig,
    reassignment: Arc<ReassignmentManager>,
    load_balancer: RwLock<LoadBalancer>,
    stats: RwLock<AllocatorStats>,
}

impl TaskAllocator {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        results: Arc<dyn TaskResultRepository>,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            agents,
            results,
            config,
            reassignment: Arc::new(ReassignmentManager::new()),
            load_balancer: RwLock::new(LoadBalancer::new()),
            stats: RwLock::new(AllocatorStats::default()),
        }
    }

    pub fn reassignment_manager(&self) -> Arc<ReassignmentManager> {
        Arc::clone(&self.reassignment)
    }

    async fn candidates(&self, task: &Task, exclude: &[Uuid], thresholds: FilterThresholds) -> Vec<Agent> {
        let now = Utc::now();
        let online = self.agents.list_online().await.unwrap_or_default();
        online
            .into_iter()
            .filter(|a| !exclude.contains(&a.id))
            .filter(|a| is_eligible_candidate(a, task, now))
            .filter(|a| passes_filters(a, thresholds))
            .collect()
    }

    async fn score_all(&self, task: &Task, candidates: &[Agent]) -> Vec<(Uuid, f64)> {
        let since = Utc::now() - chrono::Duration::days(7);
        let mut scored = Vec::with_capacity(candidates.len());
        for agent in candidates {
            let history = self.results.recent_for_agent(agent.id, since).await.unwrap_or_default();
            let score = score_agent(agent, task, &history, self.config.weights);
            scored.push((agent.id, score));
        }
        scored
    }

    /// §4.4.1–§4.4.3: filter, score, pick the highest scorer, breaking ties
    /// by agent id for determinism. Falls back to the relaxed "Smart"
    /// thresholds (§4.4.4) when the strict pass finds nothing.
    pub async fn select_agent(&self, task: &Task, exclude: &[Uuid]) -> Option<Uuid> {
        let mut candidates = self.candidates(task, exclude, self.config.thresholds).await;
        let mut used_smart_fallback = false;
        if candidates.is_empty() {
            candidates = self.candidates(task, exclude, self.config.smart_thresholds).await;
            used_smart_fallback = !candidates.is_empty();
        }

        if candidates.is_empty() {
            self.stats.write().await.allocation_failures += 1;
            warn!(task_id = %task.id, "no eligible agent found for task");
            return None;
        }

        let mut scored = self.score_all(task, &candidates).await;
        scored.sort_by(|a, b| match b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal) {
            std::cmp::Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });

        let winner = scored.first().map(|(id, _)| *id);
        if let Some(agent_id) = winner {
            let mut stats = self.stats.write().await;
            stats.allocations += 1;
            if used_smart_fallback {
                stats.smart_fallbacks += 1;
                info!(task_id = %task.id, agent_id = %agent_id, "allocated via smart fallback thresholds");
            }
        }
        winner
    }

    /// §4.4.4: rerun allocation excluding the failed agent, recording the
    /// attempt in the reassignment manager.
    pub async fn reassign(&self, task: &Task, failed_agent: Uuid) -> Option<Uuid> {
        if self.reassignment.exhausted(task.id).await {
            warn!(task_id = %task.id, "reassignment budget exhausted, giving up");
            return None;
        }
        let already_tried = self.reassignment.history_for(task.id).await;
        let mut exclude: Vec<Uuid> = already_tried.iter().map(|e| e.from_agent).collect();
        exclude.push(failed_agent);

        let replacement = self.select_agent(task, &exclude).await;
        self.reassignment.record(task.id, failed_agent, replacement, "agent_failure").await;
        replacement
    }

    /// §4.4.6: sequential allocation over a batch, capping each agent's
    /// eligibility within the batch at its `max_concurrent` so one batch
    /// never over-commits a single agent.
    pub async fn allocate_batch(&self, tasks: &[Task]) -> Vec<(Uuid, Option<Uuid>)> {
        let mut per_agent_assigned: HashMap<Uuid, u32> = HashMap::new();
        let mut assignments = Vec::with_capacity(tasks.len());

        for task in tasks {
            let exhausted_agents: Vec<Uuid> = per_agent_assigned
                .iter()
                .filter_map(|(agent_id, count)| {
                    // capacity is re-checked against the live agent record below;
                    // this pass only excludes agents already maxed within the batch
                    if *count == u32::MAX { Some(*agent_id) } else { None }
                })
                .collect();

            let assigned = self.select_agent_respecting_batch_caps(task, &exhausted_agents, &per_agent_assigned).await;
            if let Some(agent_id) = assigned {
                *per_agent_assigned.entry(agent_id).or_insert(0) += 1;
            }
            assignments.push((task.id, assigned));
        }

        assignments
    }

    async fn select_agent_respecting_batch_caps(
        &self,
        task: &Task,
        exclude: &[Uuid],
        per_agent_assigned: &HashMap<Uuid, u32>,
    ) -> Option<Uuid> {
        let candidates = self.candidates(task, exclude, self.config.thresholds).await;
        let eligible: Vec<Agent> = candidates
            .into_iter()
            .filter(|a| per_agent_assigned.get(&a.id).copied().unwrap_or(0) < a.max_concurrent)
            .collect();

        if eligible.is_empty() {
            self.stats.write().await.allocation_failures += 1;
            return None;
        }

        let mut scored = self.score_all(task, &eligible).await;
        scored.sort_by(|a, b| match b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal) {
            std::cmp::Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });
        let winner = scored.first().map(|(id, _)| *id);
        if winner.is_some() {
            self.stats.write().await.allocations += 1;
        }
        winner
    }

    /// §4.4.5: advisory move suggestions from live per-agent task counts.
    /// Never executes a move; callers decide whether to cancel+reassign.
    pub async fn check_rebalance(&self, counts: &HashMap<Uuid, (u32, u32)>) -> Vec<MoveSuggestion> {
        let ratios = ratios_from_counts(counts);
        self.load_balancer.write().await.check_rebalance(&ratios, Utc::now())
    }

    pub async fn stats(&self) -> (u64, u64, u64) {
        let s = self.stats.read().await;
        (s.allocations, s.allocation_failures, s.smart_fallbacks)
    }
}
