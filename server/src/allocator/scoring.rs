//! Agent scoring and the filtering pipeline (§4.4.1, §4.4.2).
//!
//! Grounded on `examples/original_source/management_platform/scheduler/allocator.py`'s
//! `AgentSelector._calculate_agent_score` and its three component
//! functions, translated to weighted-field scoring over `shared::model`.

use chrono::{DateTime, Utc};
use shared::model::{Agent, LoadSnapshot, ResultStatus, Task, TaskResult};

#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub location: f64,
    pub performance: f64,
    pub load: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct FilterThresholds {
    pub max_agent_load: f64,
    pub min_agent_availability: f64,
}

/// §4.4.1 steps 1–2: online/enabled/recent-heartbeat and capability check.
/// Steps 3–4 (load, availability) are applied separately by `passes_filters`
/// so the "Smart" fallback (§4.4.4) can relax only those two.
pub fn is_eligible_candidate(agent: &Agent, task: &Task, now: DateTime<Utc>) -> bool {
    agent.is_available(now) && agent.supports(task.protocol)
}

pub fn passes_filters(agent: &Agent, thresholds: FilterThresholds) -> bool {
    agent.load.cpu_usage < thresholds.max_agent_load * 100.0
        && agent.load.memory_usage < thresholds.max_agent_load * 100.0
        && agent.availability >= thresholds.min_agent_availability
}

/// §4.4.2 location component: starts at 0.5, capped at 1.0.
fn location_score(agent: &Agent, task: &Task) -> f64 {
    let mut score = 0.5;
    if let Some(preferred) = &task.preferred_location {
        if agent.geo.country.as_deref() == Some(preferred.as_str()) {
            score += 0.3;
        }
        if agent.geo.city.as_deref() == Some(preferred.as_str()) {
            score += 0.2;
        }
    }
    if let Some(preferred_isp) = &task.preferred_isp {
        if agent.isp.as_deref() == Some(preferred_isp.as_str()) {
            score += 0.2;
        }
    }
    score.min(1.0)
}

/// §4.4.2 performance component: success rate 0.7, response-time score 0.3.
/// Returns 0.5 with no history.
fn performance_score(recent_results: &[TaskResult]) -> f64 {
    if recent_results.is_empty() {
        return 0.5;
    }
    let successes = recent_results
        .iter()
        .filter(|r| r.status == ResultStatus::Success)
        .count();
    let success_rate = successes as f64 / recent_results.len() as f64;

    let avg_ms = recent_results.iter().map(|r| r.duration_ms).sum::<f64>() / recent_results.len() as f64;
    let response_time_score = (1.0 - avg_ms / 1000.0).max(0.0);

    0.7 * success_rate + 0.3 * response_time_score
}

/// §4.4.2 load component: mean of `(1 − cpu%/100)` and `(1 − mem%/100)`.
/// Returns 1.0 with unknown load (represented here by a zeroed snapshot
/// being treated the same as missing data is not distinguishable from a
/// genuinely idle agent — callers that track "unknown" explicitly should
/// pass `None`).
fn load_score(load: Option<LoadSnapshot>) -> f64 {
    match load {
        Some(load) => {
            let cpu_component = 1.0 - load.cpu_usage / 100.0;
            let mem_component = 1.0 - load.memory_usage / 100.0;
            ((cpu_component + mem_component) / 2.0).clamp(0.0, 1.0)
        }
        None => 1.0,
    }
}

/// §4.4.2: full weighted score in `[0, 1]`.
pub fn score_agent(
    agent: &Agent,
    task: &Task,
    recent_results: &[TaskResult],
    weights: ScoringWeights,
) -> f64 {
    let location = location_score(agent, task);
    let performance = performance_score(recent_results);
    let load = load_score(Some(agent.load));

    weights.location * location + weights.performance * performance + weights.load * load
}
