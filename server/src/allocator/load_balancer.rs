//! Load Balancer (§4.4.5): advisory-only rebalance suggestions.
//!
//! Grounded on `examples/original_source/management_platform/scheduler/allocator.py`'s
//! `LoadBalancer.check_rebalance_needed` (variance threshold, cooldown,
//! suggestion-only — no move is ever executed here).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

const VARIANCE_THRESHOLD: f64 = 0.1;
const MIN_SECONDS_BETWEEN_REBALANCES: i64 = 300;
const RATIO_DIFFERENCE_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Copy)]
pub struct AgentLoadRatio {
    pub agent_id: Uuid,
    /// `current_tasks / max_concurrent_tasks`.
    pub ratio: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct MoveSuggestion {
    pub from_agent: Uuid,
    pub to_agent: Uuid,
    pub from_ratio: f64,
    pub to_ratio: f64,
}

pub struct LoadBalancer {
    last_rebalance: Option<DateTime<Utc>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self { last_rebalance: None }
    }

    fn mean(ratios: &[AgentLoadRatio]) -> f64 {
        ratios.iter().map(|r| r.ratio).sum::<f64>() / ratios.len() as f64
    }

    fn variance(ratios: &[AgentLoadRatio]) -> f64 {
        let mean = Self::mean(ratios);
        ratios.iter().map(|r| (r.ratio - mean).powi(2)).sum::<f64>() / ratios.len() as f64
    }

    /// Returns move suggestions if rebalancing is warranted right now.
    /// Never performs a move itself — callers must explicitly cancel and
    /// reassign the suggested task (§4.4.5: "suggestion only").
    pub fn check_rebalance(&mut self, ratios: &[AgentLoadRatio], now: DateTime<Utc>) -> Vec<MoveSuggestion> {
        if ratios.len() < 2 {
            return Vec::new();
        }

        if let Some(last) = self.last_rebalance {
            if (now - last).num_seconds() < MIN_SECONDS_BETWEEN_REBALANCES {
                return Vec::new();
            }
        }

        if Self::variance(ratios) <= VARIANCE_THRESHOLD {
            return Vec::new();
        }

        let mut sorted: Vec<&AgentLoadRatio> = ratios.iter().collect();
        sorted.sort_by(|a, b| a.ratio.partial_cmp(&b.ratio).unwrap_or(std::cmp::Ordering::Equal));

        let mut suggestions = Vec::new();
        let mut low = 0usize;
        let mut high = sorted.len() - 1;
        while low < high {
            let lightest = sorted[low];
            let heaviest = sorted[high];
            if heaviest.ratio - lightest.ratio > RATIO_DIFFERENCE_THRESHOLD {
                suggestions.push(MoveSuggestion {
                    from_agent: heaviest.agent_id,
                    to_agent: lightest.agent_id,
                    from_ratio: heaviest.ratio,
                    to_ratio: lightest.ratio,
                });
            }
            low += 1;
            if high == 0 {
                break;
            }
            high -= 1;
        }

        if !suggestions.is_empty() {
            self.last_rebalance = Some(now);
        }
        suggestions
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds per-agent load ratios from `(current_tasks, max_concurrent_tasks)`
/// pairs, skipping agents with no capacity configured.
pub fn ratios_from_counts(counts: &HashMap<Uuid, (u32, u32)>) -> Vec<AgentLoadRatio> {
    counts
        .iter()
        .filter(|(_, (_, max))| *max > 0)
        .map(|(agent_id, (current, max))| AgentLoadRatio {
            agent_id: *agent_id,
            ratio: *current as f64 / *max as f64,
        })
        .collect()
}
