//! Load Monitor (§4.1.4): rolling per-agent load history with edge-triggered
//! threshold alerts.
//!
//! Grounded on `examples/original_source/management_platform/api/connection_manager.py`'s
//! `load_metrics` tracking, generalized into a dedicated component per the
//! spec's split of connection-pool bookkeeping from load analysis.

use std::collections::{HashMap, VecDeque};

use shared::model::LoadSnapshot;
use uuid::Uuid;

const HISTORY_CAP: usize = 100;
const CPU_THRESHOLD: f64 = 80.0;
const MEMORY_THRESHOLD: f64 = 85.0;
const DISK_THRESHOLD: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Cpu,
    Memory,
    Disk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    Crossed(Metric),
    Recovered(Metric),
}

/// Per-agent rolling window plus the last-known over-threshold state for
/// each metric, so repeated samples above threshold emit only one alert
/// (edge-triggered, §4.1.4).
#[derive(Default)]
struct AgentState {
    samples: VecDeque<LoadSnapshot>,
    over_threshold: HashMap<Metric, bool>,
}

#[derive(Default)]
pub struct LoadMonitor {
    agents: HashMap<Uuid, AgentState>,
}

impl LoadMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sample and returns any alerts edge-triggered by it.
    pub fn record(&mut self, agent_id: Uuid, load: LoadSnapshot) -> Vec<Alert> {
        let state = self.agents.entry(agent_id).or_default();
        if state.samples.len() >= HISTORY_CAP {
            state.samples.pop_front();
        }
        state.samples.push_back(load);

        let mut alerts = Vec::new();
        for (metric, value, threshold) in [
            (Metric::Cpu, load.cpu_usage, CPU_THRESHOLD),
            (Metric::Memory, load.memory_usage, MEMORY_THRESHOLD),
            (Metric::Disk, load.disk_usage, DISK_THRESHOLD),
        ] {
            let now_over = value > threshold;
            let was_over = *state.over_threshold.get(&metric).unwrap_or(&false);
            if now_over && !was_over {
                alerts.push(Alert::Crossed(metric));
            } else if !now_over && was_over {
                alerts.push(Alert::Recovered(metric));
            }
            state.over_threshold.insert(metric, now_over);
        }
        alerts
    }

    pub fn is_overloaded(&self, agent_id: Uuid) -> bool {
        self.agents
            .get(&agent_id)
            .map(|s| s.over_threshold.values().any(|v| *v))
            .unwrap_or(false)
    }

    pub fn latest(&self, agent_id: Uuid) -> Option<LoadSnapshot> {
        self.agents.get(&agent_id).and_then(|s| s.samples.back()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(cpu: f64) -> LoadSnapshot {
        LoadSnapshot {
            cpu_usage: cpu,
            memory_usage: 10.0,
            disk_usage: 10.0,
            load_average: 0.5,
        }
    }

    #[test]
    fn crossing_threshold_emits_one_shot_alert() {
        let mut monitor = LoadMonitor::new();
        let agent_id = Uuid::new_v4();
        assert!(monitor.record(agent_id, load(50.0)).is_empty());
        let alerts = monitor.record(agent_id, load(90.0));
        assert_eq!(alerts, vec![Alert::Crossed(Metric::Cpu)]);
        assert!(monitor.is_overloaded(agent_id));
        // Staying over threshold emits nothing further.
        assert!(monitor.record(agent_id, load(95.0)).is_empty());
    }

    #[test]
    fn recovering_below_threshold_emits_recovery_alert() {
        let mut monitor = LoadMonitor::new();
        let agent_id = Uuid::new_v4();
        monitor.record(agent_id, load(90.0));
        let alerts = monitor.record(agent_id, load(40.0));
        assert_eq!(alerts, vec![Alert::Recovered(Metric::Cpu)]);
        assert!(!monitor.is_overloaded(agent_id));
    }

    #[test]
    fn history_is_capped() {
        let mut monitor = LoadMonitor::new();
        let agent_id = Uuid::new_v4();
        for _ in 0..(HISTORY_CAP + 10) {
            monitor.record(agent_id, load(10.0));
        }
        assert_eq!(monitor.agents.get(&agent_id).unwrap().samples.len(), HISTORY_CAP);
    }
}
