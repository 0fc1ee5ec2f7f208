//! Configuration for the orchestrator core (§6.2).
//!
//! Loaded from a `server.toml` file by `server::config::ConfigManager`;
//! every option has a default so the file only needs to mention
//! deployment-specific values, matching the teacher's `ServerConfig`.

use serde::{Deserialize, Serialize};

use crate::defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_max_connections_per_agent")]
    pub max_connections_per_agent: u32,

    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_heartbeat_timeout_seconds")]
    pub heartbeat_timeout_seconds: u64,
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_disk_threshold")]
    pub disk_threshold: f64,

    #[serde(default = "default_recovery_max_attempts")]
    pub recovery_max_attempts: u32,
    #[serde(default = "default_recovery_delay_seconds")]
    pub recovery_delay_seconds: u64,
    #[serde(default = "default_recovery_backoff_multiplier")]
    pub recovery_backoff_multiplier: u64,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_scheduler_check_interval_seconds")]
    pub scheduler_check_interval_seconds: u64,
    #[serde(default = "default_task_timeout_seconds")]
    pub task_timeout_seconds: u64,
    #[serde(default = "default_reaper_interval_seconds")]
    pub reaper_interval_seconds: u64,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,

    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,
    #[serde(default = "default_dispatch_max_retries")]
    pub dispatch_max_retries: u32,

    #[serde(default = "default_location_weight")]
    pub location_weight: f64,
    #[serde(default = "default_performance_weight")]
    pub performance_weight: f64,
    #[serde(default = "default_load_weight")]
    pub load_weight: f64,
    #[serde(default = "default_max_agent_load")]
    pub max_agent_load: f64,
    #[serde(default = "default_min_agent_availability")]
    pub min_agent_availability: f64,
    #[serde(default = "default_smart_max_agent_load")]
    pub smart_max_agent_load: f64,
    #[serde(default = "default_smart_min_agent_availability")]
    pub smart_min_agent_availability: f64,
    #[serde(default = "default_reassignment_max_history")]
    pub reassignment_max_history: usize,
    #[serde(default = "default_reassignment_retention_days")]
    pub reassignment_retention_days: i64,
    #[serde(default = "default_rebalance_interval_seconds")]
    pub rebalance_interval_seconds: u64,
    #[serde(default = "default_load_variance_threshold")]
    pub load_variance_threshold: f64,
    #[serde(default = "default_load_ratio_diff_threshold")]
    pub load_ratio_diff_threshold: f64,

    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,

    /// API key agents authenticate with, per §4.1.2. In a real deployment
    /// this would be per-agent, looked up through `AgentRepository`; a
    /// single shared key is kept here only as the bootstrap/fallback the
    /// repository falls back to when an agent has no stored key yet.
    #[serde(default)]
    pub shared_api_key: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        toml::from_str("").expect("all fields have defaults")
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_connections_per_agent == 0 {
            return Err(crate::OrchestratorError::Validation(
                "max_connections_per_agent must be at least 1".to_string(),
            )
            .into());
        }
        if self.heartbeat_timeout_seconds <= self.heartbeat_interval_seconds {
            return Err(crate::OrchestratorError::Validation(
                "heartbeat_timeout_seconds must be greater than heartbeat_interval_seconds"
                    .to_string(),
            )
            .into());
        }
        if self.max_missed_heartbeats == 0 {
            return Err(crate::OrchestratorError::Validation(
                "max_missed_heartbeats must be at least 1".to_string(),
            )
            .into());
        }
        for (name, v) in [
            ("cpu_threshold", self.cpu_threshold),
            ("memory_threshold", self.memory_threshold),
            ("disk_threshold", self.disk_threshold),
        ] {
            if !(0.0..=100.0).contains(&v) {
                return Err(crate::OrchestratorError::Validation(format!(
                    "{name} must be between 0 and 100, got {v}"
                ))
                .into());
            }
        }
        if self.recovery_max_attempts == 0 {
            return Err(crate::OrchestratorError::Validation(
                "recovery_max_attempts must be at least 1".to_string(),
            )
            .into());
        }
        if self.max_concurrent_tasks == 0 {
            return Err(crate::OrchestratorError::Validation(
                "max_concurrent_tasks must be at least 1".to_string(),
            )
            .into());
        }
        if self.queue_max_size == 0 {
            return Err(crate::OrchestratorError::Validation(
                "queue_max_size must be at least 1".to_string(),
            )
            .into());
        }
        let weight_sum = self.location_weight + self.performance_weight + self.load_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(crate::OrchestratorError::Validation(format!(
                "location_weight + performance_weight + load_weight must sum to 1.0, got {weight_sum}"
            ))
            .into());
        }
        for (name, v) in [
            ("max_agent_load", self.max_agent_load),
            ("min_agent_availability", self.min_agent_availability),
            ("smart_max_agent_load", self.smart_max_agent_load),
            (
                "smart_min_agent_availability",
                self.smart_min_agent_availability,
            ),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(crate::OrchestratorError::Validation(format!(
                    "{name} must be between 0.0 and 1.0, got {v}"
                ))
                .into());
            }
        }
        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(crate::OrchestratorError::Validation(format!(
                "listen_address '{}' is not a valid socket address",
                self.listen_address
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_max_connections() {
        let mut c = OrchestratorConfig::default();
        c.max_connections_per_agent = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_timeout_not_greater_than_interval() {
        let mut c = OrchestratorConfig::default();
        c.heartbeat_timeout_seconds = c.heartbeat_interval_seconds;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let mut c = OrchestratorConfig::default();
        c.load_weight = 0.9;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_bad_listen_address() {
        let mut c = OrchestratorConfig::default();
        c.listen_address = "not-an-address".to_string();
        assert!(c.validate().is_err());
    }
}
