//! Default values for configuration parameters.
//!
//! Centralizes the `default_*` functions used by serde when deserializing
//! a config file that omits an optional field, one function per constant
//! named in §6.2.

// Connection manager

pub fn default_max_connections_per_agent() -> u32 {
    1
}

pub fn default_heartbeat_interval_seconds() -> u64 {
    30
}

pub fn default_heartbeat_timeout_seconds() -> u64 {
    90
}

pub fn default_max_missed_heartbeats() -> u32 {
    3
}

pub fn default_recovery_max_attempts() -> u32 {
    3
}

pub fn default_recovery_delay_seconds() -> u64 {
    5
}

pub fn default_recovery_backoff_multiplier() -> u64 {
    2
}

pub fn default_cpu_threshold() -> f64 {
    80.0
}

pub fn default_memory_threshold() -> f64 {
    85.0
}

pub fn default_disk_threshold() -> f64 {
    90.0
}

// Scheduler

pub fn default_max_concurrent_tasks() -> usize {
    100
}

pub fn default_scheduler_check_interval_seconds() -> u64 {
    10
}

pub fn default_task_timeout_seconds() -> u64 {
    300
}

pub fn default_reaper_interval_seconds() -> u64 {
    30
}

pub fn default_retry_delay_seconds() -> u64 {
    60
}

// Dispatcher / queue

pub fn default_queue_max_size() -> usize {
    10_000
}

pub fn default_dispatch_max_retries() -> u32 {
    3
}

// Allocator

pub fn default_location_weight() -> f64 {
    0.3
}

pub fn default_performance_weight() -> f64 {
    0.4
}

pub fn default_load_weight() -> f64 {
    0.3
}

pub fn default_max_agent_load() -> f64 {
    0.8
}

pub fn default_min_agent_availability() -> f64 {
    0.7
}

pub fn default_smart_max_agent_load() -> f64 {
    0.9
}

pub fn default_smart_min_agent_availability() -> f64 {
    0.5
}

pub fn default_reassignment_max_history() -> usize {
    3
}

pub fn default_reassignment_retention_days() -> i64 {
    7
}

pub fn default_rebalance_interval_seconds() -> u64 {
    300
}

pub fn default_load_variance_threshold() -> f64 {
    0.1
}

pub fn default_load_ratio_diff_threshold() -> f64 {
    0.3
}

// Ambient runtime / server lifecycle

pub fn default_listen_address() -> String {
    "0.0.0.0:7300".to_string()
}

pub fn default_graceful_shutdown_timeout_seconds() -> u64 {
    30
}

pub fn default_channel_buffer_size() -> usize {
    1000
}
