//! Shared data model, configuration, wire protocol and repository traits
//! for the probe orchestration platform.
//!
//! This crate contains the types that cross the boundary between the
//! orchestrator's subsystems (connection manager, dispatcher, scheduler,
//! allocator) and the interfaces they consume: the agent control channel
//! wire format and the persistence repositories.

pub mod config;
pub mod defaults;
pub mod model;
pub mod protocol;
pub mod repository;
pub mod utils;

pub use model::{
    Agent, AgentStatus, Connection, ConnectionState, Message, MessagePriority, Protocol,
    QueuedTask, ResultStatus, Task, TaskResult, TaskStatus,
};
pub use protocol::Frame;

/// Result type alias used throughout the shared crate and the orchestrator.
pub type Result<T> = anyhow::Result<T>;

/// Common error kinds surfaced by the orchestration core.
///
/// Mirrors the teacher's `MonitoringError`: a small, flat enum of broad
/// categories rather than one variant per failure site.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("validation error: {0}")]
    Validation(String),
}
