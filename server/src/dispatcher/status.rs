//! Status Updater (§4.2.4): unicast/broadcast status and notification
//! frames through the connection manager.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use shared::model::{Message, MessagePriority, TaskStatus};
use shared::protocol::{frame_type, AgentCommandPayload, Frame, TaskStatusUpdatePayload};
use uuid::Uuid;

use crate::connection::ConnectionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

pub struct StatusUpdater {
    connections: Arc<ConnectionManager>,
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Active => "active",
        TaskStatus::Paused => "paused",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

impl StatusUpdater {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Unicasts to `agent_id` if given, else broadcasts (NORMAL priority).
    pub async fn update_task_status(&self, task_id: Uuid, status: TaskStatus, agent_id: Option<Uuid>) -> bool {
        let payload = TaskStatusUpdatePayload {
            task_id,
            status: task_status_str(status).to_string(),
            updated_at: Utc::now(),
        };
        let frame = Frame::new(frame_type::TASK_STATUS_UPDATE, json!(payload));

        match agent_id {
            Some(agent_id) => self.connections.send(agent_id, frame).await,
            None => self.connections.broadcast(frame, &[]).await > 0,
        }
    }

    /// Info notifications are NORMAL priority; warning/error are HIGH.
    pub async fn send_system_notification(&self, message: &str, level: NotificationLevel, agent_id: Option<Uuid>) -> bool {
        let priority = match level {
            NotificationLevel::Info => MessagePriority::Normal,
            NotificationLevel::Warning | NotificationLevel::Error => MessagePriority::High,
        };
        let envelope = Message {
            id: Uuid::new_v4(),
            message_type: "system_notification".to_string(),
            priority,
            sender: "orchestrator".to_string(),
            recipient: agent_id,
            payload: json!({ "message": message, "level": format!("{level:?}").to_lowercase() }),
            created_at: Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
        };
        let frame = Frame::new("system_notification", envelope.payload.clone());
        match agent_id {
            Some(agent_id) => self.connections.send(agent_id, frame).await,
            None => self.connections.broadcast(frame, &[]).await > 0,
        }
    }

    pub async fn send_agent_command(&self, agent_id: Uuid, command: &str, parameters: serde_json::Value) -> bool {
        let payload = AgentCommandPayload {
            command: command.to_string(),
            parameters,
        };
        let frame = Frame::new(frame_type::AGENT_COMMAND, json!(payload));
        self.connections.send(agent_id, frame).await
    }
}
