//! Agent control channel wire protocol (§6.1).
//!
//! Frames are JSON objects with required fields `{id, type, timestamp,
//! data}`. `data` carries one of the payload structs below depending on
//! `frame_type`. Modeled the way `shared::api` models the teacher's REST
//! DTOs: plain structs plus a constants module, here for frame type tags
//! instead of HTTP endpoint paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::ResultStatus;

/// Frame type tags exchanged over the duplex channel.
pub mod frame_type {
    pub const AUTH: &str = "auth";
    pub const AUTH_RESPONSE: &str = "auth_response";
    pub const AGENT_REGISTER: &str = "agent_register";
    pub const AGENT_REGISTER_RESPONSE: &str = "agent_register_response";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const HEARTBEAT_RESPONSE: &str = "heartbeat_response";
    pub const RESOURCE_REPORT: &str = "resource_report";
    pub const RESOURCE_REPORT_ACK: &str = "resource_report_ack";
    pub const TASK_ASSIGNMENT: &str = "task_assignment";
    pub const TASK_CANCEL: &str = "task_cancel";
    pub const TASK_RESULT: &str = "task_result";
    pub const TASK_RESULT_ACK: &str = "task_result_ack";
    pub const TASK_STATUS_UPDATE: &str = "task_status_update";
    pub const AGENT_COMMAND: &str = "agent_command";
    pub const DISCONNECT: &str = "disconnect";
    pub const ERROR: &str = "error";
}

/// The envelope every frame is wrapped in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(frame_type: &str, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            frame_type: frame_type.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub agent_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub nonce: String,
    pub signature: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponsePayload {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterPayload {
    pub capabilities: Vec<String>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterResponsePayload {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub agent_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponsePayload {
    pub agent_id: Uuid,
    pub server_time: DateTime<Utc>,
    pub original_message_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReportPayload {
    pub resources: ResourceUsage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    #[serde(default)]
    pub load_average: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReportAckPayload {
    pub received: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentPayload {
    pub task_id: Uuid,
    pub protocol: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub parameters: serde_json::Value,
    pub timeout: u32,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancelPayload {
    pub task_id: Uuid,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub task_id: Uuid,
    pub result: serde_json::Value,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultAckPayload {
    pub task_id: Uuid,
    pub received: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdatePayload {
    pub task_id: Uuid,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommandPayload {
    pub command: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectPayload {
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_json() {
        let payload = HeartbeatPayload {
            agent_id: Uuid::new_v4(),
        };
        let frame = Frame::new(
            frame_type::HEARTBEAT,
            serde_json::to_value(&payload).unwrap(),
        );
        let json = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.frame_type, frame_type::HEARTBEAT);
        let decoded: HeartbeatPayload = serde_json::from_value(back.data).unwrap();
        assert_eq!(decoded.agent_id, payload.agent_id);
    }

    #[test]
    fn auth_response_omits_absent_fields() {
        let resp = AuthResponsePayload {
            success: true,
            session_id: Some(Uuid::new_v4()),
            error: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("error").is_none());
    }
}
