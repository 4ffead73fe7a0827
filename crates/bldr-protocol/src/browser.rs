//! Control-plane -> browser fanout protocol.
//!
//! Browsers subscribe per project over WebSocket and hold only a projection
//! of session state. `state-recovery` is authoritative: clients replace any
//! in-memory state for the session when they receive one, so the server
//! never needs to merge conflicting views.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::update::{SessionStatus, TodoPhase, TodoStatus, ToolCallState, UpdateEnvelope};

// ============================================================================
// Snapshot views
// ============================================================================

/// Session projection sent to browsers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    pub project_id: String,
    pub build_id: String,
    pub agent_id: String,
    pub model_id: String,
    /// Required; a snapshot without a decodable status fails closed rather
    /// than guessing liveness.
    pub status: SessionStatus,
    pub operation: crate::runner::OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Todo projection, dense-indexed within its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoView {
    pub index: i64,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
    pub status: TodoStatus,
    pub phase: TodoPhase,
}

/// Tool-call projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallView {
    pub tool_call_id: String,
    /// -1 for planning tools not bound to a todo.
    pub todo_index: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub state: ToolCallState,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

/// Durable projection of a session, sufficient to rebuild the browser view.
///
/// Todos are ordered by index, tool calls by start time. Planning tools
/// (todo index -1) are kept out of the per-todo list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub session: SessionView,
    pub todos: Vec<TodoView>,
    pub tool_calls: Vec<ToolCallView>,
    pub planning_tools: Vec<ToolCallView>,
    /// Computed from the persisted session status, never from an in-memory
    /// flag.
    pub is_active: bool,
}

// ============================================================================
// Wire frames
// ============================================================================

/// Frame from server to browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame after the upgrade; carries the assigned client id.
    Connected { client_id: String },

    /// Authoritative snapshot; replaces client state for the session.
    StateRecovery(RecoverySnapshot),

    /// Snapshot could not be produced; the client should retry with backoff.
    StateRecoveryFailed { reason: String },

    /// Canonical updates in the order the per-session handler enqueued
    /// them. Arrays grow to absorb backpressure; updates are never dropped
    /// while the socket is writable.
    BatchUpdate { updates: Vec<UpdateEnvelope> },

    Heartbeat,
}

/// Frame from browser to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    HeartbeatAck,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Incoming;

    fn snapshot() -> RecoverySnapshot {
        RecoverySnapshot {
            session: SessionView {
                id: "s1".to_string(),
                project_id: "p1".to_string(),
                build_id: "b1".to_string(),
                agent_id: "claude-code".to_string(),
                model_id: "default".to_string(),
                status: SessionStatus::Completed,
                operation: crate::runner::OperationType::InitialBuild,
                started_at: Some("2026-07-01T10:00:00Z".to_string()),
                ended_at: Some("2026-07-01T10:05:00Z".to_string()),
                summary: Some("done".to_string()),
            },
            todos: vec![],
            tool_calls: vec![],
            planning_tools: vec![],
            is_active: false,
        }
    }

    #[test]
    fn test_state_recovery_frame() {
        let msg = ServerMessage::StateRecovery(snapshot());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "state-recovery");
        assert_eq!(json["is_active"], false);
        assert_eq!(json["session"]["status"], "completed");
    }

    #[test]
    fn test_snapshot_without_status_fails_closed() {
        let raw = serde_json::json!({
            "type": "state-recovery",
            "session": {
                "id": "s1",
                "project_id": "p1",
                "build_id": "b1",
                "agent_id": "claude-code",
                "model_id": "default",
                "operation": "initial-build"
            },
            "todos": [],
            "tool_calls": [],
            "planning_tools": [],
            "is_active": true
        });
        assert!(serde_json::from_value::<ServerMessage>(raw).is_err());
    }

    #[test]
    fn test_unknown_client_message_ignored() {
        let decoded: Incoming<ClientMessage> =
            serde_json::from_str(r#"{"type":"telemetry-blob","data":[]}"#).unwrap();
        assert!(matches!(decoded, Incoming::Unknown(_)));

        let decoded: Incoming<ClientMessage> =
            serde_json::from_str(r#"{"type":"heartbeat-ack"}"#).unwrap();
        assert!(matches!(
            decoded,
            Incoming::Known(ClientMessage::HeartbeatAck)
        ));
    }
}
