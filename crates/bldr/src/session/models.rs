//! Session data models.

use bldr_protocol::{
    OperationType, SessionStatus, SessionView, TodoPhase, TodoStatus, TodoView, ToolCallState,
    ToolCallView,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

/// Errors from session store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A compare-and-set transition found the session in a status outside
    /// the allowed set.
    #[error("illegal transition for session {session_id}: current status not in {allowed:?}")]
    IllegalTransition {
        session_id: String,
        allowed: Vec<SessionStatus>,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// One invocation of the AI agent for a project.
///
/// Terminal statuses are immutable: once a session is completed, failed, or
/// cancelled no further transition succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub build_id: String,
    /// Runner that owns the in-flight build, if assigned.
    pub runner_id: Option<String>,
    pub agent_id: String,
    pub model_id: String,
    #[sqlx(try_from = "String")]
    pub operation: OperationType,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Highest event sequence persisted for this session. Replayed events
    /// at or below this value are no-ops.
    pub last_seq: i64,
    /// Set while the owning runner's transport is down; cleared on resume.
    pub orphaned_at: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub summary: Option<String>,
    pub failure_cause: Option<String>,
    pub created_at: String,
}

impl Session {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            build_id: self.build_id.clone(),
            agent_id: self.agent_id.clone(),
            model_id: self.model_id.clone(),
            status: self.status,
            operation: self.operation,
            started_at: self.started_at.clone(),
            ended_at: self.ended_at.clone(),
            summary: self.summary.clone(),
        }
    }
}

/// Persisted todo row. Indices within a session are dense: `[0, n)`.
#[derive(Debug, Clone, FromRow)]
pub struct TodoRow {
    pub session_id: String,
    pub todo_index: i64,
    pub content: String,
    pub active_form: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: TodoStatus,
    #[sqlx(try_from = "String")]
    pub phase: TodoPhase,
}

impl TodoRow {
    pub fn view(&self) -> TodoView {
        TodoView {
            index: self.todo_index,
            content: self.content.clone(),
            active_form: self.active_form.clone(),
            status: self.status,
            phase: self.phase,
        }
    }
}

/// Persisted tool-call row. Input/output are stored as JSON text.
#[derive(Debug, Clone, FromRow)]
pub struct ToolCallRow {
    pub session_id: String,
    pub tool_call_id: String,
    pub todo_index: i64,
    pub name: String,
    pub input: Option<String>,
    pub output: Option<String>,
    #[sqlx(try_from = "String")]
    pub state: ToolCallState,
    pub started_at: String,
    pub ended_at: Option<String>,
}

impl ToolCallRow {
    pub fn view(&self) -> ToolCallView {
        ToolCallView {
            tool_call_id: self.tool_call_id.clone(),
            todo_index: self.todo_index,
            name: self.name.clone(),
            input: self
                .input
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
            output: self
                .output
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
            state: self.state,
            started_at: self.started_at.clone(),
            ended_at: self.ended_at.clone(),
        }
    }
}
