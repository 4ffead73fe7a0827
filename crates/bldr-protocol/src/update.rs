//! Canonical build-update types.
//!
//! Runner normalizers translate every agent backend's native event stream
//! into this single vocabulary. The control plane persists these updates and
//! fans the same shapes out to browsers, so the three hops (agent -> runner,
//! runner -> control plane, control plane -> browser) all speak one language.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

// ============================================================================
// Tolerant decoding
// ============================================================================

/// A decoded message that may carry an unrecognized payload.
///
/// Wire enums are internally tagged; a tag added by a newer peer would
/// otherwise fail deserialization of the whole frame. `Incoming` first tries
/// the known shape and falls back to preserving the raw JSON verbatim.
/// Receivers log and ignore [`Incoming::Unknown`].
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming<T> {
    Known(T),
    /// Payload we do not recognize, preserved opaquely.
    Unknown(Value),
}

impl<T> Incoming<T> {
    /// The known payload, if this frame decoded to one.
    pub fn known(self) -> Option<T> {
        match self {
            Incoming::Known(t) => Some(t),
            Incoming::Unknown(_) => None,
        }
    }

    pub fn as_known(&self) -> Option<&T> {
        match self {
            Incoming::Known(t) => Some(t),
            Incoming::Unknown(_) => None,
        }
    }
}

impl<T: Serialize> Serialize for Incoming<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Incoming::Known(t) => t.serialize(serializer),
            Incoming::Unknown(v) => v.serialize(serializer),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Incoming<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match T::deserialize(value.clone()) {
            Ok(known) => Ok(Incoming::Known(known)),
            Err(_) => Ok(Incoming::Unknown(value)),
        }
    }
}

// ============================================================================
// Todos
// ============================================================================

/// Todo status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    /// Parse from any agent's spelling.
    ///
    /// Agents disagree on how to write "in progress"; every casing,
    /// hyphenation, and spacing collapses to [`TodoStatus::InProgress`].
    pub fn parse(s: &str) -> Self {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "inprogress" | "active" | "running" | "doing" => Self::InProgress,
            "completed" | "complete" | "done" => Self::Completed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for TodoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl TryFrom<String> for TodoStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Which planning phase a todo list belongs to.
///
/// Template-phase todos track project scaffolding; their completion is
/// observable but never terminates a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TodoPhase {
    Template,
    #[default]
    Build,
}

impl std::fmt::Display for TodoPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Template => write!(f, "template"),
            Self::Build => write!(f, "build"),
        }
    }
}

impl std::str::FromStr for TodoPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "template" => Ok(Self::Template),
            "build" => Ok(Self::Build),
            _ => Err(format!("unknown todo phase: {}", s)),
        }
    }
}

impl TryFrom<String> for TodoPhase {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One unit of planned work inside a session, as emitted by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    /// Present-continuous form shown while the todo is in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
    pub status: TodoStatus,
}

// ============================================================================
// Tool calls
// ============================================================================

/// Tool-call lifecycle state.
///
/// The sequence observed by the store is always a prefix of
/// `input-streaming, input-available, output-available | error` and never
/// regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallState {
    InputStreaming,
    InputAvailable,
    OutputAvailable,
    Error,
}

impl ToolCallState {
    /// Ordering rank used to enforce monotonicity.
    pub fn rank(self) -> u8 {
        match self {
            Self::InputStreaming => 0,
            Self::InputAvailable => 1,
            Self::OutputAvailable => 2,
            Self::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::OutputAvailable | Self::Error)
    }
}

impl std::fmt::Display for ToolCallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputStreaming => write!(f, "input-streaming"),
            Self::InputAvailable => write!(f, "input-available"),
            Self::OutputAvailable => write!(f, "output-available"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ToolCallState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input-streaming" => Ok(Self::InputStreaming),
            "input-available" => Ok(Self::InputAvailable),
            "output-available" => Ok(Self::OutputAvailable),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown tool call state: {}", s)),
        }
    }
}

impl TryFrom<String> for ToolCallState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        value.parse()
    }
}

// ============================================================================
// Session status
// ============================================================================

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, command not yet picked up by a runner.
    Pending,
    /// Runner has emitted the first event.
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Terminal outcome carried by `build-complete`.
///
/// Runners only emit `completed` or `failed`; `cancelled` appears in
/// broadcasts the control plane synthesizes when a cancel grace timer
/// expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl BuildOutcome {
    pub fn session_status(self) -> SessionStatus {
        match self {
            Self::Completed => SessionStatus::Completed,
            Self::Failed => SessionStatus::Failed,
            Self::Cancelled => SessionStatus::Cancelled,
        }
    }
}

// ============================================================================
// Canonical updates
// ============================================================================

/// Canonical build update payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpdatePayload {
    /// Session transitions to active. Idempotent per session.
    Start {
        session_id: String,
        build_id: String,
        project_id: String,
        agent_id: String,
        model_id: String,
    },

    /// Replaces the todo list. Shrinking the list prunes higher indices and
    /// their tool calls.
    TodosUpdate {
        todos: Vec<TodoItem>,
        /// Index of the todo currently in progress, -1 if none.
        active_index: i64,
        phase: TodoPhase,
    },

    /// Tool input is fully known; creates the tool call if unseen.
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        /// -1 marks a planning tool not bound to any todo. Absent means
        /// "inherit the session's active todo index".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        todo_index: Option<i64>,
        input: Value,
    },

    /// Tool finished. Requires a prior `tool-input-available`.
    ToolOutputAvailable { tool_call_id: String, output: Value },

    /// Tool failed. Same precondition as `tool-output-available`.
    ToolError { tool_call_id: String, error: String },

    /// Streaming assistant text. Forwarded live, persisted only as the
    /// concatenated assistant message at session close.
    TextDelta { message_id: String, delta: String },

    /// Summary text stored on the session; not terminal by itself.
    BuildSummary { summary: String },

    /// Terminal. The session transitions to the given status.
    BuildComplete {
        status: BuildOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

impl UpdatePayload {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::TodosUpdate { .. } => "todos-update",
            Self::ToolInputAvailable { .. } => "tool-input-available",
            Self::ToolOutputAvailable { .. } => "tool-output-available",
            Self::ToolError { .. } => "tool-error",
            Self::TextDelta { .. } => "text-delta",
            Self::BuildSummary { .. } => "build-summary",
            Self::BuildComplete { .. } => "build-complete",
        }
    }
}

/// Optional tracing context attached to an update.
///
/// Receivers must treat a missing context as benign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

/// One canonical update addressed to a session, with its replay position.
///
/// `seq` is monotonic per session across runner reconnects; the control
/// plane drops any envelope at or below the last persisted sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    pub session_id: String,
    pub seq: u64,
    pub update: Incoming<UpdatePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

impl UpdateEnvelope {
    pub fn new(session_id: impl Into<String>, seq: u64, update: UpdatePayload) -> Self {
        Self {
            session_id: session_id.into(),
            seq,
            update: Incoming::Known(update),
            trace: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_todo_status_parse_spellings() {
        for s in [
            "in_progress",
            "in progress",
            "In Progress",
            "IN-PROGRESS",
            "inProgress",
        ] {
            assert_eq!(TodoStatus::parse(s), TodoStatus::InProgress, "{}", s);
        }
        assert_eq!(TodoStatus::parse("Completed"), TodoStatus::Completed);
        assert_eq!(TodoStatus::parse("done"), TodoStatus::Completed);
        assert_eq!(TodoStatus::parse("pending"), TodoStatus::Pending);
        assert_eq!(TodoStatus::parse("???"), TodoStatus::Pending);
    }

    #[test]
    fn test_tool_state_rank_monotonic() {
        assert!(ToolCallState::InputStreaming.rank() < ToolCallState::InputAvailable.rank());
        assert!(ToolCallState::InputAvailable.rank() < ToolCallState::OutputAvailable.rank());
        assert_eq!(
            ToolCallState::OutputAvailable.rank(),
            ToolCallState::Error.rank()
        );
    }

    #[test]
    fn test_update_payload_tagged_serialization() {
        let update = UpdatePayload::TodosUpdate {
            todos: vec![TodoItem {
                content: "Create layout".to_string(),
                active_form: Some("Creating layout".to_string()),
                status: TodoStatus::InProgress,
            }],
            active_index: 0,
            phase: TodoPhase::Build,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "todos-update");
        assert_eq!(json["todos"][0]["status"], "in_progress");
        assert_eq!(json["phase"], "build");
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = UpdateEnvelope::new(
            "s1",
            7,
            UpdatePayload::ToolInputAvailable {
                tool_call_id: "tc-1".to_string(),
                tool_name: "Read".to_string(),
                todo_index: Some(2),
                input: json!({"file": "x"}),
            },
        );
        let text = serde_json::to_string(&envelope).unwrap();
        let back: UpdateEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_unknown_update_preserved() {
        let raw = json!({
            "session_id": "s1",
            "seq": 3,
            "update": {"type": "hologram-render", "frames": 12}
        });
        let envelope: UpdateEnvelope = serde_json::from_value(raw.clone()).unwrap();
        match &envelope.update {
            Incoming::Unknown(v) => assert_eq!(v["type"], "hologram-render"),
            Incoming::Known(_) => panic!("unknown update decoded as known"),
        }
        // Re-serializing preserves the original payload verbatim.
        let round = serde_json::to_value(&envelope).unwrap();
        assert_eq!(round["update"], raw["update"]);
    }

    #[test]
    fn test_missing_trace_context_is_benign() {
        let raw = json!({
            "session_id": "s1",
            "seq": 1,
            "update": {"type": "build-summary", "summary": "done"}
        });
        let envelope: UpdateEnvelope = serde_json::from_value(raw).unwrap();
        assert!(envelope.trace.is_none());
        assert!(matches!(
            envelope.update,
            Incoming::Known(UpdatePayload::BuildSummary { .. })
        ));
    }
}
