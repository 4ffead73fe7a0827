//! Runner <-> control-plane wire protocol.
//!
//! One long-lived WebSocket per connected runner carries JSON frames tagged
//! with a `kind` discriminator. Frames on a single channel are ordered;
//! replay safety across reconnects comes from the per-session `seq` on
//! [`UpdateEnvelope`](crate::update::UpdateEnvelope), not from the channel.
//!
//! The runner is responsible for:
//! - Spawning agent processes and normalizing their native events
//! - Executing build commands dispatched by the control plane
//! - Managing dev servers and tunnels, reporting their state upstream

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::update::UpdateEnvelope;

// ============================================================================
// Registration
// ============================================================================

/// Runner hello, sent as the first frame after the socket opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerHello {
    /// Stable runner identifier, unique per user.
    pub runner_id: String,
    /// Hostname of the machine running the agent.
    pub hostname: String,
    /// Runner version.
    pub version: String,
    /// Operating system.
    pub os: String,
    /// Maximum concurrent builds this runner accepts.
    pub max_builds: u32,
    /// Session ids of builds still running locally that the runner wants to
    /// resume streaming after a reconnect.
    #[serde(default)]
    pub resume: Vec<String>,
}

// ============================================================================
// Commands
// ============================================================================

/// What kind of build a command requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    #[default]
    InitialBuild,
    Enhancement,
    FocusedEdit,
    Continuation,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitialBuild => write!(f, "initial-build"),
            Self::Enhancement => write!(f, "enhancement"),
            Self::FocusedEdit => write!(f, "focused-edit"),
            Self::Continuation => write!(f, "continuation"),
        }
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial-build" => Ok(Self::InitialBuild),
            "enhancement" => Ok(Self::Enhancement),
            "focused-edit" => Ok(Self::FocusedEdit),
            "continuation" => Ok(Self::Continuation),
            _ => Err(format!("unknown operation type: {}", s)),
        }
    }
}

impl TryFrom<String> for OperationType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A build work item dispatched from the control plane to a runner.
///
/// Retries after an ack timeout carry the same `command_id`; delivery is
/// at-most-once per `(session_id, runner)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildCommand {
    pub command_id: String,
    pub project_id: String,
    pub session_id: String,
    pub build_id: String,
    pub prompt: String,
    pub agent_id: String,
    pub model_id: String,
    #[serde(default)]
    pub operation: OperationType,
    pub workspace_path: String,
    /// Free-form context forwarded to the agent (selected element, prior
    /// summary, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

// ============================================================================
// Dev servers
// ============================================================================

/// Dev-server process state as reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl std::fmt::Display for DevServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for DevServerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown dev server state: {}", s)),
        }
    }
}

impl TryFrom<String> for DevServerState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Wire frames
// ============================================================================

/// Frame from runner to control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RunnerMessage {
    Hello(RunnerHello),

    Heartbeat,

    /// One canonical update from a build session.
    RunnerEvent(UpdateEnvelope),

    /// The runner accepted a dispatched command.
    CommandAck { command_id: String },

    /// The runner finished (or failed to start) a command.
    CommandResult {
        command_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A tunnel for a project's dev server is publicly reachable.
    TunnelAnnounced {
        project_id: String,
        url: String,
        port: u16,
    },

    /// Tunnel bring-up failed. Permanent failures (missing binary, port in
    /// use, permission denied) were not retried and need user action.
    TunnelFailed {
        project_id: String,
        error: String,
        permanent: bool,
    },

    /// Dev-server state transition for a project.
    DevServerStatus {
        project_id: String,
        state: DevServerState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        /// Framework detected from the workspace, reported on start.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        framework: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Frame from control plane to runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Handshake accepted; carries the server-assigned connection id.
    HelloAck { connection_id: String },

    Heartbeat,

    CommandDispatch(BuildCommand),

    /// Stop the AI process for a session cooperatively and emit a terminal
    /// event.
    CancelBuild { session_id: String },

    /// Server is closing the channel.
    Goodbye { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::{Incoming, UpdatePayload};

    #[test]
    fn test_hello_roundtrip() {
        let hello = RunnerMessage::Hello(RunnerHello {
            runner_id: "rnr-alice-01".to_string(),
            hostname: "alice-laptop".to_string(),
            version: "0.2.1".to_string(),
            os: "linux".to_string(),
            max_builds: 2,
            resume: vec!["s1".to_string()],
        });
        let json = serde_json::to_string(&hello).unwrap();
        assert!(json.contains("\"kind\":\"hello\""));
        assert!(json.contains("\"resume\":[\"s1\"]"));
        let back: RunnerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hello);
    }

    #[test]
    fn test_runner_event_frame() {
        let msg = RunnerMessage::RunnerEvent(crate::update::UpdateEnvelope::new(
            "s1",
            4,
            UpdatePayload::BuildSummary {
                summary: "done".to_string(),
            },
        ));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "runner-event");
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["seq"], 4);
    }

    #[test]
    fn test_unknown_frame_preserved() {
        let raw = r#"{"kind":"quantum-sync","payload":{"x":1}}"#;
        let decoded: Incoming<RunnerMessage> = serde_json::from_str(raw).unwrap();
        assert!(matches!(decoded, Incoming::Unknown(_)));
    }

    #[test]
    fn test_command_dispatch_frame() {
        let cmd = ControlMessage::CommandDispatch(BuildCommand {
            command_id: "cmd-1".to_string(),
            project_id: "p1".to_string(),
            session_id: "s1".to_string(),
            build_id: "b1".to_string(),
            prompt: "make a hello page".to_string(),
            agent_id: "claude-code".to_string(),
            model_id: "default".to_string(),
            operation: OperationType::InitialBuild,
            workspace_path: "/srv/workspaces/p1".to_string(),
            context: None,
        });
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["kind"], "command-dispatch");
        assert_eq!(json["operation"], "initial-build");
    }
}
