//! Agent backends and event normalization.
//!
//! Two native vocabularies come in (Claude-like stream JSON, Codex-like
//! item events); one canonical update stream goes out. Each build owns one
//! adapter instance; the adapter owns all per-session translation state.

mod claude;
mod codex;
mod normalize;
mod tolerant;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use normalize::NormalizerState;
pub use tolerant::parse_tolerant_object;

use bldr_protocol::UpdatePayload;

use crate::config::RunnerConfig;

/// Which native event vocabulary an agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    ClaudeLike,
    CodexLike,
}

impl AgentKind {
    /// Classify an agent id from a build command.
    pub fn from_agent_id(agent_id: &str) -> Self {
        if agent_id.to_lowercase().contains("codex") {
            Self::CodexLike
        } else {
            Self::ClaudeLike
        }
    }

    /// Program and arguments to spawn this agent for a prompt.
    pub fn command(&self, config: &RunnerConfig, prompt: &str, model_id: &str) -> (String, Vec<String>) {
        match self {
            Self::ClaudeLike => (
                config.claude_binary.clone(),
                vec![
                    "-p".to_string(),
                    prompt.to_string(),
                    "--output-format".to_string(),
                    "stream-json".to_string(),
                    "--verbose".to_string(),
                    "--model".to_string(),
                    model_id.to_string(),
                ],
            ),
            Self::CodexLike => (
                config.codex_binary.clone(),
                vec![
                    "exec".to_string(),
                    "--json".to_string(),
                    "--model".to_string(),
                    model_id.to_string(),
                    prompt.to_string(),
                ],
            ),
        }
    }
}

/// Per-build adapter translating native stdout lines into canonical
/// updates.
pub enum Adapter {
    Claude(ClaudeAdapter),
    Codex(CodexAdapter),
}

impl Adapter {
    pub fn new(kind: AgentKind) -> Self {
        match kind {
            AgentKind::ClaudeLike => Self::Claude(ClaudeAdapter::new()),
            AgentKind::CodexLike => Self::Codex(CodexAdapter::new()),
        }
    }

    /// Translate one stdout line. Unparseable or irrelevant lines yield
    /// nothing.
    pub fn translate_line(&mut self, line: &str) -> Vec<UpdatePayload> {
        match self {
            Self::Claude(adapter) => adapter.translate_line(line),
            Self::Codex(adapter) => adapter.translate_line(line),
        }
    }

    /// Whether a terminal `build-complete` has been produced.
    pub fn saw_terminal(&self) -> bool {
        match self {
            Self::Claude(adapter) => adapter.saw_terminal(),
            Self::Codex(adapter) => adapter.saw_terminal(),
        }
    }
}
