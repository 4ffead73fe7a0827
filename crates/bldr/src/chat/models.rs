//! Chat message data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    #[default]
    User,
    Assistant,
    System,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for ChatRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("unknown chat role: {}", s)),
        }
    }
}

impl TryFrom<String> for ChatRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A persisted chat message. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChatMessage {
    pub id: String,
    pub project_id: String,
    /// Session the message belongs to, when it was produced by a build.
    pub session_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub role: ChatRole,
    pub content: String,
    pub created_at: String,
}

/// Request to append a chat message.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMessageRequest {
    pub project_id: String,
    pub content: String,
    #[serde(default)]
    pub role: ChatRole,
}
