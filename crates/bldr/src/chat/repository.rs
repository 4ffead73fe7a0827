//! Chat message database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::ChatMessage;

/// Repository for chat message persistence.
#[derive(Debug, Clone)]
pub struct ChatRepository {
    pool: SqlitePool,
}

impl ChatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a message.
    pub async fn create(&self, message: &ChatMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, project_id, session_id, role, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.project_id)
        .bind(&message.session_id)
        .bind(message.role.to_string())
        .bind(&message.content)
        .bind(&message.created_at)
        .execute(&self.pool)
        .await
        .context("creating chat message")?;

        Ok(())
    }

    /// Messages for a project, newest first.
    pub async fn list_for_project(&self, project_id: &str, limit: i64) -> Result<Vec<ChatMessage>> {
        let messages = sqlx::query_as::<_, ChatMessage>(
            "SELECT id, project_id, session_id, role, content, created_at FROM messages WHERE project_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing messages for project")?;

        Ok(messages)
    }

    /// Most recent messages across all of a user's projects.
    pub async fn list_recent_for_owner(&self, owner_id: &str, limit: i64) -> Result<Vec<ChatMessage>> {
        let messages = sqlx::query_as::<_, ChatMessage>(
            r#"
            SELECT m.id, m.project_id, m.session_id, m.role, m.content, m.created_at
            FROM messages m
            JOIN projects p ON p.id = m.project_id
            WHERE p.owner_id = ?
            ORDER BY m.created_at DESC
            LIMIT ?
            "#,
        )
        .bind(owner_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing recent messages")?;

        Ok(messages)
    }
}
