//! Session database repository.
//!
//! Writes preserve per-session order (callers serialize per session) and
//! every mutation is visible to `fetch_recovery_snapshot` before the
//! corresponding broadcast goes out.

use anyhow::{Context, Result};
use bldr_protocol::{
    RecoverySnapshot, SessionStatus, TodoItem, TodoPhase, ToolCallState,
};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{Session, StoreError, TodoRow, ToolCallRow};

/// All session columns for SELECT queries.
const SESSION_COLUMNS: &str = r#"
    id, project_id, build_id, runner_id, agent_id, model_id, operation, status,
    last_seq, orphaned_at, started_at, ended_at, summary, failure_cause, created_at
"#;

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Repository for build-session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a session, idempotent by id.
    pub async fn upsert(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO generation_sessions (
                id, project_id, build_id, runner_id, agent_id, model_id, operation, status,
                last_seq, orphaned_at, started_at, ended_at, summary, failure_cause, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&session.id)
        .bind(&session.project_id)
        .bind(&session.build_id)
        .bind(&session.runner_id)
        .bind(&session.agent_id)
        .bind(&session.model_id)
        .bind(session.operation.to_string())
        .bind(session.status.to_string())
        .bind(session.last_seq)
        .bind(&session.orphaned_at)
        .bind(&session.started_at)
        .bind(&session.ended_at)
        .bind(&session.summary)
        .bind(&session.failure_cause)
        .bind(&session.created_at)
        .execute(&self.pool)
        .await
        .context("upserting session")?;

        Ok(())
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {} FROM generation_sessions WHERE id = ?",
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        Ok(session)
    }

    /// List sessions for a project, newest first.
    pub async fn list_for_project(&self, project_id: &str) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM generation_sessions WHERE project_id = ? ORDER BY created_at DESC",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions for project")?;

        Ok(sessions)
    }

    /// The non-terminal session for a project, if one exists.
    pub async fn find_open_for_project(&self, project_id: &str) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {} FROM generation_sessions WHERE project_id = ? AND status IN ('pending', 'active') ORDER BY created_at DESC LIMIT 1",
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .context("finding open session for project")?;

        Ok(session)
    }

    /// Most recent session for a project regardless of status.
    pub async fn latest_for_project(&self, project_id: &str) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {} FROM generation_sessions WHERE project_id = ? ORDER BY created_at DESC LIMIT 1",
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .context("finding latest session for project")?;

        Ok(session)
    }

    /// Non-terminal sessions owned by a runner, used at reconnect to
    /// reconcile resume claims.
    pub async fn list_open_for_runner(&self, runner_id: &str) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM generation_sessions WHERE runner_id = ? AND status IN ('pending', 'active') ORDER BY created_at ASC",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(runner_id)
            .fetch_all(&self.pool)
            .await
            .context("listing open sessions for runner")?;

        Ok(sessions)
    }

    /// Atomic compare-and-set status transition.
    ///
    /// Fails with [`StoreError::IllegalTransition`] when the current status
    /// is not in `allowed`. Terminal transitions stamp `ended_at`.
    pub async fn transition(
        &self,
        id: &str,
        allowed: &[SessionStatus],
        to: SessionStatus,
        summary: Option<&str>,
        failure_cause: Option<&str>,
    ) -> Result<(), StoreError> {
        let placeholders = vec!["?"; allowed.len()].join(", ");
        let query = format!(
            r#"
            UPDATE generation_sessions
            SET status = ?,
                started_at = CASE WHEN ? = 'active' AND started_at IS NULL THEN ? ELSE started_at END,
                ended_at = CASE WHEN ? IN ('completed', 'failed', 'cancelled') THEN ? ELSE ended_at END,
                summary = COALESCE(?, summary),
                failure_cause = COALESCE(?, failure_cause)
            WHERE id = ? AND status IN ({})
            "#,
            placeholders
        );

        let to_str = to.to_string();
        let ts = now();
        let mut q = sqlx::query(&query)
            .bind(&to_str)
            .bind(&to_str)
            .bind(&ts)
            .bind(&to_str)
            .bind(&ts)
            .bind(summary)
            .bind(failure_cause)
            .bind(id);
        for status in allowed {
            q = q.bind(status.to_string());
        }

        let result = q.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT id FROM generation_sessions WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(StoreError::SessionNotFound(id.to_string()));
            }
            return Err(StoreError::IllegalTransition {
                session_id: id.to_string(),
                allowed: allowed.to_vec(),
            });
        }

        Ok(())
    }

    /// Store the latest build summary without touching the status.
    pub async fn set_summary(&self, id: &str, summary: &str) -> Result<()> {
        sqlx::query("UPDATE generation_sessions SET summary = ? WHERE id = ?")
            .bind(summary)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting session summary")?;

        Ok(())
    }

    /// Advance the replay watermark for a session.
    pub async fn set_last_seq(&self, id: &str, seq: i64) -> Result<()> {
        sqlx::query("UPDATE generation_sessions SET last_seq = ? WHERE id = ? AND last_seq < ?")
            .bind(seq)
            .bind(id)
            .bind(seq)
            .execute(&self.pool)
            .await
            .context("setting session last_seq")?;

        Ok(())
    }

    /// Bind a session to the runner executing it.
    pub async fn set_runner(&self, id: &str, runner_id: &str) -> Result<()> {
        sqlx::query("UPDATE generation_sessions SET runner_id = ? WHERE id = ?")
            .bind(runner_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting session runner")?;

        Ok(())
    }

    // ========================================================================
    // Orphan bookkeeping
    // ========================================================================

    /// Mark every active session owned by a runner as orphaned.
    ///
    /// Status stays `active`; the session remains resumable until the orphan
    /// window lapses. Returns the affected session ids.
    pub async fn mark_orphaned(&self, runner_id: &str) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM generation_sessions WHERE runner_id = ? AND status = 'active' AND orphaned_at IS NULL",
        )
        .bind(runner_id)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions to orphan")?;

        sqlx::query(
            "UPDATE generation_sessions SET orphaned_at = ? WHERE runner_id = ? AND status = 'active' AND orphaned_at IS NULL",
        )
        .bind(now())
        .bind(runner_id)
        .execute(&self.pool)
        .await
        .context("marking sessions orphaned")?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Clear the orphan marker for sessions a reconnecting runner claims.
    pub async fn resume_orphans(&self, runner_id: &str, session_ids: &[String]) -> Result<Vec<String>> {
        let mut resumed = Vec::new();
        for id in session_ids {
            let result = sqlx::query(
                "UPDATE generation_sessions SET orphaned_at = NULL, runner_id = ? WHERE id = ? AND status IN ('pending', 'active')",
            )
            .bind(runner_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("resuming orphaned session")?;
            if result.rows_affected() > 0 {
                resumed.push(id.clone());
            }
        }

        Ok(resumed)
    }

    /// Whether a session is still orphaned (transport down, not yet failed).
    pub async fn is_orphaned(&self, id: &str) -> Result<bool> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT orphaned_at FROM generation_sessions WHERE id = ? AND status = 'active'",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("checking orphan marker")?;

        Ok(matches!(row, Some((Some(_),))))
    }

    // ========================================================================
    // Todos
    // ========================================================================

    /// Replace the todo list for a session.
    ///
    /// Bulk upsert keyed by `(session_id, todo_index)`, then prune todo rows
    /// at indices >= the new count and any tool calls pointing at them, in
    /// one transaction. This keeps indices dense in `[0, n)`.
    pub async fn replace_todos(
        &self,
        session_id: &str,
        todos: &[TodoItem],
        phase: TodoPhase,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting todo txn")?;

        for (index, todo) in todos.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO generation_todos (session_id, todo_index, content, active_form, status, phase)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(session_id, todo_index) DO UPDATE SET
                    content = excluded.content,
                    active_form = excluded.active_form,
                    status = excluded.status,
                    phase = excluded.phase
                "#,
            )
            .bind(session_id)
            .bind(index as i64)
            .bind(&todo.content)
            .bind(&todo.active_form)
            .bind(todo.status.to_string())
            .bind(phase.to_string())
            .execute(&mut *tx)
            .await
            .context("upserting todo")?;
        }

        let count = todos.len() as i64;
        sqlx::query("DELETE FROM generation_todos WHERE session_id = ? AND todo_index >= ?")
            .bind(session_id)
            .bind(count)
            .execute(&mut *tx)
            .await
            .context("pruning todos")?;

        sqlx::query("DELETE FROM generation_tool_calls WHERE session_id = ? AND todo_index >= ?")
            .bind(session_id)
            .bind(count)
            .execute(&mut *tx)
            .await
            .context("pruning tool calls of removed todos")?;

        tx.commit().await.context("committing todo txn")?;

        Ok(())
    }

    /// Todos for a session, index order.
    pub async fn list_todos(&self, session_id: &str) -> Result<Vec<TodoRow>> {
        let todos = sqlx::query_as::<_, TodoRow>(
            "SELECT session_id, todo_index, content, active_form, status, phase FROM generation_todos WHERE session_id = ? ORDER BY todo_index ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing todos")?;

        Ok(todos)
    }

    /// Number of persisted todos for a session.
    pub async fn todo_count(&self, session_id: &str) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM generation_todos WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await
                .context("counting todos")?;

        Ok(count.0)
    }

    // ========================================================================
    // Tool calls
    // ========================================================================

    /// Get a tool call by its id within a session.
    pub async fn get_tool_call(
        &self,
        session_id: &str,
        tool_call_id: &str,
    ) -> Result<Option<ToolCallRow>> {
        let row = sqlx::query_as::<_, ToolCallRow>(
            "SELECT session_id, tool_call_id, todo_index, name, input, output, state, started_at, ended_at FROM generation_tool_calls WHERE session_id = ? AND tool_call_id = ?",
        )
        .bind(session_id)
        .bind(tool_call_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching tool call")?;

        Ok(row)
    }

    /// Record tool input, creating the call on first sight.
    ///
    /// A conflict on `(session_id, tool_call_id)` updates the input only
    /// while the call is still open; terminal states never regress.
    pub async fn upsert_tool_input(
        &self,
        session_id: &str,
        tool_call_id: &str,
        name: &str,
        todo_index: i64,
        input: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO generation_tool_calls (session_id, tool_call_id, todo_index, name, input, state, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, tool_call_id) DO UPDATE SET
                input = excluded.input,
                todo_index = excluded.todo_index,
                name = excluded.name,
                state = excluded.state
            WHERE generation_tool_calls.state IN ('input-streaming', 'input-available')
            "#,
        )
        .bind(session_id)
        .bind(tool_call_id)
        .bind(todo_index)
        .bind(name)
        .bind(input.to_string())
        .bind(ToolCallState::InputAvailable.to_string())
        .bind(now())
        .execute(&self.pool)
        .await
        .context("upserting tool input")?;

        Ok(())
    }

    /// Move an open tool call to a terminal state.
    ///
    /// Returns false when the call is missing or already terminal; the
    /// caller drops the update in that case.
    pub async fn finish_tool_call(
        &self,
        session_id: &str,
        tool_call_id: &str,
        state: ToolCallState,
        output: &serde_json::Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE generation_tool_calls
            SET state = ?, output = ?, ended_at = ?
            WHERE session_id = ? AND tool_call_id = ?
              AND state IN ('input-streaming', 'input-available')
            "#,
        )
        .bind(state.to_string())
        .bind(output.to_string())
        .bind(now())
        .bind(session_id)
        .bind(tool_call_id)
        .execute(&self.pool)
        .await
        .context("finishing tool call")?;

        Ok(result.rows_affected() > 0)
    }

    /// Tool calls for a session, oldest first.
    pub async fn list_tool_calls(&self, session_id: &str) -> Result<Vec<ToolCallRow>> {
        let rows = sqlx::query_as::<_, ToolCallRow>(
            "SELECT session_id, tool_call_id, todo_index, name, input, output, state, started_at, ended_at FROM generation_tool_calls WHERE session_id = ? ORDER BY started_at ASC, tool_call_id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing tool calls")?;

        Ok(rows)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Durable projection of a session, sufficient to rebuild the browser
    /// view. `is_active` comes from the persisted status alone.
    pub async fn fetch_recovery_snapshot(
        &self,
        session_id: &str,
    ) -> Result<Option<RecoverySnapshot>> {
        let Some(session) = self.get(session_id).await? else {
            return Ok(None);
        };

        let todos = self.list_todos(session_id).await?;
        let tools = self.list_tool_calls(session_id).await?;

        let (planning, bound): (Vec<_>, Vec<_>) =
            tools.into_iter().partition(|t| t.todo_index < 0);

        let is_active = session.status == SessionStatus::Active;

        Ok(Some(RecoverySnapshot {
            session: session.view(),
            todos: todos.iter().map(TodoRow::view).collect(),
            tool_calls: bound.iter().map(ToolCallRow::view).collect(),
            planning_tools: planning.iter().map(ToolCallRow::view).collect(),
            is_active,
        }))
    }
}
