//! Project database repository.

use anyhow::{Context, Result};
use bldr_protocol::DevServerState;
use sqlx::SqlitePool;

use super::models::Project;

/// All project columns for SELECT queries.
const PROJECT_COLUMNS: &str = r#"
    id, slug, owner_id, runner_id, workspace_path, framework,
    dev_server_status, dev_server_port, dev_server_error, tunnel_url, tunnel_error, created_at
"#;

/// Repository for project persistence.
#[derive(Debug, Clone)]
pub struct ProjectRepository {
    pool: SqlitePool,
}

impl ProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new project.
    pub async fn create(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (
                id, slug, owner_id, runner_id, workspace_path, framework,
                dev_server_status, dev_server_port, dev_server_error, tunnel_url, tunnel_error, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&project.id)
        .bind(&project.slug)
        .bind(&project.owner_id)
        .bind(&project.runner_id)
        .bind(&project.workspace_path)
        .bind(&project.framework)
        .bind(project.dev_server_status.to_string())
        .bind(project.dev_server_port)
        .bind(&project.dev_server_error)
        .bind(&project.tunnel_url)
        .bind(&project.tunnel_error)
        .bind(&project.created_at)
        .execute(&self.pool)
        .await
        .context("creating project")?;

        Ok(())
    }

    /// Get a project by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Project>> {
        let query = format!("SELECT {} FROM projects WHERE id = ?", PROJECT_COLUMNS);
        let project = sqlx::query_as::<_, Project>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching project")?;

        Ok(project)
    }

    /// List projects owned by a user.
    pub async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Project>> {
        let query = format!(
            "SELECT {} FROM projects WHERE owner_id = ? ORDER BY created_at DESC",
            PROJECT_COLUMNS
        );
        let projects = sqlx::query_as::<_, Project>(&query)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .context("listing projects for owner")?;

        Ok(projects)
    }

    /// Pin a project to a runner.
    pub async fn set_runner(&self, id: &str, runner_id: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET runner_id = ? WHERE id = ?")
            .bind(runner_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting project runner")?;

        Ok(())
    }

    /// Record the framework the runner detected.
    pub async fn set_framework(&self, id: &str, framework: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET framework = ? WHERE id = ?")
            .bind(framework)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting project framework")?;

        Ok(())
    }

    /// Record a dev-server state transition reported by the runner.
    ///
    /// A stopped or failed dev server loses its tunnel URL as well.
    pub async fn set_dev_server_status(
        &self,
        id: &str,
        state: DevServerState,
        port: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        let clears_tunnel = matches!(state, DevServerState::Stopped | DevServerState::Failed);
        if clears_tunnel {
            sqlx::query(
                "UPDATE projects SET dev_server_status = ?, dev_server_port = ?, dev_server_error = ?, tunnel_url = NULL WHERE id = ?",
            )
            .bind(state.to_string())
            .bind(port)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating dev server status")?;
        } else {
            sqlx::query(
                "UPDATE projects SET dev_server_status = ?, dev_server_port = ?, dev_server_error = ? WHERE id = ?",
            )
            .bind(state.to_string())
            .bind(port)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating dev server status")?;
        }

        Ok(())
    }

    /// Record the public tunnel URL for a project.
    pub async fn set_tunnel_url(&self, id: &str, url: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE projects SET tunnel_url = ?, tunnel_error = NULL WHERE id = ?")
            .bind(url)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting tunnel url")?;

        Ok(())
    }

    /// Record a tunnel bring-up failure.
    pub async fn set_tunnel_error(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET tunnel_error = ?, tunnel_url = NULL WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting tunnel error")?;

        Ok(())
    }
}
