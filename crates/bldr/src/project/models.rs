//! Project data models.

use bldr_protocol::DevServerState;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A logical workspace builds run against.
///
/// Created by the control plane; the runner mutates framework, paths, and
/// dev-server state. Browsers never write to it directly.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    /// Unique project ID.
    pub id: String,
    /// URL-friendly name, unique.
    pub slug: String,
    /// User who owns this project.
    pub owner_id: String,
    /// Runner affinity: the runner that hosts this project's workspace.
    pub runner_id: Option<String>,
    /// Path to the workspace directory on the runner.
    pub workspace_path: Option<String>,
    /// Detected framework (next, vite, astro, angular, ...).
    pub framework: Option<String>,
    /// Dev-server state as last reported by the runner.
    #[sqlx(try_from = "String")]
    pub dev_server_status: DevServerState,
    pub dev_server_port: Option<i64>,
    pub dev_server_error: Option<String>,
    /// Public tunnel URL, when a tunnel is up.
    pub tunnel_url: Option<String>,
    /// Last tunnel bring-up failure, surfaced to the UI.
    pub tunnel_error: Option<String>,
    pub created_at: String,
}

/// Request to create a new project.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectRequest {
    pub slug: String,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub runner_id: Option<String>,
}
