//! Project handlers: CRUD, hydration, build start and cancel.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bldr_protocol::{BuildCommand, OperationType, SessionStatus, SessionView};
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::CurrentUser;
use crate::chat::{ChatMessage, ChatRole};
use crate::project::{CreateProjectRequest, Project};
use crate::session::Session;

/// Fetch a project and check ownership.
async fn owned_project(state: &AppState, user: &CurrentUser, id: &str) -> ApiResult<Project> {
    let project = state
        .projects
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project not found: {}", id)))?;

    if project.owner_id != user.id {
        return Err(ApiError::forbidden("project belongs to another user"));
    }

    Ok(project)
}

/// GET /api/projects
pub async fn list_projects(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<Project>>> {
    let projects = state.projects.list_for_owner(&user.id).await?;
    Ok(Json(projects))
}

/// POST /api/projects
pub async fn create_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    if req.slug.is_empty()
        || !req
            .slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ApiError::bad_request(
            "invalid slug: lowercase letters, digits, and dashes only",
        ));
    }

    let workspace_path = req.workspace_path.unwrap_or_else(|| {
        state
            .config
            .workspace_root
            .join(&req.slug)
            .to_string_lossy()
            .to_string()
    });

    let project = Project {
        id: Uuid::new_v4().to_string(),
        slug: req.slug,
        owner_id: user.id.clone(),
        runner_id: req.runner_id,
        workspace_path: Some(workspace_path),
        framework: None,
        dev_server_status: bldr_protocol::DevServerState::Stopped,
        dev_server_port: None,
        dev_server_error: None,
        tunnel_url: None,
        tunnel_error: None,
        created_at: Utc::now().to_rfc3339(),
    };

    state.projects.create(&project).await?;
    info!("Created project {} ({})", project.slug, project.id);

    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /api/projects/{id}
pub async fn get_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Project>> {
    let project = owned_project(&state, &user, &id).await?;
    Ok(Json(project))
}

/// Hydration payload: past sessions plus chat history.
#[derive(Debug, Serialize)]
pub struct ProjectMessages {
    pub sessions: Vec<SessionView>,
    pub messages: Vec<ChatMessage>,
}

/// GET /api/projects/{id}/messages
pub async fn project_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectMessages>> {
    let project = owned_project(&state, &user, &id).await?;

    let sessions = state.sessions.list_for_project(&project.id).await?;
    let messages = state.chat.list_for_project(&project.id, 200).await?;

    Ok(Json(ProjectMessages {
        sessions: sessions.iter().map(Session::view).collect(),
        messages,
    }))
}

/// Build request body.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub operation: Option<OperationType>,
    #[serde(default)]
    pub context: Option<Value>,
}

/// Build request acknowledgment.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub session_id: String,
    pub build_id: String,
    pub command_id: String,
    pub runner_id: String,
}

/// POST /api/projects/{id}/generate
///
/// Records a pending session, appends the user's prompt to chat, and queues
/// a build command for the project's runner.
pub async fn generate(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<(StatusCode, Json<GenerateResponse>)> {
    let project = owned_project(&state, &user, &id).await?;

    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }

    if let Some(open) = state.sessions.find_open_for_project(&project.id).await? {
        return Err(ApiError::conflict(format!(
            "project already has an open session: {}",
            open.id
        )));
    }

    // Runner affinity, falling back to any connected runner of the user.
    let runner_id = match &project.runner_id {
        Some(id) => id.clone(),
        None => state
            .registry
            .any_for_user(&user.id)
            .ok_or_else(|| ApiError::conflict("no runner connected for this user"))?,
    };
    if project.runner_id.is_none() {
        state.projects.set_runner(&project.id, &runner_id).await?;
    }

    let workspace_path = project.workspace_path.clone().unwrap_or_else(|| {
        state
            .config
            .workspace_root
            .join(&project.slug)
            .to_string_lossy()
            .to_string()
    });

    let session_id = Uuid::new_v4().to_string();
    let build_id = Uuid::new_v4().to_string();
    let command_id = Uuid::new_v4().to_string();
    let agent_id = req
        .agent
        .unwrap_or_else(|| state.config.default_agent_id.clone());
    let model_id = req
        .model
        .unwrap_or_else(|| state.config.default_model_id.clone());
    let operation = req.operation.unwrap_or_default();

    let session = Session {
        id: session_id.clone(),
        project_id: project.id.clone(),
        build_id: build_id.clone(),
        runner_id: Some(runner_id.clone()),
        agent_id: agent_id.clone(),
        model_id: model_id.clone(),
        operation,
        status: SessionStatus::Pending,
        last_seq: 0,
        orphaned_at: None,
        started_at: None,
        ended_at: None,
        summary: None,
        failure_cause: None,
        created_at: Utc::now().to_rfc3339(),
    };
    state.sessions.upsert(&session).await?;

    state
        .chat
        .create(&ChatMessage {
            id: Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            session_id: Some(session_id.clone()),
            role: ChatRole::User,
            content: req.prompt.clone(),
            created_at: Utc::now().to_rfc3339(),
        })
        .await?;

    state
        .registry
        .enqueue_command(
            &runner_id,
            BuildCommand {
                command_id: command_id.clone(),
                project_id: project.id.clone(),
                session_id: session_id.clone(),
                build_id: build_id.clone(),
                prompt: req.prompt,
                agent_id,
                model_id,
                operation,
                workspace_path,
                context: req.context,
            },
        )
        .await;

    info!(
        "Build requested for project {}: session {}",
        project.id, session_id
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateResponse {
            session_id,
            build_id,
            command_id,
            runner_id,
        }),
    ))
}

/// Cancel acknowledgment.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub session_id: String,
}

/// POST /api/projects/{id}/cancel-build
pub async fn cancel_build(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    let project = owned_project(&state, &user, &id).await?;

    let session = state
        .sessions
        .find_open_for_project(&project.id)
        .await?
        .ok_or_else(|| ApiError::not_found("no open session for project"))?;

    let runner_id = session
        .runner_id
        .clone()
        .or(project.runner_id.clone())
        .ok_or_else(|| ApiError::conflict("session has no runner"))?;

    info!("Cancel requested for session {}", session.id);
    state.registry.cancel_build(&runner_id, &session.id).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            session_id: session.id,
        }),
    ))
}
