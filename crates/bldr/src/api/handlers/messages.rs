//! Chat message handlers.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::CurrentUser;
use crate::chat::{ChatMessage, CreateMessageRequest};

#[derive(Debug, Deserialize)]
pub struct ListMessagesParams {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

/// GET /api/messages
pub async fn list_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(params): Query<ListMessagesParams>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    let limit = params.limit.clamp(1, 500);

    let messages = match params.project_id {
        Some(project_id) => {
            let project = state
                .projects
                .get(&project_id)
                .await?
                .ok_or_else(|| ApiError::not_found("project not found"))?;
            if project.owner_id != user.id {
                return Err(ApiError::forbidden("project belongs to another user"));
            }
            state.chat.list_for_project(&project_id, limit).await?
        }
        None => state.chat.list_recent_for_owner(&user.id, limit).await?,
    };

    Ok(Json(messages))
}

/// POST /api/messages
pub async fn append_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateMessageRequest>,
) -> ApiResult<(StatusCode, Json<ChatMessage>)> {
    let project = state
        .projects
        .get(&req.project_id)
        .await?
        .ok_or_else(|| ApiError::not_found("project not found"))?;
    if project.owner_id != user.id {
        return Err(ApiError::forbidden("project belongs to another user"));
    }

    if req.content.trim().is_empty() {
        return Err(ApiError::bad_request("message content must not be empty"));
    }

    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        project_id: req.project_id,
        session_id: None,
        role: req.role,
        content: req.content,
        created_at: Utc::now().to_rfc3339(),
    };

    state.chat.create(&message).await?;

    Ok((StatusCode::CREATED, Json(message)))
}
