//! Runner key management handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::CurrentUser;
use crate::runner_key::{RunnerKey, RunnerKeyCreated};

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub label: Option<String>,
}

/// GET /api/runner-keys
pub async fn list_runner_keys(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<RunnerKey>>> {
    let keys = state.runner_keys.list_for_user(&user.id).await?;
    Ok(Json(keys))
}

/// POST /api/runner-keys
///
/// The plaintext secret appears in this response and nowhere else.
pub async fn create_runner_key(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateKeyRequest>,
) -> ApiResult<(StatusCode, Json<RunnerKeyCreated>)> {
    let created = state
        .runner_keys
        .create(&user.id, req.label.as_deref())
        .await?;

    info!("Runner key {} created for user {}", created.id, user.id);

    Ok((StatusCode::CREATED, Json(created)))
}

/// DELETE /api/runner-keys/{id}
///
/// Revocation is immediate: the next lookup of the key fails.
pub async fn revoke_runner_key(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let revoked = state.runner_keys.revoke(&user.id, &id).await?;
    if !revoked {
        return Err(ApiError::not_found("runner key not found"));
    }

    info!("Runner key {} revoked by user {}", id, user.id);

    Ok(Json(json!({ "revoked": true })))
}
