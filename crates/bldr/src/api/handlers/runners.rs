//! Connected-runner telemetry handlers.

use axum::{extract::State, Json};

use crate::api::{ApiResult, AppState};
use crate::auth::CurrentUser;
use crate::runner::RunnerInfo;

/// GET /api/runners
pub async fn list_runners(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<RunnerInfo>>> {
    let runners = state.registry.list_for_user(&user.id).await;
    Ok(Json(runners))
}
