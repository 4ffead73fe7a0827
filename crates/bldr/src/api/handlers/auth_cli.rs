//! CLI auth bootstrap.
//!
//! Begins a device-code-like flow: the CLI names a local callback port, we
//! hand back the URL the user should open. Everything past the redirect is
//! the fronting auth layer's business.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{ApiError, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct CliAuthStartRequest {
    pub callback_port: u16,
}

#[derive(Debug, Serialize)]
pub struct CliAuthStartResponse {
    #[serde(rename = "authUrl")]
    pub auth_url: String,
    pub state: String,
}

/// POST /api/auth/cli/start
pub async fn start_cli_auth(
    State(state): State<AppState>,
    Json(req): Json<CliAuthStartRequest>,
) -> ApiResult<Json<CliAuthStartResponse>> {
    if req.callback_port == 0 {
        return Err(ApiError::bad_request("callback_port must be non-zero"));
    }

    let flow_state = Uuid::new_v4().to_string();
    let auth_url = format!(
        "{}/auth/device?state={}&redirect_uri=http://127.0.0.1:{}/callback",
        state.config.public_base_url.trim_end_matches('/'),
        flow_state,
        req.callback_port
    );

    Ok(Json(CliAuthStartResponse {
        auth_url,
        state: flow_state,
    }))
}
