//! Bulk event ingest over REST.
//!
//! Fallback for runners that cannot hold a WebSocket open: the same
//! canonical envelopes, posted in batches. The per-session sequence numbers
//! make re-posting after a network hiccup a no-op.

use axum::{extract::State, http::StatusCode, Json};
use bldr_protocol::UpdateEnvelope;
use log::debug;
use serde::Serialize;

use crate::api::{ApiResult, AppState};
use crate::auth::RunnerIdentity;

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
}

/// POST /api/build-events
pub async fn ingest_build_events(
    State(state): State<AppState>,
    identity: RunnerIdentity,
    Json(envelopes): Json<Vec<UpdateEnvelope>>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    debug!(
        "Bulk ingest of {} events from runner of user {}",
        envelopes.len(),
        identity.user_id
    );

    let accepted = envelopes.len();
    for envelope in envelopes {
        state.pipeline.submit(envelope).await;
    }

    Ok((StatusCode::ACCEPTED, Json(IngestResponse { accepted })))
}
