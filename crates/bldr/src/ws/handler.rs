//! WebSocket handler for browser connections.
//!
//! Contract on connect: `connected` with the assigned client id, then an
//! authoritative `state-recovery` snapshot for the project's active (or most
//! recent) session. After that, `batch-update` frames carry canonical
//! updates in ingest order; consecutive queued batches are coalesced into
//! one frame so slow links absorb bursts without reordering or loss.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use bldr_protocol::{ClientMessage, Incoming, ServerMessage, BROWSER_HEARTBEAT_SECS, LIVENESS_MULTIPLIER};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::api::{ApiError, AppState};
use crate::auth::CurrentUser;

/// Query parameters for the browser socket.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// WebSocket upgrade handler.
///
/// GET /ws?projectId=...&sessionId=...
pub async fn ws_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let project = state
        .projects
        .get(&params.project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project not found: {}", params.project_id)))?;

    if project.owner_id != user.id {
        return Err(ApiError::forbidden("project belongs to another user"));
    }

    info!(
        "Browser WebSocket upgrade for project {} by user {}",
        project.id, user.id
    );

    Ok(ws.on_upgrade(move |socket| handle_browser_socket(socket, state, params)))
}

async fn handle_browser_socket(socket: WebSocket, state: AppState, params: WsParams) {
    let (mut sender, mut receiver) = socket.split();
    let project_id = params.project_id.clone();

    let (client_id, mut queue) = state.hub.register(&project_id);

    let connected = ServerMessage::Connected {
        client_id: client_id.clone(),
    };
    if send_json(&mut sender, &connected).await.is_err() {
        state.hub.unregister(&project_id, &client_id);
        return;
    }

    // Snapshot for the requested session, else the project's open or most
    // recent one.
    let recovery = recovery_message(&state, &params).await;
    if send_json(&mut sender, &recovery).await.is_err() {
        state.hub.unregister(&project_id, &client_id);
        return;
    }

    // Reader updates this on every frame; the writer closes the socket when
    // the peer has been silent for 3 heartbeat intervals.
    let last_heard = Arc::new(Mutex::new(Instant::now()));

    let last_heard_writer = last_heard.clone();
    let send_task = tokio::spawn(async move {
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(BROWSER_HEARTBEAT_SECS));
        let liveness_window =
            Duration::from_secs(BROWSER_HEARTBEAT_SECS * LIVENESS_MULTIPLIER as u64);
        // Two consecutive write failures close the socket; recovery on
        // reconnect heals the client.
        let mut write_failures = 0u32;

        loop {
            tokio::select! {
                maybe_env = queue.recv() => {
                    let Some(envelope) = maybe_env else { break };
                    let msg = coalesce_batch(envelope, &mut queue);
                    match send_json(&mut sender, &msg).await {
                        Ok(()) => write_failures = 0,
                        Err(()) => {
                            write_failures += 1;
                            if write_failures >= 2 {
                                break;
                            }
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if last_heard_writer.lock().await.elapsed() > liveness_window {
                        debug!("Browser client silent past liveness window, closing");
                        break;
                    }
                    match send_json(&mut sender, &ServerMessage::Heartbeat).await {
                        Ok(()) => write_failures = 0,
                        Err(()) => {
                            write_failures += 1;
                            if write_failures >= 2 {
                                break;
                            }
                        }
                    }
                }
            }
        }
    });

    // Reader: heartbeat acks refresh liveness, unknown types are ignored.
    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                *last_heard.lock().await = Instant::now();
                match serde_json::from_str::<Incoming<ClientMessage>>(&text) {
                    Ok(Incoming::Known(ClientMessage::HeartbeatAck)) => {}
                    Ok(Incoming::Unknown(v)) => {
                        debug!(
                            "Ignoring unknown browser message type: {}",
                            v.get("type").and_then(|t| t.as_str()).unwrap_or("?")
                        );
                    }
                    Err(e) => {
                        warn!("Malformed browser message dropped: {}", e);
                    }
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                *last_heard.lock().await = Instant::now();
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame from browser client {}", client_id);
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("Browser socket error for client {}: {}", client_id, e);
                break;
            }
        }
    }

    send_task.abort();
    state.hub.unregister(&project_id, &client_id);
    info!("Browser client {} disconnected", client_id);
}

/// Pack every immediately available envelope into one `batch-update`.
///
/// The queue fills faster than a slow socket drains; growing one array
/// keeps ordering intact and drops nothing.
fn coalesce_batch(
    first: bldr_protocol::UpdateEnvelope,
    queue: &mut mpsc::Receiver<bldr_protocol::UpdateEnvelope>,
) -> ServerMessage {
    let mut updates = vec![first];
    while let Ok(next) = queue.try_recv() {
        updates.push(next);
    }
    ServerMessage::BatchUpdate { updates }
}

async fn recovery_message(state: &AppState, params: &WsParams) -> ServerMessage {
    let session_id = match &params.session_id {
        Some(id) => Some(id.clone()),
        None => {
            let open = state.sessions.find_open_for_project(&params.project_id).await;
            match open {
                Ok(Some(session)) => Some(session.id),
                Ok(None) => match state.sessions.latest_for_project(&params.project_id).await {
                    Ok(session) => session.map(|s| s.id),
                    Err(e) => {
                        warn!("Recovery lookup failed: {:#}", e);
                        return ServerMessage::StateRecoveryFailed {
                            reason: "session lookup failed".to_string(),
                        };
                    }
                },
                Err(e) => {
                    warn!("Recovery lookup failed: {:#}", e);
                    return ServerMessage::StateRecoveryFailed {
                        reason: "session lookup failed".to_string(),
                    };
                }
            }
        }
    };

    let Some(session_id) = session_id else {
        return ServerMessage::StateRecoveryFailed {
            reason: "no sessions for project".to_string(),
        };
    };

    match state.sessions.fetch_recovery_snapshot(&session_id).await {
        Ok(Some(snapshot)) => ServerMessage::StateRecovery(snapshot),
        Ok(None) => ServerMessage::StateRecoveryFailed {
            reason: format!("session not found: {}", session_id),
        },
        Err(e) => {
            warn!("Snapshot read failed for session {}: {:#}", session_id, e);
            ServerMessage::StateRecoveryFailed {
                reason: "snapshot read failed".to_string(),
            }
        }
    }
}

async fn send_json(
    sender: &mut (impl SinkExt<Message> + Unpin),
    msg: &ServerMessage,
) -> Result<(), ()> {
    let json = match serde_json::to_string(msg) {
        Ok(j) => j,
        Err(e) => {
            warn!("Failed to serialize server message: {}", e);
            return Err(());
        }
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
