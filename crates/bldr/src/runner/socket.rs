//! WebSocket endpoint for runner transports.
//!
//! One duplex channel per connected runner. The handshake authenticates the
//! Authorization header before the upgrade completes; a bad credential gets
//! a 401 and the runner-side client stops reconnecting. After `hello` /
//! `hello-ack`, both sides heartbeat every 15 s and close on 45 s of
//! silence. Outbound frames flow through a single writer task; inbound
//! events are pushed into the per-session ingest mailboxes, which is where
//! backpressure lands (the read loop awaits the mailbox, the socket fills,
//! TCP pushes back on the runner).

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use bldr_protocol::{
    ControlMessage, Incoming, RunnerMessage, LIVENESS_MULTIPLIER, RUNNER_HEARTBEAT_SECS,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::api::{ApiError, AppState};
use crate::auth::RunnerIdentity;

/// Outbound queue depth per runner connection.
const OUTBOUND_BUFFER_SIZE: usize = 64;

/// How long the server waits for the hello frame.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket upgrade handler for runners.
///
/// GET /ws/runner
pub async fn runner_ws_handler(
    State(state): State<AppState>,
    identity: RunnerIdentity,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    info!(
        "Runner transport upgrade for user {} (key {})",
        identity.user_id,
        identity.key_id.as_deref().unwrap_or("shared-secret")
    );

    Ok(ws.on_upgrade(move |socket| handle_runner_socket(socket, state, identity)))
}

async fn handle_runner_socket(socket: WebSocket, state: AppState, identity: RunnerIdentity) {
    let (mut sender, mut receiver) = socket.split();

    // Handshake: the first frame must be hello, within the timeout.
    let hello = match tokio::time::timeout(HELLO_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            match serde_json::from_str::<Incoming<RunnerMessage>>(&text) {
                Ok(Incoming::Known(RunnerMessage::Hello(hello))) => hello,
                _ => {
                    warn!("Runner handshake failed: first frame was not hello");
                    let _ = sender.send(Message::Close(None)).await;
                    return;
                }
            }
        }
        _ => {
            warn!("Runner handshake failed: no hello within {:?}", HELLO_TIMEOUT);
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let runner_id = hello.runner_id.clone();
    let (tx, mut outbound) = mpsc::channel::<ControlMessage>(OUTBOUND_BUFFER_SIZE);

    let connection_id = match state
        .registry
        .register(hello, &identity.user_id, tx)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!("Runner {} registration failed: {:#}", runner_id, e);
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let ack = ControlMessage::HelloAck {
        connection_id: connection_id.clone(),
    };
    if send_control(&mut sender, &ack).await.is_err() {
        state.registry.unregister(&runner_id, &connection_id).await;
        return;
    }

    let last_heard = Arc::new(Mutex::new(Instant::now()));

    // Single writer: registry-driven frames plus our own heartbeat.
    let last_heard_writer = last_heard.clone();
    let send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(RUNNER_HEARTBEAT_SECS));
        let liveness_window =
            Duration::from_secs(RUNNER_HEARTBEAT_SECS * LIVENESS_MULTIPLIER as u64);

        loop {
            tokio::select! {
                maybe_msg = outbound.recv() => {
                    let Some(msg) = maybe_msg else { break };
                    let is_goodbye = matches!(msg, ControlMessage::Goodbye { .. });
                    if send_control(&mut sender, &msg).await.is_err() {
                        break;
                    }
                    if is_goodbye {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }

                _ = heartbeat.tick() => {
                    if last_heard_writer.lock().await.elapsed() > liveness_window {
                        debug!("Runner transport silent past liveness window, closing");
                        break;
                    }
                    if send_control(&mut sender, &ControlMessage::Heartbeat).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read loop: every frame refreshes liveness; events go to ingest.
    while let Some(msg_result) = receiver.next().await {
        let message = match msg_result {
            Ok(m) => m,
            Err(e) => {
                debug!("Runner {} socket error: {}", runner_id, e);
                break;
            }
        };

        *last_heard.lock().await = Instant::now();

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => {
                debug!("Ignoring binary frame from runner {}", runner_id);
                continue;
            }
            Message::Close(_) => break,
        };

        let frame = match serde_json::from_str::<Incoming<RunnerMessage>>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                // Protocol error: log and drop, never crash the channel.
                warn!("Malformed frame from runner {}: {}", runner_id, e);
                continue;
            }
        };

        match frame {
            Incoming::Known(msg) => {
                handle_runner_message(&state, &runner_id, msg).await;
            }
            Incoming::Unknown(value) => {
                debug!(
                    "Ignoring unknown frame kind {} from runner {}",
                    value.get("kind").and_then(|k| k.as_str()).unwrap_or("?"),
                    runner_id
                );
            }
        }
    }

    send_task.abort();
    state.registry.unregister(&runner_id, &connection_id).await;
}

async fn handle_runner_message(state: &AppState, runner_id: &str, msg: RunnerMessage) {
    match msg {
        RunnerMessage::Hello(_) => {
            debug!("Duplicate hello from runner {}, ignoring", runner_id);
        }

        RunnerMessage::Heartbeat => {}

        RunnerMessage::RunnerEvent(envelope) => {
            state.pipeline.submit(envelope).await;
        }

        RunnerMessage::CommandAck { command_id } => {
            state.registry.on_command_ack(runner_id, &command_id).await;
        }

        RunnerMessage::CommandResult {
            command_id,
            success,
            error,
        } => {
            state
                .registry
                .on_command_result(runner_id, &command_id, success, error.as_deref())
                .await;
        }

        RunnerMessage::TunnelAnnounced {
            project_id,
            url,
            port,
        } => {
            info!(
                "Tunnel for project {} announced at {} (port {})",
                project_id, url, port
            );
            if let Err(e) = state.projects.set_tunnel_url(&project_id, Some(&url)).await {
                warn!("Failed to record tunnel url for {}: {:#}", project_id, e);
            }
        }

        RunnerMessage::TunnelFailed {
            project_id,
            error,
            permanent,
        } => {
            warn!(
                "Tunnel for project {} failed ({}): {}",
                project_id,
                if permanent { "permanent" } else { "transient" },
                error
            );
            if let Err(e) = state.projects.set_tunnel_error(&project_id, &error).await {
                warn!("Failed to record tunnel error for {}: {:#}", project_id, e);
            }
        }

        RunnerMessage::DevServerStatus {
            project_id,
            state: server_state,
            port,
            framework,
            error,
        } => {
            info!(
                "Dev server for project {} -> {} (port {:?})",
                project_id, server_state, port
            );
            if let Some(framework) = framework {
                if let Err(e) = state.projects.set_framework(&project_id, &framework).await {
                    warn!("Failed to record framework for {}: {:#}", project_id, e);
                }
            }
            if let Err(e) = state
                .projects
                .set_dev_server_status(
                    &project_id,
                    server_state,
                    port.map(|p| p as i64),
                    error.as_deref(),
                )
                .await
            {
                warn!("Failed to record dev server status for {}: {:#}", project_id, e);
            }
        }
    }
}

async fn send_control(
    sender: &mut (impl SinkExt<Message> + Unpin),
    msg: &ControlMessage,
) -> Result<(), ()> {
    let json = match serde_json::to_string(msg) {
        Ok(j) => j,
        Err(e) => {
            warn!("Failed to serialize control message: {}", e);
            return Err(());
        }
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
