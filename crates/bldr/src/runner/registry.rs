//! Registry of connected runners.
//!
//! One supervisor task per runner connection owns the socket; the registry
//! holds each connection's outbound sender plus its command queue, and runs
//! the timers that outlive a single message exchange: ack-timeout requeues,
//! cancel grace, and the orphan window after a disconnect.

use bldr_protocol::{BuildCommand, BuildOutcome, ControlMessage, RunnerHello};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::ingest::IngestPipeline;
use crate::session::SessionRepository;

use super::queue::CommandQueue;

/// Timer knobs, overridable in tests.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a dispatched command may go unacknowledged before it is
    /// re-queued.
    pub ack_timeout: Duration,
    /// How long after `cancel-build` the control plane waits for the
    /// runner's terminal event before declaring `cancelled` itself.
    pub cancel_grace: Duration,
    /// How long orphaned sessions stay resumable after their runner
    /// disconnects.
    pub orphan_window: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(60),
            orphan_window: Duration::from_secs(600),
        }
    }
}

/// A live runner connection.
struct RunnerHandle {
    connection_id: String,
    user_id: String,
    hello: RunnerHello,
    tx: mpsc::Sender<ControlMessage>,
    connected_at: String,
}

/// Telemetry view of a connected runner.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerInfo {
    pub runner_id: String,
    pub hostname: String,
    pub version: String,
    pub os: String,
    pub max_builds: u32,
    pub active_builds: usize,
    pub queued_commands: usize,
    pub connected_at: String,
}

/// Registry of connected runners and their command queues.
pub struct RunnerRegistry {
    config: RegistryConfig,
    runners: DashMap<String, Arc<RunnerHandle>>,
    queues: DashMap<String, Arc<Mutex<CommandQueue>>>,
    sessions: SessionRepository,
    pipeline: Arc<IngestPipeline>,
}

impl RunnerRegistry {
    pub fn new(
        config: RegistryConfig,
        sessions: SessionRepository,
        pipeline: Arc<IngestPipeline>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            runners: DashMap::new(),
            queues: DashMap::new(),
            sessions,
            pipeline,
        })
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Register a runner connection after a valid hello.
    ///
    /// A reconnect replaces any previous connection for the same runner id;
    /// the stale socket gets a goodbye. Resume claims re-bind orphaned
    /// sessions to this connection. Returns the connection id.
    pub async fn register(
        self: &Arc<Self>,
        hello: RunnerHello,
        user_id: &str,
        tx: mpsc::Sender<ControlMessage>,
    ) -> anyhow::Result<String> {
        let connection_id = Uuid::new_v4().to_string();
        let runner_id = hello.runner_id.clone();

        let handle = Arc::new(RunnerHandle {
            connection_id: connection_id.clone(),
            user_id: user_id.to_string(),
            hello: hello.clone(),
            tx,
            connected_at: Utc::now().to_rfc3339(),
        });

        if let Some(old) = self.runners.insert(runner_id.clone(), handle) {
            debug!("Replacing stale connection for runner {}", runner_id);
            let _ = old
                .tx
                .try_send(ControlMessage::Goodbye {
                    reason: "superseded by a newer connection".to_string(),
                });
        }

        self.queues
            .entry(runner_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CommandQueue::new())));

        if !hello.resume.is_empty() {
            let resumed = self
                .sessions
                .resume_orphans(&runner_id, &hello.resume)
                .await?;
            info!(
                "Runner {} resumed {}/{} claimed sessions",
                runner_id,
                resumed.len(),
                hello.resume.len()
            );
        }

        info!(
            "Runner {} connected ({} concurrent builds)",
            runner_id, hello.max_builds
        );

        self.pump(&runner_id).await;

        Ok(connection_id)
    }

    /// Drop a connection. Only the connection that registered may
    /// unregister; a superseded socket's cleanup is a no-op.
    ///
    /// Active sessions owned by the runner become orphaned (still `active`,
    /// resumable); after the orphan window they fail with `runner_timeout`.
    pub async fn unregister(self: &Arc<Self>, runner_id: &str, connection_id: &str) {
        let removed = match self.runners.get(runner_id) {
            Some(handle) if handle.connection_id == connection_id => {
                drop(handle);
                self.runners.remove(runner_id);
                true
            }
            _ => false,
        };
        if !removed {
            return;
        }

        info!("Runner {} disconnected", runner_id);

        let orphans = match self.sessions.mark_orphaned(runner_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Failed to orphan sessions of runner {}: {:#}", runner_id, e);
                return;
            }
        };

        for session_id in orphans {
            info!("Session {} orphaned by runner {} disconnect", session_id, runner_id);
            let registry = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(registry.config.orphan_window).await;
                match registry.sessions.is_orphaned(&session_id).await {
                    Ok(true) => {
                        registry
                            .pipeline
                            .force_terminal(&session_id, BuildOutcome::Failed, "runner_timeout")
                            .await;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Orphan check failed for session {}: {:#}", session_id, e),
                }
            });
        }
    }

    pub fn is_connected(&self, runner_id: &str) -> bool {
        self.runners.contains_key(runner_id)
    }

    /// Any connected runner owned by a user, for projects without affinity.
    pub fn any_for_user(&self, user_id: &str) -> Option<String> {
        self.runners
            .iter()
            .find(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.key().clone())
    }

    /// Telemetry for all connected runners of a user.
    pub async fn list_for_user(&self, user_id: &str) -> Vec<RunnerInfo> {
        // Snapshot handles first; no registry guard is held across awaits.
        let handles: Vec<(String, Arc<RunnerHandle>)> = self
            .runners
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut infos = Vec::new();
        for (runner_id, handle) in handles {
            let (active, queued) = match self.queues.get(&runner_id).map(|q| q.value().clone()) {
                Some(queue) => {
                    let q = queue.lock().await;
                    (q.in_flight_count(), q.queued_count())
                }
                None => (0, 0),
            };
            infos.push(RunnerInfo {
                runner_id,
                hostname: handle.hello.hostname.clone(),
                version: handle.hello.version.clone(),
                os: handle.hello.os.clone(),
                max_builds: handle.hello.max_builds,
                active_builds: active,
                queued_commands: queued,
                connected_at: handle.connected_at.clone(),
            });
        }
        infos
    }

    // ========================================================================
    // Command dispatch
    // ========================================================================

    /// Queue a build command for a runner and dispatch if a slot is free.
    pub async fn enqueue_command(self: &Arc<Self>, runner_id: &str, command: BuildCommand) {
        let queue = self
            .queues
            .entry(runner_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CommandQueue::new())))
            .clone();

        let accepted = queue.lock().await.enqueue(command.clone());
        if !accepted {
            warn!(
                "Session {} already has a command on runner {}, ignoring",
                command.session_id, runner_id
            );
            return;
        }

        info!(
            "Queued command {} (session {}) for runner {}",
            command.command_id, command.session_id, runner_id
        );
        self.pump(runner_id).await;
    }

    /// Dispatch queued commands while the runner has free slots.
    async fn pump(self: &Arc<Self>, runner_id: &str) {
        let Some(handle) = self.runners.get(runner_id).map(|h| h.value().clone()) else {
            return;
        };
        let Some(queue) = self.queues.get(runner_id).map(|q| q.value().clone()) else {
            return;
        };

        loop {
            let command = {
                let mut q = queue.lock().await;
                match q.next_dispatch(handle.hello.max_builds as usize) {
                    Some(cmd) => cmd,
                    None => break,
                }
            };

            if let Err(e) = self.sessions.set_runner(&command.session_id, runner_id).await {
                warn!(
                    "Failed to bind session {} to runner {}: {:#}",
                    command.session_id, runner_id, e
                );
            }

            let command_id = command.command_id.clone();
            info!(
                "Dispatching command {} to runner {}",
                command_id, runner_id
            );

            if handle
                .tx
                .send(ControlMessage::CommandDispatch(command))
                .await
                .is_err()
            {
                // Connection died mid-dispatch; the command goes back to the
                // queue for the next connection.
                let mut q = queue.lock().await;
                q.requeue_unacked(&command_id);
                break;
            }

            self.arm_ack_timeout(runner_id.to_string(), command_id);
        }
    }

    fn arm_ack_timeout(self: &Arc<Self>, runner_id: String, command_id: String) {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(registry.config.ack_timeout).await;
            let Some(queue) = registry.queues.get(&runner_id).map(|q| q.value().clone()) else {
                return;
            };
            let requeued = queue.lock().await.requeue_unacked(&command_id);
            if requeued {
                warn!(
                    "Command {} unacknowledged by runner {}, re-queued",
                    command_id, runner_id
                );
                registry.pump(&runner_id).await;
            }
        });
    }

    /// Record a command ack from the runner.
    pub async fn on_command_ack(&self, runner_id: &str, command_id: &str) {
        let Some(queue) = self.queues.get(runner_id).map(|q| q.value().clone()) else {
            return;
        };
        if !queue.lock().await.ack(command_id) {
            debug!(
                "Ack for unknown command {} from runner {}",
                command_id, runner_id
            );
        }
    }

    /// Record a command result and free its concurrency slot.
    pub async fn on_command_result(
        self: &Arc<Self>,
        runner_id: &str,
        command_id: &str,
        success: bool,
        error: Option<&str>,
    ) {
        let command = match self.queues.get(runner_id).map(|q| q.value().clone()) {
            Some(queue) => queue.lock().await.complete(command_id),
            None => None,
        };

        let Some(command) = command else {
            debug!(
                "Result for unknown command {} from runner {}",
                command_id, runner_id
            );
            return;
        };

        if !success {
            warn!(
                "Command {} failed on runner {}: {}",
                command_id,
                runner_id,
                error.unwrap_or("unknown error")
            );
            self.pipeline
                .force_terminal(
                    &command.session_id,
                    BuildOutcome::Failed,
                    error.unwrap_or("command_failed"),
                )
                .await;
        }

        self.pump(runner_id).await;
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel a session's build.
    ///
    /// A still-queued command is withdrawn and the session cancelled on the
    /// spot. A dispatched build gets `cancel-build`; if no terminal event
    /// arrives within the grace window the control plane declares
    /// `cancelled` itself and later events for the session are dropped.
    pub async fn cancel_build(self: &Arc<Self>, runner_id: &str, session_id: &str) {
        if let Some(queue) = self.queues.get(runner_id).map(|q| q.value().clone()) {
            let withdrawn = queue.lock().await.remove_queued_for_session(session_id);
            if withdrawn.is_some() {
                info!("Withdrew queued command for session {}", session_id);
                self.pipeline
                    .force_terminal(session_id, BuildOutcome::Cancelled, "cancelled_before_dispatch")
                    .await;
                return;
            }
        }

        self.pipeline.note_cancel_requested(session_id).await;

        if let Some(handle) = self.runners.get(runner_id).map(|h| h.value().clone()) {
            let _ = handle
                .tx
                .send(ControlMessage::CancelBuild {
                    session_id: session_id.to_string(),
                })
                .await;
        }

        let registry = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(registry.config.cancel_grace).await;
            // No-op if the runner's terminal event beat the timer.
            registry
                .pipeline
                .force_terminal(&session_id, BuildOutcome::Cancelled, "cancel_timeout")
                .await;
        });
    }
}
