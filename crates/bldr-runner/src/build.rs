//! Build execution.
//!
//! One supervisor task per build: spawn the agent process, pump its stdout
//! through the adapter, and stream canonical envelopes upstream. The
//! sequence counter per session is monotonic for the life of the runner
//! process, so events emitted around a transport reconnect keep their
//! ordering guarantee and the control plane can drop replayed prefixes.

use anyhow::{Context, Result};
use bldr_protocol::{BuildCommand, BuildOutcome, RunnerMessage, UpdateEnvelope, UpdatePayload};
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agent::{Adapter, AgentKind};
use crate::config::RunnerConfig;
use crate::devserver::DevServerManager;

/// How long a cancelled agent gets to exit after SIGTERM.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

struct BuildHandle {
    cancel: CancellationToken,
}

/// Supervises agent processes for all builds on this runner.
pub struct BuildManager {
    config: Arc<RunnerConfig>,
    outbound: mpsc::Sender<RunnerMessage>,
    devservers: Arc<DevServerManager>,
    active: Mutex<HashMap<String, BuildHandle>>,
    /// Per-session monotonic event sequence.
    seqs: Mutex<HashMap<String, u64>>,
}

impl BuildManager {
    pub fn new(
        config: Arc<RunnerConfig>,
        outbound: mpsc::Sender<RunnerMessage>,
        devservers: Arc<DevServerManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            outbound,
            devservers,
            active: Mutex::new(HashMap::new()),
            seqs: Mutex::new(HashMap::new()),
        })
    }

    /// Session ids of builds currently running, for hello resume claims.
    pub fn active_sessions(&self) -> Vec<String> {
        match self.active.try_lock() {
            Ok(active) => active.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Accept a dispatched command: ack it and start the build.
    pub async fn accept_command(self: &Arc<Self>, command: BuildCommand) {
        let _ = self
            .outbound
            .send(RunnerMessage::CommandAck {
                command_id: command.command_id.clone(),
            })
            .await;

        {
            let active = self.active.lock().await;
            if active.contains_key(&command.session_id) {
                // Re-dispatch after an ack the control plane missed; the
                // running build already covers it.
                warn!(
                    "Ignoring duplicate dispatch for session {}",
                    command.session_id
                );
                return;
            }
        }

        let cancel = CancellationToken::new();
        self.active.lock().await.insert(
            command.session_id.clone(),
            BuildHandle {
                cancel: cancel.clone(),
            },
        );

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_build(command, cancel).await;
        });
    }

    /// Cancel a running build cooperatively.
    pub async fn cancel(&self, session_id: &str) {
        let active = self.active.lock().await;
        match active.get(session_id) {
            Some(handle) => {
                info!("Cancelling build for session {}", session_id);
                handle.cancel.cancel();
            }
            None => warn!("Cancel for unknown session {}", session_id),
        }
    }

    async fn run_build(self: Arc<Self>, command: BuildCommand, cancel: CancellationToken) {
        let session_id = command.session_id.clone();
        info!(
            "Starting build {} (session {}, agent {})",
            command.build_id, session_id, command.agent_id
        );

        self.emit(
            &session_id,
            UpdatePayload::Start {
                session_id: session_id.clone(),
                build_id: command.build_id.clone(),
                project_id: command.project_id.clone(),
                agent_id: command.agent_id.clone(),
                model_id: command.model_id.clone(),
            },
        )
        .await;

        let outcome = self.drive_agent(&command, &cancel).await;

        let (success, error) = match outcome {
            Ok(outcome) => {
                if outcome == BuildOutcome::Completed {
                    // A finished build gets its dev server (and tunnel)
                    // brought up in the background.
                    let devservers = self.devservers.clone();
                    let project_id = command.project_id.clone();
                    let workspace = command.workspace_path.clone();
                    tokio::spawn(async move {
                        devservers.ensure_running(&project_id, Path::new(&workspace)).await;
                    });
                }
                (true, None)
            }
            Err(e) => {
                warn!("Build for session {} failed to run: {:#}", session_id, e);
                self.emit(
                    &session_id,
                    UpdatePayload::BuildComplete {
                        status: BuildOutcome::Failed,
                        summary: Some(format!("agent failed to start: {:#}", e)),
                    },
                )
                .await;
                (false, Some(format!("{:#}", e)))
            }
        };

        let _ = self
            .outbound
            .send(RunnerMessage::CommandResult {
                command_id: command.command_id.clone(),
                success,
                error,
            })
            .await;

        self.active.lock().await.remove(&session_id);
        info!("Build for session {} finished", session_id);
    }

    /// Spawn the agent and translate its stdout until it exits or the
    /// build is cancelled. Returns the terminal outcome that was emitted.
    async fn drive_agent(
        &self,
        command: &BuildCommand,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let kind = AgentKind::from_agent_id(&command.agent_id);
        let (program, args) = kind.command(&self.config, &command.prompt, &command.model_id);

        let workspace = Path::new(&command.workspace_path);
        std::fs::create_dir_all(workspace)
            .with_context(|| format!("creating workspace {}", workspace.display()))?;

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning agent {}", program))?;

        let stdout = child
            .stdout
            .take()
            .context("agent stdout not captured")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut adapter = Adapter::new(kind);
        let session_id = &command.session_id;

        let mut emitted_outcome: Option<BuildOutcome> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Terminating agent for session {} after cancel", session_id);
                    terminate(&mut child, CANCEL_GRACE).await;
                    let outcome = BuildOutcome::Failed;
                    self.emit(
                        session_id,
                        UpdatePayload::BuildComplete {
                            status: outcome,
                            summary: Some("build cancelled".to_string()),
                        },
                    )
                    .await;
                    return Ok(outcome);
                }

                maybe_line = lines.next_line() => {
                    match maybe_line {
                        Ok(Some(line)) => {
                            for update in adapter.translate_line(&line) {
                                if let UpdatePayload::BuildComplete { status, .. } = &update {
                                    emitted_outcome = Some(*status);
                                }
                                self.emit(session_id, update).await;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Error reading agent output for session {}: {}", session_id, e);
                            break;
                        }
                    }
                }
            }
        }

        let status = child.wait().await.context("waiting for agent exit")?;

        if let Some(outcome) = emitted_outcome {
            return Ok(outcome);
        }

        // The agent died without a terminal record; synthesize one so the
        // session never ends in silence.
        let outcome = if adapter.saw_terminal() || status.success() {
            BuildOutcome::Completed
        } else {
            BuildOutcome::Failed
        };
        let summary = if outcome == BuildOutcome::Failed {
            Some(format!(
                "agent exited with {}",
                status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string())
            ))
        } else {
            None
        };
        self.emit(
            session_id,
            UpdatePayload::BuildComplete {
                status: outcome,
                summary,
            },
        )
        .await;

        Ok(outcome)
    }

    /// Wrap a payload in the next envelope for a session and send it
    /// upstream. The await is the backpressure point when the transport
    /// buffer is full.
    async fn emit(&self, session_id: &str, update: UpdatePayload) {
        let seq = {
            let mut seqs = self.seqs.lock().await;
            let counter = seqs.entry(session_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        let envelope = UpdateEnvelope::new(session_id, seq, update);
        if self
            .outbound
            .send(RunnerMessage::RunnerEvent(envelope))
            .await
            .is_err()
        {
            warn!("Transport gone while emitting for session {}", session_id);
        }
    }
}

/// SIGTERM, a grace window, then SIGKILL. Idempotent on a dead process.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("Agent ignored SIGTERM for {:?}, killing", grace);
            let _ = child.kill().await;
        }
    }
}
