//! Runner-event ingest pipeline.
//!
//! Every `runner-event` lands here. Events for one session are applied by a
//! single worker task fed from a bounded mailbox, so state mutations for a
//! session never interleave; sessions proceed in parallel with each other.
//! Each event runs to completion: validate against the store, persist, then
//! enqueue the broadcast. Browsers therefore never see an update that a
//! recovery snapshot read would miss.

mod runtime;

pub use runtime::SessionRuntime;

use anyhow::Result;
use bldr_protocol::{
    BuildOutcome, Incoming, SessionStatus, TodoStatus, ToolCallState, UpdateEnvelope,
    UpdatePayload,
};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chat::{ChatMessage, ChatRepository, ChatRole};
use crate::session::{SessionRepository, StoreError};
use crate::ws::WsHub;

/// Mailbox depth per session. Filling up applies backpressure to the
/// transport read loop, which is the intended flow-control path.
const MAILBOX_SIZE: usize = 256;

/// Work items for a session worker.
enum Job {
    Event(UpdateEnvelope),
    /// Control-plane-synthesized terminal: cancel grace expiry or orphan
    /// timeout. No-op if the session already finalized.
    ForceTerminal { outcome: BuildOutcome, cause: String },
}

/// Per-session serial ingest pipeline.
pub struct IngestPipeline {
    sessions: SessionRepository,
    chat: ChatRepository,
    hub: Arc<WsHub>,
    runtimes: DashMap<String, SessionRuntime>,
    mailboxes: DashMap<String, mpsc::Sender<Job>>,
}

impl IngestPipeline {
    pub fn new(sessions: SessionRepository, chat: ChatRepository, hub: Arc<WsHub>) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            chat,
            hub,
            runtimes: DashMap::new(),
            mailboxes: DashMap::new(),
        })
    }

    /// Submit one runner event. Awaiting here is the backpressure point for
    /// the transport read loop.
    pub async fn submit(self: &Arc<Self>, envelope: UpdateEnvelope) {
        let session_id = envelope.session_id.clone();
        self.send_job(&session_id, Job::Event(envelope)).await;
    }

    /// Force a terminal status from the control plane.
    pub async fn force_terminal(
        self: &Arc<Self>,
        session_id: &str,
        outcome: BuildOutcome,
        cause: impl Into<String>,
    ) {
        self.send_job(
            session_id,
            Job::ForceTerminal {
                outcome,
                cause: cause.into(),
            },
        )
        .await;
    }

    async fn send_job(self: &Arc<Self>, session_id: &str, job: Job) {
        let tx = {
            match self.mailboxes.get(session_id) {
                Some(tx) => tx.clone(),
                None => {
                    let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
                    self.mailboxes.insert(session_id.to_string(), tx.clone());
                    let pipeline = self.clone();
                    let sid = session_id.to_string();
                    tokio::spawn(async move {
                        pipeline.run_worker(sid, rx).await;
                    });
                    tx
                }
            }
        };

        if tx.send(job).await.is_err() {
            warn!("Ingest mailbox for session {} closed", session_id);
        }
    }

    /// Serial worker: one event at a time, no suspension across mutations of
    /// the same session's state other than awaited store writes.
    async fn run_worker(self: Arc<Self>, session_id: String, mut rx: mpsc::Receiver<Job>) {
        while let Some(job) = rx.recv().await {
            let result = match job {
                Job::Event(envelope) => self.handle_event(&session_id, envelope).await,
                Job::ForceTerminal { outcome, cause } => {
                    self.handle_force_terminal(&session_id, outcome, &cause).await
                }
            };

            if let Err(e) = result {
                // Persistence failure: fail the session and tell browsers.
                warn!("Ingest error for session {}: {:#}", session_id, e);
                if let Err(e2) = self
                    .terminalize(&session_id, BuildOutcome::Failed, None, Some("persistence_error"))
                    .await
                {
                    warn!(
                        "Could not mark session {} failed after ingest error: {:#}",
                        session_id, e2
                    );
                }
            }
        }
    }

    // ========================================================================
    // Event application
    // ========================================================================

    async fn handle_event(&self, session_id: &str, envelope: UpdateEnvelope) -> Result<()> {
        let Some(session) = self.sessions.get(session_id).await? else {
            warn!("Dropping event for unknown session {}", session_id);
            return Ok(());
        };

        // Replay idempotency: the watermark advances monotonically, so any
        // suffix re-delivered after a transport reconnect is a no-op.
        if (envelope.seq as i64) <= session.last_seq {
            debug!(
                "Dropping duplicate seq {} for session {} (last {})",
                envelope.seq, session_id, session.last_seq
            );
            return Ok(());
        }

        let update = match &envelope.update {
            Incoming::Known(update) => update.clone(),
            Incoming::Unknown(value) => {
                debug!(
                    "Ignoring unknown update type {} for session {}",
                    value.get("type").and_then(|t| t.as_str()).unwrap_or("?"),
                    session_id
                );
                self.sessions.set_last_seq(session_id, envelope.seq as i64).await?;
                return Ok(());
            }
        };

        let (finalized, auto_completed) = self
            .runtimes
            .get(session_id)
            .map(|r| (r.finalized, r.auto_completed))
            .unwrap_or((false, false));

        if session.is_terminal() || finalized {
            // A cancelled or finalized session accepts nothing further. A
            // gracefully completed/failed one still accepts late tool
            // outputs for calls that were open at the terminal transition,
            // and an auto-completed session still awaits the runner's own
            // build-complete to release the terminal broadcast.
            let late_tool_ok = !finalized
                && session.status != SessionStatus::Cancelled
                && matches!(
                    update,
                    UpdatePayload::ToolOutputAvailable { .. } | UpdatePayload::ToolError { .. }
                );
            let awaited_terminal = !finalized
                && auto_completed
                && session.status == SessionStatus::Completed
                && matches!(update, UpdatePayload::BuildComplete { .. });
            if !late_tool_ok && !awaited_terminal {
                debug!(
                    "Dropping {} for terminal session {}",
                    update.kind(),
                    session_id
                );
                return Ok(());
            }
        }

        self.ensure_runtime(session_id, &session.project_id);

        let broadcast = match update {
            UpdatePayload::Start { .. } => self.apply_start(&session).await?,
            UpdatePayload::TodosUpdate {
                todos,
                active_index,
                phase,
            } => {
                self.apply_todos_update(&session, todos, active_index, phase)
                    .await?
            }
            UpdatePayload::ToolInputAvailable {
                tool_call_id,
                tool_name,
                todo_index,
                input,
            } => {
                self.apply_tool_input(&session, &tool_call_id, &tool_name, todo_index, input)
                    .await?
            }
            UpdatePayload::ToolOutputAvailable {
                tool_call_id,
                output,
            } => {
                self.apply_tool_finish(&session, &tool_call_id, ToolCallState::OutputAvailable, output)
                    .await?
            }
            UpdatePayload::ToolError {
                tool_call_id,
                error,
            } => {
                let output = serde_json::Value::String(error);
                self.apply_tool_finish(&session, &tool_call_id, ToolCallState::Error, output)
                    .await?
            }
            UpdatePayload::TextDelta { message_id, delta } => {
                if let Some(mut runtime) = self.runtimes.get_mut(session_id) {
                    runtime.push_text_delta(&message_id, &delta);
                }
                true
            }
            UpdatePayload::BuildSummary { summary } => {
                self.sessions.set_summary(session_id, &summary).await?;
                true
            }
            UpdatePayload::BuildComplete { status, summary } => {
                self.apply_build_complete(&session, status, summary.as_deref())
                    .await?
            }
        };

        self.sessions.set_last_seq(session_id, envelope.seq as i64).await?;

        if broadcast {
            self.hub.broadcast_update(&session.project_id, envelope);
        }

        Ok(())
    }

    async fn apply_start(&self, session: &crate::session::Session) -> Result<bool> {
        match self
            .sessions
            .transition(
                &session.id,
                &[SessionStatus::Pending],
                SessionStatus::Active,
                None,
                None,
            )
            .await
        {
            Ok(()) => {
                info!("Session {} active", session.id);
                Ok(true)
            }
            // Start is idempotent: a second one on an already-active session
            // is harmless noise.
            Err(StoreError::IllegalTransition { .. })
                if session.status == SessionStatus::Active =>
            {
                Ok(false)
            }
            Err(StoreError::IllegalTransition { .. }) => {
                debug!("Dropping start for session {} in {}", session.id, session.status);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_todos_update(
        &self,
        session: &crate::session::Session,
        todos: Vec<bldr_protocol::TodoItem>,
        active_index: i64,
        phase: bldr_protocol::TodoPhase,
    ) -> Result<bool> {
        self.sessions.replace_todos(&session.id, &todos, phase).await?;

        // Recompute rather than trust the wire: the active index is the
        // first in-progress todo, -1 if none.
        let computed = todos
            .iter()
            .position(|t| t.status == TodoStatus::InProgress)
            .map(|i| i as i64)
            .unwrap_or(-1);
        if computed != active_index {
            debug!(
                "Active index mismatch for session {}: wire {} computed {}",
                session.id, active_index, computed
            );
        }

        let all_completed =
            !todos.is_empty() && todos.iter().all(|t| t.status == TodoStatus::Completed);

        if let Some(mut runtime) = self.runtimes.get_mut(&session.id) {
            if todos.len() < runtime.previous_todo_count {
                info!(
                    "Session {} todo list shrank {} -> {}",
                    session.id,
                    runtime.previous_todo_count,
                    todos.len()
                );
            }
            runtime.active_todo_index = computed;
            runtime.previous_todo_count = todos.len();
        }

        // All build-phase todos done while the session is still live: record
        // completion now, but hold the terminal broadcast for the runner's
        // own build-complete carrying the summary. Template-phase completion
        // never closes the session.
        if all_completed
            && phase == bldr_protocol::TodoPhase::Build
            && session.status == SessionStatus::Active
        {
            match self
                .sessions
                .transition(
                    &session.id,
                    &[SessionStatus::Active],
                    SessionStatus::Completed,
                    None,
                    None,
                )
                .await
            {
                Ok(()) => {
                    info!("Session {} auto-completed (all todos done)", session.id);
                    if let Some(mut runtime) = self.runtimes.get_mut(&session.id) {
                        runtime.auto_completed = true;
                    }
                }
                Err(StoreError::IllegalTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(true)
    }

    async fn apply_tool_input(
        &self,
        session: &crate::session::Session,
        tool_call_id: &str,
        tool_name: &str,
        todo_index: Option<i64>,
        input: serde_json::Value,
    ) -> Result<bool> {
        let inherited = self
            .runtimes
            .get(&session.id)
            .map(|r| r.active_todo_index)
            .unwrap_or(-1);
        let todo_index = todo_index.unwrap_or(inherited).max(-1);

        // A bound tool call must point at an existing todo; violating
        // updates are dropped without mutating state.
        if todo_index >= 0 {
            let count = self.sessions.todo_count(&session.id).await?;
            if todo_index >= count {
                warn!(
                    "Dropping tool {} for session {}: todo index {} out of range (count {})",
                    tool_call_id, session.id, todo_index, count
                );
                return Ok(false);
            }
        }

        // Never regress a terminal tool call.
        if let Some(existing) = self.sessions.get_tool_call(&session.id, tool_call_id).await? {
            if existing.state.is_terminal() {
                warn!(
                    "Dropping input for terminal tool call {} in session {}",
                    tool_call_id, session.id
                );
                return Ok(false);
            }
        }

        self.sessions
            .upsert_tool_input(&session.id, tool_call_id, tool_name, todo_index, &input)
            .await?;

        Ok(true)
    }

    async fn apply_tool_finish(
        &self,
        session: &crate::session::Session,
        tool_call_id: &str,
        state: ToolCallState,
        output: serde_json::Value,
    ) -> Result<bool> {
        let finished = self
            .sessions
            .finish_tool_call(&session.id, tool_call_id, state, &output)
            .await?;

        if !finished {
            // Output without a prior input, or a regressing update. Drop it
            // to preserve the tool-call invariants.
            warn!(
                "Dropping {} for tool call {} in session {}: no open call",
                state, tool_call_id, session.id
            );
            return Ok(false);
        }

        Ok(true)
    }

    async fn apply_build_complete(
        &self,
        session: &crate::session::Session,
        outcome: BuildOutcome,
        summary: Option<&str>,
    ) -> Result<bool> {
        let (auto_completed, cancel_requested) = self
            .runtimes
            .get(&session.id)
            .map(|r| (r.auto_completed, r.cancel_requested))
            .unwrap_or((false, false));

        // A cancel beat this terminal event: the runner stopped
        // cooperatively, so the session closes as cancelled no matter what
        // status the agent reported on the way down.
        let outcome = if cancel_requested && !auto_completed {
            BuildOutcome::Cancelled
        } else {
            outcome
        };

        if auto_completed && session.status == SessionStatus::Completed {
            // The store already holds `completed`; the runner's terminal
            // event contributes the summary and releases the broadcast.
            if outcome != BuildOutcome::Completed {
                warn!(
                    "Runner reported {:?} for auto-completed session {}, keeping completed",
                    outcome, session.id
                );
            }
            if let Some(summary) = summary {
                self.sessions.set_summary(&session.id, summary).await?;
            }
            self.finish_runtime(&session.id).await?;
            return Ok(true);
        }

        match self
            .sessions
            .transition(
                &session.id,
                &[SessionStatus::Pending, SessionStatus::Active],
                outcome.session_status(),
                summary,
                None,
            )
            .await
        {
            Ok(()) => {
                info!("Session {} finished: {:?}", session.id, outcome);
                self.finish_runtime(&session.id).await?;
                Ok(true)
            }
            Err(StoreError::IllegalTransition { .. }) => {
                debug!(
                    "Dropping build-complete for session {} already in {}",
                    session.id, session.status
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Forced terminals
    // ========================================================================

    async fn handle_force_terminal(
        &self,
        session_id: &str,
        outcome: BuildOutcome,
        cause: &str,
    ) -> Result<()> {
        let finalized = self
            .runtimes
            .get(session_id)
            .map(|r| r.finalized)
            .unwrap_or(false);
        if finalized {
            return Ok(());
        }

        self.terminalize(session_id, outcome, None, Some(cause)).await
    }

    /// Transition to a terminal status and emit the one terminal broadcast.
    async fn terminalize(
        &self,
        session_id: &str,
        outcome: BuildOutcome,
        summary: Option<&str>,
        cause: Option<&str>,
    ) -> Result<()> {
        let Some(session) = self.sessions.get(session_id).await? else {
            return Ok(());
        };

        match self
            .sessions
            .transition(
                session_id,
                &[SessionStatus::Pending, SessionStatus::Active],
                outcome.session_status(),
                summary,
                cause,
            )
            .await
        {
            Ok(()) => {}
            Err(StoreError::IllegalTransition { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        info!(
            "Session {} forced to {:?} ({})",
            session_id,
            outcome,
            cause.unwrap_or("-")
        );

        self.ensure_runtime(session_id, &session.project_id);
        self.finish_runtime(session_id).await?;

        // Synthesize the terminal update so browsers never have to infer
        // the end of a session from silence.
        let seq = (session.last_seq + 1) as u64;
        self.sessions.set_last_seq(session_id, seq as i64).await?;
        let envelope = UpdateEnvelope::new(
            session_id,
            seq,
            UpdatePayload::BuildComplete {
                status: outcome,
                summary: summary.map(String::from),
            },
        );
        self.hub.broadcast_update(&session.project_id, envelope);

        Ok(())
    }

    // ========================================================================
    // Runtime bookkeeping
    // ========================================================================

    fn ensure_runtime(&self, session_id: &str, project_id: &str) {
        self.runtimes
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRuntime::new(project_id));
    }

    /// Mark finalized and persist buffered assistant text as one chat
    /// message.
    async fn finish_runtime(&self, session_id: &str) -> Result<()> {
        let (project_id, text) = {
            let Some(mut runtime) = self.runtimes.get_mut(session_id) else {
                return Ok(());
            };
            runtime.finalized = true;
            (runtime.project_id.clone(), runtime.take_assistant_text())
        };

        if let Some(text) = text {
            self.chat
                .create(&ChatMessage {
                    id: Uuid::new_v4().to_string(),
                    project_id,
                    session_id: Some(session_id.to_string()),
                    role: ChatRole::Assistant,
                    content: text,
                    created_at: Utc::now().to_rfc3339(),
                })
                .await?;
        }

        Ok(())
    }

    /// Note that a cancel is outstanding, so the runner's terminal event
    /// closes the session as cancelled.
    pub async fn note_cancel_requested(&self, session_id: &str) {
        let Ok(Some(session)) = self.sessions.get(session_id).await else {
            return;
        };
        self.ensure_runtime(session_id, &session.project_id);
        if let Some(mut runtime) = self.runtimes.get_mut(session_id) {
            runtime.cancel_requested = true;
        }
    }

    /// Whether a session has already emitted its terminal broadcast.
    pub fn is_finalized(&self, session_id: &str) -> bool {
        self.runtimes
            .get(session_id)
            .map(|r| r.finalized)
            .unwrap_or(false)
    }
}
