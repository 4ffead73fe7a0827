//! Ingest pipeline and event-store property tests.
//!
//! These run the real per-session pipeline against an in-memory database
//! and assert the invariants browsers rely on: dense todo indices,
//! monotonic tool states, one terminal per session, replay idempotence,
//! and recovery authority.

mod common;

use bldr_protocol::{
    BuildOutcome, RunnerHello, SessionStatus, TodoItem, TodoPhase, TodoStatus, ToolCallState,
    UpdatePayload,
};
use common::{envelope, eventually, seed_project, seed_session, test_state};
use serde_json::json;

fn todo(content: &str, status: TodoStatus) -> TodoItem {
    TodoItem {
        content: content.to_string(),
        active_form: None,
        status,
    }
}

fn todos_update(todos: Vec<TodoItem>, active_index: i64) -> UpdatePayload {
    UpdatePayload::TodosUpdate {
        todos,
        active_index,
        phase: TodoPhase::Build,
    }
}

fn start(session_id: &str, project_id: &str) -> UpdatePayload {
    UpdatePayload::Start {
        session_id: session_id.to_string(),
        build_id: "b1".to_string(),
        project_id: project_id.to_string(),
        agent_id: "claude-code".to_string(),
        model_id: "default".to_string(),
    }
}

// ============================================================================
// E1: happy path
// ============================================================================

#[tokio::test]
async fn test_happy_path_build() {
    let state = test_state().await;
    seed_project(&state, "p1").await;
    seed_session(&state, "p1", "s1", SessionStatus::Pending).await;

    let events = vec![
        envelope("s1", 1, start("s1", "p1")),
        envelope(
            "s1",
            2,
            todos_update(
                vec![
                    todo("A", TodoStatus::InProgress),
                    todo("B", TodoStatus::Pending),
                    todo("C", TodoStatus::Pending),
                ],
                0,
            ),
        ),
        envelope(
            "s1",
            3,
            UpdatePayload::ToolInputAvailable {
                tool_call_id: "tc-read".to_string(),
                tool_name: "Read".to_string(),
                todo_index: None,
                input: json!({"file": "x"}),
            },
        ),
        envelope(
            "s1",
            4,
            UpdatePayload::ToolOutputAvailable {
                tool_call_id: "tc-read".to_string(),
                output: json!("contents of x"),
            },
        ),
        envelope(
            "s1",
            5,
            todos_update(
                vec![
                    todo("A", TodoStatus::Completed),
                    todo("B", TodoStatus::Completed),
                    todo("C", TodoStatus::Completed),
                ],
                -1,
            ),
        ),
        envelope(
            "s1",
            6,
            UpdatePayload::BuildComplete {
                status: BuildOutcome::Completed,
                summary: Some("done".to_string()),
            },
        ),
    ];

    for event in events {
        state.pipeline.submit(event).await;
    }

    eventually(
        || async {
            state
                .sessions
                .get("s1")
                .await
                .unwrap()
                .map(|s| s.status == SessionStatus::Completed && s.summary.as_deref() == Some("done"))
                .unwrap_or(false)
        },
        "session completed with summary",
    )
    .await;

    let snapshot = state
        .sessions
        .fetch_recovery_snapshot("s1")
        .await
        .unwrap()
        .unwrap();

    assert!(!snapshot.is_active);
    assert_eq!(snapshot.session.status, SessionStatus::Completed);
    assert_eq!(snapshot.todos.len(), 3);
    assert!(snapshot
        .todos
        .iter()
        .all(|t| t.status == TodoStatus::Completed));
    assert_eq!(snapshot.tool_calls.len(), 1);
    assert_eq!(snapshot.tool_calls[0].state, ToolCallState::OutputAvailable);
    assert_eq!(snapshot.planning_tools.len(), 0);
}

// ============================================================================
// P1 + E3: dense indices, shrink prunes todos and their tools
// ============================================================================

#[tokio::test]
async fn test_todo_shrink_prunes_indices_and_tools() {
    let state = test_state().await;
    seed_project(&state, "p1").await;
    seed_session(&state, "p1", "s1", SessionStatus::Pending).await;

    state.pipeline.submit(envelope("s1", 1, start("s1", "p1"))).await;
    state
        .pipeline
        .submit(envelope(
            "s1",
            2,
            todos_update(
                vec![
                    todo("A", TodoStatus::Completed),
                    todo("B", TodoStatus::Pending),
                    todo("C", TodoStatus::Pending),
                    todo("D", TodoStatus::Pending),
                ],
                0,
            ),
        ))
        .await;
    // Tool bound to todo 3, about to be pruned.
    state
        .pipeline
        .submit(envelope(
            "s1",
            3,
            UpdatePayload::ToolInputAvailable {
                tool_call_id: "tc-doomed".to_string(),
                tool_name: "Write".to_string(),
                todo_index: Some(3),
                input: json!({}),
            },
        ))
        .await;
    state
        .pipeline
        .submit(envelope(
            "s1",
            4,
            todos_update(
                vec![todo("A", TodoStatus::Completed), todo("B", TodoStatus::InProgress)],
                1,
            ),
        ))
        .await;

    eventually(
        || async { state.sessions.todo_count("s1").await.unwrap() == 2 },
        "todo list shrank to 2",
    )
    .await;

    let todos = state.sessions.list_todos("s1").await.unwrap();
    let indices: Vec<i64> = todos.iter().map(|t| t.todo_index).collect();
    assert_eq!(indices, vec![0, 1]);
    assert_eq!(todos[1].content, "B");

    // The tool bound past the new count is gone with its todo.
    assert!(state
        .sessions
        .get_tool_call("s1", "tc-doomed")
        .await
        .unwrap()
        .is_none());
}

// ============================================================================
// P2: tool-call state monotonicity
// ============================================================================

#[tokio::test]
async fn test_tool_state_never_regresses() {
    let state = test_state().await;
    seed_project(&state, "p1").await;
    seed_session(&state, "p1", "s1", SessionStatus::Pending).await;

    state.pipeline.submit(envelope("s1", 1, start("s1", "p1"))).await;

    // Output with no prior input: dropped entirely.
    state
        .pipeline
        .submit(envelope(
            "s1",
            2,
            UpdatePayload::ToolOutputAvailable {
                tool_call_id: "tc-ghost".to_string(),
                output: json!("ghost"),
            },
        ))
        .await;

    state
        .pipeline
        .submit(envelope(
            "s1",
            3,
            UpdatePayload::ToolInputAvailable {
                tool_call_id: "tc-1".to_string(),
                tool_name: "Bash".to_string(),
                todo_index: Some(-1),
                input: json!({"command": "ls"}),
            },
        ))
        .await;
    state
        .pipeline
        .submit(envelope(
            "s1",
            4,
            UpdatePayload::ToolError {
                tool_call_id: "tc-1".to_string(),
                error: "command not found".to_string(),
            },
        ))
        .await;
    // Late input for a terminal call: ignored.
    state
        .pipeline
        .submit(envelope(
            "s1",
            5,
            UpdatePayload::ToolInputAvailable {
                tool_call_id: "tc-1".to_string(),
                tool_name: "Bash".to_string(),
                todo_index: Some(-1),
                input: json!({"command": "pwd"}),
            },
        ))
        .await;
    // Second terminal for the same call: ignored.
    state
        .pipeline
        .submit(envelope(
            "s1",
            6,
            UpdatePayload::ToolOutputAvailable {
                tool_call_id: "tc-1".to_string(),
                output: json!("late output"),
            },
        ))
        .await;

    eventually(
        || async {
            state
                .sessions
                .get("s1")
                .await
                .unwrap()
                .map(|s| s.last_seq == 6)
                .unwrap_or(false)
        },
        "all events processed",
    )
    .await;

    assert!(state
        .sessions
        .get_tool_call("s1", "tc-ghost")
        .await
        .unwrap()
        .is_none());

    let tool = state
        .sessions
        .get_tool_call("s1", "tc-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tool.state, ToolCallState::Error);
    // The input from before the terminal state is what survived.
    assert!(tool.input.unwrap().contains("ls"));

    // Planning tools land in their own list in the snapshot.
    let snapshot = state
        .sessions
        .fetch_recovery_snapshot("s1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.planning_tools.len(), 1);
    assert!(snapshot.tool_calls.is_empty());
}

// ============================================================================
// P3: at most one terminal status
// ============================================================================

#[tokio::test]
async fn test_at_most_one_terminal() {
    let state = test_state().await;
    seed_project(&state, "p1").await;
    seed_session(&state, "p1", "s1", SessionStatus::Pending).await;

    state.pipeline.submit(envelope("s1", 1, start("s1", "p1"))).await;
    state
        .pipeline
        .submit(envelope(
            "s1",
            2,
            UpdatePayload::BuildComplete {
                status: BuildOutcome::Completed,
                summary: Some("first".to_string()),
            },
        ))
        .await;
    // A contradictory second terminal, and a forced one, both lose.
    state
        .pipeline
        .submit(envelope(
            "s1",
            3,
            UpdatePayload::BuildComplete {
                status: BuildOutcome::Failed,
                summary: Some("second".to_string()),
            },
        ))
        .await;

    eventually(
        || async {
            state
                .sessions
                .get("s1")
                .await
                .unwrap()
                .map(|s| s.status.is_terminal())
                .unwrap_or(false)
        },
        "session reached a terminal status",
    )
    .await;

    state
        .pipeline
        .force_terminal("s1", BuildOutcome::Failed, "too_late")
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let session = state.sessions.get("s1").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.summary.as_deref(), Some("first"));
    assert!(session.failure_cause.is_none());
}

// ============================================================================
// P4: replay idempotence
// ============================================================================

#[tokio::test]
async fn test_replaying_suffix_changes_nothing() {
    let state = test_state().await;
    seed_project(&state, "p1").await;
    seed_session(&state, "p1", "s1", SessionStatus::Pending).await;

    let stream = vec![
        envelope("s1", 1, start("s1", "p1")),
        envelope(
            "s1",
            2,
            todos_update(
                vec![todo("A", TodoStatus::InProgress), todo("B", TodoStatus::Pending)],
                0,
            ),
        ),
        envelope(
            "s1",
            3,
            UpdatePayload::ToolInputAvailable {
                tool_call_id: "tc-1".to_string(),
                tool_name: "Read".to_string(),
                todo_index: None,
                input: json!({"file": "y"}),
            },
        ),
        envelope(
            "s1",
            4,
            UpdatePayload::ToolOutputAvailable {
                tool_call_id: "tc-1".to_string(),
                output: json!("y contents"),
            },
        ),
    ];

    for event in &stream {
        state.pipeline.submit(event.clone()).await;
    }

    eventually(
        || async {
            state
                .sessions
                .get("s1")
                .await
                .unwrap()
                .map(|s| s.last_seq == 4)
                .unwrap_or(false)
        },
        "stream applied",
    )
    .await;

    let before = state
        .sessions
        .fetch_recovery_snapshot("s1")
        .await
        .unwrap()
        .unwrap();

    // Transport reconnect: the runner replays a suffix with the same seqs.
    for event in &stream[1..] {
        state.pipeline.submit(event.clone()).await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    let after = state
        .sessions
        .fetch_recovery_snapshot("s1")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(before, after);
    assert_eq!(after.tool_calls.len(), 1);
}

// ============================================================================
// Auto-completion holds the terminal broadcast for the runner's summary
// ============================================================================

#[tokio::test]
async fn test_auto_complete_then_runner_terminal() {
    let state = test_state().await;
    seed_project(&state, "p1").await;
    seed_session(&state, "p1", "s1", SessionStatus::Pending).await;

    state.pipeline.submit(envelope("s1", 1, start("s1", "p1"))).await;
    state
        .pipeline
        .submit(envelope(
            "s1",
            2,
            todos_update(vec![todo("A", TodoStatus::Completed)], -1),
        ))
        .await;

    // Store shows completed as soon as every build-phase todo is done.
    eventually(
        || async {
            state
                .sessions
                .get("s1")
                .await
                .unwrap()
                .map(|s| s.status == SessionStatus::Completed)
                .unwrap_or(false)
        },
        "auto-completed",
    )
    .await;

    // The runner's own terminal event still lands the summary.
    state
        .pipeline
        .submit(envelope(
            "s1",
            3,
            UpdatePayload::BuildComplete {
                status: BuildOutcome::Completed,
                summary: Some("all tasks finished".to_string()),
            },
        ))
        .await;

    eventually(
        || async {
            state
                .sessions
                .get("s1")
                .await
                .unwrap()
                .map(|s| s.summary.as_deref() == Some("all tasks finished"))
                .unwrap_or(false)
        },
        "summary recorded after auto-complete",
    )
    .await;
}

#[tokio::test]
async fn test_template_phase_completion_not_terminal() {
    let state = test_state().await;
    seed_project(&state, "p1").await;
    seed_session(&state, "p1", "s1", SessionStatus::Pending).await;

    state.pipeline.submit(envelope("s1", 1, start("s1", "p1"))).await;
    state
        .pipeline
        .submit(envelope(
            "s1",
            2,
            UpdatePayload::TodosUpdate {
                todos: vec![todo("Scaffold", TodoStatus::Completed)],
                active_index: -1,
                phase: TodoPhase::Template,
            },
        ))
        .await;

    eventually(
        || async {
            state
                .sessions
                .get("s1")
                .await
                .unwrap()
                .map(|s| s.last_seq == 2)
                .unwrap_or(false)
        },
        "template todos applied",
    )
    .await;

    let session = state.sessions.get("s1").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Active);
}

// ============================================================================
// E4: cancel with an unresponsive runner
// ============================================================================

#[tokio::test]
async fn test_cancel_timeout_declares_cancelled() {
    let state = test_state().await;
    seed_project(&state, "p1").await;
    seed_session(&state, "p1", "s2", SessionStatus::Active).await;

    // Runner never answers; the grace timer declares the outcome.
    state.registry.cancel_build("rnr-test", "s2").await;

    eventually(
        || async {
            state
                .sessions
                .get("s2")
                .await
                .unwrap()
                .map(|s| s.status == SessionStatus::Cancelled)
                .unwrap_or(false)
        },
        "session cancelled after grace",
    )
    .await;

    // Anything the runner sends afterwards is dropped.
    state
        .pipeline
        .submit(envelope(
            "s2",
            10,
            todos_update(vec![todo("Z", TodoStatus::Pending)], -1),
        ))
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(state.sessions.todo_count("s2").await.unwrap(), 0);
    let session = state.sessions.get("s2").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
}

// ============================================================================
// E5: orphaned sessions fail after the resume window
// ============================================================================

#[tokio::test]
async fn test_orphan_fails_after_window() {
    let state = test_state().await;
    seed_project(&state, "p1").await;
    seed_session(&state, "p1", "s1", SessionStatus::Active).await;

    let (tx, _rx) = tokio::sync::mpsc::channel(8);
    let connection_id = state
        .registry
        .register(
            RunnerHello {
                runner_id: "rnr-test".to_string(),
                hostname: "test".to_string(),
                version: "0.0.0".to_string(),
                os: "linux".to_string(),
                max_builds: 1,
                resume: vec![],
            },
            "local-dev",
            tx,
        )
        .await
        .unwrap();

    state.registry.unregister("rnr-test", &connection_id).await;

    // Orphaned first (still active, resumable)...
    eventually(
        || async { state.sessions.is_orphaned("s1").await.unwrap() },
        "session orphaned on disconnect",
    )
    .await;

    // ...then failed with runner_timeout once the window lapses.
    eventually(
        || async {
            state
                .sessions
                .get("s1")
                .await
                .unwrap()
                .map(|s| {
                    s.status == SessionStatus::Failed
                        && s.failure_cause.as_deref() == Some("runner_timeout")
                })
                .unwrap_or(false)
        },
        "orphan failed after window",
    )
    .await;
}

// ============================================================================
// E2: resume claim keeps the session alive across the window
// ============================================================================

#[tokio::test]
async fn test_resume_claim_clears_orphan() {
    let state = test_state().await;
    seed_project(&state, "p1").await;
    seed_session(&state, "p1", "s1", SessionStatus::Active).await;

    let (tx, _rx) = tokio::sync::mpsc::channel(8);
    let connection_id = state
        .registry
        .register(
            RunnerHello {
                runner_id: "rnr-test".to_string(),
                hostname: "test".to_string(),
                version: "0.0.0".to_string(),
                os: "linux".to_string(),
                max_builds: 1,
                resume: vec![],
            },
            "local-dev",
            tx,
        )
        .await
        .unwrap();
    state.registry.unregister("rnr-test", &connection_id).await;

    eventually(
        || async { state.sessions.is_orphaned("s1").await.unwrap() },
        "session orphaned",
    )
    .await;

    // Reconnect with a resume claim before the window lapses.
    let (tx, _rx) = tokio::sync::mpsc::channel(8);
    state
        .registry
        .register(
            RunnerHello {
                runner_id: "rnr-test".to_string(),
                hostname: "test".to_string(),
                version: "0.0.0".to_string(),
                os: "linux".to_string(),
                max_builds: 1,
                resume: vec!["s1".to_string()],
            },
            "local-dev",
            tx,
        )
        .await
        .unwrap();

    assert!(!state.sessions.is_orphaned("s1").await.unwrap());

    // The session survives past the orphan window and finishes normally.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let session = state.sessions.get("s1").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Active);

    state
        .pipeline
        .submit(envelope(
            "s1",
            5,
            UpdatePayload::BuildComplete {
                status: BuildOutcome::Completed,
                summary: None,
            },
        ))
        .await;

    eventually(
        || async {
            state
                .sessions
                .get("s1")
                .await
                .unwrap()
                .map(|s| s.status == SessionStatus::Completed)
                .unwrap_or(false)
        },
        "resumed session completed",
    )
    .await;
}

// ============================================================================
// Text deltas persist as one assistant chat message at close
// ============================================================================

#[tokio::test]
async fn test_text_deltas_become_assistant_message() {
    let state = test_state().await;
    seed_project(&state, "p1").await;
    seed_session(&state, "p1", "s1", SessionStatus::Pending).await;

    state.pipeline.submit(envelope("s1", 1, start("s1", "p1"))).await;
    for (seq, delta) in [(2, "Hello"), (3, ", "), (4, "world")] {
        state
            .pipeline
            .submit(envelope(
                "s1",
                seq,
                UpdatePayload::TextDelta {
                    message_id: "m1".to_string(),
                    delta: delta.to_string(),
                },
            ))
            .await;
    }
    state
        .pipeline
        .submit(envelope(
            "s1",
            5,
            UpdatePayload::BuildComplete {
                status: BuildOutcome::Completed,
                summary: None,
            },
        ))
        .await;

    eventually(
        || async {
            common::chat_repo(&state)
                .list_for_project("p1", 10)
                .await
                .unwrap()
                .iter()
                .any(|m| m.content == "Hello, world")
        },
        "assistant message persisted",
    )
    .await;
}
