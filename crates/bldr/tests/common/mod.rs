//! Test utilities and common setup.
#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use axum_test::TestServer;
use bldr::api::{self, AppState};
use bldr::chat::ChatRepository;
use bldr::config::AppConfig;
use bldr::db::Database;
use bldr::project::Project;
use bldr::runner::RegistryConfig;
use bldr::session::Session;
use bldr_protocol::{
    DevServerState, OperationType, SessionStatus, UpdateEnvelope, UpdatePayload,
};
use chrono::Utc;
use uuid::Uuid;

/// Test config: local mode, shared secret for runner ingress.
pub fn test_config() -> AppConfig {
    AppConfig {
        local_mode: true,
        runner_shared_secret: Some("test-shared-secret".to_string()),
        ..AppConfig::default()
    }
}

/// Registry timers shrunk so grace/orphan paths run inside a test.
pub fn fast_registry_config() -> RegistryConfig {
    RegistryConfig {
        ack_timeout: Duration::from_millis(100),
        cancel_grace: Duration::from_millis(100),
        orphan_window: Duration::from_millis(200),
    }
}

/// App state over an in-memory database.
pub async fn test_state() -> AppState {
    let db = Database::in_memory().await.unwrap();
    AppState::with_registry_config(test_config(), db, fast_registry_config())
}

/// Test server wrapping the full router.
pub async fn test_app() -> (TestServer, AppState) {
    let state = test_state().await;
    let server = TestServer::new(api::create_router(state.clone())).unwrap();
    (server, state)
}

/// Insert a project owned by the local dev user, pinned to a runner.
pub async fn seed_project(state: &AppState, id: &str) -> Project {
    let project = Project {
        id: id.to_string(),
        slug: format!("proj-{}", id),
        owner_id: "local-dev".to_string(),
        runner_id: Some("rnr-test".to_string()),
        workspace_path: Some(format!("/tmp/bldr-test/{}", id)),
        framework: None,
        dev_server_status: DevServerState::Stopped,
        dev_server_port: None,
        dev_server_error: None,
        tunnel_url: None,
        tunnel_error: None,
        created_at: Utc::now().to_rfc3339(),
    };
    state.projects.create(&project).await.unwrap();
    project
}

/// Insert a session in the given status.
pub async fn seed_session(
    state: &AppState,
    project_id: &str,
    session_id: &str,
    status: SessionStatus,
) -> Session {
    let session = Session {
        id: session_id.to_string(),
        project_id: project_id.to_string(),
        build_id: Uuid::new_v4().to_string(),
        runner_id: Some("rnr-test".to_string()),
        agent_id: "claude-code".to_string(),
        model_id: "default".to_string(),
        operation: OperationType::InitialBuild,
        status: SessionStatus::Pending,
        last_seq: 0,
        orphaned_at: None,
        started_at: None,
        ended_at: None,
        summary: None,
        failure_cause: None,
        created_at: Utc::now().to_rfc3339(),
    };
    state.sessions.upsert(&session).await.unwrap();
    if status == SessionStatus::Active {
        state
            .sessions
            .transition(
                session_id,
                &[SessionStatus::Pending],
                SessionStatus::Active,
                None,
                None,
            )
            .await
            .unwrap();
    }
    state.sessions.get(session_id).await.unwrap().unwrap()
}

/// Shorthand for a known-update envelope.
pub fn envelope(session_id: &str, seq: u64, update: UpdatePayload) -> UpdateEnvelope {
    UpdateEnvelope::new(session_id, seq, update)
}

/// Poll a condition until it holds or the deadline passes.
///
/// Ingest runs on per-session worker tasks, so tests observe effects
/// asynchronously.
pub async fn eventually<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition never held: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Access to the chat repository for assertions.
pub fn chat_repo(state: &AppState) -> &ChatRepository {
    &state.chat
}
