//! Application state shared across handlers.

use std::sync::Arc;

use crate::chat::ChatRepository;
use crate::config::AppConfig;
use crate::db::Database;
use crate::ingest::IngestPipeline;
use crate::project::ProjectRepository;
use crate::runner::{RegistryConfig, RunnerRegistry};
use crate::runner_key::RunnerKeyRepository;
use crate::session::SessionRepository;
use crate::ws::WsHub;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Database,
    pub projects: ProjectRepository,
    pub sessions: SessionRepository,
    pub chat: ChatRepository,
    pub runner_keys: RunnerKeyRepository,
    /// Browser fanout hub.
    pub hub: Arc<WsHub>,
    /// Per-session serial ingest pipeline.
    pub pipeline: Arc<IngestPipeline>,
    /// Connected runners and their command queues.
    pub registry: Arc<RunnerRegistry>,
}

impl AppState {
    /// Wire up all services over one database.
    pub fn new(config: AppConfig, db: Database) -> Self {
        Self::with_registry_config(config, db, RegistryConfig::default())
    }

    /// Same, with registry timers overridden (tests shrink them).
    pub fn with_registry_config(
        config: AppConfig,
        db: Database,
        registry_config: RegistryConfig,
    ) -> Self {
        let pool = db.pool().clone();
        let projects = ProjectRepository::new(pool.clone());
        let sessions = SessionRepository::new(pool.clone());
        let chat = ChatRepository::new(pool.clone());
        let runner_keys = RunnerKeyRepository::new(pool);

        let hub = Arc::new(WsHub::new());
        let pipeline = IngestPipeline::new(sessions.clone(), chat.clone(), hub.clone());
        let registry = RunnerRegistry::new(registry_config, sessions.clone(), pipeline.clone());

        Self {
            config: Arc::new(config),
            db,
            projects,
            sessions,
            chat,
            runner_keys,
            hub,
            pipeline,
            registry,
        }
    }
}
