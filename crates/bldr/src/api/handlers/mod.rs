//! REST handlers.

mod auth_cli;
mod build_events;
mod messages;
mod misc;
mod projects;
mod runner_keys;
mod runners;

pub use auth_cli::start_cli_auth;
pub use build_events::ingest_build_events;
pub use messages::{append_message, list_messages};
pub use misc::health;
pub use projects::{
    cancel_build, create_project, generate, get_project, list_projects, project_messages,
};
pub use runner_keys::{create_runner_key, list_runner_keys, revoke_runner_key};
pub use runners::list_runners;
