//! Configuration loading.
//!
//! Layered the usual way: defaults, then an optional TOML file, then
//! `BLDR_`-prefixed environment variables. `LOCAL_MODE` and
//! `RUNNER_SHARED_SECRET` are also honored bare for compatibility with
//! runner deployments that predate the prefix.

use ::config::{Config, Environment, File, FileFormat};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Control-plane configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// SQLite database path.
    pub database_path: PathBuf,
    /// Root directory for project workspaces on runners.
    pub workspace_root: PathBuf,
    /// Default agent when a build request names none.
    pub default_agent_id: String,
    /// Default model when a build request names none.
    pub default_model_id: String,
    /// Attribute all actions to a fixed dev user and skip identity checks.
    pub local_mode: bool,
    /// Bearer secret accepted from legacy runners.
    pub runner_shared_secret: Option<String>,
    /// Public base URL used when constructing auth URLs for the CLI flow.
    pub public_base_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bldr");
        Self {
            host: "127.0.0.1".to_string(),
            port: 4100,
            database_path: data_dir.join("bldr.db"),
            workspace_root: data_dir.join("workspaces"),
            default_agent_id: "claude-code".to_string(),
            default_model_id: "default".to_string(),
            local_mode: false,
            runner_shared_secret: None,
            public_base_url: "http://127.0.0.1:4100".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        } else if let Some(dir) = dirs::config_dir() {
            let default_path = dir.join("bldr").join("config.toml");
            builder = builder.add_source(
                File::from(default_path)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(Environment::with_prefix("BLDR"));

        let mut config: AppConfig = builder
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;

        // Bare env vars recognized at the core boundary.
        if let Ok(v) = std::env::var("LOCAL_MODE") {
            config.local_mode = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("RUNNER_SHARED_SECRET") {
            if !v.is_empty() {
                config.runner_shared_secret = Some(v);
            }
        }

        Ok(config)
    }
}
