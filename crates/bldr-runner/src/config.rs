//! Runner configuration.

use ::config::{Config, Environment, File, FileFormat};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Runner configuration, loaded from file plus `BLDR_RUNNER_` env vars.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Control-plane WebSocket endpoint, e.g. `ws://127.0.0.1:4100/ws/runner`.
    pub control_plane_url: String,
    /// Runner key (or shared secret) presented on the handshake.
    pub runner_key: String,
    /// Stable runner identifier. Defaults to `rnr-<hostname>`.
    pub runner_id: String,
    /// Maximum concurrent builds.
    pub max_builds: u32,
    /// Root for project workspaces on this machine.
    pub workspace_root: PathBuf,
    /// Claude-like agent binary.
    pub claude_binary: String,
    /// Codex-like agent binary.
    pub codex_binary: String,
    /// Tunnel provider binary.
    pub tunnel_binary: String,
    /// First port the allocator hands out for dev servers and proxies.
    pub port_range_start: u16,
    /// Size of the allocator's port range.
    pub port_range_len: u16,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        Self {
            control_plane_url: "ws://127.0.0.1:4100/ws/runner".to_string(),
            runner_key: String::new(),
            runner_id: format!("rnr-{}", hostname),
            max_builds: 1,
            workspace_root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("bldr-workspaces"),
            claude_binary: "claude".to_string(),
            codex_binary: "codex".to_string(),
            tunnel_binary: "cloudflared".to_string(),
            port_range_start: 41820,
            port_range_len: 200,
        }
    }
}

impl RunnerConfig {
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
            let default_path = dir.join("bldr").join("runner.toml");
            builder = builder.add_source(
                File::from(default_path)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(Environment::with_prefix("BLDR_RUNNER"));

        let config: RunnerConfig = builder
            .build()
            .context("building runner configuration")?
            .try_deserialize()
            .context("deserializing runner configuration")?;

        if config.runner_key.is_empty() {
            anyhow::bail!("runner_key must be set (BLDR_RUNNER_RUNNER_KEY)");
        }

        Ok(config)
    }
}
