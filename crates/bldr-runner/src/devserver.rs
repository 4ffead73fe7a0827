//! Dev-server lifecycle.
//!
//! One dev server per project, on a port the runner assigns. The start
//! gate is strict: the process must stay alive and accept a TCP connection
//! on its port within the startup window, or the attempt is failed and
//! the port released. An exit, any cause, releases the port and closes the
//! project's tunnel.

use bldr_protocol::{DevServerState, RunnerMessage};
use log::{info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

use crate::ports::PortAllocator;
use crate::tunnel::TunnelManager;

/// The process must be listening within this window or the start fails.
const START_WINDOW: Duration = Duration::from_secs(8);

/// Port-probe cadence during startup.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Frameworks with a known dev command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framework {
    Next,
    Vite,
    Astro,
    Angular,
    Unknown,
}

impl Framework {
    /// Detect from a workspace's package.json dependencies.
    pub fn detect(workspace: &Path) -> Self {
        let package_json = workspace.join("package.json");
        match std::fs::read_to_string(&package_json) {
            Ok(contents) => Self::from_package_json(&contents),
            Err(_) => Self::Unknown,
        }
    }

    /// Detect from package.json contents.
    pub fn from_package_json(contents: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(contents) else {
            return Self::Unknown;
        };

        let has_dep = |name: &str| -> bool {
            ["dependencies", "devDependencies"]
                .iter()
                .any(|section| value.get(section).and_then(|d| d.get(name)).is_some())
        };

        if has_dep("next") {
            Self::Next
        } else if has_dep("astro") {
            Self::Astro
        } else if has_dep("@angular/core") || has_dep("@angular/cli") {
            Self::Angular
        } else if has_dep("vite") {
            Self::Vite
        } else {
            Self::Unknown
        }
    }

    /// Program and arguments for the dev server on an enforced port.
    pub fn dev_command(&self, port: u16) -> (String, Vec<String>) {
        let port = port.to_string();
        match self {
            Self::Next => (
                "npm".to_string(),
                vec![
                    "run".to_string(),
                    "dev".to_string(),
                    "--".to_string(),
                    "-p".to_string(),
                    port,
                ],
            ),
            Self::Vite => (
                "npm".to_string(),
                vec![
                    "run".to_string(),
                    "dev".to_string(),
                    "--".to_string(),
                    "--port".to_string(),
                    port,
                    "--strictPort".to_string(),
                ],
            ),
            Self::Astro => (
                "npm".to_string(),
                vec![
                    "run".to_string(),
                    "dev".to_string(),
                    "--".to_string(),
                    "--port".to_string(),
                    port,
                ],
            ),
            Self::Angular => (
                "npx".to_string(),
                vec!["ng".to_string(), "serve".to_string(), "--port".to_string(), port],
            ),
            // Unknown frameworks get the port through the environment only.
            Self::Unknown => ("npm".to_string(), vec!["run".to_string(), "dev".to_string()]),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::Vite => "vite",
            Self::Astro => "astro",
            Self::Angular => "angular",
            Self::Unknown => "unknown",
        }
    }
}

struct DevServerHandle {
    port: u16,
    pid: u32,
}

/// Manages dev-server processes per project.
pub struct DevServerManager {
    ports: Arc<PortAllocator>,
    tunnels: Arc<TunnelManager>,
    outbound: mpsc::Sender<RunnerMessage>,
    active: Mutex<HashMap<String, DevServerHandle>>,
}

impl DevServerManager {
    pub fn new(
        ports: Arc<PortAllocator>,
        tunnels: Arc<TunnelManager>,
        outbound: mpsc::Sender<RunnerMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ports,
            tunnels,
            outbound,
            active: Mutex::new(HashMap::new()),
        })
    }

    async fn report(&self, project_id: &str, state: DevServerState, port: Option<u16>, error: Option<String>) {
        self.report_with_framework(project_id, state, port, None, error)
            .await;
    }

    async fn report_with_framework(
        &self,
        project_id: &str,
        state: DevServerState,
        port: Option<u16>,
        framework: Option<&str>,
        error: Option<String>,
    ) {
        let _ = self
            .outbound
            .send(RunnerMessage::DevServerStatus {
                project_id: project_id.to_string(),
                state,
                port,
                framework: framework.map(String::from),
                error,
            })
            .await;
    }

    /// Start the project's dev server if it is not already running, then
    /// bring up its tunnel.
    pub async fn ensure_running(self: &Arc<Self>, project_id: &str, workspace: &Path) {
        {
            let active = self.active.lock().await;
            if active.contains_key(project_id) {
                return;
            }
        }

        let port = match self.ports.allocate() {
            Ok(port) => port,
            Err(e) => {
                warn!("No port for dev server of project {}: {:#}", project_id, e);
                self.report(project_id, DevServerState::Failed, None, Some(e.to_string()))
                    .await;
                return;
            }
        };

        let framework = Framework::detect(workspace);
        info!(
            "Starting {} dev server for project {} on port {}",
            framework.name(),
            project_id,
            port
        );
        self.report_with_framework(
            project_id,
            DevServerState::Starting,
            Some(port),
            Some(framework.name()),
            None,
        )
        .await;

        let (program, args) = framework.dev_command(port);
        let spawned = Command::new(&program)
            .args(&args)
            .current_dir(workspace)
            .env("PORT", port.to_string())
            .env("HOST", "127.0.0.1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(port);
                self.report(
                    project_id,
                    DevServerState::Failed,
                    None,
                    Some(format!("spawn failed: {}", e)),
                )
                .await;
                return;
            }
        };

        // Start gate: listening within the window, process still alive.
        let deadline = tokio::time::Instant::now() + START_WINDOW;
        let ready = loop {
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.ports.release(port);
                    self.report(
                        project_id,
                        DevServerState::Failed,
                        None,
                        Some(format!("exited during startup: {}", status)),
                    )
                    .await;
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Dev server wait error for project {}: {}", project_id, e);
                }
            }
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                break true;
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        };

        if !ready {
            let _ = child.kill().await;
            self.ports.release(port);
            self.report(
                project_id,
                DevServerState::Failed,
                None,
                Some(format!("no listener on port {} within {:?}", port, START_WINDOW)),
            )
            .await;
            return;
        }

        let pid = child.id().unwrap_or(0);
        self.active.lock().await.insert(
            project_id.to_string(),
            DevServerHandle { port, pid },
        );
        self.report(project_id, DevServerState::Running, Some(port), None)
            .await;

        // Exit watcher owns the child: any exit releases the port and tears
        // the tunnel down with it.
        let manager = self.clone();
        let project = project_id.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            let failed = match &status {
                Ok(status) => !status.success(),
                Err(_) => true,
            };
            info!(
                "Dev server for project {} exited ({:?})",
                project, status
            );

            manager.active.lock().await.remove(&project);
            manager.ports.release(port);
            manager.tunnels.close(&project).await;

            let (state, error) = if failed {
                (
                    DevServerState::Failed,
                    status.ok().map(|s| format!("exited: {}", s)),
                )
            } else {
                (DevServerState::Stopped, None)
            };
            manager.report(&project, state, None, error).await;
        });

        let tunnels = self.tunnels.clone();
        let project = project_id.to_string();
        tokio::spawn(async move {
            tunnels.open(&project, port).await;
        });
    }

    /// Stop a project's dev server cooperatively. The exit watcher handles
    /// the cleanup.
    pub async fn stop(&self, project_id: &str) {
        let pid = {
            let active = self.active.lock().await;
            active.get(project_id).map(|h| h.pid)
        };

        let Some(pid) = pid else {
            return;
        };

        self.report(project_id, DevServerState::Stopping, None, None)
            .await;
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framework_detection() {
        let next = r#"{"dependencies": {"next": "15.0.0", "react": "19.0.0"}}"#;
        assert_eq!(Framework::from_package_json(next), Framework::Next);

        let vite = r#"{"devDependencies": {"vite": "6.0.0"}}"#;
        assert_eq!(Framework::from_package_json(vite), Framework::Vite);

        let astro = r#"{"dependencies": {"astro": "5.0.0"}}"#;
        assert_eq!(Framework::from_package_json(astro), Framework::Astro);

        let angular = r#"{"dependencies": {"@angular/core": "19.0.0"}}"#;
        assert_eq!(Framework::from_package_json(angular), Framework::Angular);

        let plain = r#"{"dependencies": {"express": "4.0.0"}}"#;
        assert_eq!(Framework::from_package_json(plain), Framework::Unknown);

        assert_eq!(Framework::from_package_json("not json"), Framework::Unknown);
    }

    #[test]
    fn test_detect_from_workspace_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"astro": "5.0.0"}}"#,
        )
        .unwrap();
        assert_eq!(Framework::detect(dir.path()), Framework::Astro);

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(Framework::detect(empty.path()), Framework::Unknown);
    }

    #[test]
    fn test_next_wins_over_vite() {
        // Next projects often carry vite via tooling; next is the server.
        let both = r#"{"dependencies": {"next": "15.0.0"}, "devDependencies": {"vite": "6.0.0"}}"#;
        assert_eq!(Framework::from_package_json(both), Framework::Next);
    }

    #[test]
    fn test_dev_commands_enforce_port() {
        let (program, args) = Framework::Vite.dev_command(5173);
        assert_eq!(program, "npm");
        assert!(args.contains(&"5173".to_string()));
        assert!(args.contains(&"--strictPort".to_string()));

        let (_, args) = Framework::Next.dev_command(3000);
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "3000"));

        // Unknown relies on the PORT env var alone.
        let (_, args) = Framework::Unknown.dev_command(4000);
        assert!(!args.contains(&"4000".to_string()));
    }
}
