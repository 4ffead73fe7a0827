//! Tunnel lifecycle.
//!
//! Two-stage bring-up per dev server: an injection proxy on a fresh local
//! port, then the tunnel binary pointed at the proxy. Ready means both a
//! public URL line and a "registered connection" line were seen on the
//! child's output, plus a fixed DNS-propagation delay. Transient failures
//! retry with exponential backoff and jitter; permanent ones (missing
//! binary, port in use, permission denied) fail fast and need user action.

use bldr_protocol::RunnerMessage;
use log::{debug, info, warn};
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::config::RunnerConfig;
use crate::inject::InjectionProxy;
use crate::ports::PortAllocator;

/// Retry attempts for transient failures.
const MAX_ATTEMPTS: u32 = 4;

/// Overall limit for one bring-up attempt.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed wait after the tunnel registers, for DNS propagation.
const DNS_DELAY: Duration = Duration::from_secs(3);

/// SIGTERM grace before SIGKILL on shutdown.
const TERM_GRACE: Duration = Duration::from_secs(1);

/// Tunnel bring-up failure, split by retryability.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Retrying cannot help; the user has to act.
    #[error("permanent tunnel failure: {0}")]
    Permanent(String),

    #[error("transient tunnel failure: {0}")]
    Transient(String),
}

impl TunnelError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Classify a spawn error. A missing binary or denied exec never heals on
/// retry.
pub fn classify_spawn_error(err: &std::io::Error) -> TunnelError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            TunnelError::Permanent("tunnel binary not found".to_string())
        }
        std::io::ErrorKind::PermissionDenied => {
            TunnelError::Permanent("permission denied spawning tunnel".to_string())
        }
        _ => TunnelError::Transient(err.to_string()),
    }
}

/// Classify a diagnostic line from the tunnel's output.
pub fn classify_output_line(line: &str) -> Option<TunnelError> {
    let lower = line.to_lowercase();
    if lower.contains("address already in use") || lower.contains("port is already allocated") {
        return Some(TunnelError::Permanent("port in use".to_string()));
    }
    if lower.contains("permission denied") {
        return Some(TunnelError::Permanent("permission denied".to_string()));
    }
    if lower.contains("failed to connect") || lower.contains("connection refused") {
        return Some(TunnelError::Transient(line.trim().to_string()));
    }
    None
}

fn public_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https://[a-zA-Z0-9][a-zA-Z0-9-]*\.trycloudflare\.com").expect("valid regex")
    })
}

/// Extract the public URL from a tunnel output line, if present.
pub fn parse_public_url(line: &str) -> Option<String> {
    public_url_regex().find(line).map(|m| m.as_str().to_string())
}

/// Whether a line announces the tunnel connection is registered upstream.
pub fn is_registered_line(line: &str) -> bool {
    line.contains("Registered tunnel connection")
}

/// A live tunnel with its injection proxy.
pub struct TunnelHandle {
    pub url: String,
    pub proxy_port: u16,
    proxy: Option<InjectionProxy>,
    child: Option<Child>,
}

impl TunnelHandle {
    /// Close proxy first (bounded), then SIGTERM -> grace -> SIGKILL the
    /// tunnel process. Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(mut proxy) = self.proxy.take() {
            proxy.stop().await;
        }

        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }
    }
}

/// Manages one tunnel per project.
pub struct TunnelManager {
    config: Arc<RunnerConfig>,
    ports: Arc<PortAllocator>,
    outbound: mpsc::Sender<RunnerMessage>,
    active: Mutex<HashMap<String, TunnelHandle>>,
}

impl TunnelManager {
    pub fn new(
        config: Arc<RunnerConfig>,
        ports: Arc<PortAllocator>,
        outbound: mpsc::Sender<RunnerMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ports,
            outbound,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Bring up a tunnel for a project's dev server and announce it.
    ///
    /// Failures are reported upstream as `tunnel-failed`; the dev server
    /// keeps running (and keeps its port) either way.
    pub async fn open(self: &Arc<Self>, project_id: &str, dev_port: u16) {
        {
            let active = self.active.lock().await;
            if active.contains_key(project_id) {
                debug!("Tunnel for project {} already up", project_id);
                return;
            }
        }

        let mut last_error = TunnelError::Transient("no attempts made".to_string());

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let base = Duration::from_secs(1 << attempt.min(5));
                let jitter = Duration::from_millis(rand::rng().random_range(0..1_000));
                tokio::time::sleep(base + jitter).await;
            }

            match self.try_open(project_id, dev_port).await {
                Ok(handle) => {
                    let url = handle.url.clone();
                    self.active
                        .lock()
                        .await
                        .insert(project_id.to_string(), handle);
                    let _ = self
                        .outbound
                        .send(RunnerMessage::TunnelAnnounced {
                            project_id: project_id.to_string(),
                            url,
                            port: dev_port,
                        })
                        .await;
                    return;
                }
                Err(e) => {
                    warn!(
                        "Tunnel attempt {} for project {} failed: {}",
                        attempt + 1,
                        project_id,
                        e
                    );
                    let permanent = e.is_permanent();
                    last_error = e;
                    if permanent {
                        break;
                    }
                }
            }
        }

        let _ = self
            .outbound
            .send(RunnerMessage::TunnelFailed {
                project_id: project_id.to_string(),
                error: last_error.to_string(),
                permanent: last_error.is_permanent(),
            })
            .await;
    }

    /// Tear down a project's tunnel, if any. Idempotent.
    pub async fn close(&self, project_id: &str) {
        let handle = self.active.lock().await.remove(project_id);
        if let Some(mut handle) = handle {
            info!("Closing tunnel for project {}", project_id);
            let proxy_port = handle.proxy_port;
            handle.stop().await;
            self.ports.release(proxy_port);
        }
    }

    /// One bring-up attempt: proxy, then tunnel process, then wait for
    /// both ready signals.
    async fn try_open(&self, project_id: &str, dev_port: u16) -> Result<TunnelHandle, TunnelError> {
        let proxy_port = self
            .ports
            .allocate()
            .map_err(|e| TunnelError::Transient(e.to_string()))?;

        let proxy = match InjectionProxy::start(proxy_port, dev_port).await {
            Ok(proxy) => proxy,
            Err(e) => {
                self.ports.release(proxy_port);
                let msg = format!("{:#}", e);
                return Err(if msg.to_lowercase().contains("address") {
                    TunnelError::Permanent("port in use".to_string())
                } else {
                    TunnelError::Transient(msg)
                });
            }
        };

        info!(
            "Starting tunnel for project {} (proxy {} -> dev {})",
            project_id, proxy_port, dev_port
        );

        let spawned = Command::new(&self.config.tunnel_binary)
            .arg("tunnel")
            .arg("--url")
            .arg(format!("http://127.0.0.1:{}", proxy_port))
            .arg("--no-autoupdate")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let classified = classify_spawn_error(&e);
                let mut proxy = proxy;
                proxy.stop().await;
                self.ports.release(proxy_port);
                return Err(classified);
            }
        };

        match wait_for_ready(&mut child).await {
            Ok(url) => {
                tokio::time::sleep(DNS_DELAY).await;
                Ok(TunnelHandle {
                    url,
                    proxy_port,
                    proxy: Some(proxy),
                    child: Some(child),
                })
            }
            Err(e) => {
                let mut handle = TunnelHandle {
                    url: String::new(),
                    proxy_port,
                    proxy: Some(proxy),
                    child: Some(child),
                };
                handle.stop().await;
                self.ports.release(proxy_port);
                Err(e)
            }
        }
    }
}

/// Scan the tunnel's output for the public URL and the registration line.
async fn wait_for_ready(child: &mut Child) -> Result<String, TunnelError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TunnelError::Transient("tunnel stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TunnelError::Transient("tunnel stderr not captured".to_string()))?;

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut url: Option<String> = None;
    let mut registered = false;

    let scan = async {
        loop {
            let line = tokio::select! {
                l = stdout_lines.next_line() => l,
                l = stderr_lines.next_line() => l,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(TunnelError::Transient(
                        "tunnel exited before becoming ready".to_string(),
                    ));
                }
                Err(e) => return Err(TunnelError::Transient(e.to_string())),
            };

            debug!("tunnel: {}", line);

            if let Some(error) = classify_output_line(&line) {
                return Err(error);
            }
            if url.is_none() {
                url = parse_public_url(&line);
            }
            if is_registered_line(&line) {
                registered = true;
            }
            if registered {
                if let Some(url) = &url {
                    return Ok(url.clone());
                }
            }
        }
    };

    match tokio::time::timeout(READY_TIMEOUT, scan).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::Transient(format!(
            "tunnel not ready within {:?}",
            READY_TIMEOUT
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_classification() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "no cloudflared");
        assert!(classify_spawn_error(&not_found).is_permanent());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(classify_spawn_error(&denied).is_permanent());

        let other = std::io::Error::other("flaky");
        assert!(!classify_spawn_error(&other).is_permanent());
    }

    #[test]
    fn test_output_line_classification() {
        assert!(classify_output_line("bind: address already in use")
            .unwrap()
            .is_permanent());
        assert!(classify_output_line("open /etc/x: permission denied")
            .unwrap()
            .is_permanent());
        assert!(!classify_output_line("ERR failed to connect to edge")
            .unwrap()
            .is_permanent());
        assert!(classify_output_line("INF Starting tunnel").is_none());
    }

    #[test]
    fn test_public_url_parsing() {
        let line = "2026-07-01T10:00:00Z INF +  https://witty-lemur-halt.trycloudflare.com  +";
        assert_eq!(
            parse_public_url(line).unwrap(),
            "https://witty-lemur-halt.trycloudflare.com"
        );
        assert!(parse_public_url("INF Version 2026.1.0").is_none());
    }

    #[test]
    fn test_registered_line() {
        assert!(is_registered_line(
            "2026-07-01T10:00:01Z INF Registered tunnel connection connIndex=0"
        ));
        assert!(!is_registered_line("INF Starting metrics server"));
    }
}
