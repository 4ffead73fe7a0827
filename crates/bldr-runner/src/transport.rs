//! Outbound transport to the control plane.
//!
//! One long-lived WebSocket, driven by an explicit connection state
//! machine: `Idle -> Connecting -> Connected -> Backoff(n) -> Connecting`.
//! Backoff starts at a 1 s floor, doubles with jitter, and caps at 30 s; a
//! 401-class rejection stops the loop permanently instead of hammering a
//! revoked key. Outbound frames come from one mpsc drained by a single
//! writer, so event order per session is exactly emission order; frames
//! buffered while disconnected flow out after the reconnect and the
//! control plane drops any the store has already seen.

use anyhow::{Context, Result};
use bldr_protocol::{
    ControlMessage, Incoming, RunnerHello, RunnerMessage, LIVENESS_MULTIPLIER,
    RUNNER_HEARTBEAT_SECS,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::connect_async;

use crate::build::BuildManager;
use crate::config::RunnerConfig;

/// Backoff floor. Reconnects are never attempted faster than this.
const BACKOFF_FLOOR_MS: u64 = 1_000;

/// Backoff cap.
const BACKOFF_CAP_MS: u64 = 30_000;

/// Jitter added to every backoff delay, +/- this many ms.
const BACKOFF_JITTER_MS: u64 = 1_000;

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    /// Waiting to reconnect; n counts consecutive failures.
    Backoff(u32),
    /// Credential rejected; no further attempts.
    Rejected,
}

/// Exponential backoff delay for the nth consecutive failure, jittered.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_FLOOR_MS.saturating_mul(1u64 << attempt.min(5));
    let capped = base.min(BACKOFF_CAP_MS);
    let jitter = rand::rng().random_range(0..=BACKOFF_JITTER_MS * 2);
    let with_jitter = (capped + jitter).saturating_sub(BACKOFF_JITTER_MS);
    Duration::from_millis(with_jitter.max(BACKOFF_FLOOR_MS))
}

/// How one connection attempt ended.
enum Outcome {
    /// Channel closed after a healthy run; reconnect promptly.
    Closed,
    /// Authentication rejected; stop for good.
    AuthRejected,
}

/// Runner-side transport supervisor.
pub struct Transport {
    config: Arc<RunnerConfig>,
    builds: Arc<BuildManager>,
    outbound_rx: mpsc::Receiver<RunnerMessage>,
}

impl Transport {
    pub fn new(
        config: Arc<RunnerConfig>,
        builds: Arc<BuildManager>,
        outbound_rx: mpsc::Receiver<RunnerMessage>,
    ) -> Self {
        Self {
            config,
            builds,
            outbound_rx,
        }
    }

    /// Run the reconnect loop until the credential is rejected or the
    /// process shuts down.
    pub async fn run(mut self) -> Result<()> {
        let mut state = ConnState::Idle;
        debug!("Transport state: {:?}", state);
        let mut failures = 0u32;

        loop {
            state = ConnState::Connecting;
            debug!("Transport state: {:?}", state);

            match self.connect_once().await {
                Ok(Outcome::AuthRejected) => {
                    state = ConnState::Rejected;
                    debug!("Transport state: {:?}", state);
                    warn!("Control plane rejected our credential; giving up");
                    anyhow::bail!("runner credential rejected");
                }
                Ok(Outcome::Closed) => {
                    // A run that got as far as hello-ack resets the backoff.
                    failures = 0;
                    info!("Transport closed, reconnecting");
                }
                Err(e) => {
                    failures += 1;
                    warn!("Transport attempt failed ({}): {:#}", failures, e);
                }
            }

            state = ConnState::Backoff(failures);
            debug!("Transport state: {:?}", state);
            tokio::time::sleep(backoff_delay(failures)).await;
        }
    }

    /// One full connection: dial, hello, pump frames until the channel
    /// dies.
    async fn connect_once(&mut self) -> Result<Outcome> {
        let mut request = self
            .config
            .control_plane_url
            .clone()
            .into_client_request()
            .context("building transport request")?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.config.runner_key)
                .parse()
                .context("building authorization header")?,
        );

        let (stream, _response) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(tokio_tungstenite::tungstenite::Error::Http(response))
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                return Ok(Outcome::AuthRejected);
            }
            Err(e) => return Err(e).context("dialing control plane"),
        };

        let (mut sink, mut source) = stream.split();

        let hello = RunnerMessage::Hello(RunnerHello {
            runner_id: self.config.runner_id.clone(),
            hostname: hostname(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            max_builds: self.config.max_builds,
            resume: self.builds.active_sessions(),
        });
        send_frame(&mut sink, &hello).await?;

        let mut heartbeat = tokio::time::interval(Duration::from_secs(RUNNER_HEARTBEAT_SECS));
        let liveness_window =
            Duration::from_secs(RUNNER_HEARTBEAT_SECS * LIVENESS_MULTIPLIER as u64);
        let mut last_heard = Instant::now();

        info!("Transport connected to {}", self.config.control_plane_url);

        loop {
            tokio::select! {
                maybe_out = self.outbound_rx.recv() => {
                    let Some(msg) = maybe_out else {
                        // All producers gone; shutting down.
                        return Ok(Outcome::Closed);
                    };
                    send_frame(&mut sink, &msg).await?;
                }

                _ = heartbeat.tick() => {
                    if last_heard.elapsed() > liveness_window {
                        warn!("No traffic from control plane for {:?}, reconnecting", liveness_window);
                        return Ok(Outcome::Closed);
                    }
                    send_frame(&mut sink, &RunnerMessage::Heartbeat).await?;
                }

                maybe_frame = source.next() => {
                    let Some(frame) = maybe_frame else {
                        return Ok(Outcome::Closed);
                    };
                    last_heard = Instant::now();

                    let text = match frame.context("reading transport frame")? {
                        Message::Text(text) => text,
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => return Ok(Outcome::Closed),
                        _ => continue,
                    };

                    match serde_json::from_str::<Incoming<ControlMessage>>(&text) {
                        Ok(Incoming::Known(msg)) => {
                            if self.handle_control(msg).await {
                                return Ok(Outcome::Closed);
                            }
                        }
                        Ok(Incoming::Unknown(value)) => {
                            debug!(
                                "Ignoring unknown control kind {}",
                                value.get("kind").and_then(|k| k.as_str()).unwrap_or("?")
                            );
                        }
                        Err(e) => warn!("Malformed control frame dropped: {}", e),
                    }
                }
            }
        }
    }

    /// Apply one control message. Returns true when the channel should
    /// close.
    async fn handle_control(&self, msg: ControlMessage) -> bool {
        match msg {
            ControlMessage::HelloAck { connection_id } => {
                info!("Registered with control plane (connection {})", connection_id);
                false
            }
            ControlMessage::Heartbeat => false,
            ControlMessage::CommandDispatch(command) => {
                self.builds.accept_command(command).await;
                false
            }
            ControlMessage::CancelBuild { session_id } => {
                self.builds.cancel(&session_id).await;
                false
            }
            ControlMessage::Goodbye { reason } => {
                info!("Control plane said goodbye: {}", reason);
                true
            }
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

async fn send_frame<S>(sink: &mut S, msg: &RunnerMessage) -> Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(msg).context("serializing frame")?;
    sink.send(Message::Text(json.into()))
        .await
        .context("sending frame")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_floor_and_cap() {
        for _ in 0..50 {
            let first = backoff_delay(0);
            assert!(first >= Duration::from_millis(BACKOFF_FLOOR_MS));
            assert!(first <= Duration::from_millis(BACKOFF_FLOOR_MS + 2 * BACKOFF_JITTER_MS));

            let deep = backoff_delay(12);
            assert!(deep <= Duration::from_millis(BACKOFF_CAP_MS + BACKOFF_JITTER_MS));
            assert!(deep >= Duration::from_millis(BACKOFF_CAP_MS - BACKOFF_JITTER_MS));
        }
    }

    #[test]
    fn test_backoff_grows() {
        // Strip jitter by comparing midpoints over many samples.
        let avg = |attempt: u32| -> u128 {
            (0..200)
                .map(|_| backoff_delay(attempt).as_millis())
                .sum::<u128>()
                / 200
        };
        assert!(avg(0) < avg(2));
        assert!(avg(2) < avg(4));
    }
}
