//! Fanout hub for browser connections.
//!
//! One registry entry per project holds every subscribed browser socket.
//! Delivery is lock-free past the registry: each socket owns a bounded send
//! queue drained by its writer task, so a slow tab never stalls the
//! per-session ingest worker or its sibling tabs.

use bldr_protocol::UpdateEnvelope;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Size of the per-connection send queue. A queue this deep only fills when
/// the socket stops accepting writes, at which point the client is closed
/// and heals through `state-recovery` on reconnect.
const CONNECTION_BUFFER_SIZE: usize = 256;

/// A registered browser connection. The queue carries bare envelopes; the
/// socket writer packs everything available into one `batch-update` frame.
struct ClientHandle {
    client_id: String,
    tx: mpsc::Sender<UpdateEnvelope>,
}

/// Fanout hub managing browser connections per project.
pub struct WsHub {
    /// Project ID -> subscribed clients.
    clients: DashMap<String, Vec<ClientHandle>>,
}

impl WsHub {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register a browser connection for a project.
    ///
    /// Returns the assigned client id and the receive side of its send
    /// queue.
    pub fn register(&self, project_id: &str) -> (String, mpsc::Receiver<UpdateEnvelope>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let client_id = Uuid::new_v4().to_string();
        self.clients
            .entry(project_id.to_string())
            .or_default()
            .push(ClientHandle {
                client_id: client_id.clone(),
                tx,
            });
        info!(
            "Registered browser client {} for project {}",
            client_id, project_id
        );
        (client_id, rx)
    }

    /// Unregister a browser connection.
    pub fn unregister(&self, project_id: &str, client_id: &str) {
        if let Some(mut clients) = self.clients.get_mut(project_id) {
            clients.retain(|c| c.client_id != client_id);
        }
        self.clients.retain(|_, v| !v.is_empty());
        info!(
            "Unregistered browser client {} for project {}",
            client_id, project_id
        );
    }

    /// Broadcast one canonical update to every client of a project.
    ///
    /// Every socket gets an identical message. A full queue means the writer
    /// is stuck on an unwritable socket; that client is dropped and will
    /// replace its state from the next `state-recovery`.
    pub fn broadcast_update(&self, project_id: &str, envelope: UpdateEnvelope) {
        let Some(mut clients) = self.clients.get_mut(project_id) else {
            return;
        };

        clients.retain(|client| {
            match client.tx.try_send(envelope.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Browser client {} for project {} stalled, dropping connection",
                        client.client_id, project_id
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(
                        "Browser client {} for project {} already gone",
                        client.client_id, project_id
                    );
                    false
                }
            }
        });
    }

    /// Number of clients subscribed to a project.
    pub fn client_count(&self, project_id: &str) -> usize {
        self.clients.get(project_id).map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}
