//! Runner key data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A runner credential, hashed at rest. The plaintext secret is shown only
/// once, at creation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunnerKey {
    pub id: String,
    pub user_id: String,
    /// SHA-256 of the secret, hex-encoded.
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub label: Option<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub revoked_at: Option<String>,
}

impl RunnerKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Response for a freshly created key; carries the plaintext secret exactly
/// once.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerKeyCreated {
    pub id: String,
    pub key: String,
    pub label: Option<String>,
    pub created_at: String,
}
