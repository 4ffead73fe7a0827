//! Runner key database repository.

use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{RunnerKey, RunnerKeyCreated};

/// Prefix on every runner key secret, so leaked keys are greppable.
const KEY_PREFIX: &str = "bldr_rk_";

/// Hash a plaintext runner key secret for at-rest storage and lookups.
pub fn hash_key(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(digest)
}

/// Repository for runner key persistence.
#[derive(Debug, Clone)]
pub struct RunnerKeyRepository {
    pool: SqlitePool,
}

impl RunnerKeyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mint a new key for a user. The plaintext secret is returned once and
    /// never stored.
    pub async fn create(&self, user_id: &str, label: Option<&str>) -> Result<RunnerKeyCreated> {
        let mut raw = [0u8; 32];
        rand::rng().fill_bytes(&mut raw);
        let secret = format!(
            "{}{}",
            KEY_PREFIX,
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
        );

        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO runner_keys (id, user_id, key_hash, label, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(hash_key(&secret))
        .bind(label)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .context("creating runner key")?;

        Ok(RunnerKeyCreated {
            id,
            key: secret,
            label: label.map(String::from),
            created_at,
        })
    }

    /// List a user's keys (hashes stay server-side).
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<RunnerKey>> {
        let keys = sqlx::query_as::<_, RunnerKey>(
            "SELECT id, user_id, key_hash, label, created_at, last_used_at, revoked_at FROM runner_keys WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing runner keys")?;

        Ok(keys)
    }

    /// Look up a live key by the hash of a presented secret.
    pub async fn find_live_by_hash(&self, key_hash: &str) -> Result<Option<RunnerKey>> {
        let key = sqlx::query_as::<_, RunnerKey>(
            "SELECT id, user_id, key_hash, label, created_at, last_used_at, revoked_at FROM runner_keys WHERE key_hash = ? AND revoked_at IS NULL",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .context("looking up runner key")?;

        Ok(key)
    }

    /// Stamp a key as just used.
    pub async fn touch_last_used(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE runner_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touching runner key")?;

        Ok(())
    }

    /// Revoke a key. Takes effect immediately; in-flight transports using it
    /// are closed by the caller.
    pub async fn revoke(&self, user_id: &str, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runner_keys SET revoked_at = ? WHERE id = ? AND user_id = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("revoking runner key")?;

        Ok(result.rows_affected() > 0)
    }
}
