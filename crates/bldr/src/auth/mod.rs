//! Authentication boundary.
//!
//! OAuth and session cookies live in a fronting layer; by the time a
//! request reaches the core it carries an already-validated identity. Two
//! extractors enforce that contract:
//!
//! - [`CurrentUser`]: browser/API callers. In local mode everything is
//!   attributed to a fixed dev user; otherwise the validated identity
//!   arrives in the `x-bldr-user` header set by the auth layer.
//! - [`RunnerIdentity`]: runner callers, authenticated by a runner key
//!   (hashed at rest) or the legacy shared secret.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use log::{debug, warn};
use thiserror::Error;

use crate::api::{ApiError, AppState};
use crate::runner_key::hash_key;

/// User id everything is attributed to in local mode.
pub const LOCAL_MODE_USER: &str = "local-dev";

/// Header carrying the pre-validated caller identity.
pub const USER_HEADER: &str = "x-bldr-user";

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization")]
    MissingAuth,

    #[error("invalid authorization header")]
    InvalidAuthHeader,

    #[error("unknown or revoked runner key")]
    BadRunnerKey,

    #[error("internal auth error: {0}")]
    Internal(String),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingAuth | AuthError::InvalidAuthHeader => {
                ApiError::unauthorized("Missing or invalid authorization")
            }
            AuthError::BadRunnerKey => ApiError::unauthorized("Unknown or revoked runner key"),
            AuthError::Internal(msg) => ApiError::internal(format!("Auth error: {}", msg)),
        }
    }
}

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() || parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

/// The validated user behind a browser/API request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if state.config.local_mode {
            return Ok(CurrentUser {
                id: LOCAL_MODE_USER.to_string(),
            });
        }

        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty());

        match user_id {
            Some(id) => Ok(CurrentUser { id: id.to_string() }),
            None => {
                debug!("Request without validated identity header");
                Err(AuthError::MissingAuth.into())
            }
        }
    }
}

/// The validated runner behind a transport or ingest request.
#[derive(Debug, Clone)]
pub struct RunnerIdentity {
    /// User the runner acts for.
    pub user_id: String,
    /// Runner key id, absent for shared-secret runners.
    pub key_id: Option<String>,
}

impl FromRequestParts<AppState> for RunnerIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingAuth)?;

        let token = bearer_token_from_header(header)?;

        // Legacy runners authenticate with the shared secret.
        if let Some(secret) = &state.config.runner_shared_secret {
            if !secret.is_empty() && token == secret {
                return Ok(RunnerIdentity {
                    user_id: LOCAL_MODE_USER.to_string(),
                    key_id: None,
                });
            }
        }

        let key = state
            .runner_keys
            .find_live_by_hash(&hash_key(token))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        match key {
            Some(key) => {
                if let Err(e) = state.runner_keys.touch_last_used(&key.id).await {
                    warn!("Failed to touch runner key {}: {:#}", key.id, e);
                }
                Ok(RunnerIdentity {
                    user_id: key.user_id,
                    key_id: Some(key.id),
                })
            }
            None => Err(AuthError::BadRunnerKey.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token_from_header("Bearer abc").unwrap(), "abc");
        assert_eq!(bearer_token_from_header("bearer abc").unwrap(), "abc");
        assert!(bearer_token_from_header("Basic abc").is_err());
        assert!(bearer_token_from_header("Bearer").is_err());
        assert!(bearer_token_from_header("Bearer a b").is_err());
        assert!(bearer_token_from_header("").is_err());
    }
}
