//! API-key authentication middleware.
//!
//! Grounded on `dwctl`'s bearer-token extraction layer, simplified to a single
//! key kind (no scopes/roles): a request carries its key as `Authorization:
//! Bearer <secret>` or `X-Api-Key: <secret>`. The secret is hashed with SHA-256
//! and looked up by hash so the durable store never holds a plaintext secret.
//!
//! If no API keys have been created yet, the gateway is left open — this lets a
//! fresh install be exercised immediately and matches the CLI-first audience
//! from spec.md §1; once the first key is created, every other request must
//! present one.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response as AxumResponse;
use sha2::{Digest, Sha256};

use relay_core::store::Storage;
use relay_core::RelayError;

use super::error::ApiError;
use super::AppState;

pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn extract_secret(req: &Request) -> Option<&str> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        let value = value.to_str().ok()?;
        if let Some(secret) = value.strip_prefix("Bearer ") {
            return Some(secret);
        }
    }
    req.headers().get("x-api-key")?.to_str().ok()
}

pub async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Result<AxumResponse, ApiError> {
    let any_keys = !state.gateway.storage.api_key_list().await?.is_empty();
    if !any_keys {
        return Ok(next.run(req).await);
    }

    let secret = extract_secret(&req).ok_or(RelayError::AuthRequired { hint_url: None })?;
    let hash = hash_secret(secret);
    let key = state
        .gateway
        .storage
        .api_key_get_by_hash(&hash)
        .await?
        .filter(|k| k.status == relay_core::store::ApiKeyStatus::Active)
        .ok_or(RelayError::AuthRequired { hint_url: None })?;

    if let Err(wait) = state.gateway.rate_limiter.try_acquire(Some(key.id), key.per_minute_limit) {
        return Err(RelayError::RateLimited { retry_after: Some(wait) }.into());
    }
    let _ = state.gateway.storage.api_key_touch(key.id).await;

    Ok(next.run(req).await)
}
