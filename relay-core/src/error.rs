//! The gateway's error taxonomy.
//!
//! Grounded on `dwctl::errors::Error`: a single `thiserror`-derived enum, one
//! variant per kind in spec.md §7, each carrying just enough context to build a
//! safe, stable `code` and a user-facing `message` that never echoes secrets,
//! environment values, or raw error chains from upstream providers.

use std::time::Duration;

use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum RelayError {
    /// Bad input; not retried.
    #[error("{message}")]
    Validation { message: String },

    /// Upstream needs login; fallback may recover.
    #[error("authentication required")]
    AuthRequired { hint_url: Option<String> },

    /// Retryable with backoff.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Network, 5xx, or classified transient CLI failure; retryable.
    #[error("transient backend error: {message}")]
    TransientBackend { message: String },

    /// Upstream rejected irrecoverably; not retried, fallback attempted.
    #[error("permanent backend error: {message}")]
    PermanentBackend { message: String },

    /// Request exceeded its deadline; terminal.
    #[error("request timed out")]
    TimedOut,

    /// External cancel; terminal.
    #[error("request cancelled")]
    Cancelled,

    /// Process restart caught the request mid-flight; terminal, recovery-only.
    #[error("request interrupted by a gateway restart")]
    Interrupted,

    /// Gateway-side overload.
    #[error("queue is at capacity")]
    QueueFull,

    /// Gateway-side overload.
    #[error("storage is unavailable")]
    StorageUnavailable(#[source] anyhow::Error),

    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Stable machine-readable error code, per spec.md §7's taxonomy names.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Validation { .. } => "validation",
            RelayError::AuthRequired { .. } => "auth_required",
            RelayError::RateLimited { .. } => "rate_limited",
            RelayError::TransientBackend { .. } => "transient_backend",
            RelayError::PermanentBackend { .. } => "permanent_backend",
            RelayError::TimedOut => "timed_out",
            RelayError::Cancelled => "cancelled",
            RelayError::Interrupted => "interrupted",
            RelayError::QueueFull => "queue_full",
            RelayError::StorageUnavailable(_) => "storage_unavailable",
            RelayError::NotFound { .. } => "not_found",
            RelayError::Conflict { .. } => "conflict",
            RelayError::Other(_) => "internal",
        }
    }

    /// A message safe to return to an API caller: never includes secrets, env
    /// values, or raw upstream stack traces.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::Validation { message } => message.clone(),
            RelayError::AuthRequired { .. } => "the upstream provider requires authentication".to_string(),
            RelayError::RateLimited { .. } => "rate limit exceeded".to_string(),
            RelayError::TransientBackend { .. } => "the upstream provider returned a transient error".to_string(),
            RelayError::PermanentBackend { .. } => "the upstream provider rejected the request".to_string(),
            RelayError::TimedOut => "the request exceeded its deadline".to_string(),
            RelayError::Cancelled => "the request was cancelled".to_string(),
            RelayError::Interrupted => "the gateway restarted while this request was in flight".to_string(),
            RelayError::QueueFull => "the gateway is at capacity, try again shortly".to_string(),
            RelayError::StorageUnavailable(_) => "storage is temporarily unavailable".to_string(),
            RelayError::NotFound { resource, id } => format!("{resource} {id} not found"),
            RelayError::Conflict { message } => message.clone(),
            RelayError::Other(_) => "internal error".to_string(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RelayError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl std::fmt::Display) -> Self {
        RelayError::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
