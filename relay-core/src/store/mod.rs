//! The durable persistence surface. Grounded on `fusillade::manager::Storage` (the
//! trait shape: async CRUD plus a `startup_recovery`-style sweep) and
//! `dwctl::db`'s repository-over-a-pool idiom, retargeted at a single embedded
//! SQLite file per spec.md §6 instead of the teacher's PostgreSQL.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::ids::{ApiKeyId, RequestId};
use crate::request::{RequestRecord, RequestStatus, TransitionMeta};
use crate::response::{Response, TokenCounts};

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Paging {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Paging {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub text: String,
    pub thinking: Option<String>,
    pub tokens: TokenCounts,
    pub provider_used: String,
    pub stored_at: DateTime<Utc>,
    pub ttl_s: u64,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.stored_at) > chrono::Duration::seconds(self.ttl_s as i64)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub secret_hash: String,
    pub display_name: String,
    pub status: ApiKeyStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub per_minute_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSample {
    pub request_id: RequestId,
    pub provider: String,
    pub cost: f64,
    pub tokens_total: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Database-level failures, distinct from the higher-level `RelayError` taxonomy
/// so a repository can describe exactly what went wrong before it gets folded into
/// `storage_unavailable`/`conflict`/`not_found` for callers. Grounded on
/// `dwctl::db`'s error layering.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("{resource} not found")]
    NotFound { resource: &'static str },
    #[error("unique constraint violated")]
    UniqueViolation,
    #[error("compare-and-set conflict")]
    Conflict,
    #[error("database busy")]
    Busy,
    #[error(transparent)]
    Other(#[from] sqlx::Error),
}

impl From<DbError> for RelayError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound { resource } => RelayError::NotFound {
                resource: resource.to_string(),
                id: "?".to_string(),
            },
            DbError::UniqueViolation => RelayError::Conflict {
                message: "a row with this identity already exists".to_string(),
            },
            DbError::Conflict => RelayError::Conflict {
                message: "request state changed concurrently".to_string(),
            },
            DbError::Busy => RelayError::StorageUnavailable(anyhow::anyhow!("database busy")),
            DbError::Other(e) => RelayError::StorageUnavailable(e.into()),
        }
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn put_request(&self, request: RequestRecord) -> crate::error::Result<()>;
    async fn transition(&self, id: RequestId, from: RequestStatus, to: RequestStatus, meta: TransitionMeta) -> crate::error::Result<()>;
    /// Writes a terminal response and its CAS status transition as a single commit,
    /// per spec.md §4.1: a transition a concurrent writer loses never leaves a
    /// response row behind, and a response is never durable without its status
    /// change (or vice versa).
    async fn transition_with_response(
        &self,
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
        meta: TransitionMeta,
        response: Response,
    ) -> crate::error::Result<()>;
    /// Records the total number of backend attempts the executor made for this
    /// request (across retries and fallback providers), independent of the status
    /// transition audit trail.
    async fn set_attempt_count(&self, id: RequestId, attempt_count: u32) -> crate::error::Result<()>;
    async fn get_request(&self, id: RequestId) -> crate::error::Result<RequestRecord>;
    async fn get_response(&self, id: RequestId) -> crate::error::Result<Option<Response>>;
    async fn list_requests(&self, filter: RequestFilter, paging: Paging) -> crate::error::Result<Vec<RequestRecord>>;

    async fn cache_get(&self, fingerprint: &str) -> crate::error::Result<Option<CacheEntry>>;
    async fn cache_put(&self, entry: CacheEntry) -> crate::error::Result<()>;
    async fn cache_evict(&self, fingerprint: &str) -> crate::error::Result<()>;
    async fn cache_lru_candidates(&self, keep: usize) -> crate::error::Result<Vec<String>>;
    /// Every entry's fingerprint and serialized byte size, oldest-read-first, for
    /// the cache manager's byte-budget eviction pass.
    async fn cache_entries_by_last_read(&self) -> crate::error::Result<Vec<(String, u64)>>;
    /// Fingerprints of entries whose `stored_at + ttl_s` has already passed as of `now`.
    async fn cache_expired(&self, now: DateTime<Utc>) -> crate::error::Result<Vec<String>>;
    async fn cache_stats(&self) -> crate::error::Result<CacheStats>;
    async fn cache_clear(&self) -> crate::error::Result<()>;

    async fn api_key_create(&self, key: ApiKey) -> crate::error::Result<()>;
    async fn api_key_get(&self, id: ApiKeyId) -> crate::error::Result<Option<ApiKey>>;
    async fn api_key_get_by_hash(&self, secret_hash: &str) -> crate::error::Result<Option<ApiKey>>;
    async fn api_key_list(&self) -> crate::error::Result<Vec<ApiKey>>;
    async fn api_key_set_status(&self, id: ApiKeyId, status: ApiKeyStatus) -> crate::error::Result<()>;
    async fn api_key_touch(&self, id: ApiKeyId) -> crate::error::Result<()>;
    async fn api_key_delete(&self, id: ApiKeyId) -> crate::error::Result<()>;

    async fn cost_sample_append(&self, sample: CostSample) -> crate::error::Result<()>;
    async fn cost_summary(&self) -> crate::error::Result<f64>;
    async fn cost_by_provider(&self) -> crate::error::Result<Vec<(String, f64)>>;
    async fn cost_by_day(&self) -> crate::error::Result<Vec<(NaiveDate, f64)>>;

    /// Scans for non-terminal requests left over from a previous run, marks them
    /// `failed`/`interrupted`, and returns their ids so the caller can emit
    /// synthetic events on the bus.
    async fn startup_recovery(&self) -> crate::error::Result<Vec<RequestId>>;
}
