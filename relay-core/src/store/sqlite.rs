//! The SQLite-backed `Storage` implementation.
//!
//! Grounded on `fusillade::manager::postgres::PostgresRequestManager`'s
//! builder/pool idiom, retargeted to `sqlx::SqlitePool` per spec.md §6's "single
//! embedded relational database file at `storage.path`". A bounded `busy_timeout`
//! pragma backs the "readers never block on a locked writer indefinitely"
//! invariant from spec.md §4.1.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::{ApiKey, ApiKeyStatus, CacheEntry, CacheStats, CostSample, DbError, Paging, RequestFilter, Storage};
use crate::error::{RelayError, Result};
use crate::ids::{ApiKeyId, RequestId};
use crate::provider::BackendVariant;
use crate::request::{RequestRecord, RequestStatus, TransitionMeta};
use crate::response::{Response, TokenCounts};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let in_memory = path == ":memory:";
        let url = if in_memory { "sqlite::memory:".to_string() } else { format!("sqlite://{path}") };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| RelayError::StorageUnavailable(e.into()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // An in-memory database is private to its connection; cap the pool at one
        // connection so every caller shares the same database instead of each
        // getting its own empty one.
        let max_connections = if in_memory { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| RelayError::StorageUnavailable(e.into()))?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| RelayError::StorageUnavailable(e.into()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn status_str(status: RequestStatus) -> &'static str {
    status.as_str()
}

fn parse_status(s: &str) -> RequestStatus {
    match s {
        "queued" => RequestStatus::Queued,
        "processing" => RequestStatus::Processing,
        "completed" => RequestStatus::Completed,
        "failed" => RequestStatus::Failed,
        "cancelled" => RequestStatus::Cancelled,
        _ => RequestStatus::TimedOut,
    }
}

fn variant_str(variant: BackendVariant) -> &'static str {
    match variant {
        BackendVariant::Http => "http",
        BackendVariant::Cli => "cli",
        BackendVariant::Terminal => "terminal",
    }
}

fn parse_variant(s: &str) -> Option<BackendVariant> {
    match s {
        "http" => Some(BackendVariant::Http),
        "cli" => Some(BackendVariant::Cli),
        "terminal" => Some(BackendVariant::Terminal),
        _ => None,
    }
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Applies the CAS status UPDATE and its `state_transitions` audit row within an
/// already-open transaction, shared by `transition` and `transition_with_response`
/// so both commit the identical status-change semantics.
async fn apply_transition(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: RequestId,
    from: RequestStatus,
    to: RequestStatus,
    meta: &TransitionMeta,
) -> Result<()> {
    let bump_attempt = to == RequestStatus::Processing;
    let clear_worker = to == RequestStatus::Queued;

    let sql = format!(
        "UPDATE requests SET status = ?{}{} WHERE id = ? AND status = ?",
        if bump_attempt { ", attempt_count = attempt_count + 1, assigned_worker = ?" } else { "" },
        if clear_worker { ", assigned_worker = NULL" } else { "" },
    );
    let mut q = sqlx::query(&sql).bind(status_str(to));
    if bump_attempt {
        q = q.bind(meta.worker_id.clone());
    }
    q = q.bind(id.to_string()).bind(status_str(from));

    let result = q.execute(&mut **tx).await.map_err(DbError::Other)?;
    if result.rows_affected() != 1 {
        return Err(DbError::Conflict.into());
    }

    sqlx::query("INSERT INTO state_transitions (request_id, from_status, to_status, worker_id, note, transitioned_at) VALUES (?,?,?,?,?,?)")
        .bind(id.to_string())
        .bind(status_str(from))
        .bind(status_str(to))
        .bind(meta.worker_id.clone())
        .bind(meta.note.clone())
        .bind(to_rfc3339(Utc::now()))
        .execute(&mut **tx)
        .await
        .map_err(DbError::Other)?;
    Ok(())
}

/// Upserts a response row within an already-open transaction; see `apply_transition`.
async fn insert_response(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, response: Response) -> Result<()> {
    sqlx::query(
        "INSERT INTO responses (request_id, text, thinking, tokens_input, tokens_output, tokens_total, latency_ms, backend_variant, provider_used, error_code, error_message, cached, completed_at)
         VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)
         ON CONFLICT(request_id) DO UPDATE SET text=excluded.text, thinking=excluded.thinking, tokens_input=excluded.tokens_input,
            tokens_output=excluded.tokens_output, tokens_total=excluded.tokens_total, latency_ms=excluded.latency_ms,
            backend_variant=excluded.backend_variant, provider_used=excluded.provider_used, error_code=excluded.error_code,
            error_message=excluded.error_message, cached=excluded.cached, completed_at=excluded.completed_at",
    )
    .bind(response.request_id.to_string())
    .bind(&response.text)
    .bind(&response.thinking)
    .bind(response.tokens.input as i64)
    .bind(response.tokens.output as i64)
    .bind(response.tokens.total as i64)
    .bind(response.latency_ms as i64)
    .bind(response.backend_variant.map(variant_str))
    .bind(&response.provider_used)
    .bind(response.error_code)
    .bind(&response.error_message)
    .bind(response.cached as i64)
    .bind(to_rfc3339(response.completed_at))
    .execute(&mut **tx)
    .await
    .map_err(DbError::Other)?;
    Ok(())
}

fn from_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> RequestRecord {
    RequestRecord {
        id: RequestId::from_str(row.get::<String, _>("id").as_str()).unwrap_or_default(),
        provider: row.get("provider"),
        model: row.get("model"),
        agent: row.get("agent"),
        prompt: row.get("prompt"),
        priority: row.get("priority"),
        submitted_at: from_rfc3339(row.get::<String, _>("submitted_at").as_str()),
        deadline: from_rfc3339(row.get::<String, _>("deadline").as_str()),
        status: parse_status(row.get::<String, _>("status").as_str()),
        attempt_count: row.get::<i64, _>("attempt_count") as u32,
        assigned_worker: row.get("assigned_worker"),
        api_key_id: row
            .get::<Option<String>, _>("api_key_id")
            .and_then(|s| uuid::Uuid::from_str(&s).ok())
            .map(ApiKeyId::from),
        parent_request_id: row
            .get::<Option<String>, _>("parent_request_id")
            .and_then(|s| RequestId::from_str(&s).ok()),
        fingerprint: row.get("fingerprint"),
        bypass_cache: row.get::<i64, _>("bypass_cache") != 0,
    }
}

fn row_to_response(row: &sqlx::sqlite::SqliteRow) -> Response {
    Response {
        request_id: RequestId::from_str(row.get::<String, _>("request_id").as_str()).unwrap_or_default(),
        text: row.get("text"),
        thinking: row.get("thinking"),
        tokens: TokenCounts {
            input: row.get::<i64, _>("tokens_input") as u32,
            output: row.get::<i64, _>("tokens_output") as u32,
            total: row.get::<i64, _>("tokens_total") as u32,
        },
        latency_ms: row.get::<i64, _>("latency_ms") as u64,
        backend_variant: row.get::<Option<String>, _>("backend_variant").and_then(|s| parse_variant(&s)),
        provider_used: row.get("provider_used"),
        error_code: row.get::<Option<String>, _>("error_code").and_then(|s| leak_code(&s)),
        error_message: row.get("error_message"),
        cached: row.get::<i64, _>("cached") != 0,
        completed_at: from_rfc3339(row.get::<String, _>("completed_at").as_str()),
    }
}

/// Error codes are the fixed, `'static` taxonomy from `RelayError::code`; match
/// back onto the same strings instead of leaking an owned String as `&'static str`.
fn leak_code(s: &str) -> Option<&'static str> {
    const CODES: &[&str] = &[
        "validation",
        "auth_required",
        "rate_limited",
        "transient_backend",
        "permanent_backend",
        "timed_out",
        "cancelled",
        "interrupted",
        "queue_full",
        "storage_unavailable",
        "not_found",
        "conflict",
        "internal",
    ];
    CODES.iter().find(|c| **c == s).copied()
}

#[async_trait]
impl Storage for SqliteStore {
    async fn put_request(&self, request: RequestRecord) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO requests (id, provider, model, agent, prompt, priority, submitted_at, deadline, status, attempt_count, assigned_worker, api_key_id, parent_request_id, fingerprint, bypass_cache)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(request.id.to_string())
        .bind(&request.provider)
        .bind(&request.model)
        .bind(&request.agent)
        .bind(&request.prompt)
        .bind(request.priority)
        .bind(to_rfc3339(request.submitted_at))
        .bind(to_rfc3339(request.deadline))
        .bind(status_str(request.status))
        .bind(request.attempt_count as i64)
        .bind(&request.assigned_worker)
        .bind(request.api_key_id.map(|id| id.to_string()))
        .bind(request.parent_request_id.map(|id| id.to_string()))
        .bind(&request.fingerprint)
        .bind(request.bypass_cache as i64)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(DbError::UniqueViolation.into()),
            Err(e) => Err(DbError::Other(e).into()),
        }
    }

    async fn transition(&self, id: RequestId, from: RequestStatus, to: RequestStatus, meta: TransitionMeta) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::Other)?;
        apply_transition(&mut tx, id, from, to, &meta).await?;
        tx.commit().await.map_err(DbError::Other)?;
        Ok(())
    }

    async fn transition_with_response(
        &self,
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
        meta: TransitionMeta,
        response: Response,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::Other)?;
        apply_transition(&mut tx, id, from, to, &meta).await?;
        insert_response(&mut tx, response).await?;
        tx.commit().await.map_err(DbError::Other)?;
        Ok(())
    }

    async fn set_attempt_count(&self, id: RequestId, attempt_count: u32) -> Result<()> {
        sqlx::query("UPDATE requests SET attempt_count = ? WHERE id = ?")
            .bind(attempt_count as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<RequestRecord> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Other)?;
        row.as_ref()
            .map(row_to_request)
            .ok_or_else(|| RelayError::not_found("request", id))
    }

    async fn get_response(&self, id: RequestId) -> Result<Option<Response>> {
        let row = sqlx::query("SELECT * FROM responses WHERE request_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(row.as_ref().map(row_to_response))
    }

    async fn list_requests(&self, filter: RequestFilter, paging: Paging) -> Result<Vec<RequestRecord>> {
        let mut sql = "SELECT * FROM requests WHERE 1=1".to_string();
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.provider.is_some() {
            sql.push_str(" AND provider = ?");
        }
        sql.push_str(" ORDER BY submitted_at DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql);
        if let Some(status) = filter.status {
            q = q.bind(status_str(status));
        }
        if let Some(provider) = &filter.provider {
            q = q.bind(provider.clone());
        }
        q = q.bind(paging.limit).bind(paging.offset);

        let rows = q.fetch_all(&self.pool).await.map_err(DbError::Other)?;
        Ok(rows.iter().map(row_to_request).collect())
    }

    async fn cache_get(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query("SELECT * FROM cache_entries WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Other)?;
        let Some(row) = row else { return Ok(None) };

        // A hit bumps `last_read_at` so `cache_lru_candidates`, which orders by it,
        // evicts by staleness-of-read rather than staleness-of-write.
        sqlx::query("UPDATE cache_entries SET last_read_at = ? WHERE fingerprint = ?")
            .bind(to_rfc3339(Utc::now()))
            .bind(fingerprint)
            .execute(&self.pool)
            .await
            .map_err(DbError::Other)?;

        Ok(Some(CacheEntry {
            fingerprint: row.get("fingerprint"),
            text: row.get("text"),
            thinking: row.get("thinking"),
            tokens: TokenCounts {
                input: row.get::<i64, _>("tokens_input") as u32,
                output: row.get::<i64, _>("tokens_output") as u32,
                total: row.get::<i64, _>("tokens_total") as u32,
            },
            provider_used: row.get("provider_used"),
            stored_at: from_rfc3339(row.get::<String, _>("stored_at").as_str()),
            ttl_s: row.get::<i64, _>("ttl_s") as u64,
        }))
    }

    async fn cache_put(&self, entry: CacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_entries (fingerprint, text, thinking, tokens_input, tokens_output, tokens_total, provider_used, stored_at, ttl_s, last_read_at)
             VALUES (?,?,?,?,?,?,?,?,?,?)
             ON CONFLICT(fingerprint) DO UPDATE SET text=excluded.text, thinking=excluded.thinking, tokens_input=excluded.tokens_input,
                tokens_output=excluded.tokens_output, tokens_total=excluded.tokens_total, provider_used=excluded.provider_used,
                stored_at=excluded.stored_at, ttl_s=excluded.ttl_s, last_read_at=excluded.last_read_at",
        )
        .bind(&entry.fingerprint)
        .bind(&entry.text)
        .bind(&entry.thinking)
        .bind(entry.tokens.input as i64)
        .bind(entry.tokens.output as i64)
        .bind(entry.tokens.total as i64)
        .bind(&entry.provider_used)
        .bind(to_rfc3339(entry.stored_at))
        .bind(entry.ttl_s as i64)
        .bind(to_rfc3339(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(DbError::Other)?;
        Ok(())
    }

    async fn cache_evict(&self, fingerprint: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(())
    }

    async fn cache_lru_candidates(&self, keep: usize) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT fingerprint FROM cache_entries ORDER BY last_read_at DESC LIMIT -1 OFFSET ?")
            .bind(keep as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(rows.iter().map(|r| r.get("fingerprint")).collect())
    }

    async fn cache_entries_by_last_read(&self) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query("SELECT fingerprint, LENGTH(text) as bytes FROM cache_entries ORDER BY last_read_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(rows.iter().map(|r| (r.get::<String, _>("fingerprint"), r.get::<i64, _>("bytes") as u64)).collect())
    }

    async fn cache_expired(&self, now: chrono::DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT fingerprint, stored_at, ttl_s FROM cache_entries")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                let stored_at = from_rfc3339(r.get::<String, _>("stored_at").as_str());
                let ttl_s = r.get::<i64, _>("ttl_s");
                let expires_at = stored_at + chrono::Duration::seconds(ttl_s);
                if expires_at <= now {
                    Some(r.get::<String, _>("fingerprint"))
                } else {
                    None
                }
            })
            .collect())
    }

    async fn cache_stats(&self) -> Result<CacheStats> {
        let row = sqlx::query("SELECT COUNT(*) as n, COALESCE(SUM(LENGTH(text)),0) as bytes FROM cache_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(CacheStats {
            entries: row.get::<i64, _>("n") as u64,
            bytes: row.get::<i64, _>("bytes") as u64,
            hits: 0,
            misses: 0,
        })
    }

    async fn cache_clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries").execute(&self.pool).await.map_err(DbError::Other)?;
        Ok(())
    }

    async fn api_key_create(&self, key: ApiKey) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_keys (id, secret_hash, display_name, status, created_at, last_used_at, per_minute_limit) VALUES (?,?,?,?,?,?,?)",
        )
        .bind(key.id.to_string())
        .bind(&key.secret_hash)
        .bind(&key.display_name)
        .bind(api_key_status_str(key.status))
        .bind(to_rfc3339(key.created_at))
        .bind(key.last_used_at.map(to_rfc3339))
        .bind(key.per_minute_limit.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => RelayError::from(DbError::UniqueViolation),
            other => RelayError::from(DbError::Other(other)),
        })?;
        Ok(())
    }

    async fn api_key_get(&self, id: ApiKeyId) -> Result<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(row.as_ref().map(row_to_api_key))
    }

    async fn api_key_get_by_hash(&self, secret_hash: &str) -> Result<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE secret_hash = ?")
            .bind(secret_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(row.as_ref().map(row_to_api_key))
    }

    async fn api_key_list(&self) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query("SELECT * FROM api_keys ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(rows.iter().map(row_to_api_key).collect())
    }

    async fn api_key_set_status(&self, id: ApiKeyId, status: ApiKeyStatus) -> Result<()> {
        let result = sqlx::query("UPDATE api_keys SET status = ? WHERE id = ?")
            .bind(api_key_status_str(status))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Other)?;
        if result.rows_affected() == 0 {
            return Err(RelayError::not_found("api_key", id));
        }
        Ok(())
    }

    async fn api_key_touch(&self, id: ApiKeyId) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(to_rfc3339(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(())
    }

    async fn api_key_delete(&self, id: ApiKeyId) -> Result<()> {
        sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(())
    }

    async fn cost_sample_append(&self, sample: CostSample) -> Result<()> {
        sqlx::query("INSERT INTO cost_samples (request_id, provider, cost, tokens_total, recorded_at) VALUES (?,?,?,?,?)")
            .bind(sample.request_id.to_string())
            .bind(&sample.provider)
            .bind(sample.cost)
            .bind(sample.tokens_total as i64)
            .bind(to_rfc3339(sample.recorded_at))
            .execute(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(())
    }

    async fn cost_summary(&self) -> Result<f64> {
        let row = sqlx::query("SELECT COALESCE(SUM(cost), 0.0) as total FROM cost_samples")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(row.get("total"))
    }

    async fn cost_by_provider(&self) -> Result<Vec<(String, f64)>> {
        let rows = sqlx::query("SELECT provider, SUM(cost) as total FROM cost_samples GROUP BY provider")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(rows.iter().map(|r| (r.get("provider"), r.get("total"))).collect())
    }

    async fn cost_by_day(&self) -> Result<Vec<(NaiveDate, f64)>> {
        let rows = sqlx::query("SELECT date(recorded_at) as day, SUM(cost) as total FROM cost_samples GROUP BY day ORDER BY day")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Other)?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                let day: String = r.get("day");
                NaiveDate::parse_from_str(&day, "%Y-%m-%d").ok().map(|d| (d, r.get("total")))
            })
            .collect())
    }

    async fn startup_recovery(&self) -> Result<Vec<RequestId>> {
        let rows = sqlx::query("SELECT id FROM requests WHERE status IN ('queued', 'processing')")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Other)?;

        let mut recovered = Vec::with_capacity(rows.len());
        for row in rows {
            let id_str: String = row.get("id");
            let Ok(id) = RequestId::from_str(&id_str) else { continue };
            let record = self.get_request(id).await?;
            let response = Response::failure(id, "interrupted", "gateway restarted while this request was in flight".to_string(), None, None, 0);
            self.transition_with_response(id, record.status, RequestStatus::Failed, TransitionMeta::note("startup recovery"), response)
                .await?;
            recovered.push(id);
        }
        Ok(recovered)
    }
}

fn api_key_status_str(status: ApiKeyStatus) -> &'static str {
    match status {
        ApiKeyStatus::Active => "active",
        ApiKeyStatus::Disabled => "disabled",
    }
}

fn row_to_api_key(row: &sqlx::sqlite::SqliteRow) -> ApiKey {
    ApiKey {
        id: ApiKeyId::from_str(row.get::<String, _>("id").as_str()).unwrap_or_default(),
        secret_hash: row.get("secret_hash"),
        display_name: row.get("display_name"),
        status: match row.get::<String, _>("status").as_str() {
            "disabled" => ApiKeyStatus::Disabled,
            _ => ApiKeyStatus::Active,
        },
        created_at: from_rfc3339(row.get::<String, _>("created_at").as_str()),
        last_used_at: row.get::<Option<String>, _>("last_used_at").map(|s| from_rfc3339(&s)),
        per_minute_limit: row.get::<Option<i64>, _>("per_minute_limit").map(|v| v as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ProviderName;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect(":memory:").await.expect("connect")
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = memory_store().await;
        let record = RequestRecord::new(
            ProviderName::from("p1").to_string(),
            None,
            None,
            "hello",
            0,
            chrono::Duration::seconds(30),
            None,
            None,
            "fp1".to_string(),
            false,
        );
        let id = record.id;
        store.put_request(record).await.unwrap();
        let fetched = store.get_request(id).await.unwrap();
        assert_eq!(fetched.prompt, "hello");
        assert_eq!(fetched.status, RequestStatus::Queued);
    }

    #[tokio::test]
    async fn transition_fails_on_status_mismatch() {
        let store = memory_store().await;
        let record = RequestRecord::new("p1", None, None, "hi", 0, chrono::Duration::seconds(30), None, None, "fp".to_string(), false);
        let id = record.id;
        store.put_request(record).await.unwrap();
        let result = store
            .transition(id, RequestStatus::Processing, RequestStatus::Completed, TransitionMeta::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn startup_recovery_fails_non_terminal_requests() {
        let store = memory_store().await;
        let record = RequestRecord::new("p1", None, None, "hi", 0, chrono::Duration::seconds(30), None, None, "fp".to_string(), false);
        let id = record.id;
        store.put_request(record).await.unwrap();
        let recovered = store.startup_recovery().await.unwrap();
        assert_eq!(recovered, vec![id]);
        let fetched = store.get_request(id).await.unwrap();
        assert_eq!(fetched.status, RequestStatus::Failed);
    }
}
