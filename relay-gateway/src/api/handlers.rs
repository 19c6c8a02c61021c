//! REST handlers for the intake and admin surface from spec.md §6.
//!
//! Handlers are thin per spec.md §4.9: validate, call into `relay_core::Gateway`,
//! translate the outcome into the `{success, data}`/`{success, error}` envelope.
//! A terminal request's own failure (`failed`/`cancelled`/`timed_out`) is never an
//! HTTP error — it is reported as `200` with the error embedded in `data`, per
//! the S4 scenario. `ApiError` is reserved for request-handling failures: bad
//! input, unknown id, disabled/unknown provider, queue full, storage down, rate
//! limiting, and terminal-state conflicts.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Json;
use chrono::{DateTime, Utc};
use relay_core::gateway::{IntakeOutcome, SubmitRequest};
use relay_core::ids::{ApiKeyId, RequestId};
use relay_core::provider::HealthStatus;
use relay_core::request::RequestStatus;
use relay_core::response::{Response as CoreResponse, TokenCounts};
use relay_core::store::{ApiKey, ApiKeyStatus, Paging, RequestFilter, Storage};
use relay_core::RelayError;
use serde::{Deserialize, Serialize};

use super::auth::hash_secret;
use super::error::{ApiError, ApiResult};
use super::AppState;

fn ok<T: Serialize>(data: T) -> AxumResponse {
    (StatusCode::OK, Json(Envelope { success: true, data })).into_response()
}

fn accepted<T: Serialize>(data: T) -> AxumResponse {
    (StatusCode::ACCEPTED, Json(Envelope { success: true, data })).into_response()
}

#[derive(Serialize)]
struct Envelope<T> {
    success: bool,
    data: T,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct RequestView {
    request_id: String,
    status: &'static str,
    provider: String,
    model: Option<String>,
    priority: i64,
    submitted_at: DateTime<Utc>,
    attempt_count: u32,
    response: Option<String>,
    thinking: Option<String>,
    tokens: Option<TokenCounts>,
    provider_used: Option<String>,
    cached: bool,
    latency_ms: Option<u64>,
    error: Option<ErrorDetail>,
}

impl RequestView {
    fn from_record(record: &relay_core::request::RequestRecord, response: Option<&CoreResponse>) -> Self {
        Self {
            request_id: record.id.to_string(),
            status: record.status.as_str(),
            provider: record.provider.clone(),
            model: record.model.clone(),
            priority: record.priority,
            submitted_at: record.submitted_at,
            attempt_count: record.attempt_count,
            response: response.and_then(|r| r.text.clone()),
            thinking: response.and_then(|r| r.thinking.clone()),
            tokens: response.map(|r| r.tokens),
            provider_used: response.and_then(|r| r.provider_used.clone()),
            cached: response.map(|r| r.cached).unwrap_or(false),
            latency_ms: response.map(|r| r.latency_ms),
            error: response.and_then(|r| {
                r.error_code.map(|code| ErrorDetail {
                    code,
                    message: r.error_message.clone().unwrap_or_default(),
                })
            }),
        }
    }

    fn from_cache_hit(id: RequestId, response: &CoreResponse, provider: &str) -> Self {
        Self {
            request_id: id.to_string(),
            status: RequestStatus::Completed.as_str(),
            provider: provider.to_string(),
            model: None,
            priority: 0,
            submitted_at: response.completed_at,
            attempt_count: 0,
            response: response.text.clone(),
            thinking: response.thinking.clone(),
            tokens: Some(response.tokens),
            provider_used: response.provider_used.clone(),
            cached: true,
            latency_ms: Some(response.latency_ms),
            error: None,
        }
    }

    /// Built from a single-flight waiter's broadcast result: no `RequestRecord`
    /// read is needed since the response itself carries everything the caller
    /// asked for.
    fn from_waiter_response(id: RequestId, response: &CoreResponse) -> Self {
        Self {
            request_id: id.to_string(),
            status: if response.is_success() { RequestStatus::Completed.as_str() } else { RequestStatus::Failed.as_str() },
            provider: response.provider_used.clone().unwrap_or_default(),
            model: None,
            priority: 0,
            submitted_at: response.completed_at,
            attempt_count: 0,
            response: response.text.clone(),
            thinking: response.thinking.clone(),
            tokens: Some(response.tokens),
            provider_used: response.provider_used.clone(),
            cached: response.cached,
            latency_ms: Some(response.latency_ms),
            error: response.error_code.map(|code| ErrorDetail {
                code,
                message: response.error_message.clone().unwrap_or_default(),
            }),
        }
    }
}

#[derive(Deserialize)]
pub struct AskBody {
    pub provider: String,
    pub message: String,
    pub model: Option<String>,
    pub agent: Option<String>,
    pub priority: Option<i64>,
    #[serde(default)]
    pub bypass_cache: bool,
    /// Accepted for wire-compatibility; streamed chunks are published as
    /// `StreamChunk` events on the `stream` channel rather than held open on
    /// this response (see `api::ws`).
    #[serde(default)]
    pub stream: bool,
}

#[derive(Deserialize)]
pub struct AskQuery {
    #[serde(default)]
    pub wait: bool,
    pub timeout: Option<u64>,
}

fn submit_request(body: AskBody, timeout: Option<Duration>) -> SubmitRequest {
    SubmitRequest {
        provider: body.provider,
        model: body.model,
        agent: body.agent,
        message: body.message,
        priority: body.priority,
        bypass_cache: body.bypass_cache,
        api_key_id: None,
        timeout: timeout.and_then(|d| chrono::Duration::from_std(d).ok()),
    }
}

/// Polls the store until the request reaches a terminal status or `deadline`
/// elapses. A synchronous `wait=true` caller has no other way to observe
/// completion: the gateway has no per-request oneshot channel for the *queued*
/// path, only for single-flight waiters, so this mirrors what `submit(wait=true)
/// ≡ submit(wait=false) then poll until terminal` (spec.md §8) literally says a
/// client would do.
async fn poll_until_terminal(state: &AppState, id: RequestId, deadline: Duration) -> Result<RequestView, AxumResponse> {
    let started = tokio::time::Instant::now();
    loop {
        let (record, response) = match state.gateway.query(id).await {
            Ok(pair) => pair,
            Err(e) => return Err(ApiError::from(e).into_response()),
        };
        if record.status.is_terminal() {
            return Ok(RequestView::from_record(&record, response.as_ref()));
        }
        if started.elapsed() >= deadline {
            return Err((
                StatusCode::GATEWAY_TIMEOUT,
                Json(serde_json::json!({
                    "success": false,
                    "error": { "code": "wait_timeout", "message": "wait-timeout exceeded before the request reached a terminal state" },
                })),
            )
                .into_response());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub async fn ask(State(state): State<AppState>, Query(query): Query<AskQuery>, Json(body): Json<AskBody>) -> AxumResponse {
    let provider = body.provider.clone();
    let timeout = query.timeout.map(Duration::from_secs);
    let outcome = match state.gateway.intake(submit_request(body, timeout)).await {
        Ok(outcome) => outcome,
        Err(e) => return ApiError::from(e).into_response(),
    };

    match outcome {
        IntakeOutcome::CachedHit(response) => ok(RequestView::from_cache_hit(response.request_id, &response, &provider)),
        IntakeOutcome::Enqueued(id) => {
            if query.wait {
                let deadline = timeout.unwrap_or(Duration::from_secs(60));
                match poll_until_terminal(&state, id, deadline).await {
                    Ok(view) => ok(view),
                    Err(resp) => resp,
                }
            } else {
                accepted(serde_json::json!({ "request_id": id.to_string(), "status": "queued" }))
            }
        }
        IntakeOutcome::JoinedInFlight(id, mut rx) => {
            if query.wait {
                let deadline = timeout.unwrap_or(Duration::from_secs(60));
                match tokio::time::timeout(deadline, rx.recv()).await {
                    Ok(Ok(response)) => {
                        let _ = state.gateway.resolve_waiter(id, response.clone()).await;
                        ok(RequestView::from_waiter_response(id, &response))
                    }
                    _ => match poll_until_terminal(&state, id, Duration::from_millis(1)).await {
                        Ok(view) => ok(view),
                        Err(resp) => resp,
                    },
                }
            } else {
                accepted(serde_json::json!({ "request_id": id.to_string(), "status": "queued" }))
            }
        }
    }
}

pub async fn submit(State(state): State<AppState>, Json(body): Json<AskBody>) -> AxumResponse {
    let outcome = match state.gateway.intake(submit_request(body, None)).await {
        Ok(outcome) => outcome,
        Err(e) => return ApiError::from(e).into_response(),
    };
    match outcome {
        IntakeOutcome::CachedHit(response) => accepted(serde_json::json!({
            "request_id": response.request_id.to_string(),
            "status": "completed",
        })),
        IntakeOutcome::Enqueued(id) | IntakeOutcome::JoinedInFlight(id, _) => {
            accepted(serde_json::json!({ "request_id": id.to_string(), "status": "queued" }))
        }
    }
}

pub async fn query(State(state): State<AppState>, Path(id): Path<RequestId>) -> ApiResult<AxumResponse> {
    let (record, response) = state.gateway.query(id).await?;
    Ok(ok(RequestView::from_record(&record, response.as_ref())))
}

pub async fn cancel(State(state): State<AppState>, Path(id): Path<RequestId>) -> ApiResult<AxumResponse> {
    let record = state.gateway.cancel(id).await?;
    Ok(ok(RequestView::from_record(&record, None)))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub provider: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_requests(State(state): State<AppState>, Query(q): Query<ListQuery>) -> ApiResult<AxumResponse> {
    let status = q
        .status
        .as_deref()
        .map(parse_status)
        .transpose()
        .map_err(|message| RelayError::Validation { message })?;
    let filter = RequestFilter { status, provider: q.provider };
    let paging = Paging {
        limit: q.limit.unwrap_or(50),
        offset: q.offset.unwrap_or(0),
    };
    let records = state.gateway.storage.list_requests(filter, paging).await?;
    let views: Vec<RequestView> = records.iter().map(|r| RequestView::from_record(r, None)).collect();
    Ok(ok(views))
}

fn parse_status(s: &str) -> Result<RequestStatus, String> {
    match s {
        "queued" => Ok(RequestStatus::Queued),
        "processing" => Ok(RequestStatus::Processing),
        "completed" => Ok(RequestStatus::Completed),
        "failed" => Ok(RequestStatus::Failed),
        "cancelled" => Ok(RequestStatus::Cancelled),
        "timed_out" => Ok(RequestStatus::TimedOut),
        other => Err(format!("unknown status filter {other}")),
    }
}

#[derive(Serialize)]
struct ProviderStatusView {
    name: String,
    enabled: bool,
    health: HealthStatus,
    in_flight: usize,
    consecutive_failures: u32,
    backend_variant: relay_core::provider::BackendVariant,
}

pub async fn status(State(state): State<AppState>) -> AxumResponse {
    let providers: Vec<ProviderStatusView> = state
        .gateway
        .providers()
        .map(|descriptor| {
            let runtime = state.gateway.health.runtime_snapshot(descriptor.name.as_str());
            ProviderStatusView {
                name: descriptor.name.to_string(),
                enabled: state.gateway.provider_enabled(descriptor.name.as_str()),
                health: runtime.as_ref().map(|r| r.health).unwrap_or(HealthStatus::Unknown),
                in_flight: runtime.as_ref().map(|r| r.in_flight).unwrap_or(0),
                consecutive_failures: runtime.as_ref().map(|r| r.consecutive_failures).unwrap_or(0),
                backend_variant: descriptor.backend_variant(),
            }
        })
        .collect();
    ok(serde_json::json!({
        "providers": providers,
        "queue_depth": state.gateway.queue.len(),
    }))
}

pub async fn health() -> AxumResponse {
    ok(serde_json::json!({ "status": "ok" }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let domain = state.gateway.metrics.render().unwrap_or_default();
    let transport = state.metric_handle.render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        format!("{domain}{transport}"),
    )
}

#[derive(Deserialize)]
pub struct ToggleBody {
    pub enabled: bool,
}

pub async fn toggle_provider(State(state): State<AppState>, Path(name): Path<String>, Json(body): Json<ToggleBody>) -> ApiResult<AxumResponse> {
    state.gateway.set_provider_enabled(&name, body.enabled)?;
    Ok(ok(serde_json::json!({ "name": name, "enabled": body.enabled })))
}

pub async fn cache_stats(State(state): State<AppState>) -> ApiResult<AxumResponse> {
    let stats = state.gateway.cache.stats().await?;
    Ok(ok(stats))
}

pub async fn cache_clear(State(state): State<AppState>) -> ApiResult<AxumResponse> {
    state.gateway.cache.clear().await?;
    Ok(ok(serde_json::json!({ "cleared": true })))
}

pub async fn cache_cleanup(State(state): State<AppState>) -> ApiResult<AxumResponse> {
    let swept = state.gateway.cache.cleanup().await?;
    Ok(ok(serde_json::json!({ "evicted": swept })))
}

#[derive(Deserialize)]
pub struct CreateKeyBody {
    pub display_name: String,
    pub per_minute_limit: Option<u32>,
}

#[derive(Serialize)]
struct ApiKeyView {
    id: String,
    display_name: String,
    status: ApiKeyStatus,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
    per_minute_limit: Option<u32>,
}

impl From<&ApiKey> for ApiKeyView {
    fn from(key: &ApiKey) -> Self {
        Self {
            id: key.id.to_string(),
            display_name: key.display_name.clone(),
            status: key.status,
            created_at: key.created_at,
            last_used_at: key.last_used_at,
            per_minute_limit: key.per_minute_limit,
        }
    }
}

pub async fn list_keys(State(state): State<AppState>) -> ApiResult<AxumResponse> {
    let keys = state.gateway.storage.api_key_list().await?;
    let views: Vec<ApiKeyView> = keys.iter().map(ApiKeyView::from).collect();
    Ok(ok(views))
}

pub async fn create_key(State(state): State<AppState>, Json(body): Json<CreateKeyBody>) -> ApiResult<AxumResponse> {
    use rand::RngCore;
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let secret = format!("relay_{}", raw.iter().map(|b| format!("{b:02x}")).collect::<String>());
    let key = ApiKey {
        id: ApiKeyId::new(),
        secret_hash: hash_secret(&secret),
        display_name: body.display_name,
        status: ApiKeyStatus::Active,
        created_at: Utc::now(),
        last_used_at: None,
        per_minute_limit: body.per_minute_limit,
    };
    state.gateway.storage.api_key_create(key.clone()).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "data": { "key": ApiKeyView::from(&key), "secret": secret } })),
    )
        .into_response())
}

pub async fn delete_key(State(state): State<AppState>, Path(id): Path<ApiKeyId>) -> ApiResult<AxumResponse> {
    state.gateway.storage.api_key_delete(id).await?;
    Ok(ok(serde_json::json!({ "deleted": true })))
}

pub async fn set_key_status(State(state): State<AppState>, Path((id, action)): Path<(ApiKeyId, String)>) -> ApiResult<AxumResponse> {
    let status = match action.as_str() {
        "enable" => ApiKeyStatus::Active,
        "disable" => ApiKeyStatus::Disabled,
        other => return Err(RelayError::Validation { message: format!("unknown key action {other}") }.into()),
    };
    state.gateway.storage.api_key_set_status(id, status).await?;
    Ok(ok(serde_json::json!({ "id": id.to_string(), "status": status })))
}

pub async fn costs_summary(State(state): State<AppState>) -> ApiResult<AxumResponse> {
    Ok(ok(serde_json::json!({ "total_cost": state.gateway.storage.cost_summary().await? })))
}

pub async fn costs_by_provider(State(state): State<AppState>) -> ApiResult<AxumResponse> {
    let rows = state.gateway.storage.cost_by_provider().await?;
    let map: HashMap<String, f64> = rows.into_iter().collect();
    Ok(ok(map))
}

pub async fn costs_by_day(State(state): State<AppState>) -> ApiResult<AxumResponse> {
    let rows = state.gateway.storage.cost_by_day().await?;
    let map: HashMap<String, f64> = rows.into_iter().map(|(day, cost)| (day.to_string(), cost)).collect();
    Ok(ok(map))
}
