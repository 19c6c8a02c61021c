//! Retry and fallback executor: drives a request's preferred provider, then its
//! fallback chain, attempt by attempt, per spec.md §4.6.
//!
//! Grounded on `fusillade::retry`'s attempt-loop shape (classify, branch, sleep,
//! retry) generalized from a fixed backend call to the three-variant `Backend`
//! trait and a provider fallback chain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use crate::backend::{Backend, BackendCtx, BackendKind, BackendResult};
use crate::events::{Event, EventBus};
use crate::ids::RequestId;
use crate::provider::BackendVariant;
use crate::request::RequestRecord;
use crate::response::{Response, TokenCounts};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            jitter_fraction: 0.25,
        }
    }
}

pub struct Outcome {
    pub response: Response,
    pub provider_used: Option<String>,
    /// Total number of backend calls made across every provider in the fallback
    /// chain, including retries on the same provider. Persisted onto the request's
    /// `attempt_count` once the worker finishes, so a permanently-failing provider
    /// with `max_attempts = 3` and no fallback leaves `attempt_count == 3` in the
    /// store, not just the single worker claim that started this executor run.
    pub total_attempts: u32,
}

/// Runs the preferred-provider-then-fallback-chain algorithm for a single request,
/// returning a terminal `Response`. Never exceeds `request.deadline`.
pub async fn execute_with_fallback(
    request: &RequestRecord,
    chain: &[String],
    backends: &HashMap<String, Arc<BackendKind>>,
    config: &RetryConfig,
    bus: &EventBus,
    worker_cancel: &tokio_util::sync::CancellationToken,
) -> Outcome {
    let started = std::time::Instant::now();
    let mut last_error: Option<(&'static str, String, Option<BackendVariant>, Option<String>)> = None;
    let mut total_attempts: u32 = 0;

    let providers: Vec<&String> = std::iter::once(&request.provider).chain(chain.iter()).collect();

    for (step, provider_name) in providers.iter().enumerate() {
        let Some(backend) = backends.get(provider_name.as_str()) else {
            last_error = Some(("permanent_backend", format!("provider {provider_name} is not configured"), None, Some((*provider_name).clone())));
            continue;
        };

        for attempt in 1..=config.max_attempts {
            if worker_cancel.is_cancelled() {
                return Outcome {
                    response: Response::cancelled(request.id),
                    provider_used: Some((*provider_name).clone()),
                    total_attempts,
                };
            }
            if Utc::now() >= request.deadline {
                return Outcome {
                    response: Response::timed_out(request.id),
                    provider_used: Some((*provider_name).clone()),
                    total_attempts,
                };
            }

            total_attempts += 1;
            bus.publish(Event::ProviderInvoked {
                request_id: request.id,
                provider: (*provider_name).clone(),
                backend_variant: backend.variant(),
                attempt,
                at: Utc::now(),
            });

            let ctx = BackendCtx::new(request.deadline, worker_cancel.clone());
            let result = backend.execute(request, &ctx).await;

            match result {
                BackendResult::Success(success) => {
                    let response = Response::success(
                        request.id,
                        success.text,
                        success.thinking,
                        non_zero_tokens(success.tokens, request),
                        started.elapsed().as_millis() as u64,
                        backend.variant(),
                        (*provider_name).clone(),
                    );
                    return Outcome {
                        response,
                        provider_used: Some((*provider_name).clone()),
                        total_attempts,
                    };
                }
                BackendResult::AuthRequired { hint_url } => {
                    last_error = Some((
                        "auth_required",
                        hint_url.unwrap_or_else(|| "the provider requires interactive authentication".to_string()),
                        Some(backend.variant()),
                        Some((*provider_name).clone()),
                    ));
                    break;
                }
                BackendResult::PermanentError { message } => {
                    last_error = Some(("permanent_backend", message, Some(backend.variant()), Some((*provider_name).clone())));
                    break;
                }
                BackendResult::RateLimited { retry_after } => {
                    last_error = Some(("rate_limited", "rate limited by provider".to_string(), Some(backend.variant()), Some((*provider_name).clone())));
                    if attempt == config.max_attempts {
                        break;
                    }
                    let remaining = (request.deadline - Utc::now()).to_std().unwrap_or_default();
                    let wait = retry_after.unwrap_or(config.base_backoff).min(remaining);
                    if !sleep_or_timeout(wait, request, worker_cancel).await {
                        return Outcome {
                            response: timeout_or_cancelled(request.id, worker_cancel),
                            provider_used: Some((*provider_name).clone()),
                            total_attempts,
                        };
                    }
                }
                BackendResult::TransientError { message } => {
                    last_error = Some(("transient_backend", message, Some(backend.variant()), Some((*provider_name).clone())));
                    if attempt == config.max_attempts {
                        break;
                    }
                    let backoff = jittered_backoff(config.base_backoff, attempt, config.jitter_fraction);
                    let remaining = (request.deadline - Utc::now()).to_std().unwrap_or_default();
                    if !sleep_or_timeout(backoff.min(remaining), request, worker_cancel).await {
                        return Outcome {
                            response: timeout_or_cancelled(request.id, worker_cancel),
                            provider_used: Some((*provider_name).clone()),
                            total_attempts,
                        };
                    }
                }
            }
        }

        let _ = step;
    }

    let (code, message, backend_variant, provider_used) = last_error.unwrap_or((
        "permanent_backend",
        "no provider in the fallback chain was configured".to_string(),
        None,
        None,
    ));
    Outcome {
        response: Response::failure(request.id, code, message, backend_variant, provider_used.clone(), started.elapsed().as_millis() as u64),
        provider_used,
        total_attempts,
    }
}

fn non_zero_tokens(tokens: TokenCounts, request: &RequestRecord) -> TokenCounts {
    if tokens.total > 0 {
        tokens
    } else {
        crate::backend::tokens::estimate(&request.prompt, "")
    }
}

fn jittered_backoff(base: Duration, attempt: u32, jitter_fraction: f64) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    let jitter = exp * jitter_fraction;
    let delta = rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((exp + delta).max(0.0))
}

/// Sleeps for `duration`, but returns `false` immediately if the request's
/// deadline or worker cancellation fires first.
async fn sleep_or_timeout(duration: Duration, request: &RequestRecord, cancel: &tokio_util::sync::CancellationToken) -> bool {
    let deadline_sleep = (request.deadline - Utc::now()).to_std().unwrap_or_default();
    let wait = duration.min(deadline_sleep);
    tokio::select! {
        _ = tokio::time::sleep(wait) => Utc::now() < request.deadline,
        _ = cancel.cancelled() => false,
    }
}

/// `sleep_or_timeout` returning `false` means either the deadline or cancellation
/// fired first; this picks the matching terminal response for the one that did.
fn timeout_or_cancelled(id: RequestId, worker_cancel: &tokio_util::sync::CancellationToken) -> Response {
    if worker_cancel.is_cancelled() {
        Response::cancelled(id)
    } else {
        Response::timed_out(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_jitter_bounds() {
        let base = Duration::from_millis(100);
        for attempt in 1..=4 {
            let d = jittered_backoff(base, attempt, 0.25);
            let exp = base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
            assert!(d.as_secs_f64() >= exp * 0.75 - 0.001);
            assert!(d.as_secs_f64() <= exp * 1.25 + 0.001);
        }
    }
}
