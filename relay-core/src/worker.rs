//! The worker pool: claims runnable requests off the priority queue, enforces
//! per-provider concurrency and rate limits, and delegates to the retry/fallback
//! executor.
//!
//! Grounded on `fusillade::daemon::Daemon::run`: a `JoinSet` of per-request tasks,
//! an atomic in-flight counter with periodic status logging, and a
//! `scopeguard`-backed decrement so a panicking task never leaks its slot.
//! Generalized from the daemon's per-model `Semaphore` map to per-provider, and
//! from a single HTTP call to the full backend/executor stack.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendKind;
use crate::cache::CacheManager;
use crate::error::{RelayError, Result};
use crate::events::{Event, EventBus};
use crate::executor::{self, RetryConfig};
use crate::health::HealthMonitor;
use crate::ids::RequestId;
use crate::provider::ProviderDescriptor;
use crate::queue::PriorityQueue;
use crate::ratelimit::RateLimiter;
use crate::request::{AnyRequest, Request, RequestRecord};
use crate::response::Response;
use crate::store::Storage;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub claim_interval: Duration,
    pub status_log_interval: Option<Duration>,
    pub cancel_grace: Duration,
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            claim_interval: Duration::from_millis(50),
            status_log_interval: Some(Duration::from_secs(10)),
            cancel_grace: Duration::from_secs(2),
            retry: RetryConfig::default(),
        }
    }
}

pub struct WorkerPool {
    storage: Arc<dyn Storage>,
    cache: Arc<CacheManager>,
    queue: Arc<PriorityQueue>,
    rate_limiter: Arc<RateLimiter>,
    backends: HashMap<String, Arc<BackendKind>>,
    providers: HashMap<String, ProviderDescriptor>,
    bus: Arc<EventBus>,
    health: Arc<HealthMonitor>,
    config: WorkerConfig,
    provider_semaphores: DashMap<String, Arc<Semaphore>>,
    /// Cancellation tokens for in-flight requests, so an external cancel (API call
    /// or SIGTERM-style shutdown) can signal exactly the right backend call.
    inflight_cancels: DashMap<RequestId, CancellationToken>,
    in_flight_count: AtomicUsize,
    shutdown: CancellationToken,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<CacheManager>,
        queue: Arc<PriorityQueue>,
        rate_limiter: Arc<RateLimiter>,
        backends: HashMap<String, Arc<BackendKind>>,
        providers: HashMap<String, ProviderDescriptor>,
        bus: Arc<EventBus>,
        health: Arc<HealthMonitor>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            cache,
            queue,
            rate_limiter,
            backends,
            providers,
            bus,
            health,
            config,
            provider_semaphores: DashMap::new(),
            inflight_cancels: DashMap::new(),
            in_flight_count: AtomicUsize::new(0),
            shutdown,
        }
    }

    fn publish_in_flight(&self, provider: &str, delta: i64) {
        let in_flight = self.health.note_in_flight_delta(provider, delta);
        self.bus.publish(Event::ProviderInFlightChanged {
            provider: provider.to_string(),
            in_flight,
            at: Utc::now(),
        });
    }

    fn semaphore_for(&self, provider: &str) -> Arc<Semaphore> {
        self.provider_semaphores
            .entry(provider.to_string())
            .or_insert_with(|| {
                let permits = self.providers.get(provider).map(|d| d.concurrency).unwrap_or(4);
                Arc::new(Semaphore::new(permits))
            })
            .clone()
    }

    /// Signals cancellation for a specific in-flight request; a no-op if it isn't
    /// currently claimed by a worker (e.g. it's still queued — callers should
    /// remove it from the queue directly in that case).
    pub fn cancel_request(&self, id: RequestId) -> bool {
        if let Some(token) = self.inflight_cancels.get(&id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight_count.load(Ordering::Relaxed)
    }

    /// Commits a cancellation requested from outside the claim/execute/finish loop
    /// (`Gateway::cancel`), sharing `finish`'s event-publishing and single-flight
    /// resolution so there is exactly one place that ever completes a request's
    /// terminal state. A queued request has no in-flight worker to race, so it's
    /// committed directly; a processing one goes through `finish`, and if the
    /// worker that owns it wins the commit race first, this loses the CAS and
    /// simply reports the request's actual (already-terminal) state.
    pub async fn commit_cancellation(&self, any: AnyRequest) -> Result<RequestRecord> {
        match any {
            AnyRequest::Queued(r) => {
                let id = r.id();
                let cancelled = r.cancel(self.storage.as_ref()).await?;
                self.bus.publish(Event::RequestCancelled { request_id: id, at: Utc::now() });
                Ok(cancelled.into_record())
            }
            AnyRequest::Processing(r) => {
                let id = r.id();
                self.finish(r, Response::cancelled(id), 0).await;
                self.storage.get_request(id).await
            }
            already_terminal => Err(RelayError::Conflict {
                message: format!("request {} is already {}", already_terminal.record().id, already_terminal.record().status.as_str()),
            }),
        }
    }

    pub async fn run(self: Arc<Self>) {
        if let Some(interval) = self.config.status_log_interval {
            let this = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = this.shutdown.cancelled() => return,
                        _ = ticker.tick() => {
                            tracing::debug!(
                                in_flight = this.in_flight(),
                                queued = this.queue.len(),
                                "worker pool status"
                            );
                        }
                    }
                }
            });
        }

        let mut set = JoinSet::new();
        for _ in 0..self.config.pool_size {
            let this = self.clone();
            set.spawn(async move { this.worker_loop().await });
        }
        while set.join_next().await.is_some() {}
    }

    async fn worker_loop(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let item = self.queue.pop_runnable(|item| self.semaphore_for(&item.provider).available_permits() > 0);

            let Some(item) = item else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.config.claim_interval) => {}
                }
                continue;
            };

            self.process(item.request_id).await;
        }
    }

    async fn process(&self, id: RequestId) {
        let record = match self.storage.get_request(id).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(request_id = %id, error = %e, "failed to load claimed request");
                return;
            }
        };

        let queued = match AnyRequest::from_record(record) {
            AnyRequest::Queued(q) => q,
            other => {
                tracing::warn!(request_id = %id, status = other.record().status.as_str(), "dequeued request was not in queued state");
                return;
            }
        };

        let worker_id = format!("worker-{:?}", std::thread::current().id());
        let processing = match queued.claim(self.storage.as_ref(), &worker_id).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(request_id = %id, error = %e, "failed to claim request");
                return;
            }
        };

        self.bus.publish(Event::RequestProcessing {
            request_id: id,
            provider: processing.record.provider.clone(),
            at: Utc::now(),
        });

        self.in_flight_count.fetch_add(1, Ordering::Relaxed);
        self.publish_in_flight(&processing.record.provider, 1);
        let cancel = CancellationToken::new();
        self.inflight_cancels.insert(id, cancel.clone());

        let _guard = scopeguard::guard((processing.record.provider.clone(), id), |(provider, id)| {
            self.in_flight_count.fetch_sub(1, Ordering::Relaxed);
            self.publish_in_flight(&provider, -1);
            self.inflight_cancels.remove(&id);
        });

        let permit = self.semaphore_for(&processing.record.provider).acquire_owned().await;
        let Ok(_permit) = permit else { return };

        if !self.await_rate_limit(&processing.record.provider, &processing.record.deadline, &cancel).await {
            let fingerprint = processing.fingerprint().to_string();
            let response = Response::timed_out(id);
            if processing.time_out(self.storage.as_ref(), &response).await.is_ok() {
                self.cache.complete_single_flight(&fingerprint, response, None).await;
                self.bus.publish(Event::RequestFailed {
                    request_id: id,
                    error_code: "timed_out",
                    at: Utc::now(),
                });
            }
            return;
        }

        let combined_cancel = combine(&self.shutdown, &cancel);
        let chain: Vec<String> = self
            .providers
            .get(&processing.record.provider)
            .map(|d| d.fallback_chain.iter().map(|p| p.to_string()).collect())
            .unwrap_or_default();

        let outcome = executor::execute_with_fallback(&processing.record, &chain, &self.backends, &self.config.retry, &self.bus, &combined_cancel).await;

        self.finish(processing, outcome.response, outcome.total_attempts).await;
    }

    /// `total_attempts` is the number of backend calls the executor actually made
    /// (including in-process retries and fallback-chain switches), and overwrites
    /// the single increment `claim()` applied — so a request that exhausts
    /// `max_attempts` against one provider leaves that full count in the store,
    /// not just the one worker claim that started this run.
    async fn finish(&self, processing: Request<crate::request::Processing>, response: Response, total_attempts: u32) {
        let id = processing.id();
        let fingerprint = processing.fingerprint().to_string();
        let provider_ttl = self.providers.get(&processing.record.provider).and_then(|d| d.cache_ttl_s);

        if total_attempts > processing.record.attempt_count {
            if let Err(e) = self.storage.set_attempt_count(id, total_attempts).await {
                tracing::warn!(request_id = %id, error = %e, "failed to persist attempt count");
            }
        }

        let event = match response.error_code {
            None => {
                let provider_used = response.provider_used.clone();
                match processing.complete(self.storage.as_ref(), &response).await {
                    Ok(_) => Event::RequestCompleted {
                        request_id: id,
                        provider_used,
                        cached: false,
                        at: Utc::now(),
                    },
                    Err(e) => {
                        tracing::error!(request_id = %id, error = %e, "failed to persist completion");
                        return;
                    }
                }
            }
            Some("cancelled") => match processing.cancel(self.storage.as_ref(), &response).await {
                Ok(_) => Event::RequestCancelled { request_id: id, at: Utc::now() },
                Err(e) => {
                    tracing::error!(request_id = %id, error = %e, "failed to persist cancellation");
                    return;
                }
            },
            Some("timed_out") => match processing.time_out(self.storage.as_ref(), &response).await {
                Ok(_) => Event::RequestFailed {
                    request_id: id,
                    error_code: "timed_out",
                    at: Utc::now(),
                },
                Err(e) => {
                    tracing::error!(request_id = %id, error = %e, "failed to persist timeout");
                    return;
                }
            },
            Some(code) => match processing.fail(self.storage.as_ref(), &response).await {
                Ok(_) => Event::RequestFailed { request_id: id, error_code: code, at: Utc::now() },
                Err(e) => {
                    tracing::error!(request_id = %id, error = %e, "failed to persist failure");
                    return;
                }
            },
        };

        self.cache.complete_single_flight(&fingerprint, response, provider_ttl).await;
        self.bus.publish(event);
    }

    /// Polls the per-provider QPS bucket until it admits the request or the
    /// deadline/cancellation fires first.
    async fn await_rate_limit(&self, provider: &str, deadline: &chrono::DateTime<Utc>, cancel: &CancellationToken) -> bool {
        let qps = self.providers.get(provider).and_then(|d| d.qps);
        loop {
            if self.rate_limiter.try_acquire_provider(provider, qps) {
                return true;
            }
            if Utc::now() >= *deadline {
                return false;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_millis(25)) => {}
            }
        }
    }
}

fn combine(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
    let combined = CancellationToken::new();
    let c1 = combined.clone();
    let a = a.clone();
    tokio::spawn(async move {
        a.cancelled().await;
        c1.cancel();
    });
    let c2 = combined.clone();
    let b = b.clone();
    tokio::spawn(async move {
        b.cancelled().await;
        c2.cancel();
    });
    combined
}
