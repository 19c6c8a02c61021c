//! Top-level orchestration: wires the store, cache, queue, rate limiter, workers,
//! health monitor, event bus and metrics together and exposes the intake
//! operations the HTTP layer calls into.
//!
//! Grounded on `fusillade`'s `Manager`-over-`Daemon` composition root: one struct
//! owns every long-lived component and exposes a narrow set of entry points
//! (`submit`, `cancel`, `query`) rather than letting callers reach into workers or
//! storage directly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::backend::cli::CliBackend;
use crate::backend::http::HttpBackend;
use crate::backend::terminal::{InMemoryPaneController, PaneController, TerminalBackend};
use crate::backend::{Backend, BackendKind};
use crate::cache::{CacheManager, SingleFlightRole};
use crate::error::{RelayError, Result};
use crate::events::{Channel, Event, EventBus};
use crate::health::{HealthMonitor, HealthMonitorConfig};
use crate::ids::{ApiKeyId, RequestId};
use crate::metrics::GatewayMetrics;
use crate::provider::{BackendConfig, ProviderDescriptor};
use crate::queue::{PriorityQueue, QueueItem};
use crate::ratelimit::RateLimiter;
use crate::request::{AnyRequest, RequestRecord};
use crate::response::Response;
use crate::store::Storage;
use crate::worker::{WorkerConfig, WorkerPool};

#[derive(Debug, Clone)]
pub struct GatewayLimits {
    pub queue_max_depth: usize,
    pub default_timeout: ChronoDuration,
    pub default_priority: i64,
    pub default_cache_ttl_s: u64,
    pub cache_max_entries: Option<u64>,
    pub cache_max_bytes: Option<u64>,
    pub rate_default_rpm: f64,
    pub rate_burst: f64,
    pub rate_global_rpm: f64,
    pub queue_skip_ahead: usize,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            queue_max_depth: 1000,
            default_timeout: ChronoDuration::seconds(60),
            default_priority: 0,
            default_cache_ttl_s: 3600,
            cache_max_entries: Some(10_000),
            cache_max_bytes: None,
            rate_default_rpm: 60.0,
            rate_burst: 10.0,
            rate_global_rpm: 6000.0,
            queue_skip_ahead: 8,
        }
    }
}

pub struct SubmitRequest {
    pub provider: String,
    pub model: Option<String>,
    pub agent: Option<String>,
    pub message: String,
    pub priority: Option<i64>,
    pub bypass_cache: bool,
    pub api_key_id: Option<ApiKeyId>,
    pub timeout: Option<ChronoDuration>,
}

pub enum IntakeOutcome {
    /// Served synchronously from the cache; never touched the queue.
    CachedHit(Response),
    /// Enqueued; the caller owns this id and may poll or wait on it.
    Enqueued(RequestId),
    /// Joined another in-flight request with the same fingerprint; will resolve
    /// when that leader's response is broadcast.
    JoinedInFlight(RequestId, tokio::sync::broadcast::Receiver<Response>),
}

pub struct Gateway {
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<CacheManager>,
    pub queue: Arc<PriorityQueue>,
    pub rate_limiter: Arc<RateLimiter>,
    pub bus: Arc<EventBus>,
    pub health: Arc<HealthMonitor>,
    pub metrics: Arc<GatewayMetrics>,
    pub workers: Arc<WorkerPool>,
    providers: HashMap<String, ProviderDescriptor>,
    /// Administrative enable/disable overrides (`POST /api/provider/{name}/toggle`),
    /// separate from the health monitor's `ok`/`degraded`/`down` status: a disabled
    /// provider refuses new intake regardless of how healthy its last probe was.
    provider_enabled: DashMap<String, bool>,
    limits: GatewayLimits,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        storage: Arc<dyn Storage>,
        providers: Vec<ProviderDescriptor>,
        limits: GatewayLimits,
        health_config: HealthMonitorConfig,
        worker_config: WorkerConfig,
    ) -> Result<Self> {
        let bus = Arc::new(EventBus::new(256));
        let metrics = Arc::new(GatewayMetrics::new()?);
        metrics.clone().spawn_event_subscriber(bus.clone());

        let cache = Arc::new(CacheManager::new(
            storage.clone(),
            limits.default_cache_ttl_s,
            limits.cache_max_entries,
            limits.cache_max_bytes,
        ));
        let queue = Arc::new(PriorityQueue::new(limits.queue_max_depth, limits.queue_skip_ahead));
        let rate_limiter = Arc::new(RateLimiter::new(limits.rate_default_rpm, limits.rate_burst, limits.rate_global_rpm));
        let shutdown = CancellationToken::new();

        let backends = build_backends(&providers)?;
        let provider_map: HashMap<String, ProviderDescriptor> = providers.into_iter().map(|p| (p.name.to_string(), p)).collect();

        let provider_enabled: DashMap<String, bool> = provider_map.iter().map(|(name, d)| (name.clone(), d.enabled)).collect();

        let health = Arc::new(HealthMonitor::new(backends.clone(), health_config, bus.clone(), shutdown.clone()));

        let workers = Arc::new(WorkerPool::new(
            storage.clone(),
            cache.clone(),
            queue.clone(),
            rate_limiter.clone(),
            backends,
            provider_map.clone(),
            bus.clone(),
            health.clone(),
            worker_config,
            shutdown.clone(),
        ));

        Ok(Self {
            storage,
            cache,
            queue,
            rate_limiter,
            bus,
            health,
            metrics,
            workers,
            providers: provider_map,
            provider_enabled,
            limits,
            shutdown,
        })
    }

    /// Spawns the health monitor and worker pool as background tasks. Call once
    /// at startup; the returned handles run until `shutdown()` is called.
    pub fn spawn_background_tasks(&self) {
        let health = self.health.clone();
        tokio::spawn(async move { health.run().await });
        let workers = self.workers.clone();
        tokio::spawn(async move { workers.run().await });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.providers.get(name)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.providers.values()
    }

    pub fn provider_enabled(&self, name: &str) -> bool {
        self.provider_enabled.get(name).map(|v| *v).unwrap_or(false)
    }

    pub fn set_provider_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        if !self.providers.contains_key(name) {
            return Err(RelayError::not_found("provider", name));
        }
        self.provider_enabled.insert(name.to_string(), enabled);
        Ok(())
    }

    /// Runs the cache-lookup / single-flight-join / enqueue algorithm from
    /// spec.md §4.4's intake description. Rate-limiting happens in the HTTP layer
    /// before this is called, since a denial there never touches the queue.
    pub async fn intake(&self, req: SubmitRequest) -> Result<IntakeOutcome> {
        if !self.providers.contains_key(&req.provider) {
            return Err(RelayError::Validation {
                message: format!("unknown provider {}", req.provider),
            });
        }
        if !self.provider_enabled(&req.provider) {
            return Err(RelayError::Validation {
                message: format!("provider {} is disabled", req.provider),
            });
        }

        let fingerprint = CacheManager::fingerprint(&req.provider, req.model.as_deref(), req.agent.as_deref(), &req.message);

        if let Some(response) = self.cache.lookup(&fingerprint, req.bypass_cache).await? {
            self.metrics.cache_hits.inc();
            return Ok(IntakeOutcome::CachedHit(response));
        }
        self.metrics.cache_misses.inc();

        let timeout = req.timeout.unwrap_or(self.limits.default_timeout);
        let record = RequestRecord::new(
            req.provider.clone(),
            req.model,
            req.agent,
            req.message,
            req.priority.unwrap_or(self.limits.default_priority),
            timeout,
            req.api_key_id,
            None,
            fingerprint.clone(),
            req.bypass_cache,
        );
        let id = record.id;

        match self.cache.join_single_flight(&fingerprint) {
            SingleFlightRole::Waiter(rx) => {
                self.storage.put_request(record).await?;
                Ok(IntakeOutcome::JoinedInFlight(id, rx))
            }
            SingleFlightRole::Leader => {
                self.storage.put_request(record.clone()).await?;
                self.queue.push(QueueItem {
                    request_id: id,
                    provider: req_provider_of(&record),
                    priority: record.priority,
                    submitted_at: record.submitted_at,
                })
                .map_err(|_| RelayError::QueueFull)?;
                self.bus.publish(Event::RequestSubmitted {
                    request_id: id,
                    provider: record.provider.clone(),
                    priority: record.priority,
                    at: record.submitted_at,
                });
                Ok(IntakeOutcome::Enqueued(id))
            }
        }
    }

    /// Resolves a waiter's eventual response into the same terminal transition a
    /// leader's own worker would apply, so both share identical status semantics.
    pub async fn resolve_waiter(&self, id: RequestId, response: Response) -> Result<()> {
        let record = self.storage.get_request(id).await?;
        let queued = match AnyRequest::from_record(record) {
            AnyRequest::Queued(q) => q,
            _ => return Ok(()),
        };
        if response.is_success() {
            queued.complete_as_waiter(self.storage.as_ref(), &response).await?;
        } else {
            queued.fail_as_waiter(self.storage.as_ref(), &response).await?;
        }
        Ok(())
    }

    pub async fn query(&self, id: RequestId) -> Result<(RequestRecord, Option<Response>)> {
        let record = self.storage.get_request(id).await?;
        let response = self.storage.get_response(id).await?;
        Ok((record, response))
    }

    pub async fn cancel(&self, id: RequestId) -> Result<RequestRecord> {
        let record = self.storage.get_request(id).await?;
        let any = AnyRequest::from_record(record);
        self.queue.remove(id);
        self.workers.cancel_request(id);
        self.workers.commit_cancellation(any).await
    }

    pub fn subscribe(&self, channels: std::collections::HashSet<Channel>) -> (u64, tokio::sync::mpsc::Receiver<Event>) {
        self.bus.subscribe(channels)
    }
}

fn req_provider_of(record: &RequestRecord) -> String {
    record.provider.clone()
}

fn build_backends(providers: &[ProviderDescriptor]) -> Result<HashMap<String, Arc<BackendKind>>> {
    let mut map = HashMap::new();
    for descriptor in providers {
        let backend = match &descriptor.backend {
            BackendConfig::HttpApi(cfg) => BackendKind::Http(HttpBackend::new(cfg.clone(), descriptor.default_model.clone(), descriptor.cost_per_1k)),
            BackendConfig::Cli(cfg) => BackendKind::Cli(CliBackend::new(cfg.clone(), descriptor.cost_per_1k)),
            BackendConfig::Terminal(cfg) => {
                let pane: Arc<dyn PaneController> = Arc::new(InMemoryPaneController::default());
                BackendKind::Terminal(TerminalBackend::new(cfg.clone(), pane, descriptor.cost_per_1k))
            }
        };
        map.insert(descriptor.name.to_string(), Arc::new(backend));
    }
    Ok(map)
}

#[allow(dead_code)]
fn assert_backend_impl(b: &dyn Backend) {
    let _ = b.variant();
}
