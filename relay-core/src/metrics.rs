//! Domain metrics: counters, histograms, and per-provider gauges, hand-registered
//! against a `prometheus::Registry` the way `dwctl::metrics::gen_ai::GenAiMetrics`
//! registers its GenAI instrument family. HTTP-transport-level metrics (request
//! counts, latency by route) are a separate concern layered on by the gateway
//! binary via `axum_prometheus`; this registry covers gateway domain state only.

use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::error::Result;

pub struct GatewayMetrics {
    registry: Registry,
    pub requests_submitted: IntCounter,
    pub requests_completed: IntCounterVec,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub retries_total: IntCounterVec,
    pub fallbacks_total: IntCounterVec,
    pub provider_latency_seconds: HistogramVec,
    pub queue_wait_seconds: Histogram,
    pub queue_depth: IntGauge,
    pub provider_in_flight: IntGaugeVec,
    pub provider_health: IntGaugeVec,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_submitted = IntCounter::with_opts(Opts::new("gateway_requests_submitted_total", "requests accepted at intake")).map_err(|e| anyhow::anyhow!(e))?;

        let requests_completed = IntCounterVec::new(
            Opts::new("gateway_requests_completed_total", "terminal requests by final status"),
            &["status"],
        ).map_err(|e| anyhow::anyhow!(e))?;

        let cache_hits = IntCounter::with_opts(Opts::new("gateway_cache_hits_total", "intake requests served from cache")).map_err(|e| anyhow::anyhow!(e))?;
        let cache_misses = IntCounter::with_opts(Opts::new("gateway_cache_misses_total", "intake requests that missed the cache")).map_err(|e| anyhow::anyhow!(e))?;

        let retries_total = IntCounterVec::new(Opts::new("gateway_retries_total", "backend retry attempts"), &["provider"]).map_err(|e| anyhow::anyhow!(e))?;
        let fallbacks_total = IntCounterVec::new(Opts::new("gateway_fallbacks_total", "fallback-chain provider switches"), &["from", "to"]).map_err(|e| anyhow::anyhow!(e))?;

        let provider_latency_seconds = HistogramVec::new(
            HistogramOpts::new("gateway_provider_latency_seconds", "backend call latency by provider")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["provider"],
        ).map_err(|e| anyhow::anyhow!(e))?;

        let queue_wait_seconds = Histogram::with_opts(
            HistogramOpts::new("gateway_queue_wait_seconds", "time spent queued before a worker claims a request")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        ).map_err(|e| anyhow::anyhow!(e))?;

        let queue_depth = IntGauge::with_opts(Opts::new("gateway_queue_depth", "requests currently queued")).map_err(|e| anyhow::anyhow!(e))?;
        let provider_in_flight = IntGaugeVec::new(Opts::new("gateway_provider_in_flight", "in-flight requests per provider"), &["provider"]).map_err(|e| anyhow::anyhow!(e))?;
        let provider_health = IntGaugeVec::new(
            Opts::new("gateway_provider_health", "0=unknown 1=ok 2=degraded 3=down, per provider"),
            &["provider"],
        ).map_err(|e| anyhow::anyhow!(e))?;

        registry.register(Box::new(requests_submitted.clone())).map_err(|e| anyhow::anyhow!(e))?;
        registry.register(Box::new(requests_completed.clone())).map_err(|e| anyhow::anyhow!(e))?;
        registry.register(Box::new(cache_hits.clone())).map_err(|e| anyhow::anyhow!(e))?;
        registry.register(Box::new(cache_misses.clone())).map_err(|e| anyhow::anyhow!(e))?;
        registry.register(Box::new(retries_total.clone())).map_err(|e| anyhow::anyhow!(e))?;
        registry.register(Box::new(fallbacks_total.clone())).map_err(|e| anyhow::anyhow!(e))?;
        registry.register(Box::new(provider_latency_seconds.clone())).map_err(|e| anyhow::anyhow!(e))?;
        registry.register(Box::new(queue_wait_seconds.clone())).map_err(|e| anyhow::anyhow!(e))?;
        registry.register(Box::new(queue_depth.clone())).map_err(|e| anyhow::anyhow!(e))?;
        registry.register(Box::new(provider_in_flight.clone())).map_err(|e| anyhow::anyhow!(e))?;
        registry.register(Box::new(provider_health.clone())).map_err(|e| anyhow::anyhow!(e))?;

        Ok(Self {
            registry,
            requests_submitted,
            requests_completed,
            cache_hits,
            cache_misses,
            retries_total,
            fallbacks_total,
            provider_latency_seconds,
            queue_wait_seconds,
            queue_depth,
            provider_in_flight,
            provider_health,
        })
    }

    pub fn record_health(&self, provider: &str, status: crate::provider::HealthStatus) {
        let value = match status {
            crate::provider::HealthStatus::Unknown => 0,
            crate::provider::HealthStatus::Ok => 1,
            crate::provider::HealthStatus::Degraded => 2,
            crate::provider::HealthStatus::Down => 3,
        };
        self.provider_health.with_label_values(&[provider]).set(value);
    }

    pub fn set_in_flight(&self, provider: &str, value: i64) {
        self.provider_in_flight.with_label_values(&[provider]).set(value);
    }

    /// Renders the domain registry as Prometheus text exposition; the gateway
    /// binary appends its `axum_prometheus` HTTP-transport family to this same
    /// response body.
    pub fn render(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buf = String::new();
        TextEncoder::new().encode_utf8(&families, &mut buf).map_err(|e| anyhow::anyhow!(e))?;
        Ok(buf)
    }

    /// Drives the domain counters/gauges off the event bus, so worker and health
    /// monitor code never needs a direct `GatewayMetrics` dependency — it only
    /// publishes `Event`s, and this task translates them.
    pub fn spawn_event_subscriber(self: std::sync::Arc<Self>, bus: std::sync::Arc<crate::events::EventBus>) {
        use std::collections::HashSet;
        let (_, mut rx) = bus.subscribe(HashSet::from([
            crate::events::Channel::Requests,
            crate::events::Channel::Providers,
            crate::events::Channel::Cli,
        ]));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.observe(&event);
            }
        });
    }

    fn observe(&self, event: &crate::events::Event) {
        use crate::events::Event;
        match event {
            Event::RequestSubmitted { .. } => self.requests_submitted.inc(),
            Event::RequestCompleted { .. } => self.requests_completed.with_label_values(&["completed"]).inc(),
            Event::RequestFailed { error_code, .. } => self.requests_completed.with_label_values(&[error_code]).inc(),
            Event::RequestCancelled { .. } => self.requests_completed.with_label_values(&["cancelled"]).inc(),
            Event::ProviderInvoked { provider, attempt, .. } if *attempt > 1 => {
                self.retries_total.with_label_values(&[provider]).inc();
            }
            Event::ProviderHealthChanged { provider, status, .. } => self.record_health(provider, *status),
            Event::ProviderInFlightChanged { provider, in_flight, .. } => self.set_in_flight(provider, *in_flight as i64),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_families() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.requests_submitted.inc();
        let text = metrics.render().unwrap();
        assert!(text.contains("gateway_requests_submitted_total"));
    }
}
