//! Background health monitor: pings every enabled provider on a fixed interval and
//! maintains a rolling window that drives `ok`/`degraded`/`down` transitions.
//!
//! Grounded on `dwctl::probes::executor`/`scheduler`: one task per provider,
//! measuring latency via `Instant` around `health_check` and recording
//! success/failure into a fixed-capacity window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendCtx, BackendKind, HealthCheck};
use crate::events::{Event, EventBus};
use crate::provider::{HealthStatus, ProviderRuntimeState};

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    pub window: usize,
    pub success_threshold: f64,
    pub down_after_failures: u32,
    pub latency_budget_ms: Option<u64>,
    pub probation_window: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            window: 20,
            success_threshold: 0.7,
            down_after_failures: 3,
            latency_budget_ms: None,
            probation_window: Duration::from_secs(60),
        }
    }
}

pub struct HealthMonitor {
    backends: HashMap<String, Arc<BackendKind>>,
    runtime: DashMap<String, ProviderRuntimeState>,
    config: HealthMonitorConfig,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(backends: HashMap<String, Arc<BackendKind>>, config: HealthMonitorConfig, bus: Arc<EventBus>, cancel: CancellationToken) -> Self {
        let runtime = DashMap::new();
        for name in backends.keys() {
            runtime.insert(name.clone(), ProviderRuntimeState::new(config.window));
        }
        Self {
            backends,
            runtime,
            config,
            bus,
            cancel,
        }
    }

    pub fn status(&self, provider: &str) -> HealthStatus {
        self.runtime.get(provider).map(|s| s.health).unwrap_or(HealthStatus::Unknown)
    }

    pub fn runtime_snapshot(&self, provider: &str) -> Option<ProviderRuntimeState> {
        self.runtime.get(provider).map(|s| s.clone())
    }

    /// Adjusts a provider's in-flight count and returns the new value, so the
    /// caller can publish it without the monitor depending on `GatewayMetrics`
    /// directly.
    pub fn note_in_flight_delta(&self, provider: &str, delta: i64) -> usize {
        let Some(mut state) = self.runtime.get_mut(provider) else { return 0 };
        state.in_flight = (state.in_flight as i64 + delta).max(0) as usize;
        state.in_flight
    }

    pub async fn run(self: Arc<Self>) {
        let mut set = JoinSet::new();
        for (name, backend) in self.backends.clone() {
            let this = self.clone();
            set.spawn(async move { this.probe_loop(name, backend).await });
        }
        while set.join_next().await.is_some() {}
    }

    async fn probe_loop(&self, name: String, backend: Arc<BackendKind>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            let deadline = Utc::now() + chrono::Duration::from_std(self.config.interval).unwrap_or(chrono::Duration::seconds(30));
            let ctx = BackendCtx::new(deadline, CancellationToken::new());
            let started = Instant::now();
            let result = backend.health_check(&ctx).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            let success = matches!(result, HealthCheck::Ok);
            self.record_sample(&name, success, latency_ms);
        }
    }

    fn record_sample(&self, name: &str, success: bool, latency_ms: u64) {
        let Some(mut state) = self.runtime.get_mut(name) else { return };
        let previous = state.health;
        state.record_sample(success, latency_ms);

        let now = Utc::now();
        let new_health = if state.consecutive_failures >= self.config.down_after_failures {
            state.probation_until = None;
            HealthStatus::Down
        } else if success && previous == HealthStatus::Down {
            state.probation_until = Some(now + chrono::Duration::from_std(self.config.probation_window).unwrap_or_default());
            HealthStatus::Degraded
        } else if let Some(probation_until) = state.probation_until {
            if !success {
                state.probation_until = None;
                previous
            } else if now >= probation_until {
                state.probation_until = None;
                HealthStatus::Ok
            } else {
                HealthStatus::Degraded
            }
        } else {
            let latency_exceeded = self.config.latency_budget_ms.is_some_and(|budget| state.median_latency_ms() > budget);
            if state.success_ratio() < self.config.success_threshold || latency_exceeded {
                HealthStatus::Degraded
            } else if state.all_succeeded() {
                HealthStatus::Ok
            } else {
                previous
            }
        };

        if new_health != previous {
            state.health = new_health;
            drop(state);
            self.bus.publish(Event::ProviderHealthChanged {
                provider: name.to_string(),
                status: new_health,
                at: now,
            });
        } else {
            state.health = new_health;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn monitor() -> (Arc<HealthMonitor>, tokio::sync::mpsc::Receiver<Event>) {
        let bus = Arc::new(EventBus::new(16));
        let (_, rx) = bus.subscribe(HashSet::from([crate::events::Channel::Providers]));
        let monitor = Arc::new(HealthMonitor::new(
            HashMap::new(),
            HealthMonitorConfig {
                window: 4,
                down_after_failures: 2,
                success_threshold: 0.7,
                ..Default::default()
            },
            bus,
            CancellationToken::new(),
        ));
        monitor.runtime.insert("p1".to_string(), ProviderRuntimeState::new(4));
        (monitor, rx)
    }

    #[tokio::test]
    async fn goes_down_after_consecutive_failures() {
        let (monitor, mut rx) = monitor();
        monitor.record_sample("p1", false, 10);
        assert_eq!(monitor.status("p1"), HealthStatus::Unknown);
        monitor.record_sample("p1", false, 10);
        assert_eq!(monitor.status("p1"), HealthStatus::Down);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::ProviderHealthChanged { status: HealthStatus::Down, .. }));
    }

    #[tokio::test]
    async fn recovers_through_probation() {
        let (monitor, _rx) = monitor();
        monitor.record_sample("p1", false, 10);
        monitor.record_sample("p1", false, 10);
        assert_eq!(monitor.status("p1"), HealthStatus::Down);

        monitor.record_sample("p1", true, 10);
        assert_eq!(monitor.status("p1"), HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn all_successes_reach_ok() {
        let (monitor, _rx) = monitor();
        for _ in 0..4 {
            monitor.record_sample("p1", true, 10);
        }
        assert_eq!(monitor.status("p1"), HealthStatus::Ok);
    }
}
