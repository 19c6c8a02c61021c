//! Provider descriptors (config, loaded at startup) and provider runtime state
//! (volatile, rebuilt by the health monitor). Per spec.md §9's design note,
//! providers are data: there are exactly three backend implementations and a new
//! provider is a new config row, never a new code path.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ProviderName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendVariant {
    Http,
    Cli,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpDialect {
    Anthropic,
    Openai,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    pub api_base_url: String,
    pub api_key_env: String,
    pub dialect: HttpDialect,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliBackendConfig {
    pub command: String,
    #[serde(default)]
    pub args_template: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_auth_indicators")]
    pub auth_indicators: Vec<String>,
}

fn default_auth_indicators() -> Vec<String> {
    ["sign in", "authenticate", "oauth", "please log in"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalBackendConfig {
    pub pane_id: String,
    pub prompt_prefix: String,
    pub completion_marker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend_type", rename_all = "snake_case")]
pub enum BackendConfig {
    HttpApi(HttpBackendConfig),
    Cli(CliBackendConfig),
    Terminal(TerminalBackendConfig),
}

impl BackendConfig {
    pub fn variant(&self) -> BackendVariant {
        match self {
            BackendConfig::HttpApi(_) => BackendVariant::Http,
            BackendConfig::Cli(_) => BackendVariant::Cli,
            BackendConfig::Terminal(_) => BackendVariant::Terminal,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: ProviderName,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i64,
    pub backend: BackendConfig,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub fallback_chain: Vec<ProviderName>,
    #[serde(default)]
    pub cost_per_1k: Option<f64>,
    #[serde(default)]
    pub qps: Option<f64>,
    #[serde(default)]
    pub cache_ttl_s: Option<u64>,
}

impl ProviderDescriptor {
    pub fn backend_variant(&self) -> BackendVariant {
        self.backend.variant()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
    Unknown,
}

/// Volatile, in-memory per-provider state. Rebuilt from scratch on restart; never
/// persisted, per spec.md §3's ownership rule.
#[derive(Debug, Clone)]
pub struct ProviderRuntimeState {
    pub health: HealthStatus,
    pub in_flight: usize,
    window: VecDeque<bool>,
    latencies: VecDeque<u64>,
    window_capacity: usize,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub probation_until: Option<DateTime<Utc>>,
}

impl ProviderRuntimeState {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            health: HealthStatus::Unknown,
            in_flight: 0,
            window: VecDeque::with_capacity(window_capacity),
            latencies: VecDeque::with_capacity(window_capacity),
            window_capacity,
            last_ping_at: None,
            consecutive_failures: 0,
            probation_until: None,
        }
    }

    pub fn record_sample(&mut self, success: bool, latency_ms: u64) {
        self.last_ping_at = Some(Utc::now());
        if self.window.len() == self.window_capacity {
            self.window.pop_front();
        }
        self.window.push_back(success);
        if self.latencies.len() == self.window_capacity {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency_ms);

        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }

    pub fn success_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|s| **s).count();
        ok as f64 / self.window.len() as f64
    }

    pub fn median_latency_ms(&self) -> u64 {
        if self.latencies.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.latencies.iter().copied().collect();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }

    pub fn window_full(&self) -> bool {
        self.window.len() >= self.window_capacity
    }

    pub fn all_succeeded(&self) -> bool {
        self.window_full() && self.window.iter().all(|s| *s)
    }
}
