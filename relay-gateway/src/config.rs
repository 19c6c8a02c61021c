//! Gateway configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides.
//! The file path defaults to `config.yaml` but can be set via `-f`/`--config` or
//! the `RELAY_CONFIG` environment variable.
//!
//! ## Loading priority
//!
//! 1. **YAML config file** — base configuration (default: `config.yaml`).
//! 2. **Environment variables** — prefixed `RELAY_` override YAML values; use a
//!    double underscore to address nested fields, e.g. `RELAY_CACHE__DEFAULT_TTL_S`.

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use relay_core::gateway::GatewayLimits;
use relay_core::health::HealthMonitorConfig;
use relay_core::provider::ProviderDescriptor;
use relay_core::worker::WorkerConfig;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the configuration file.
    #[arg(short = 'f', long, env = "RELAY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_storage_path() -> String {
    "relay.db".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: default_storage_path() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfigFile {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub jitter: f64,
    /// Accepted for wire-compatibility with spec.md's config table; the backend
    /// implementations classify status codes with fixed rules (spec.md §4.2), so
    /// this list is not consulted at dispatch time.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfigFile {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_backoff_ms: 500,
            jitter: 0.25,
            retryable_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryConfigFile {
    fn into_retry_config(self) -> relay_core::executor::RetryConfig {
        if !self.enabled {
            return relay_core::executor::RetryConfig {
                max_attempts: 1,
                base_backoff: Duration::from_millis(self.base_backoff_ms),
                jitter_fraction: self.jitter,
            };
        }
        relay_core::executor::RetryConfig {
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            jitter_fraction: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfigFile {
    pub enabled: bool,
    pub default_ttl_s: u64,
    pub max_entries: Option<u64>,
    pub max_bytes: Option<u64>,
}

impl Default for CacheConfigFile {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_s: 3600,
            max_entries: Some(10_000),
            max_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfigFile {
    pub default_rpm: f64,
    pub burst: f64,
    pub global_rpm: f64,
}

impl Default for RateLimitConfigFile {
    fn default() -> Self {
        Self {
            default_rpm: 60.0,
            burst: 10.0,
            global_rpm: 6000.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfigFile {
    pub interval_s: u64,
    pub window: usize,
    pub success_threshold: f64,
    pub down_after_failures: u32,
}

impl Default for HealthConfigFile {
    fn default() -> Self {
        Self {
            interval_s: 30,
            window: 20,
            success_threshold: 0.7,
            down_after_failures: 3,
        }
    }
}

impl HealthConfigFile {
    fn into_health_config(self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            interval: Duration::from_secs(self.interval_s),
            window: self.window,
            success_threshold: self.success_threshold,
            down_after_failures: self.down_after_failures,
            ..HealthMonitorConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfigFile {
    pub max_depth: usize,
    pub skip_ahead: usize,
}

impl Default for QueueConfigFile {
    fn default() -> Self {
        Self { max_depth: 1000, skip_ahead: 8 }
    }
}

/// Root gateway configuration, loaded from YAML plus `RELAY_`-prefixed env
/// overrides. Unknown keys are a startup error rather than being silently
/// ignored.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,
    pub retry: RetryConfigFile,
    pub cache: CacheConfigFile,
    pub rate_limit: RateLimitConfigFile,
    pub health: HealthConfigFile,
    pub queue: QueueConfigFile,
    pub storage: StorageConfig,
    pub worker_pool_size: usize,
    #[serde(with = "humantime_serde")]
    pub request_default_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            providers: Vec::new(),
            retry: RetryConfigFile::default(),
            cache: CacheConfigFile::default(),
            rate_limit: RateLimitConfigFile::default(),
            health: HealthConfigFile::default(),
            queue: QueueConfigFile::default(),
            storage: StorageConfig::default(),
            worker_pool_size: 8,
            request_default_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(figment::Error::from)?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("RELAY_").split("__"))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.providers.is_empty() {
            return Err("configuration must declare at least one provider".to_string());
        }
        let mut seen = HashMap::new();
        for provider in &self.providers {
            if seen.insert(provider.name.as_str().to_string(), ()).is_some() {
                return Err(format!("duplicate provider name {}", provider.name));
            }
            for fallback in &provider.fallback_chain {
                if fallback.as_str() == provider.name.as_str() {
                    return Err(format!("provider {} lists itself in its own fallback chain", provider.name));
                }
            }
        }
        if self.cache.default_ttl_s == 0 {
            return Err("cache.default_ttl_s must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn limits(&self) -> GatewayLimits {
        GatewayLimits {
            queue_max_depth: self.queue.max_depth,
            default_timeout: chrono::Duration::from_std(self.request_default_timeout).unwrap_or(chrono::Duration::seconds(60)),
            default_priority: 0,
            default_cache_ttl_s: self.cache.default_ttl_s,
            cache_max_entries: if self.cache.enabled { self.cache.max_entries } else { Some(0) },
            cache_max_bytes: self.cache.max_bytes,
            rate_default_rpm: self.rate_limit.default_rpm,
            rate_burst: self.rate_limit.burst,
            rate_global_rpm: self.rate_limit.global_rpm,
            queue_skip_ahead: self.queue.skip_ahead,
        }
    }

    pub fn health_config(&self) -> HealthMonitorConfig {
        self.health.clone().into_health_config()
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            pool_size: self.worker_pool_size,
            retry: self.retry.clone().into_retry_config(),
            ..WorkerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_provider_list() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_self_referential_fallback_chain() {
        let mut config = Config::default();
        config.providers.push(ProviderDescriptor {
            name: "p".into(),
            enabled: true,
            priority: 0,
            backend: relay_core::provider::BackendConfig::Cli(relay_core::provider::CliBackendConfig {
                command: "echo".to_string(),
                args_template: vec![],
                env: HashMap::new(),
                auth_indicators: vec![],
            }),
            default_model: None,
            concurrency: 4,
            timeout: Duration::from_secs(30),
            fallback_chain: vec!["p".into()],
            cost_per_1k: None,
            qps: None,
            cache_ttl_s: None,
        });
        assert!(config.validate().is_err());
    }
}
