//! Token-bucket rate limiting: per API key, a global ceiling, and optional
//! per-provider QPS caps, per spec.md §4.5.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::ids::ApiKeyId;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempts to withdraw `weight` tokens. On denial, returns how long until
    /// enough tokens will have refilled — used to compute `Retry-After`.
    pub fn try_acquire(&self, weight: f64) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= weight {
            state.tokens -= weight;
            Ok(())
        } else if self.refill_per_sec <= 0.0 {
            Err(Duration::from_secs(60))
        } else {
            let deficit = weight - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

pub struct RateLimiter {
    global: TokenBucket,
    per_key: DashMap<ApiKeyId, TokenBucket>,
    per_provider: DashMap<String, TokenBucket>,
    default_rpm: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(default_rpm: f64, burst: f64, global_rpm: f64) -> Self {
        Self {
            global: TokenBucket::new(burst.max(1.0), global_rpm / 60.0),
            per_key: DashMap::new(),
            per_provider: DashMap::new(),
            default_rpm,
            burst,
        }
    }

    /// Intake gate: one global bucket plus (if a key was presented) that key's own
    /// bucket, refilling at `per_minute_limit / 60` tokens/sec.
    pub fn try_acquire(&self, key: Option<ApiKeyId>, per_minute_limit: Option<u32>) -> Result<(), Duration> {
        self.global.try_acquire(1.0)?;

        if let Some(key) = key {
            let rpm = per_minute_limit.map(|v| v as f64).unwrap_or(self.default_rpm);
            self.per_key
                .entry(key)
                .or_insert_with(|| TokenBucket::new(self.burst, rpm / 60.0))
                .try_acquire(1.0)?;
        }
        Ok(())
    }

    /// Consulted by the worker right before dispatch to enforce a per-provider QPS
    /// cap, if the provider's descriptor configures one.
    pub fn try_acquire_provider(&self, provider: &str, qps: Option<f64>) -> bool {
        let Some(qps) = qps else { return true };
        self.per_provider
            .entry(provider.to_string())
            .or_insert_with(|| TokenBucket::new(qps.max(1.0), qps))
            .try_acquire(1.0)
            .is_ok()
    }

    pub fn snapshot_provider_limits(&self) -> HashMap<String, f64> {
        self.per_provider.iter().map(|e| (e.key().clone(), e.value().capacity)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_denies_after_burst_exhausted() {
        let bucket = TokenBucket::new(2.0, 1.0);
        assert!(bucket.try_acquire(1.0).is_ok());
        assert!(bucket.try_acquire(1.0).is_ok());
        assert!(bucket.try_acquire(1.0).is_err());
    }

    #[test]
    fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(1.0, 1000.0);
        assert!(bucket.try_acquire(1.0).is_ok());
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.try_acquire(1.0).is_ok());
    }

    #[test]
    fn provider_qps_cap_is_independent_per_provider() {
        let limiter = RateLimiter::new(60.0, 5.0, 1_000_000.0);
        assert!(limiter.try_acquire_provider("p1", Some(1.0)));
        assert!(!limiter.try_acquire_provider("p1", Some(1.0)));
        assert!(limiter.try_acquire_provider("p2", Some(1.0)));
    }
}
