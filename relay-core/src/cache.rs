//! Fingerprint-keyed response cache with single-flight coalescing.
//!
//! Grounded on spec.md §9's guidance to implement single-flight "as a map of
//! fingerprint → notifier object owned by the cache manager, not as a blocking
//! call in the queue": `in_flight` is a `DashMap<String, broadcast::Sender<Response>>`
//! so joining an in-flight fingerprint is a lock-free map lookup, and waiters learn
//! the result by subscribing to a one-shot-ish broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use unicode_normalization::UnicodeNormalization;

use crate::error::Result;
use crate::response::Response;
use crate::store::{CacheEntry, Storage};

/// What the caller should do after attempting to join the single-flight map for a
/// fingerprint.
pub enum SingleFlightRole {
    /// No one else is in flight for this fingerprint; the caller must execute the
    /// request and call `complete_single_flight` when done.
    Leader,
    /// Another caller is already in flight; await this receiver for the result.
    Waiter(broadcast::Receiver<Response>),
}

pub struct CacheManager {
    storage: Arc<dyn Storage>,
    default_ttl_s: u64,
    max_entries: Option<u64>,
    max_bytes: Option<u64>,
    in_flight: DashMap<String, broadcast::Sender<Response>>,
}

impl CacheManager {
    pub fn new(storage: Arc<dyn Storage>, default_ttl_s: u64, max_entries: Option<u64>, max_bytes: Option<u64>) -> Self {
        Self {
            storage,
            default_ttl_s,
            max_entries,
            max_bytes,
            in_flight: DashMap::new(),
        }
    }

    /// Normalizes {provider, model, agent, prompt} and hashes them into a stable
    /// fingerprint: lowercase provider/model, trim and NFC-normalize the prompt.
    pub fn fingerprint(provider: &str, model: Option<&str>, agent: Option<&str>, prompt: &str) -> String {
        let normalized_prompt: String = prompt.trim().nfc().collect();
        let mut hasher = Sha256::new();
        hasher.update(provider.to_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(model.unwrap_or("").to_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(agent.unwrap_or("").to_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(normalized_prompt.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Checks the durable cache; returns `None` on miss, bypass, or an expired
    /// entry (which is evicted eagerly so it doesn't shadow a fresher write).
    pub async fn lookup(&self, fingerprint: &str, bypass: bool) -> Result<Option<Response>> {
        if bypass {
            return Ok(None);
        }
        match self.storage.cache_get(fingerprint).await? {
            Some(entry) if !entry.is_expired_at(Utc::now()) => Ok(Some(Response::from_cache(
                crate::ids::RequestId::new(),
                entry.text,
                entry.thinking,
                entry.tokens,
                entry.provider_used,
            ))),
            Some(_) => {
                self.storage.cache_evict(fingerprint).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Joins the single-flight slot for `fingerprint`. At most one caller per
    /// fingerprint ever becomes `Leader` between a slot's creation and removal.
    pub fn join_single_flight(&self, fingerprint: &str) -> SingleFlightRole {
        match self.in_flight.entry(fingerprint.to_string()) {
            Entry::Occupied(entry) => SingleFlightRole::Waiter(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx);
                SingleFlightRole::Leader
            }
        }
    }

    /// Called by the leader once the upstream call has a terminal `Response`
    /// (success or failure). Wakes every waiter with a clone and, on success,
    /// durably populates the cache before the slot is removed — so a waiter that
    /// misses the broadcast and falls through to `lookup` still observes the
    /// entry (cache writes happen-before waiter wakeup, per spec.md §5).
    pub async fn complete_single_flight(&self, fingerprint: &str, response: Response, provider_ttl_s: Option<u64>) {
        if response.is_success() {
            if let Some(text) = response.text.clone() {
                let entry = CacheEntry {
                    fingerprint: fingerprint.to_string(),
                    text,
                    thinking: response.thinking.clone(),
                    tokens: response.tokens,
                    provider_used: response.provider_used.clone().unwrap_or_default(),
                    stored_at: Utc::now(),
                    ttl_s: provider_ttl_s.unwrap_or(self.default_ttl_s),
                };
                if self.storage.cache_put(entry).await.is_ok() {
                    let _ = self.enforce_eviction().await;
                }
            }
        }
        if let Some((_, tx)) = self.in_flight.remove(fingerprint) {
            let _ = tx.send(response);
        }
    }

    async fn enforce_eviction(&self) -> Result<()> {
        if let Some(max) = self.max_entries {
            for fingerprint in self.storage.cache_lru_candidates(max as usize).await? {
                self.storage.cache_evict(&fingerprint).await?;
            }
        }
        if let Some(max_bytes) = self.max_bytes {
            let entries = self.storage.cache_entries_by_last_read().await?;
            let total: u64 = entries.iter().map(|(_, bytes)| bytes).sum();
            if total > max_bytes {
                let mut over = total - max_bytes;
                for (fingerprint, bytes) in entries {
                    if over == 0 {
                        break;
                    }
                    self.storage.cache_evict(&fingerprint).await?;
                    over = over.saturating_sub(bytes);
                }
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<crate::store::CacheStats> {
        self.storage.cache_stats().await
    }

    pub async fn clear(&self) -> Result<()> {
        self.storage.cache_clear().await
    }

    /// Sweeps and evicts entries that have already expired, without touching
    /// live ones. Distinct from `clear`, which wipes the cache unconditionally.
    pub async fn cleanup(&self) -> Result<u64> {
        let expired = self.storage.cache_expired(Utc::now()).await?;
        let count = expired.len() as u64;
        for fingerprint in expired {
            self.storage.cache_evict(&fingerprint).await?;
        }
        Ok(count)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_normalized() {
        let a = CacheManager::fingerprint("Anthropic", Some("Claude-3"), None, "  Hello World  ");
        let b = CacheManager::fingerprint("anthropic", Some("claude-3"), None, "Hello World");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_prompts() {
        let a = CacheManager::fingerprint("p", None, None, "one");
        let b = CacheManager::fingerprint("p", None, None, "two");
        assert_ne!(a, b);
    }
}
