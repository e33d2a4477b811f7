//! Result cache for capability outputs.
//!
//! Outputs are memoized under a content hash of `{capability, input}` in a
//! [`KvStore`]. Keys are laid out as `cache:{capability}:{sha256}` so one
//! capability can be invalidated with a prefix scan; each entry's hit count
//! lives beside it under `{key}:hits`.
//!
//! The cache is best-effort. Store failures are logged and degrade to a miss
//! or a no-op; no method returns an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use orchestra_types::cache::{CacheEntry, CacheStats};
use orchestra_types::config::CacheConfig;
use serde_json::{Value, json};

use crate::canonical::content_hash;
use crate::repository::kv::KvStore;

const KEY_PREFIX: &str = "cache:";
const HITS_SUFFIX: &str = ":hits";
const HASH_LEN: usize = 64;

/// Cache key for a capability invocation.
pub fn cache_key(capability: &str, input: &Value) -> String {
    let digest = content_hash(&json!({"capability": capability, "input": input}));
    format!("{KEY_PREFIX}{capability}:{digest}")
}

fn hits_key(key: &str) -> String {
    format!("{key}{HITS_SUFFIX}")
}

/// Whether `rest` (the part after a capability prefix) is a digest or a
/// digest's hit counter, rather than a longer capability name.
fn is_entry_suffix(rest: &str) -> bool {
    let digest = rest.strip_suffix(HITS_SUFFIX).unwrap_or(rest);
    digest.len() == HASH_LEN && digest.bytes().all(|b| b.is_ascii_hexdigit())
}

pub struct ResultCache<K: KvStore> {
    kv: K,
    enabled: bool,
    default_ttl: Duration,
    max_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: KvStore> ResultCache<K> {
    pub fn new(kv: K, config: &CacheConfig) -> Self {
        Self {
            kv,
            enabled: config.enabled,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            max_ttl: Duration::from_secs(config.max_ttl_secs),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a memoized output. A hit bumps the entry's hit count.
    pub async fn get(&self, capability: &str, input: &Value) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let key = cache_key(capability, input);

        let raw = match self.kv.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return self.miss(),
            Err(e) => {
                tracing::warn!(key = key.as_str(), error = %e, "cache read failed; treating as miss");
                return self.miss();
            }
        };
        let mut entry: CacheEntry = match serde_json::from_value(raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = key.as_str(), error = %e, "corrupt cache entry; treating as miss");
                return self.miss();
            }
        };

        let remaining = (entry.expires_at() - Utc::now()).to_std().ok();
        match self.kv.incr(&hits_key(&key), remaining).await {
            Ok(count) => entry.hit_count = count.max(0) as u64,
            Err(e) => tracing::warn!(key = key.as_str(), error = %e, "cache hit count update failed"),
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(capability, hit_count = entry.hit_count, "cache hit");
        Some(entry)
    }

    fn miss(&self) -> Option<CacheEntry> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Memoize an output. `ttl` falls back to the configured default and is
    /// clamped to the configured maximum. Returns the stored entry.
    pub async fn put(
        &self,
        capability: &str,
        input: &Value,
        output: &Value,
        agent_id: &str,
        ttl: Option<Duration>,
    ) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let ttl = ttl.unwrap_or(self.default_ttl).min(self.max_ttl);
        if ttl.is_zero() {
            return None;
        }

        let key = cache_key(capability, input);
        let entry = CacheEntry {
            key: key.clone(),
            output: output.clone(),
            agent_id: agent_id.to_string(),
            cached_at: Utc::now(),
            ttl_seconds: ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0),
            hit_count: 0,
        };
        let raw = match serde_json::to_value(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = key.as_str(), error = %e, "cache entry serialization failed");
                return None;
            }
        };

        if let Err(e) = self.kv.set_with_ttl(&key, &raw, ttl).await {
            tracing::warn!(key = key.as_str(), error = %e, "cache write failed");
            return None;
        }
        if let Err(e) = self.kv.delete(&hits_key(&key)).await {
            tracing::warn!(key = key.as_str(), error = %e, "cache hit counter reset failed");
        }
        Some(entry)
    }

    /// Drop the entry for one exact invocation. Returns whether it existed.
    pub async fn invalidate(&self, capability: &str, input: &Value) -> bool {
        let key = cache_key(capability, input);
        let _ = self.delete_logged(&hits_key(&key)).await;
        self.delete_logged(&key).await
    }

    /// Drop every entry for `capability`. Returns how many entries went.
    pub async fn invalidate_capability(&self, capability: &str) -> usize {
        let prefix = format!("{KEY_PREFIX}{capability}:");
        self.delete_matching(&prefix, |key| {
            key.strip_prefix(prefix.as_str()).is_some_and(is_entry_suffix)
        })
        .await
    }

    /// Drop every cache entry. Returns how many entries went.
    pub async fn flush(&self) -> usize {
        self.delete_matching(KEY_PREFIX, |_| true).await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats::from_counts(
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    async fn delete_matching(&self, prefix: &str, owns: impl Fn(&str) -> bool) -> usize {
        let keys = match self.kv.scan_prefix(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(prefix, error = %e, "cache scan failed");
                return 0;
            }
        };
        let mut removed = 0;
        for key in keys.iter().filter(|k| owns(k.as_str())) {
            if self.delete_logged(key).await && !key.ends_with(HITS_SUFFIX) {
                removed += 1;
            }
        }
        removed
    }

    async fn delete_logged(&self, key: &str) -> bool {
        match self.kv.delete(key).await {
            Ok(existed) => existed,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache delete failed");
                false
            }
        }
    }
}
