//! Result cache types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A memoized capability output.
///
/// The payload is immutable; `hit_count` is tracked separately by the store
/// and filled in on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub output: serde_json::Value,
    pub agent_id: String,
    pub cached_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.cached_at + chrono::Duration::seconds(self.ttl_seconds as i64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn from_counts(hits: u64, misses: u64) -> Self {
        let total = hits + misses;
        let hit_rate = if total == 0 { 0.0 } else { hits as f64 / total as f64 };
        Self { hits, misses, hit_rate }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_from_counts() {
        assert_eq!(CacheStats::from_counts(0, 0).hit_rate, 0.0);
        assert_eq!(CacheStats::from_counts(3, 1).hit_rate, 0.75);
    }
}
