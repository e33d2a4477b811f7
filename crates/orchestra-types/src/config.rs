//! Configuration types for Orchestra.
//!
//! `OrchestraConfig` mirrors `config.toml` in the data directory. Every field
//! has a default so an empty or partial file is valid.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestraConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub events: EventConfig,
    /// HTTP capability endpoints keyed by capability name.
    #[serde(default)]
    pub providers: BTreeMap<String, HttpProviderConfig>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Re-attempts for stages that do not set `max_retries`.
    #[serde(default)]
    pub default_max_retries: u32,
    /// Per-attempt timeout for stages that do not set `timeout_ms`.
    /// Absent means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_stage_timeout_ms: Option<u64>,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Lock TTL when a resource claim gives none.
    #[serde(default = "default_lock_ttl_ms")]
    pub default_lock_ttl_ms: u64,
    /// Upper bound on a `Queue` wait for stages without a timeout.
    #[serde(default = "default_lock_queue_max_wait_ms")]
    pub lock_queue_max_wait_ms: u64,
    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,
    /// Runs the workflow service executes at once.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_lock_ttl_ms() -> u64 {
    300_000
}

fn default_lock_queue_max_wait_ms() -> u64 {
    30_000
}

fn default_lock_poll_interval_ms() -> u64 {
    100
}

fn default_max_concurrent_runs() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 0,
            default_stage_timeout_ms: None,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            default_lock_ttl_ms: default_lock_ttl_ms(),
            lock_queue_max_wait_ms: default_lock_queue_max_wait_ms(),
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Caller-supplied TTLs are clamped to this.
    #[serde(default = "default_cache_max_ttl_secs")]
    pub max_ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_max_ttl_secs() -> u64 {
    86_400
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: default_cache_ttl_secs(),
            max_ttl_secs: default_cache_max_ttl_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Base64 Ed25519 seed file. Records are unsigned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key_path: Option<PathBuf>,
    /// Base64 Ed25519 public key file used by `verify`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_key_path: Option<PathBuf>,
    #[serde(default = "default_signer_id")]
    pub signer_id: String,
}

fn default_signer_id() -> String {
    "orchestra".to_string()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            signing_key_path: None,
            verify_key_path: None,
            signer_id: default_signer_id(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events / providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

/// An HTTP endpoint serving one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    pub url: String,
    /// Client-side request timeout.
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_provider_timeout_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = OrchestraConfig::default();
        assert_eq!(config.engine.default_max_retries, 0);
        assert_eq!(config.engine.retry_base_delay_ms, 250);
        assert_eq!(config.engine.default_lock_ttl_ms, 300_000);
        assert!(config.engine.default_stage_timeout_ms.is_none());
        assert_eq!(config.cache.default_ttl_secs, 3600);
        assert!(config.cache.enabled);
        assert_eq!(config.events.capacity, 1024);
        assert_eq!(config.audit.signer_id, "orchestra");
        assert!(config.providers.is_empty());
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: OrchestraConfig = toml::from_str("").unwrap();
        assert_eq!(config, OrchestraConfig::default());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let toml_str = r#"
[engine]
default_max_retries = 2
default_stage_timeout_ms = 5000

[cache]
default_ttl_secs = 60

[providers.summarize]
url = "http://localhost:9000/summarize"
"#;
        let config: OrchestraConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.default_max_retries, 2);
        assert_eq!(config.engine.default_stage_timeout_ms, Some(5000));
        assert_eq!(config.engine.lock_poll_interval_ms, 100);
        assert_eq!(config.cache.default_ttl_secs, 60);
        assert_eq!(config.cache.max_ttl_secs, 86_400);
        let provider = &config.providers["summarize"];
        assert_eq!(provider.url, "http://localhost:9000/summarize");
        assert_eq!(provider.timeout_ms, 60_000);
    }
}
