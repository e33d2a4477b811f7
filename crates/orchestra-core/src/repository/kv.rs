//! Key-value store with per-key TTL.

use std::time::Duration;

use orchestra_types::error::RepositoryError;

/// Key-value storage backing the result cache.
///
/// Expired keys behave as absent for every operation.
pub trait KvStore: Send + Sync {
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<serde_json::Value>, RepositoryError>> + Send;

    /// Upsert with an absolute expiry of now + `ttl`.
    fn set_with_ttl(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Atomically increment an integer key, creating it at 1. A new key
    /// takes `ttl`; an existing key keeps its expiry.
    fn incr(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<i64, RepositoryError>> + Send;

    /// Returns `true` if the key existed.
    fn delete(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Live keys starting with `prefix`.
    fn scan_prefix(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RepositoryError>> + Send;
}
