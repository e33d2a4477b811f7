//! Resource lock storage.

use chrono::{DateTime, Utc};
use orchestra_types::error::RepositoryError;
use orchestra_types::lock::{LockStatus, ResourceLock};
use uuid::Uuid;

/// Outcome of an atomic acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockInsert {
    /// The lock was stored, with its `version` assigned by the store.
    Acquired(ResourceLock),
    /// Another live lock holds the resource.
    Held(ResourceLock),
}

pub trait LockStore: Send + Sync {
    /// In one atomic step: mark any `Active` lock on the same resource that
    /// is past `expires_at` as `Expired`, then insert `lock` unless a live
    /// `Active` lock remains.
    ///
    /// The stored version is one greater than the last lock on the resource.
    fn try_acquire(
        &self,
        lock: ResourceLock,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<LockInsert, RepositoryError>> + Send;

    fn get(
        &self,
        lock_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ResourceLock>, RepositoryError>> + Send;

    /// The live lock on a resource, if any.
    fn find_active(
        &self,
        resource_type: &str,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<ResourceLock>, RepositoryError>> + Send;

    /// Compare-and-set the status. Returns `true` when the stored status was
    /// `from` and is now `to`.
    fn set_status(
        &self,
        lock_id: &Uuid,
        from: LockStatus,
        to: LockStatus,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Mark every `Active` lock past `expires_at` as `Expired`. Returns the count.
    fn expire_stale(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    fn list_active(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<ResourceLock>, RepositoryError>> + Send;
}
