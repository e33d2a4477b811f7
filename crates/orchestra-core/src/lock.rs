//! Resource lock manager.
//!
//! Provides mutual exclusion over `(resource_type, resource_id)` keys shared
//! by stages across runs. Acquisition is one atomic store call; expiry is
//! lazy, so a holder that outlives its TTL simply stops counting.

use std::time::Duration;

use chrono::Utc;
use orchestra_types::error::RepositoryError;
use orchestra_types::lock::{
    ConflictStrategy, ContentConflictCheck, LockConflict, LockStatus, ResourceLock,
};
use thiserror::Error;
use uuid::Uuid;

use crate::repository::lock::{LockInsert, LockStore};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {0} not found")]
    NotFound(Uuid),

    #[error("lock {lock_id} is held by '{holder}', not '{requester}'")]
    Forbidden {
        lock_id: Uuid,
        holder: String,
        requester: String,
    },

    #[error("timed out after {waited_ms}ms waiting for {resource_type}/{resource_id} held by '{held_by}'")]
    WaitTimedOut {
        resource_type: String,
        resource_id: String,
        held_by: String,
        waited_ms: u64,
    },

    #[error("lock ttl must be greater than zero")]
    InvalidTtl,

    #[error("lock store error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Parameters for one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub resource_type: String,
    pub resource_id: String,
    pub owner_id: String,
    pub strategy: ConflictStrategy,
    pub ttl: Duration,
    pub content_hash: Option<String>,
}

impl LockRequest {
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        owner_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            owner_id: owner_id.into(),
            strategy: ConflictStrategy::default(),
            ttl,
            content_hash: None,
        }
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired(ResourceLock),
    Conflict(LockConflict),
}

impl LockAcquisition {
    pub fn lock(&self) -> Option<&ResourceLock> {
        match self {
            Self::Acquired(lock) => Some(lock),
            Self::Conflict(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

pub struct LockManager<S: LockStore> {
    store: S,
    poll_interval: Duration,
}

impl<S: LockStore> LockManager<S> {
    pub fn new(store: S, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Try once to take the lock. A live holder yields `Conflict`.
    pub async fn acquire(&self, request: &LockRequest) -> Result<LockAcquisition, LockError> {
        if request.ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(request.ttl).map_err(|_| LockError::InvalidTtl)?;
        let candidate = ResourceLock {
            lock_id: Uuid::now_v7(),
            resource_type: request.resource_type.clone(),
            resource_id: request.resource_id.clone(),
            owner_id: request.owner_id.clone(),
            version: 0,
            content_hash: request.content_hash.clone(),
            conflict_strategy: request.strategy,
            status: LockStatus::Active,
            acquired_at: now,
            expires_at: now + ttl,
        };

        match self.store.try_acquire(candidate, now).await? {
            LockInsert::Acquired(lock) => {
                tracing::debug!(
                    lock_id = %lock.lock_id,
                    resource_type = lock.resource_type.as_str(),
                    resource_id = lock.resource_id.as_str(),
                    owner = lock.owner_id.as_str(),
                    version = lock.version,
                    "lock acquired"
                );
                Ok(LockAcquisition::Acquired(lock))
            }
            LockInsert::Held(holder) => Ok(LockAcquisition::Conflict(LockConflict {
                resource_type: request.resource_type.clone(),
                resource_id: request.resource_id.clone(),
                strategy: request.strategy,
                requested_by: request.owner_id.clone(),
                held_by: holder.owner_id,
                holder_lock_id: holder.lock_id,
                holder_expires_at: holder.expires_at,
            })),
        }
    }

    /// Poll `acquire` until it succeeds or `max_wait` elapses.
    pub async fn acquire_waiting(
        &self,
        request: &LockRequest,
        max_wait: Duration,
    ) -> Result<ResourceLock, LockError> {
        let started = tokio::time::Instant::now();
        loop {
            let conflict = match self.acquire(request).await? {
                LockAcquisition::Acquired(lock) => return Ok(lock),
                LockAcquisition::Conflict(conflict) => conflict,
            };

            let waited = started.elapsed();
            if waited >= max_wait {
                return Err(LockError::WaitTimedOut {
                    resource_type: conflict.resource_type,
                    resource_id: conflict.resource_id,
                    held_by: conflict.held_by,
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval.min(max_wait - waited)).await;
        }
    }

    /// Release a lock held by `owner_id`.
    ///
    /// A lock that is no longer active is returned unchanged.
    pub async fn release(&self, lock_id: &Uuid, owner_id: &str) -> Result<ResourceLock, LockError> {
        let lock = self
            .store
            .get(lock_id)
            .await?
            .ok_or(LockError::NotFound(*lock_id))?;

        if lock.owner_id != owner_id {
            return Err(LockError::Forbidden {
                lock_id: *lock_id,
                holder: lock.owner_id,
                requester: owner_id.to_string(),
            });
        }
        if lock.status != LockStatus::Active {
            return Ok(lock);
        }

        self.store
            .set_status(lock_id, LockStatus::Active, LockStatus::Released)
            .await?;
        tracing::debug!(lock_id = %lock_id, owner = owner_id, "lock released");

        self.store
            .get(lock_id)
            .await?
            .ok_or(LockError::NotFound(*lock_id))
    }

    /// Compare a lock's stored content hash against `current_hash`.
    pub async fn detect_conflict(
        &self,
        lock_id: &Uuid,
        current_hash: &str,
    ) -> Result<ContentConflictCheck, LockError> {
        let lock = self
            .store
            .get(lock_id)
            .await?
            .ok_or(LockError::NotFound(*lock_id))?;
        let conflict = lock
            .content_hash
            .as_deref()
            .is_some_and(|stored| stored != current_hash);
        Ok(ContentConflictCheck {
            conflict,
            stored_hash: lock.content_hash,
            current_hash: current_hash.to_string(),
        })
    }

    /// Look up a lock, reporting an overdue `Active` lock as `Expired`.
    pub async fn get(&self, lock_id: &Uuid) -> Result<Option<ResourceLock>, LockError> {
        let now = Utc::now();
        Ok(self.store.get(lock_id).await?.map(|mut lock| {
            lock.status = lock.effective_status(now);
            lock
        }))
    }

    pub async fn active_for(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceLock>, LockError> {
        Ok(self
            .store
            .find_active(resource_type, resource_id, Utc::now())
            .await?)
    }

    pub async fn list_active(&self) -> Result<Vec<ResourceLock>, LockError> {
        Ok(self.store.list_active(Utc::now()).await?)
    }

    /// Persist expiry for every overdue lock. Returns how many changed.
    pub async fn sweep_expired(&self) -> Result<u64, LockError> {
        let expired = self.store.expire_stale(Utc::now()).await?;
        if expired > 0 {
            tracing::debug!(expired, "swept expired locks");
        }
        Ok(expired)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryLockStore;
    use std::sync::Arc;

    fn manager() -> LockManager<MemoryLockStore> {
        LockManager::new(MemoryLockStore::new(), Duration::from_millis(5))
    }

    fn request(owner: &str) -> LockRequest {
        LockRequest::new("document", "doc-1", owner, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn second_acquirer_sees_conflict() {
        let locks = manager();
        let first = locks.acquire(&request("run-a:s1")).await.unwrap();
        let lock = first.lock().unwrap().clone();
        assert_eq!(lock.version, 1);

        let second = locks
            .acquire(&request("run-b:s1").with_strategy(ConflictStrategy::Merge))
            .await
            .unwrap();
        match second {
            LockAcquisition::Conflict(conflict) => {
                assert_eq!(conflict.held_by, "run-a:s1");
                assert_eq!(conflict.requested_by, "run-b:s1");
                assert_eq!(conflict.strategy, ConflictStrategy::Merge);
                assert_eq!(conflict.holder_lock_id, lock.lock_id);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_acquirers_get_exactly_one_lock() {
        let locks = Arc::new(manager());
        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = Arc::clone(&locks);
            handles.push(tokio::spawn(async move {
                locks.acquire(&request(&format!("owner-{i}"))).await.unwrap()
            }));
        }
        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().lock().is_some() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn expired_lock_is_replaced_with_next_version() {
        let locks = manager();
        let mut short = request("a");
        short.ttl = Duration::from_millis(10);
        let first = locks.acquire(&short).await.unwrap().lock().unwrap().clone();

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(
            locks.get(&first.lock_id).await.unwrap().unwrap().status,
            LockStatus::Expired
        );

        let second = locks.acquire(&request("b")).await.unwrap();
        assert_eq!(second.lock().unwrap().version, 2);
    }

    #[tokio::test]
    async fn release_checks_owner() {
        let locks = manager();
        let lock = locks
            .acquire(&request("owner"))
            .await
            .unwrap()
            .lock()
            .unwrap()
            .clone();

        let err = locks.release(&lock.lock_id, "intruder").await.unwrap_err();
        assert!(matches!(err, LockError::Forbidden { .. }));

        let released = locks.release(&lock.lock_id, "owner").await.unwrap();
        assert_eq!(released.status, LockStatus::Released);
        // Idempotent.
        let again = locks.release(&lock.lock_id, "owner").await.unwrap();
        assert_eq!(again.status, LockStatus::Released);

        assert!(locks.acquire(&request("next")).await.unwrap().lock().is_some());

        let missing = locks.release(&Uuid::now_v7(), "owner").await.unwrap_err();
        assert!(matches!(missing, LockError::NotFound(_)));
    }

    #[tokio::test]
    async fn acquire_waiting_gets_lock_after_release() {
        let locks = Arc::new(manager());
        let held = locks
            .acquire(&request("first"))
            .await
            .unwrap()
            .lock()
            .unwrap()
            .clone();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .acquire_waiting(&request("second"), Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release(&held.lock_id, "first").await.unwrap();

        let lock = waiter.await.unwrap().unwrap();
        assert_eq!(lock.owner_id, "second");
    }

    #[tokio::test]
    async fn acquire_waiting_times_out() {
        let locks = manager();
        locks.acquire(&request("first")).await.unwrap();
        let err = locks
            .acquire_waiting(&request("second"), Duration::from_millis(20))
            .await
            .unwrap_err();
        match err {
            LockError::WaitTimedOut { held_by, .. } => assert_eq!(held_by, "first"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn detect_conflict_compares_hashes() {
        let locks = manager();
        let with_hash = locks
            .acquire(&request("a").with_content_hash("abc"))
            .await
            .unwrap()
            .lock()
            .unwrap()
            .clone();

        let same = locks.detect_conflict(&with_hash.lock_id, "abc").await.unwrap();
        assert!(!same.conflict);
        let changed = locks.detect_conflict(&with_hash.lock_id, "def").await.unwrap();
        assert!(changed.conflict);
        assert_eq!(changed.stored_hash.as_deref(), Some("abc"));
        assert_eq!(changed.current_hash, "def");

        let mut other = request("b");
        other.resource_id = "doc-2".to_string();
        let no_hash = locks.acquire(&other).await.unwrap().lock().unwrap().clone();
        assert!(!locks.detect_conflict(&no_hash.lock_id, "x").await.unwrap().conflict);
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let locks = manager();
        let mut req = request("a");
        req.ttl = Duration::ZERO;
        assert!(matches!(locks.acquire(&req).await.unwrap_err(), LockError::InvalidTtl));
    }

    #[tokio::test]
    async fn sweep_persists_expiry() {
        let locks = manager();
        let mut short = request("a");
        short.ttl = Duration::from_millis(5);
        locks.acquire(&short).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(locks.sweep_expired().await.unwrap(), 1);
        assert!(locks.list_active().await.unwrap().is_empty());
        assert!(locks.active_for("document", "doc-1").await.unwrap().is_none());
    }
}
