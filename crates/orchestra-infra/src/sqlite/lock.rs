//! SQLite resource lock store.
//!
//! Released and expired rows stay in the table as history; a partial unique
//! index keeps at most one `active` row per resource.

use chrono::{DateTime, Utc};
use orchestra_core::repository::lock::{LockInsert, LockStore};
use orchestra_types::error::RepositoryError;
use orchestra_types::lock::{LockStatus, ResourceLock};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, insert_err, parse_datetime, parse_enum, parse_uuid, query_err};

/// SQLite-backed implementation of `LockStore`.
pub struct SqliteLockStore {
    pool: DatabasePool,
}

impl SqliteLockStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct LockRow {
    lock_id: String,
    resource_type: String,
    resource_id: String,
    owner_id: String,
    version: i64,
    content_hash: Option<String>,
    conflict_strategy: String,
    status: String,
    acquired_at: String,
    expires_at: String,
}

impl LockRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            lock_id: row.try_get("lock_id")?,
            resource_type: row.try_get("resource_type")?,
            resource_id: row.try_get("resource_id")?,
            owner_id: row.try_get("owner_id")?,
            version: row.try_get("version")?,
            content_hash: row.try_get("content_hash")?,
            conflict_strategy: row.try_get("conflict_strategy")?,
            status: row.try_get("status")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn into_lock(self) -> Result<ResourceLock, RepositoryError> {
        Ok(ResourceLock {
            lock_id: parse_uuid(&self.lock_id)?,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            owner_id: self.owner_id,
            version: self.version.max(0) as u64,
            content_hash: self.content_hash,
            conflict_strategy: parse_enum(&self.conflict_strategy)?,
            status: parse_enum(&self.status)?,
            acquired_at: parse_datetime(&self.acquired_at)?,
            expires_at: parse_datetime(&self.expires_at)?,
        })
    }
}

fn lock_from(row: &sqlx::sqlite::SqliteRow) -> Result<ResourceLock, RepositoryError> {
    LockRow::from_row(row).map_err(query_err)?.into_lock()
}

impl LockStore for SqliteLockStore {
    async fn try_acquire(
        &self,
        lock: ResourceLock,
        now: DateTime<Utc>,
    ) -> Result<LockInsert, RepositoryError> {
        let now_text = format_datetime(&now);
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(
            r#"UPDATE resource_locks SET status = 'expired'
               WHERE resource_type = ? AND resource_id = ? AND status = 'active' AND expires_at <= ?"#,
        )
        .bind(&lock.resource_type)
        .bind(&lock.resource_id)
        .bind(&now_text)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        let holder = sqlx::query(
            "SELECT * FROM resource_locks WHERE resource_type = ? AND resource_id = ? AND status = 'active'",
        )
        .bind(&lock.resource_type)
        .bind(&lock.resource_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_err)?;

        if let Some(row) = holder {
            let held = lock_from(&row)?;
            tx.commit().await.map_err(query_err)?;
            return Ok(LockInsert::Held(held));
        }

        let last_version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM resource_locks WHERE resource_type = ? AND resource_id = ?",
        )
        .bind(&lock.resource_type)
        .bind(&lock.resource_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_err)?;

        let stored = ResourceLock {
            version: last_version.max(0) as u64 + 1,
            status: LockStatus::Active,
            ..lock
        };

        sqlx::query(
            r#"INSERT INTO resource_locks
               (lock_id, resource_type, resource_id, owner_id, version, content_hash,
                conflict_strategy, status, acquired_at, expires_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(stored.lock_id.to_string())
        .bind(&stored.resource_type)
        .bind(&stored.resource_id)
        .bind(&stored.owner_id)
        .bind(stored.version as i64)
        .bind(&stored.content_hash)
        .bind(stored.conflict_strategy.as_str())
        .bind(stored.status.as_str())
        .bind(format_datetime(&stored.acquired_at))
        .bind(format_datetime(&stored.expires_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            insert_err(e, || {
                format!(
                    "resource {}/{} was locked concurrently",
                    stored.resource_type, stored.resource_id
                )
            })
        })?;

        tx.commit().await.map_err(query_err)?;
        Ok(LockInsert::Acquired(stored))
    }

    async fn get(&self, lock_id: &Uuid) -> Result<Option<ResourceLock>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM resource_locks WHERE lock_id = ?")
            .bind(lock_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.as_ref().map(lock_from).transpose()
    }

    async fn find_active(
        &self,
        resource_type: &str,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ResourceLock>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT * FROM resource_locks
               WHERE resource_type = ? AND resource_id = ? AND status = 'active' AND expires_at > ?"#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .bind(format_datetime(&now))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;
        row.as_ref().map(lock_from).transpose()
    }

    async fn set_status(
        &self,
        lock_id: &Uuid,
        from: LockStatus,
        to: LockStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE resource_locks SET status = ? WHERE lock_id = ? AND status = ?")
            .bind(to.as_str())
            .bind(lock_id.to_string())
            .bind(from.as_str())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE resource_locks SET status = 'expired' WHERE status = 'active' AND expires_at <= ?",
        )
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<ResourceLock>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM resource_locks
               WHERE status = 'active' AND expires_at > ?
               ORDER BY resource_type, resource_id"#,
        )
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        rows.iter().map(lock_from).collect()
    }
}
