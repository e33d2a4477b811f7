//! SQLite audit store.
//!
//! Append-only: the store exposes no update or delete, and `seq` records
//! insertion order for records that share a `logged_at`.

use orchestra_core::repository::audit::AuditStore;
use orchestra_types::audit::{AuditRecord, AuditSignature};
use orchestra_types::error::RepositoryError;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, insert_err, parse_datetime, parse_enum, parse_uuid, query_err};

/// SQLite-backed implementation of `AuditStore`.
pub struct SqliteAuditStore {
    pool: DatabasePool,
}

impl SqliteAuditStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct AuditRow {
    id: String,
    run_id: String,
    stage_id: String,
    agent_id: String,
    action: String,
    input_hash: Option<String>,
    output_hash: Option<String>,
    status: String,
    attempt: i64,
    signature: Option<String>,
    prev_hash: Option<String>,
    record_hash: String,
    logged_at: String,
}

impl AuditRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            stage_id: row.try_get("stage_id")?,
            agent_id: row.try_get("agent_id")?,
            action: row.try_get("action")?,
            input_hash: row.try_get("input_hash")?,
            output_hash: row.try_get("output_hash")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            signature: row.try_get("signature")?,
            prev_hash: row.try_get("prev_hash")?,
            record_hash: row.try_get("record_hash")?,
            logged_at: row.try_get("logged_at")?,
        })
    }

    fn into_record(self) -> Result<AuditRecord, RepositoryError> {
        let signature = self
            .signature
            .as_deref()
            .map(serde_json::from_str::<AuditSignature>)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("invalid signature JSON: {e}")))?;

        Ok(AuditRecord {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            stage_id: self.stage_id,
            agent_id: self.agent_id,
            action: parse_enum(&self.action)?,
            input_hash: self.input_hash,
            output_hash: self.output_hash,
            status: self.status,
            attempt: self.attempt.clamp(0, i64::from(u32::MAX)) as u32,
            signature,
            prev_hash: self.prev_hash,
            record_hash: self.record_hash,
            logged_at: parse_datetime(&self.logged_at)?,
        })
    }
}

fn record_from(row: &sqlx::sqlite::SqliteRow) -> Result<AuditRecord, RepositoryError> {
    AuditRow::from_row(row).map_err(query_err)?.into_record()
}

impl AuditStore for SqliteAuditStore {
    async fn append(&self, record: &AuditRecord) -> Result<(), RepositoryError> {
        let signature = record
            .signature
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO audit_records
               (id, run_id, stage_id, agent_id, action, input_hash, output_hash, status,
                attempt, signature, prev_hash, record_hash, logged_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(record.run_id.to_string())
        .bind(&record.stage_id)
        .bind(&record.agent_id)
        .bind(record.action.as_str())
        .bind(&record.input_hash)
        .bind(&record.output_hash)
        .bind(&record.status)
        .bind(i64::from(record.attempt))
        .bind(&signature)
        .bind(&record.prev_hash)
        .bind(&record.record_hash)
        .bind(format_datetime(&record.logged_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_err(e, || format!("audit record {} already exists", record.id)))?;
        Ok(())
    }

    async fn list_for_run(&self, run_id: &Uuid) -> Result<Vec<AuditRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM audit_records WHERE run_id = ? ORDER BY logged_at, seq")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        rows.iter().map(record_from).collect()
    }

    async fn last_for_run(&self, run_id: &Uuid) -> Result<Option<AuditRecord>, RepositoryError> {
        // Read through the writer: appends chain on the record just written.
        let row = sqlx::query("SELECT * FROM audit_records WHERE run_id = ? ORDER BY seq DESC LIMIT 1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;
        row.as_ref().map(record_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::test_pool;
    use chrono::{Duration, Utc};
    use orchestra_core::audit::{AuditTrail, chain_intact};
    use orchestra_types::audit::{AuditAction, AuditEntry};

    fn entry(run_id: Uuid, stage: &str, action: AuditAction, attempt: u32) -> AuditEntry {
        AuditEntry {
            run_id,
            stage_id: stage.into(),
            agent_id: "sum".into(),
            action,
            input_hash: Some("in".into()),
            output_hash: None,
            status: "error".into(),
            attempt,
        }
    }

    #[tokio::test]
    async fn trail_over_sqlite_keeps_the_chain() {
        let (pool, _dir) = test_pool().await;
        let trail = AuditTrail::new(SqliteAuditStore::new(pool));
        let run_id = Uuid::now_v7();

        trail.log(entry(run_id, "s1", AuditAction::Execute, 1)).await.unwrap();
        trail.log(entry(run_id, "s1", AuditAction::Retry, 2)).await.unwrap();
        let last = trail.log(entry(run_id, "s1", AuditAction::Fail, 3)).await.unwrap();

        let records = trail.trail(&run_id).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2], last);
        assert!(records[0].prev_hash.is_none());
        assert_eq!(records[1].prev_hash.as_deref(), Some(records[0].record_hash.as_str()));
        assert!(chain_intact(&records));

        assert!(trail.trail(&Uuid::now_v7()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ties_on_logged_at_keep_insertion_order() {
        let (pool, _dir) = test_pool().await;
        let store = SqliteAuditStore::new(pool);
        let run_id = Uuid::now_v7();
        let at = Utc::now();

        let record = |stage: &str, logged_at| AuditRecord {
            id: Uuid::now_v7(),
            run_id,
            stage_id: stage.to_string(),
            agent_id: "sum".into(),
            action: AuditAction::Execute,
            input_hash: None,
            output_hash: None,
            status: "success".into(),
            attempt: 1,
            signature: Some(AuditSignature {
                algorithm: "ed25519".into(),
                value: "c2ln".into(),
                signer: "orchestra".into(),
                timestamp: logged_at,
            }),
            prev_hash: None,
            record_hash: format!("hash-{stage}"),
            logged_at,
        };

        let late = record("late", at + Duration::milliseconds(5));
        let b = record("b", at);
        let a = record("a", at);
        for r in [&late, &b, &a] {
            store.append(r).await.unwrap();
        }

        let listed = store.list_for_run(&run_id).await.unwrap();
        assert_eq!(listed, vec![b.clone(), a.clone(), late.clone()]);
        assert_eq!(store.last_for_run(&run_id).await.unwrap(), Some(a.clone()));
        assert!(matches!(store.append(&a).await, Err(RepositoryError::Conflict(_))));
    }
}
