//! SQLite storage layer.
//!
//! Port implementations backed by SQLite with WAL mode and split read/write
//! connection pools. Timestamps are stored as RFC 3339 text with a fixed
//! nanosecond fraction, so text order is time order and values round-trip
//! exactly (audit record hashes depend on that).

pub mod audit;
pub mod budget;
pub mod lock;
pub mod pool;
pub mod run;

use chrono::{DateTime, SecondsFormat, Utc};
use orchestra_core::repository::Stores;
use orchestra_core::repository::memory::MemoryKvStore;
use orchestra_types::error::RepositoryError;
use uuid::Uuid;

/// SQLite for the relational stores; the TTL cache stays in process.
pub struct SqliteStores;

impl Stores for SqliteStores {
    type Runs = run::SqliteRunRepository;
    type Locks = lock::SqliteLockStore;
    type Budgets = budget::SqliteBudgetStore;
    type Audit = audit::SqliteAuditStore;
    type Kv = MemoryKvStore;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(s).map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, RepositoryError> {
    s.parse().map_err(RepositoryError::Query)
}

pub(crate) fn parse_json(s: &str, what: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

pub(crate) fn to_json(value: &serde_json::Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

pub(crate) fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Map a unique-constraint violation to `Conflict`.
pub(crate) fn insert_err(e: sqlx::Error, what: impl FnOnce() -> String) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(what()),
        _ => query_err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_text_round_trips_and_sorts() {
        let early = DateTime::parse_from_rfc3339("2026-03-01T10:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-03-01T10:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let (a, b) = (format_datetime(&early), format_datetime(&late));
        assert_eq!(a, "2026-03-01T10:00:00.123456789Z");
        assert_eq!(b, "2026-03-01T10:00:00.500000000Z");
        assert_eq!(parse_datetime(&a).unwrap(), early);
        assert_eq!(parse_datetime(&b).unwrap(), late);
        assert!(a < b);
    }
}
