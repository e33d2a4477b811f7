//! Audit record storage. Append-only: there is no update or delete.

use orchestra_types::audit::AuditRecord;
use orchestra_types::error::RepositoryError;
use uuid::Uuid;

pub trait AuditStore: Send + Sync {
    fn append(
        &self,
        record: &AuditRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Records of a run ordered by `logged_at`, ties broken by insertion order.
    fn list_for_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<AuditRecord>, RepositoryError>> + Send;

    /// The most recently appended record of a run.
    fn last_for_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<AuditRecord>, RepositoryError>> + Send;
}
