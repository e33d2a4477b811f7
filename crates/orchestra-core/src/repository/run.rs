//! Workflow run and stage execution storage.

use orchestra_types::error::RepositoryError;
use orchestra_types::workflow::{RunTransition, StageExecution, WorkflowRun};
use uuid::Uuid;

/// Persistence for `WorkflowRun` and its `StageExecution` rows.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Apply a status transition as a compare-and-set on the current status.
    ///
    /// Sets `started_at` on first entry to `InProgress` and `completed_at`
    /// on entry to a terminal status. Fails with `NotFound` for an unknown
    /// run and `Conflict` when the transition is not allowed from the
    /// stored status. Returns the updated run.
    fn transition_run(
        &self,
        run_id: &Uuid,
        transition: &RunTransition,
    ) -> impl std::future::Future<Output = Result<WorkflowRun, RepositoryError>> + Send;

    /// Most recent runs first.
    fn list_runs(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Stage executions
    // -----------------------------------------------------------------------

    /// Upsert by `(run_id, stage_id)`.
    fn save_stage(
        &self,
        stage: &StageExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Stage executions of a run in creation order.
    fn list_stages(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StageExecution>, RepositoryError>> + Send;
}
