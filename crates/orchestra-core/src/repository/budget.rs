//! Budget storage.

use chrono::{DateTime, Utc};
use orchestra_types::budget::{Budget, BudgetScope};
use orchestra_types::error::RepositoryError;

/// Budgets are addressed by `(scope, scope_id)`; at most one exists per pair.
pub trait BudgetStore: Send + Sync {
    /// Fails with `Conflict` if a budget already exists for the scope.
    fn create(
        &self,
        budget: &Budget,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Budget>, RepositoryError>> + Send;

    fn list(&self) -> impl std::future::Future<Output = Result<Vec<Budget>, RepositoryError>> + Send;

    /// Returns `true` if a budget was removed.
    fn delete(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Zero the spend, clear `alert_sent`, and move `period_start_at` to
    /// `new_start`, only if `period_start_at` still equals `expected_start`.
    ///
    /// Returns `false` when another caller already rolled the period over.
    fn reset_period(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        expected_start: DateTime<Utc>,
        new_start: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Atomically add to `current_spend_cents`. Returns the updated budget.
    fn add_spend(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        cost_cents: u64,
    ) -> impl std::future::Future<Output = Result<Budget, RepositoryError>> + Send;

    /// Set `alert_sent` if it is clear. Returns `true` only for the call that set it.
    fn mark_alert_sent(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
