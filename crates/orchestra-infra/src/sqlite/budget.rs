//! SQLite budget store.

use chrono::{DateTime, Utc};
use orchestra_core::repository::budget::BudgetStore;
use orchestra_types::budget::{Budget, BudgetScope};
use orchestra_types::error::RepositoryError;
use sqlx::Row;

use super::pool::DatabasePool;
use super::{format_datetime, insert_err, parse_datetime, parse_enum, parse_uuid, query_err};

/// SQLite-backed implementation of `BudgetStore`.
pub struct SqliteBudgetStore {
    pool: DatabasePool,
}

impl SqliteBudgetStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct BudgetRow {
    budget_uuid: String,
    scope: String,
    scope_id: String,
    max_cost_cents: i64,
    current_spend_cents: i64,
    alert_threshold_percent: i64,
    action_at_limit: String,
    period: String,
    period_start_at: String,
    alert_sent: bool,
}

impl BudgetRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            budget_uuid: row.try_get("budget_uuid")?,
            scope: row.try_get("scope")?,
            scope_id: row.try_get("scope_id")?,
            max_cost_cents: row.try_get("max_cost_cents")?,
            current_spend_cents: row.try_get("current_spend_cents")?,
            alert_threshold_percent: row.try_get("alert_threshold_percent")?,
            action_at_limit: row.try_get("action_at_limit")?,
            period: row.try_get("period")?,
            period_start_at: row.try_get("period_start_at")?,
            alert_sent: row.try_get("alert_sent")?,
        })
    }

    fn into_budget(self) -> Result<Budget, RepositoryError> {
        Ok(Budget {
            budget_uuid: parse_uuid(&self.budget_uuid)?,
            scope: parse_enum(&self.scope)?,
            scope_id: self.scope_id,
            max_cost_cents: self.max_cost_cents.max(0) as u64,
            current_spend_cents: self.current_spend_cents.max(0) as u64,
            alert_threshold_percent: self.alert_threshold_percent.clamp(0, 100) as u8,
            action_at_limit: parse_enum(&self.action_at_limit)?,
            period: parse_enum(&self.period)?,
            period_start_at: parse_datetime(&self.period_start_at)?,
            alert_sent: self.alert_sent,
        })
    }
}

fn budget_from(row: &sqlx::sqlite::SqliteRow) -> Result<Budget, RepositoryError> {
    BudgetRow::from_row(row).map_err(query_err)?.into_budget()
}

/// Cents are stored as SQLite INTEGER; values past `i64::MAX` saturate.
fn cents(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl BudgetStore for SqliteBudgetStore {
    async fn create(&self, budget: &Budget) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO budgets
               (budget_uuid, scope, scope_id, max_cost_cents, current_spend_cents,
                alert_threshold_percent, action_at_limit, period, period_start_at, alert_sent)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(budget.budget_uuid.to_string())
        .bind(budget.scope.as_str())
        .bind(&budget.scope_id)
        .bind(cents(budget.max_cost_cents))
        .bind(cents(budget.current_spend_cents))
        .bind(i64::from(budget.alert_threshold_percent))
        .bind(budget.action_at_limit.as_str())
        .bind(budget.period.as_str())
        .bind(format_datetime(&budget.period_start_at))
        .bind(budget.alert_sent)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            insert_err(e, || {
                format!("budget for {}:{} already exists", budget.scope, budget.scope_id)
            })
        })?;
        Ok(())
    }

    async fn get(&self, scope: BudgetScope, scope_id: &str) -> Result<Option<Budget>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM budgets WHERE scope = ? AND scope_id = ?")
            .bind(scope.as_str())
            .bind(scope_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.as_ref().map(budget_from).transpose()
    }

    async fn list(&self) -> Result<Vec<Budget>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM budgets ORDER BY scope, scope_id")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        rows.iter().map(budget_from).collect()
    }

    async fn delete(&self, scope: BudgetScope, scope_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM budgets WHERE scope = ? AND scope_id = ?")
            .bind(scope.as_str())
            .bind(scope_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_period(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        expected_start: DateTime<Utc>,
        new_start: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE budgets
               SET current_spend_cents = 0, alert_sent = 0, period_start_at = ?
               WHERE scope = ? AND scope_id = ? AND period_start_at = ?"#,
        )
        .bind(format_datetime(&new_start))
        .bind(scope.as_str())
        .bind(scope_id)
        .bind(format_datetime(&expected_start))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn add_spend(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        cost_cents: u64,
    ) -> Result<Budget, RepositoryError> {
        let row = sqlx::query(
            r#"UPDATE budgets SET current_spend_cents = current_spend_cents + ?
               WHERE scope = ? AND scope_id = ?
               RETURNING *"#,
        )
        .bind(cents(cost_cents))
        .bind(scope.as_str())
        .bind(scope_id)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => budget_from(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn mark_alert_sent(&self, scope: BudgetScope, scope_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE budgets SET alert_sent = 1 WHERE scope = ? AND scope_id = ? AND alert_sent = 0",
        )
        .bind(scope.as_str())
        .bind(scope_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() == 1)
    }
}
