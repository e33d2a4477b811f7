//! Budget enforcement.
//!
//! A budget caps the cost a scope (agent, workflow, or team) may spend per
//! period. The enforcer answers pre-dispatch checks, records actual spend,
//! and rolls periods over lazily whenever a budget is read.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use orchestra_types::budget::{Budget, BudgetCheck, BudgetPeriod, BudgetScope, SpendOutcome};
use orchestra_types::error::RepositoryError;
use thiserror::Error;

use crate::repository::budget::BudgetStore;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("a budget already exists for {scope}:{scope_id}")]
    AlreadyExists { scope: BudgetScope, scope_id: String },

    #[error("invalid budget: {0}")]
    Invalid(String),

    #[error("budget store error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Start of the next period if `start` has rolled over by `now`.
///
/// Daily and weekly periods restart at `now`; monthly periods restart at
/// the first instant of the current calendar month.
pub fn rollover_start(
    period: BudgetPeriod,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match period {
        BudgetPeriod::Total => None,
        BudgetPeriod::Daily => (now - start >= chrono::Duration::days(1)).then_some(now),
        BudgetPeriod::Weekly => (now - start >= chrono::Duration::weeks(1)).then_some(now),
        BudgetPeriod::Monthly => {
            let rolled = now > start && (now.year(), now.month()) != (start.year(), start.month());
            if !rolled {
                return None;
            }
            Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single()
        }
    }
}

pub struct BudgetEnforcer<S: BudgetStore> {
    store: S,
}

impl<S: BudgetStore> BudgetEnforcer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn create_budget(&self, budget: Budget) -> Result<Budget, BudgetError> {
        if budget.scope_id.trim().is_empty() {
            return Err(BudgetError::Invalid("scope id must not be empty".to_string()));
        }
        if budget.alert_threshold_percent > 100 {
            return Err(BudgetError::Invalid(format!(
                "alert threshold {}% exceeds 100%",
                budget.alert_threshold_percent
            )));
        }
        match self.store.create(&budget).await {
            Ok(()) => Ok(budget),
            Err(RepositoryError::Conflict(_)) => Err(BudgetError::AlreadyExists {
                scope: budget.scope,
                scope_id: budget.scope_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// The budget for a scope with any due period rollover applied.
    pub async fn get_budget(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> Result<Option<Budget>, BudgetError> {
        let Some(budget) = self.store.get(scope, scope_id).await? else {
            return Ok(None);
        };
        let Some(new_start) = rollover_start(budget.period, budget.period_start_at, Utc::now())
        else {
            return Ok(Some(budget));
        };

        let reset = self
            .store
            .reset_period(scope, scope_id, budget.period_start_at, new_start)
            .await?;
        if reset {
            tracing::info!(
                scope = %scope,
                scope_id,
                period = %budget.period,
                spent = budget.current_spend_cents,
                "budget period rolled over"
            );
        }
        // Re-read either way: a concurrent caller may have reset it first.
        Ok(self.store.get(scope, scope_id).await?)
    }

    pub async fn list_budgets(&self) -> Result<Vec<Budget>, BudgetError> {
        Ok(self.store.list().await?)
    }

    pub async fn delete_budget(&self, scope: BudgetScope, scope_id: &str) -> Result<bool, BudgetError> {
        Ok(self.store.delete(scope, scope_id).await?)
    }

    /// Would spending `additional` more stay within the cap?
    ///
    /// A scope without a budget is always allowed.
    pub async fn check(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        additional: u64,
    ) -> Result<BudgetCheck, BudgetError> {
        let Some(budget) = self.get_budget(scope, scope_id).await? else {
            return Ok(BudgetCheck::unbounded());
        };

        let projected = budget.current_spend_cents.saturating_add(additional);
        let usage_percent = budget.usage_percent_with(additional);
        let allowed = projected <= budget.max_cost_cents;
        let reason = (!allowed).then(|| {
            format!(
                "{scope}:{scope_id} would spend {projected} of {} cents ({usage_percent:.1}%)",
                budget.max_cost_cents
            )
        });

        Ok(BudgetCheck {
            allowed,
            current_spend_cents: budget.current_spend_cents,
            max_cost_cents: budget.max_cost_cents,
            usage_percent,
            action: Some(budget.action_at_limit),
            reason,
        })
    }

    /// Add actual spend. Returns `None` when the scope has no budget.
    ///
    /// `alert_triggered` is true for exactly one call per period: the one
    /// that wins the compare-and-set on `alert_sent` after usage reaches the
    /// alert threshold.
    pub async fn record_spend(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        cost_cents: u64,
    ) -> Result<Option<SpendOutcome>, BudgetError> {
        if self.get_budget(scope, scope_id).await?.is_none() {
            return Ok(None);
        }

        let mut budget = self.store.add_spend(scope, scope_id, cost_cents).await?;
        let over_threshold =
            budget.usage_percent_with(0) >= f64::from(budget.alert_threshold_percent);

        let alert_triggered = over_threshold
            && !budget.alert_sent
            && self.store.mark_alert_sent(scope, scope_id).await?;
        if alert_triggered {
            budget.alert_sent = true;
            tracing::warn!(
                scope = %scope,
                scope_id,
                spent = budget.current_spend_cents,
                max = budget.max_cost_cents,
                threshold = budget.alert_threshold_percent,
                "budget alert threshold reached"
            );
        }

        Ok(Some(SpendOutcome {
            budget,
            alert_triggered,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryBudgetStore;
    use orchestra_types::budget::BudgetAction;
    use std::sync::Arc;

    fn enforcer() -> BudgetEnforcer<MemoryBudgetStore> {
        BudgetEnforcer::new(MemoryBudgetStore::new())
    }

    fn workflow_budget(max: u64, period: BudgetPeriod) -> Budget {
        Budget::new(BudgetScope::Workflow, "digest", max, BudgetAction::Kill, period)
    }

    #[tokio::test]
    async fn check_over_cap_reports_usage() {
        let budgets = enforcer();
        budgets
            .create_budget(workflow_budget(1000, BudgetPeriod::Total))
            .await
            .unwrap();
        budgets
            .record_spend(BudgetScope::Workflow, "digest", 900)
            .await
            .unwrap();

        let check = budgets.check(BudgetScope::Workflow, "digest", 150).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.usage_percent, 105.0);
        assert_eq!(check.current_spend_cents, 900);
        assert_eq!(check.action, Some(BudgetAction::Kill));
        assert!(check.reason.unwrap().contains("1050 of 1000"));

        let exact = budgets.check(BudgetScope::Workflow, "digest", 100).await.unwrap();
        assert!(exact.allowed);
        assert_eq!(exact.usage_percent, 100.0);
    }

    #[tokio::test]
    async fn huge_estimate_is_refused_not_overflowed() {
        let budgets = enforcer();
        budgets
            .create_budget(workflow_budget(1000, BudgetPeriod::Total))
            .await
            .unwrap();
        budgets
            .record_spend(BudgetScope::Workflow, "digest", 900)
            .await
            .unwrap();

        let check = budgets
            .check(BudgetScope::Workflow, "digest", u64::MAX)
            .await
            .unwrap();
        assert!(!check.allowed);
        assert!(check.usage_percent > 100.0);
        assert_eq!(check.action, Some(BudgetAction::Kill));
    }

    #[tokio::test]
    async fn missing_budget_is_unbounded() {
        let budgets = enforcer();
        let check = budgets.check(BudgetScope::Agent, "nobody", 1_000_000).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.action, None);
        assert!(budgets
            .record_spend(BudgetScope::Agent, "nobody", 5)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_and_invalid_budgets_are_rejected() {
        let budgets = enforcer();
        budgets
            .create_budget(workflow_budget(10, BudgetPeriod::Total))
            .await
            .unwrap();
        let dup = budgets
            .create_budget(workflow_budget(20, BudgetPeriod::Total))
            .await
            .unwrap_err();
        assert!(matches!(dup, BudgetError::AlreadyExists { .. }));

        let bad = budgets
            .create_budget(
                Budget::new(BudgetScope::Team, "t", 10, BudgetAction::Pause, BudgetPeriod::Total)
                    .with_alert_threshold(150),
            )
            .await
            .unwrap_err();
        assert!(matches!(bad, BudgetError::Invalid(_)));
    }

    #[tokio::test]
    async fn alert_fires_once_per_period() {
        let budgets = enforcer();
        budgets
            .create_budget(workflow_budget(100, BudgetPeriod::Total).with_alert_threshold(50))
            .await
            .unwrap();

        let first = budgets.record_spend(BudgetScope::Workflow, "digest", 40).await.unwrap().unwrap();
        assert!(!first.alert_triggered);
        let second = budgets.record_spend(BudgetScope::Workflow, "digest", 20).await.unwrap().unwrap();
        assert!(second.alert_triggered);
        assert!(second.budget.alert_sent);
        let third = budgets.record_spend(BudgetScope::Workflow, "digest", 20).await.unwrap().unwrap();
        assert!(!third.alert_triggered);
        assert_eq!(third.budget.current_spend_cents, 80);
    }

    #[tokio::test]
    async fn concurrent_spend_is_not_lost_and_alerts_once() {
        let budgets = Arc::new(enforcer());
        budgets
            .create_budget(workflow_budget(1000, BudgetPeriod::Total))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let budgets = Arc::clone(&budgets);
            handles.push(tokio::spawn(async move {
                budgets
                    .record_spend(BudgetScope::Workflow, "digest", 50)
                    .await
                    .unwrap()
                    .unwrap()
                    .alert_triggered
            }));
        }
        let mut alerts = 0;
        for handle in handles {
            if handle.await.unwrap() {
                alerts += 1;
            }
        }
        assert_eq!(alerts, 1);

        let budget = budgets
            .get_budget(BudgetScope::Workflow, "digest")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(budget.current_spend_cents, 1000);
    }

    #[tokio::test]
    async fn monthly_budget_rolls_over_to_first_of_month() {
        let budgets = enforcer();
        let mut budget = workflow_budget(100, BudgetPeriod::Monthly);
        budget.period_start_at = Utc::now() - chrono::Duration::days(40);
        budget.current_spend_cents = 90;
        budget.alert_sent = true;
        budgets.create_budget(budget).await.unwrap();

        let check = budgets.check(BudgetScope::Workflow, "digest", 50).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.current_spend_cents, 0);

        let rolled = budgets
            .get_budget(BudgetScope::Workflow, "digest")
            .await
            .unwrap()
            .unwrap();
        let now = Utc::now();
        assert!(!rolled.alert_sent);
        assert_eq!(rolled.period_start_at.day(), 1);
        assert_eq!(rolled.period_start_at.month(), now.month());
        assert_eq!(rolled.period_start_at.year(), now.year());
    }

    #[test]
    fn rollover_rules() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();

        let same_month = Utc.with_ymd_and_hms(2026, 1, 31, 23, 0, 0).unwrap();
        assert_eq!(rollover_start(BudgetPeriod::Monthly, start, same_month), None);

        let next_month = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 1).unwrap();
        assert_eq!(
            rollover_start(BudgetPeriod::Monthly, start, next_month),
            Some(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap())
        );

        let next_year = Utc.with_ymd_and_hms(2027, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(
            rollover_start(BudgetPeriod::Monthly, start, next_year),
            Some(Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap())
        );

        let day_later = start + chrono::Duration::hours(24);
        assert_eq!(rollover_start(BudgetPeriod::Daily, start, day_later), Some(day_later));
        assert_eq!(
            rollover_start(BudgetPeriod::Daily, start, start + chrono::Duration::hours(23)),
            None
        );
        assert_eq!(
            rollover_start(BudgetPeriod::Weekly, start, start + chrono::Duration::days(6)),
            None
        );
        assert_eq!(rollover_start(BudgetPeriod::Total, start, next_year), None);
    }
}
