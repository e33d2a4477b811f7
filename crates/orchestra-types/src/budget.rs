//! Spend budget types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Agent,
    Workflow,
    Team,
}

impl BudgetScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Workflow => "workflow",
            Self::Team => "team",
        }
    }
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BudgetScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "workflow" => Ok(Self::Workflow),
            "team" => Ok(Self::Team),
            other => Err(format!("invalid budget scope: '{other}'")),
        }
    }
}

/// How the engine reacts when a check would exceed the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    /// Suspend the run before the next level.
    Pause,
    /// Proceed but emit a signal.
    Notify,
    /// Fail the run immediately.
    Kill,
}

impl BudgetAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Notify => "notify",
            Self::Kill => "kill",
        }
    }
}

impl fmt::Display for BudgetAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BudgetAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(Self::Pause),
            "notify" => Ok(Self::Notify),
            "kill" => Ok(Self::Kill),
            other => Err(format!("invalid budget action: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
    /// Never rolls over.
    Total,
}

impl BudgetPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Total => "total",
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BudgetPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "total" => Ok(Self::Total),
            other => Err(format!("invalid budget period: '{other}'")),
        }
    }
}

/// A spend cap for one `(scope, scope_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub budget_uuid: Uuid,
    pub scope: BudgetScope,
    pub scope_id: String,
    pub max_cost_cents: u64,
    pub current_spend_cents: u64,
    /// Percentage of `max_cost_cents` at which a one-time alert fires.
    pub alert_threshold_percent: u8,
    pub action_at_limit: BudgetAction,
    pub period: BudgetPeriod,
    pub period_start_at: DateTime<Utc>,
    pub alert_sent: bool,
}

impl Budget {
    pub fn new(
        scope: BudgetScope,
        scope_id: impl Into<String>,
        max_cost_cents: u64,
        action_at_limit: BudgetAction,
        period: BudgetPeriod,
    ) -> Self {
        Self {
            budget_uuid: Uuid::now_v7(),
            scope,
            scope_id: scope_id.into(),
            max_cost_cents,
            current_spend_cents: 0,
            alert_threshold_percent: 80,
            action_at_limit,
            period,
            period_start_at: Utc::now(),
            alert_sent: false,
        }
    }

    pub fn with_alert_threshold(mut self, percent: u8) -> Self {
        self.alert_threshold_percent = percent;
        self
    }

    /// Usage as a percentage of the cap if `additional` were spent now.
    pub fn usage_percent_with(&self, additional: u64) -> f64 {
        let projected = self.current_spend_cents.saturating_add(additional);
        if self.max_cost_cents == 0 {
            return if projected == 0 { 0.0 } else { f64::INFINITY };
        }
        projected as f64 / self.max_cost_cents as f64 * 100.0
    }
}

/// Answer to a pre-dispatch budget check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub current_spend_cents: u64,
    pub max_cost_cents: u64,
    pub usage_percent: f64,
    /// The budget's configured reaction, present when a budget exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<BudgetAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BudgetCheck {
    /// No budget is configured for the scope.
    pub fn unbounded() -> Self {
        Self {
            allowed: true,
            current_spend_cents: 0,
            max_cost_cents: 0,
            usage_percent: 0.0,
            action: None,
            reason: None,
        }
    }
}

/// Result of recording spend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendOutcome {
    pub budget: Budget,
    /// True only for the call that first crossed the alert threshold this period.
    pub alert_triggered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_percent_includes_additional_cost() {
        let mut budget = Budget::new(
            BudgetScope::Workflow,
            "digest",
            1000,
            BudgetAction::Kill,
            BudgetPeriod::Total,
        );
        budget.current_spend_cents = 900;
        assert_eq!(budget.usage_percent_with(150), 105.0);
        assert_eq!(budget.usage_percent_with(0), 90.0);
    }

    #[test]
    fn usage_percent_saturates_on_huge_estimate() {
        let mut budget = Budget::new(
            BudgetScope::Workflow,
            "digest",
            1000,
            BudgetAction::Kill,
            BudgetPeriod::Total,
        );
        budget.current_spend_cents = 900;
        let percent = budget.usage_percent_with(u64::MAX);
        assert!(percent > 100.0);
        assert!(percent.is_finite());
    }

    #[test]
    fn zero_cap_budget() {
        let budget = Budget::new(
            BudgetScope::Team,
            "core",
            0,
            BudgetAction::Pause,
            BudgetPeriod::Daily,
        );
        assert_eq!(budget.usage_percent_with(0), 0.0);
        assert!(budget.usage_percent_with(1).is_infinite());
    }

    #[test]
    fn enums_parse_from_wire_names() {
        assert_eq!("team".parse::<BudgetScope>().unwrap(), BudgetScope::Team);
        assert_eq!("notify".parse::<BudgetAction>().unwrap(), BudgetAction::Notify);
        assert_eq!("monthly".parse::<BudgetPeriod>().unwrap(), BudgetPeriod::Monthly);
        assert!("yearly".parse::<BudgetPeriod>().is_err());
    }
}
