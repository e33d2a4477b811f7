//! CLI budget management subcommands.

use anyhow::{Result, bail};
use clap::{Subcommand, ValueEnum};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use orchestra_types::budget::{Budget, BudgetAction, BudgetPeriod, BudgetScope};
use serde_json::json;

use crate::state::AppState;

#[derive(Clone, Copy, ValueEnum)]
pub enum ScopeArg {
    Agent,
    Workflow,
    Team,
}

impl From<ScopeArg> for BudgetScope {
    fn from(s: ScopeArg) -> Self {
        match s {
            ScopeArg::Agent => BudgetScope::Agent,
            ScopeArg::Workflow => BudgetScope::Workflow,
            ScopeArg::Team => BudgetScope::Team,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ActionArg {
    Pause,
    Notify,
    Kill,
}

impl From<ActionArg> for BudgetAction {
    fn from(a: ActionArg) -> Self {
        match a {
            ActionArg::Pause => BudgetAction::Pause,
            ActionArg::Notify => BudgetAction::Notify,
            ActionArg::Kill => BudgetAction::Kill,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum PeriodArg {
    Daily,
    Weekly,
    Monthly,
    Total,
}

impl From<PeriodArg> for BudgetPeriod {
    fn from(p: PeriodArg) -> Self {
        match p {
            PeriodArg::Daily => BudgetPeriod::Daily,
            PeriodArg::Weekly => BudgetPeriod::Weekly,
            PeriodArg::Monthly => BudgetPeriod::Monthly,
            PeriodArg::Total => BudgetPeriod::Total,
        }
    }
}

#[derive(Subcommand)]
pub enum BudgetCommand {
    /// Create a budget, or replace it with `--replace`.
    Set {
        scope: ScopeArg,
        /// Agent id, workflow name, or team id.
        scope_id: String,
        /// Spend cap in cents.
        max_cents: u64,

        /// What the engine does once a stage would exceed the cap.
        #[arg(long, value_enum, default_value = "kill")]
        action: ActionArg,

        #[arg(long, value_enum, default_value = "monthly")]
        period: PeriodArg,

        /// Percent of the cap at which a one-time alert fires.
        #[arg(long, default_value = "80", value_parser = clap::value_parser!(u8).range(1..=100))]
        alert_threshold: u8,

        /// Replace an existing budget (spend starts from zero).
        #[arg(long)]
        replace: bool,
    },

    /// Show one budget, or all of them.
    Show {
        scope: Option<ScopeArg>,
        scope_id: Option<String>,
    },

    /// Delete a budget.
    Delete { scope: ScopeArg, scope_id: String },
}

pub async fn handle_budget_command(cmd: BudgetCommand, state: &AppState, json: bool) -> Result<()> {
    let budgets = &state.workflows.engine().services().budgets;

    match cmd {
        BudgetCommand::Set {
            scope,
            scope_id,
            max_cents,
            action,
            period,
            alert_threshold,
            replace,
        } => {
            let scope = BudgetScope::from(scope);
            if replace {
                budgets.delete_budget(scope, &scope_id).await?;
            }
            let budget = budgets
                .create_budget(
                    Budget::new(scope, &scope_id, max_cents, action.into(), period.into())
                        .with_alert_threshold(alert_threshold),
                )
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&budget)?);
            } else {
                println!();
                println!(
                    "  {} Budget set for {}:{}",
                    style("*").green().bold(),
                    budget.scope,
                    style(&budget.scope_id).cyan()
                );
                println!(
                    "  Cap: {}  Action: {}  Period: {}  Alert at: {}%",
                    format_cents(budget.max_cost_cents),
                    budget.action_at_limit,
                    budget.period,
                    budget.alert_threshold_percent
                );
                println!();
            }
            Ok(())
        }

        BudgetCommand::Show { scope, scope_id } => {
            let shown = match (scope, scope_id) {
                (Some(scope), Some(id)) => {
                    let scope = BudgetScope::from(scope);
                    match budgets.get_budget(scope, &id).await? {
                        Some(b) => vec![b],
                        None => bail!("no budget for {scope}:{id}"),
                    }
                }
                (None, None) => budgets.list_budgets().await?,
                _ => bail!("give both a scope and a scope id, or neither"),
            };

            if json {
                let out: Vec<_> = shown
                    .iter()
                    .map(|b| {
                        json!({
                            "scope": b.scope,
                            "scope_id": b.scope_id,
                            "max_cost_cents": b.max_cost_cents,
                            "current_spend_cents": b.current_spend_cents,
                            "usage_percent": b.usage_percent_with(0),
                            "action_at_limit": b.action_at_limit,
                            "period": b.period,
                            "period_start_at": b.period_start_at.to_rfc3339(),
                            "alert_sent": b.alert_sent,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }

            if shown.is_empty() {
                println!();
                println!("  No budgets configured.");
                println!(
                    "  Create one with: {}",
                    style("orch budget set workflow <name> <max-cents>").dim()
                );
                println!();
                return Ok(());
            }

            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("Scope").fg(Color::Cyan),
                    Cell::new("ID"),
                    Cell::new("Spent"),
                    Cell::new("Cap"),
                    Cell::new("Used"),
                    Cell::new("Action"),
                    Cell::new("Period"),
                ]);
            for b in &shown {
                let used = b.usage_percent_with(0);
                let color = if used >= 100.0 {
                    Color::Red
                } else if used >= f64::from(b.alert_threshold_percent) {
                    Color::Yellow
                } else {
                    Color::Green
                };
                table.add_row(vec![
                    Cell::new(b.scope),
                    Cell::new(&b.scope_id),
                    Cell::new(format_cents(b.current_spend_cents)),
                    Cell::new(format_cents(b.max_cost_cents)),
                    Cell::new(format!("{used:.1}%")).fg(color),
                    Cell::new(b.action_at_limit),
                    Cell::new(b.period),
                ]);
            }
            println!();
            println!("{table}");
            println!();
            Ok(())
        }

        BudgetCommand::Delete { scope, scope_id } => {
            let scope = BudgetScope::from(scope);
            let removed = budgets.delete_budget(scope, &scope_id).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "scope": scope, "scope_id": scope_id, "deleted": removed }))?
                );
            } else if removed {
                println!("  {} Deleted budget {scope}:{scope_id}", style("*").green().bold());
            } else {
                println!("  No budget for {scope}:{scope_id}");
            }
            Ok(())
        }
    }
}

fn format_cents(cents: u64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cents_render_as_dollars() {
        assert_eq!(format_cents(0), "$0.00");
        assert_eq!(format_cents(105), "$1.05");
        assert_eq!(format_cents(123_456), "$1234.56");
    }
}
