//! `orch audit`: print a run's audit trail and optionally verify it.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use orchestra_types::audit::{AuditAction, AuditRecord};
use serde_json::json;

use super::parse_run_id;
use crate::state::AppState;

pub async fn audit(state: &AppState, raw_id: &str, verify: bool, json: bool) -> Result<()> {
    let run_id = parse_run_id(raw_id)?;
    let records = state.workflows.audit_trail(run_id).await?;
    let report = if verify {
        Some(state.workflows.verify_audit(run_id).await?)
    } else {
        None
    };

    if json {
        let out = json!({
            "run_id": run_id.to_string(),
            "records": records,
            "verification": report,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return verdict(report.as_ref().is_none_or(|r| r.fully_verified));
    }

    if records.is_empty() {
        println!();
        println!("  No audit records for run {run_id}.");
        println!();
    } else {
        print_records(&records);
    }

    if let Some(report) = &report {
        let mark = |ok: bool| {
            if ok {
                format!("{}", style("✓").green())
            } else {
                format!("{}", style("✗").red())
            }
        };
        println!("  {} hash chain intact", mark(report.chain_intact));
        println!(
            "  {} {} of {} signatures valid ({} invalid, {} unsigned)",
            mark(report.invalid == 0 && report.unsigned == 0),
            report.valid,
            report.total,
            report.invalid,
            report.unsigned
        );
        println!();
        return verdict(report.fully_verified);
    }
    Ok(())
}

fn verdict(ok: bool) -> Result<()> {
    if ok {
        Ok(())
    } else {
        anyhow::bail!("audit trail failed verification")
    }
}

fn print_records(records: &[AuditRecord]) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Time").fg(Color::Cyan),
            Cell::new("Stage"),
            Cell::new("Agent"),
            Cell::new("Action"),
            Cell::new("Attempt"),
            Cell::new("Status"),
            Cell::new("Signed"),
            Cell::new("Hash"),
        ]);

    for r in records {
        let action_color = match r.action {
            AuditAction::Execute => Color::Green,
            AuditAction::Retry => Color::Yellow,
            AuditAction::Fail => Color::Red,
        };
        table.add_row(vec![
            Cell::new(r.logged_at.format("%H:%M:%S%.3f")),
            Cell::new(&r.stage_id),
            Cell::new(&r.agent_id),
            Cell::new(r.action).fg(action_color),
            Cell::new(r.attempt),
            Cell::new(&r.status),
            Cell::new(r.signature.as_ref().map_or("no", |_| "yes")),
            Cell::new(r.record_hash.get(..12).unwrap_or(&r.record_hash)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
}
