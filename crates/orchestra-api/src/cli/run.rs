//! Run lifecycle commands: validate, run, status, result, cancel, resume.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use orchestra_core::repository::run::RunRepository;
use orchestra_core::workflow::definition::load_workflow_file;
use orchestra_core::workflow::executor::ExecutionResult;
use orchestra_core::workflow::graph::build_levels;
use orchestra_types::event::{EventEnvelope, WorkflowEvent};
use orchestra_types::workflow::{RunStatus, StageStatus};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::parse_run_id;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn validate(file: &Path, json: bool) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("workflow '{}' is invalid", file.display()))?;
    let levels = build_levels(&def.stages)?;
    let level_ids: Vec<Vec<&str>> = levels
        .iter()
        .map(|level| level.iter().map(|s| s.id.as_str()).collect())
        .collect();

    if json {
        let out = json!({
            "name": def.name,
            "valid": true,
            "stages": def.stages.len(),
            "levels": level_ids,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid ({} stages, {} levels)",
        style("✓").green().bold(),
        style(&def.name).cyan(),
        def.stages.len(),
        levels.len()
    );
    for (i, ids) in level_ids.iter().enumerate() {
        println!("  {} {}", style(format!("level {i}:")).dim(), ids.join(", "));
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

fn read_input(input: Option<&str>, input_file: Option<&Path>) -> Result<Value> {
    match (input, input_file) {
        (Some(raw), _) => serde_json::from_str(raw).context("--input is not valid JSON"),
        (None, Some(path)) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
        }
        (None, None) => Ok(json!({})),
    }
}

pub async fn run(
    state: &AppState,
    file: &Path,
    input: Option<&str>,
    input_file: Option<&Path>,
    owner: &str,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("workflow '{}' is invalid", file.display()))?;
    let input = read_input(input, input_file)?;

    // Subscribe before submitting so no early event is missed.
    let events = state.workflows.engine().services().events.subscribe();
    let run_id = state.workflows.submit(def, input, owner).await?;

    let printer = (!json && !quiet).then(|| {
        println!();
        println!("  {} Run {}", style("▶").cyan().bold(), style(run_id).dim());
        tokio::spawn(print_progress(events, run_id))
    });

    let result = state.workflows.wait(run_id).await?;
    if let Some(printer) = printer {
        let _ = tokio::time::timeout(Duration::from_millis(500), printer).await;
    }

    print_result(&result, json)?;
    exit_status(&result)
}

pub async fn resume(state: &AppState, raw_id: &str, owner: &str, json: bool, quiet: bool) -> Result<()> {
    let run_id = parse_run_id(raw_id)?;
    let events = state.workflows.engine().services().events.subscribe();
    state.workflows.resume(run_id, owner).await?;

    let printer = (!json && !quiet).then(|| tokio::spawn(print_progress(events, run_id)));
    let result = state.workflows.wait(run_id).await?;
    if let Some(printer) = printer {
        let _ = tokio::time::timeout(Duration::from_millis(500), printer).await;
    }

    print_result(&result, json)?;
    exit_status(&result)
}

/// Stream this run's events until it stops.
async fn print_progress(mut events: broadcast::Receiver<EventEnvelope>, run_id: Uuid) {
    loop {
        let envelope = match events.recv().await {
            Ok(envelope) => envelope,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                eprintln!("  {} skipped {skipped} events", style("…").dim());
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if envelope.event.run_id() != Some(run_id) {
            continue;
        }

        match envelope.event {
            WorkflowEvent::LevelStarted { level, stage_ids, .. } => {
                eprintln!("  {} {}", style(format!("level {level}")).dim(), stage_ids.join(", "));
            }
            WorkflowEvent::StageStarted { stage_id, attempt, .. } if attempt > 1 => {
                eprintln!("    {} {stage_id} attempt {attempt}", style("↻").yellow());
            }
            WorkflowEvent::StageCompleted {
                stage_id,
                duration_ms,
                cached,
                ..
            } => {
                let note = if cached { " (cached)".to_string() } else { format!(" ({duration_ms}ms)") };
                eprintln!("    {} {stage_id}{}", style("✓").green(), style(note).dim());
            }
            WorkflowEvent::StageFailed {
                stage_id,
                error,
                will_retry: false,
                ..
            } => {
                eprintln!("    {} {stage_id}: {error}", style("✗").red());
            }
            WorkflowEvent::LockConflict { stage_id, conflict, .. } => {
                eprintln!(
                    "    {} {stage_id}: {}/{} held by '{}' ({})",
                    style("!").yellow(),
                    conflict.resource_type,
                    conflict.resource_id,
                    conflict.held_by,
                    conflict.strategy
                );
            }
            WorkflowEvent::BudgetExceeded {
                stage_id,
                scope,
                scope_id,
                usage_percent,
                action,
                ..
            } => {
                eprintln!(
                    "    {} {stage_id}: budget {scope}:{scope_id} at {usage_percent:.1}% ({action})",
                    style("$").yellow()
                );
            }
            WorkflowEvent::RunCompleted { .. }
            | WorkflowEvent::RunFailed { .. }
            | WorkflowEvent::RunPaused { .. }
            | WorkflowEvent::RunCancelled { .. } => return,
            _ => {}
        }
    }
}

fn print_result(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        let out = json!({
            "run_id": result.run_id.to_string(),
            "status": result.status.as_str(),
            "output": result.output,
            "error": result.error,
            "stages": result.stages,
            "conflicts": result.conflicts,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    match result.status {
        RunStatus::Completed => {
            println!("  {} Run completed", style("*").green().bold());
            if let Some(output) = &result.output {
                println!();
                println!("{}", serde_json::to_string_pretty(output)?);
            }
        }
        RunStatus::Paused => {
            println!(
                "  {} Run paused: {}",
                style("‖").yellow().bold(),
                result.error.as_deref().unwrap_or("budget limit")
            );
            println!(
                "  Resume with: {}",
                style(format!("orch resume {}", result.run_id)).dim()
            );
        }
        status => {
            println!("  {} Run {status}", style("✗").red().bold());
            if let Some(error) = &result.error {
                println!("  {}", style(error).red());
            }
        }
    }
    if !result.conflicts.is_empty() {
        println!();
        println!("  {} lock conflicts:", result.conflicts.len());
        for c in &result.conflicts {
            println!(
                "    {}/{} held by '{}' ({})",
                c.resource_type, c.resource_id, c.held_by, c.strategy
            );
        }
    }
    println!();
    Ok(())
}

/// Non-zero exit for runs that did not complete.
fn exit_status(result: &ExecutionResult) -> Result<()> {
    match result.status {
        RunStatus::Completed | RunStatus::Paused => Ok(()),
        status => anyhow::bail!("run {} {status}", result.run_id),
    }
}

// ---------------------------------------------------------------------------
// Status / result / cancel
// ---------------------------------------------------------------------------

pub async fn status(state: &AppState, raw_id: Option<&str>, limit: u32, json: bool) -> Result<()> {
    let Some(raw_id) = raw_id else {
        return list_runs(state, limit, json).await;
    };
    let run_id = parse_run_id(raw_id)?;
    let view = state.workflows.status(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let p = &view.progress;
    println!();
    println!("  Run:      {}", style(view.run_id).cyan());
    println!("  Status:   {}", styled_status(view.status));
    println!(
        "  Progress: {}/{} completed, {} failed, {} running",
        p.completed, p.total, p.failed, p.in_progress
    );
    if !p.current_stage_ids.is_empty() {
        println!("  Running:  {}", p.current_stage_ids.join(", "));
    }
    if let Some(error) = &view.error_message {
        println!("  Error:    {}", style(error).red());
    }
    println!();
    Ok(())
}

async fn list_runs(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let runs = state.workflows.list_runs(limit).await?;

    if json {
        let out: Vec<_> = runs
            .iter()
            .map(|r| {
                json!({
                    "run_id": r.run_id.to_string(),
                    "workflow": r.definition.name,
                    "owner": r.owner_id,
                    "status": r.status.as_str(),
                    "created_at": r.created_at.to_rfc3339(),
                    "completed_at": r.completed_at.map(|t| t.to_rfc3339()),
                    "error": r.error_message,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs yet.");
        println!("  Start one with: {}", style("orch run <workflow.yaml>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Owner"),
            Cell::new("Status"),
            Cell::new("Created"),
        ]);
    for r in &runs {
        table.add_row(vec![
            Cell::new(r.run_id),
            Cell::new(&r.definition.name),
            Cell::new(&r.owner_id),
            Cell::new(r.status).fg(status_color(r.status)),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn result(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(raw_id)?;
    let output = state.workflows.result(run_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&json!({ "run_id": run_id.to_string(), "output": output }))?);
    } else {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}

pub async fn cancel(state: &AppState, raw_id: &str, owner: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(raw_id)?;
    state.workflows.cancel(run_id, owner).await?;
    let stages = state.workflows.engine().services().runs.list_stages(&run_id).await?;
    let finished = stages.iter().filter(|s| s.status == StageStatus::Completed).count();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "run_id": run_id.to_string(),
                "status": "cancelled",
                "stages_completed": finished,
            }))?
        );
    } else {
        println!();
        println!("  {} Cancelled run {}", style("*").green().bold(), style(run_id).cyan());
        println!("  Stages completed before cancel: {finished}");
        println!();
    }
    Ok(())
}

fn status_color(status: RunStatus) -> Color {
    match status {
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Paused | RunStatus::Cancelled => Color::Yellow,
        RunStatus::Queued | RunStatus::InProgress => Color::Blue,
    }
}

fn styled_status(status: RunStatus) -> console::StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        RunStatus::Completed => s.green(),
        RunStatus::Failed => s.red(),
        RunStatus::Paused | RunStatus::Cancelled => s.yellow(),
        RunStatus::Queued | RunStatus::InProgress => s.blue(),
    }
}
