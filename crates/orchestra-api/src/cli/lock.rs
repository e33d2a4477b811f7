//! CLI resource lock subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::json;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum LockCommand {
    /// List live locks.
    List,

    /// Release a lock. Only its owner may release it.
    Release {
        lock_id: String,

        /// Owner id the lock was acquired under (`<run_id>:<stage_id>` for
        /// engine-held locks).
        #[arg(long)]
        owner: String,
    },

    /// Compare a lock's stored content hash with the current one.
    Check {
        lock_id: String,

        /// Hash of the resource content as it is now.
        #[arg(long)]
        hash: String,
    },

    /// Mark every overdue lock as expired.
    Sweep,
}

fn parse_lock_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("'{raw}' is not a valid lock id (expected a UUID)"))
}

pub async fn handle_lock_command(cmd: LockCommand, state: &AppState, json: bool) -> Result<()> {
    let locks = &state.workflows.engine().services().locks;

    match cmd {
        LockCommand::List => {
            let active = locks.list_active().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&active)?);
                return Ok(());
            }
            if active.is_empty() {
                println!();
                println!("  No active locks.");
                println!();
                return Ok(());
            }

            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("Resource").fg(Color::Cyan),
                    Cell::new("Owner"),
                    Cell::new("Version"),
                    Cell::new("Strategy"),
                    Cell::new("Expires"),
                    Cell::new("Lock ID"),
                ]);
            for lock in &active {
                table.add_row(vec![
                    Cell::new(format!("{}/{}", lock.resource_type, lock.resource_id)),
                    Cell::new(&lock.owner_id),
                    Cell::new(lock.version),
                    Cell::new(lock.conflict_strategy),
                    Cell::new(lock.expires_at.format("%Y-%m-%d %H:%M:%S")),
                    Cell::new(lock.lock_id),
                ]);
            }
            println!();
            println!("{table}");
            println!();
            Ok(())
        }

        LockCommand::Release { lock_id, owner } => {
            let lock_id = parse_lock_id(&lock_id)?;
            let lock = locks.release(&lock_id, &owner).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&lock)?);
            } else {
                println!(
                    "  {} Lock on {}/{} is {}",
                    style("*").green().bold(),
                    lock.resource_type,
                    lock.resource_id,
                    lock.status
                );
            }
            Ok(())
        }

        LockCommand::Check { lock_id, hash } => {
            let lock_id = parse_lock_id(&lock_id)?;
            let check = locks.detect_conflict(&lock_id, &hash).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else if check.conflict {
                println!(
                    "  {} Content changed (stored {})",
                    style("!").yellow().bold(),
                    check.stored_hash.as_deref().unwrap_or("-")
                );
            } else {
                println!("  {} No content conflict", style("✓").green().bold());
            }
            Ok(())
        }

        LockCommand::Sweep => {
            let expired = locks.sweep_expired().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&json!({ "expired": expired }))?);
            } else {
                println!("  Expired {expired} overdue locks");
            }
            Ok(())
        }
    }
}
