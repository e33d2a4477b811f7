//! CLI command definitions for the `orch` binary.
//!
//! Uses clap derive macros for argument parsing. Run-level commands sit at
//! the top level (`orch run`, `orch status`); coordination resources use a
//! noun-verb pattern (`orch budget set`, `orch lock release`).

pub mod audit;
pub mod budget;
pub mod keygen;
pub mod lock;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run multi-stage capability workflows with locks, budgets, and a signed audit trail.
#[derive(Parser)]
#[command(name = "orch", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory holding config.toml, the database, and keys.
    #[arg(long, global = true, env = "ORCHESTRA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a workflow file and print its execution levels.
    Validate {
        /// Path to a YAML or JSON workflow definition.
        file: PathBuf,
    },

    /// Submit a workflow and wait for it to finish.
    Run {
        /// Path to a YAML or JSON workflow definition.
        file: PathBuf,

        /// Initial input as a JSON string.
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the initial input from a JSON file.
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Owner recorded on the run.
        #[arg(long, env = "ORCHESTRA_OWNER", default_value = "cli")]
        owner: String,
    },

    /// Show a run's status and progress, or list recent runs.
    Status {
        /// Run UUID (omit to list recent runs).
        run_id: Option<String>,

        /// Maximum number of runs to list.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Print the output of a completed run.
    Result {
        /// Run UUID.
        run_id: String,
    },

    /// Cancel a queued or running run.
    Cancel {
        /// Run UUID.
        run_id: String,

        #[arg(long, env = "ORCHESTRA_OWNER", default_value = "cli")]
        owner: String,
    },

    /// Resume a run paused by a budget and wait for it to finish.
    Resume {
        /// Run UUID.
        run_id: String,

        #[arg(long, env = "ORCHESTRA_OWNER", default_value = "cli")]
        owner: String,
    },

    /// Show a run's audit trail.
    Audit {
        /// Run UUID.
        run_id: String,

        /// Verify signatures and the hash chain.
        #[arg(long)]
        verify: bool,
    },

    /// Manage spend budgets.
    Budget {
        #[command(subcommand)]
        action: budget::BudgetCommand,
    },

    /// Inspect and release resource locks.
    Lock {
        #[command(subcommand)]
        action: lock::LockCommand,
    },

    /// Generate an Ed25519 keypair for audit signing.
    Keygen {
        /// Output path prefix; writes `<prefix>.secret` and `<prefix>.pub`.
        /// Defaults to `<data-dir>/keys/audit`.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse a run id argument with a readable error.
pub fn parse_run_id(raw: &str) -> anyhow::Result<uuid::Uuid> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("'{raw}' is not a valid run id (expected a UUID)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_inline_input() {
        let cli = Cli::try_parse_from(["orch", "--json", "run", "wf.yaml", "--input", "{}"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run { file, input, .. } => {
                assert_eq!(file, PathBuf::from("wf.yaml"));
                assert_eq!(input.as_deref(), Some("{}"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_rejects_both_input_sources() {
        let parsed = Cli::try_parse_from([
            "orch", "run", "wf.yaml", "--input", "{}", "--input-file", "in.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn budget_set_parses_scope_and_cap() {
        let cli = Cli::try_parse_from([
            "orch", "budget", "set", "workflow", "digest", "500", "--action", "pause",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Budget {
                action: budget::BudgetCommand::Set { max_cents: 500, .. }
            }
        ));
    }

    #[test]
    fn run_id_must_be_a_uuid() {
        assert!(parse_run_id("not-a-uuid").is_err());
        assert!(parse_run_id("0192f5e0-0000-7000-8000-000000000000").is_ok());
    }
}
