//! Orchestra CLI entry point.
//!
//! Binary name: `orch`
//!
//! Parses CLI arguments, initializes tracing, the database, and the workflow
//! service, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use orchestra_infra::config::resolve_data_dir;
use orchestra_observe::tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,orchestra_core=debug,orchestra_infra=debug",
        _ => "trace",
    };
    init_tracing(&TracingOptions {
        default_filter: filter.to_string(),
        format: if cli.log_json { LogFormat::Json } else { LogFormat::Pretty },
        enable_otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Commands that need no database.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "orch", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return cli::run::validate(file, cli.json),
        _ => {}
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(resolve_data_dir);

    if let Commands::Keygen { output } = &cli.command {
        return cli::keygen::keygen(&data_dir, output.clone(), cli.json);
    }

    let state = AppState::init(data_dir).await?;

    match cli.command {
        Commands::Run {
            file,
            input,
            input_file,
            owner,
        } => {
            cli::run::run(
                &state,
                &file,
                input.as_deref(),
                input_file.as_deref(),
                &owner,
                cli.json,
                cli.quiet,
            )
            .await
        }
        Commands::Status { run_id, limit } => {
            cli::run::status(&state, run_id.as_deref(), limit, cli.json).await
        }
        Commands::Result { run_id } => cli::run::result(&state, &run_id, cli.json).await,
        Commands::Cancel { run_id, owner } => cli::run::cancel(&state, &run_id, &owner, cli.json).await,
        Commands::Resume { run_id, owner } => {
            cli::run::resume(&state, &run_id, &owner, cli.json, cli.quiet).await
        }
        Commands::Audit { run_id, verify } => cli::audit::audit(&state, &run_id, verify, cli.json).await,
        Commands::Budget { action } => cli::budget::handle_budget_command(action, &state, cli.json).await,
        Commands::Lock { action } => cli::lock::handle_lock_command(action, &state, cli.json).await,
        Commands::Validate { .. } | Commands::Completions { .. } | Commands::Keygen { .. } => {
            unreachable!("handled before state init")
        }
    }
}
