//! Durable workflow runner entry point.
//!
//! Binary name: `durable`
//!
//! Parses CLI arguments, opens the step database in the data directory, then
//! dispatches to the command handler. Any failure is logged and the process
//! exits with a non-zero status.

mod cli;
mod onboarding;
mod state;

use std::sync::Arc;

use clap::Parser;
use durable_core::engine::fault::{CrashInjector, NoFaults};
use tracing_subscriber::EnvFilter;

use cli::run::RunMode;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,durable_core=debug,durable_infra=debug,durable_cli=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = dispatch(cli).await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init(cli.data_dir, cli.stale_after_ms).await?;

    match cli.command {
        Commands::Start { workflow_id } => {
            cli::run::run_workflow(&state, &workflow_id, RunMode::Start, Arc::new(NoFaults), cli.json)
                .await?;
        }

        Commands::Resume { workflow_id } => {
            cli::run::run_workflow(&state, &workflow_id, RunMode::Resume, Arc::new(NoFaults), cli.json)
                .await?;
        }

        Commands::CrashAfter { workflow_id, steps } => {
            let injector = Arc::new(CrashInjector::new(steps));
            cli::run::run_workflow(&state, &workflow_id, RunMode::Start, injector, cli.json).await?;
        }

        Commands::Steps { workflow_id } => {
            cli::steps::show_steps(&state, &workflow_id, cli.json).await?;
        }
    }

    Ok(())
}
