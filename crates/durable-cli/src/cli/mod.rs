//! CLI command definitions for the `durable` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod run;
pub mod steps;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run the onboarding workflow durably: crash it, resume it, inspect it.
#[derive(Parser)]
#[command(name = "durable", version, about, long_about = None)]
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

    /// Directory holding the step database and `durable.toml`.
    #[arg(long, global = true, env = "DURABLE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Age in milliseconds after which an in-progress step counts as abandoned.
    #[arg(long, global = true)]
    pub stale_after_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow under a new id.
    Start {
        /// Workflow id.
        workflow_id: String,
    },

    /// Run a workflow again, replaying completed steps.
    Resume {
        /// Workflow id.
        workflow_id: String,
    },

    /// Run a workflow and kill the process after the n-th step start.
    #[command(name = "crash-after")]
    CrashAfter {
        /// Workflow id.
        workflow_id: String,

        /// Step start to crash on (1-based).
        #[arg(value_parser = clap::value_parser!(u64).range(1..))]
        steps: u64,
    },

    /// Show the recorded steps of a workflow.
    Steps {
        /// Workflow id.
        workflow_id: String,
    },
}
