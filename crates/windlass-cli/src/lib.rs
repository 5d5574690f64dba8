//! Embeddable CLI and configuration layer for windlass worker binaries.
//!
//! Workflows and steps are Rust code compiled into your binary, so the CLI
//! is a library you embed rather than a standalone executable: build the
//! engine with your registrations, then hand it to [`execute`].
//!
//! ```ignore
//! use clap::Parser;
//! use windlass_cli::{Cli, Config};
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     let cli = Cli::parse();
//!     windlass_cli::init_tracing(cli.verbose);
//!
//!     let config = Config::load(cli.config.as_deref()).expect("config");
//!     let engine = build_engine(&config); // your workflows + steps
//!
//!     std::process::ExitCode::from(windlass_cli::execute(cli, engine).await)
//! }
//! ```
//!
//! Exit codes: `0` success, `2` user error (bad arguments, unknown
//! run/workflow), `1` unexpected failure.

mod commands;
mod config;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use config::{Config, DEFAULT_CONFIG_FILE, ENV_PREFIX};

use windlass::{Broker, Storage, WorkflowEngine};

/// Exit code for user errors (unknown names, invalid input).
pub const EXIT_USER_ERROR: u8 = 2;
/// Exit code for unexpected failures.
pub const EXIT_FAILURE: u8 = 1;

/// Operate a windlass deployment.
#[derive(Debug, Parser)]
#[command(name = "windlass", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the config file (default: ./windlass.config.yaml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run worker processes.
    Worker {
        #[command(subcommand)]
        action: commands::worker::WorkerCommand,
    },

    /// Inspect and start registered workflows.
    Workflows {
        #[command(subcommand)]
        action: commands::workflows::WorkflowsCommand,
    },

    /// Inspect and manage runs.
    Runs {
        #[command(subcommand)]
        action: commands::runs::RunsCommand,
    },

    /// Verify the deployment is ready.
    Setup {
        /// Probe storage and report readiness.
        #[arg(long)]
        check: bool,
    },
}

/// Initialize tracing for a worker binary. Safe to call multiple times.
pub fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "windlass=info",
        1 => "windlass=debug",
        _ => "windlass=trace",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .try_init();
}

/// Dispatch a parsed [`Cli`] against an assembled engine. Returns the
/// process exit code.
pub async fn execute<S, B>(cli: Cli, engine: WorkflowEngine<S, B>) -> u8
where
    S: Storage,
    B: Broker,
{
    let outcome = match cli.command {
        Commands::Worker { action } => commands::worker::run(action, &engine).await,
        Commands::Workflows { action } => {
            commands::workflows::run(action, &engine, cli.json).await
        }
        Commands::Runs { action } => commands::runs::run(action, &engine, cli.json).await,
        Commands::Setup { check } => commands::setup::run(check, &engine, cli.json).await,
    };

    match outcome {
        Ok(()) => 0,
        Err(CommandError::User(message)) => {
            eprintln!("error: {message}");
            EXIT_USER_ERROR
        }
        Err(CommandError::Unexpected(err)) => {
            eprintln!("unexpected error: {err:#}");
            EXIT_FAILURE
        }
    }
}

/// Command failure, split by exit code.
pub(crate) enum CommandError {
    /// The caller asked for something that does not exist or is malformed.
    User(String),
    Unexpected(anyhow::Error),
}

impl From<anyhow::Error> for CommandError {
    fn from(err: anyhow::Error) -> Self {
        CommandError::Unexpected(err)
    }
}

impl From<windlass::Error> for CommandError {
    fn from(err: windlass::Error) -> Self {
        match err {
            windlass::Error::RunNotFound(_)
            | windlass::Error::HookNotFound { .. }
            | windlass::Error::UnknownWorkflow(_)
            | windlass::Error::UnknownStep(_)
            | windlass::Error::Validation(_)
            | windlass::Error::IdempotencyConflict { .. }
            | windlass::Error::NestingLimit { .. } => CommandError::User(err.to_string()),
            other => CommandError::Unexpected(anyhow::Error::new(other)),
        }
    }
}
