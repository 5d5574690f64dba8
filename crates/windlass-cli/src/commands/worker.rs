//! `worker run` — serve task queues until interrupted.

use clap::Subcommand;
use tracing::info;
use windlass::{Broker, Storage, WorkerMode, WorkflowEngine};

use crate::CommandError;

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Poll queues and execute tasks until Ctrl-C.
    Run {
        /// Serve only workflow ticks (plus recovery sweeps).
        #[arg(long, conflicts_with_all = ["step_only", "schedule"])]
        workflow_only: bool,

        /// Serve only step tasks.
        #[arg(long, conflicts_with_all = ["workflow_only", "schedule"])]
        step_only: bool,

        /// Serve only the schedule ticker.
        #[arg(long, conflicts_with_all = ["workflow_only", "step_only"])]
        schedule: bool,
    },
}

pub async fn run<S, B>(
    command: WorkerCommand,
    engine: &WorkflowEngine<S, B>,
) -> Result<(), CommandError>
where
    S: Storage,
    B: Broker,
{
    let WorkerCommand::Run {
        workflow_only,
        step_only,
        schedule,
    } = command;

    let mode = if workflow_only {
        WorkerMode::WorkflowOnly
    } else if step_only {
        WorkerMode::StepOnly
    } else if schedule {
        WorkerMode::ScheduleOnly
    } else {
        WorkerMode::All
    };

    info!(?mode, worker_id = engine.worker_id(), "starting worker");
    engine
        .run_worker(mode, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
