//! `runs list|status|logs|cancel|children`.

use clap::Subcommand;
use serde_json::json;
use windlass::{Broker, RunFilter, RunStatus, Storage, WorkflowEngine};

use crate::{output, CommandError};

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    /// List runs, newest first.
    List {
        /// Filter by workflow name.
        #[arg(long)]
        workflow: Option<String>,

        /// Filter by status (pending, running, suspended, completed,
        /// failed, interrupted, cancelled).
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: u32,
    },

    /// Show one run in full.
    Status { run_id: String },

    /// Show a run's ordered event log.
    Logs { run_id: String },

    /// Request cooperative cancellation.
    Cancel {
        run_id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// List a run's direct children.
    Children { run_id: String },
}

pub async fn run<S, B>(
    command: RunsCommand,
    engine: &WorkflowEngine<S, B>,
    json: bool,
) -> Result<(), CommandError>
where
    S: Storage,
    B: Broker,
{
    let client = engine.client();

    match command {
        RunsCommand::List {
            workflow,
            status,
            limit,
        } => {
            let mut filter = RunFilter::new();
            filter.workflow_name = workflow;
            filter.limit = limit;
            if let Some(raw) = &status {
                filter.status = Some(RunStatus::parse(raw).ok_or_else(|| {
                    CommandError::User(format!("unknown status '{raw}'"))
                })?);
            }

            let runs = client.list_runs(&filter).await?;
            print_runs(&runs, json)?;
            Ok(())
        }

        RunsCommand::Status { run_id } => {
            let run = client.get_run(&run_id).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&run)
                        .map_err(|e| CommandError::Unexpected(e.into()))?
                );
            } else {
                println!("run:       {}", run.run_id);
                println!("workflow:  {}", run.workflow_name);
                println!("status:    {}", run.status);
                println!("created:   {}", output::fmt_time(run.created_at));
                println!("started:   {}", output::fmt_opt_time(run.started_at));
                println!("completed: {}", output::fmt_opt_time(run.completed_at));
                if let Some(parent) = &run.parent_run_id {
                    println!("parent:    {parent} (depth {})", run.nesting_depth);
                }
                if let Some(continued_to) = &run.continued_to {
                    println!("continued: {continued_to}");
                }
                if let Some(result) = &run.result {
                    println!("result:    {result}");
                }
                if let Some(error) = &run.error {
                    println!("error:     {error}");
                }
            }
            Ok(())
        }

        RunsCommand::Logs { run_id } => {
            let events = client.events(&run_id).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&events)
                        .map_err(|e| CommandError::Unexpected(e.into()))?
                );
            } else {
                println!("{}", output::events_table(&events));
            }
            Ok(())
        }

        RunsCommand::Cancel { run_id, reason } => {
            client.cancel(&run_id, reason.as_deref()).await?;
            if json {
                println!("{}", json!({ "run_id": run_id, "cancellation_requested": true }));
            } else {
                println!("cancellation requested for {run_id}");
            }
            Ok(())
        }

        RunsCommand::Children { run_id } => {
            // Surfaces RunNotFound for a bogus id before listing.
            client.get_run(&run_id).await?;
            let children = client.children(&run_id).await?;
            print_runs(&children, json)?;
            Ok(())
        }
    }
}

fn print_runs(runs: &[windlass::WorkflowRun], json: bool) -> Result<(), CommandError> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(runs).map_err(|e| CommandError::Unexpected(e.into()))?
        );
    } else if runs.is_empty() {
        println!("no runs");
    } else {
        println!("{}", output::runs_table(runs));
    }
    Ok(())
}
