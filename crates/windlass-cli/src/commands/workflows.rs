//! `workflows list` and `workflows run`.

use clap::Subcommand;
use serde_json::json;
use windlass::{Broker, StartOptions, Storage, WorkflowEngine};

use crate::{output, CommandError};

#[derive(Debug, Subcommand)]
pub enum WorkflowsCommand {
    /// List registered workflows and their parameter schemas.
    List,

    /// Start a run of a registered workflow.
    Run {
        /// Workflow name.
        name: String,

        /// Workflow input as a JSON object.
        #[arg(long, default_value = "{}")]
        input: String,

        /// Collapse duplicate starts under this key.
        #[arg(long)]
        idempotency_key: Option<String>,
    },
}

pub async fn run<S, B>(
    command: WorkflowsCommand,
    engine: &WorkflowEngine<S, B>,
    json: bool,
) -> Result<(), CommandError>
where
    S: Storage,
    B: Broker,
{
    match command {
        WorkflowsCommand::List => {
            let descriptors = engine.descriptors();
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&descriptors)
                        .map_err(|e| CommandError::Unexpected(e.into()))?
                );
            } else {
                println!("{}", output::workflows_table(&descriptors));
            }
            Ok(())
        }

        WorkflowsCommand::Run {
            name,
            input,
            idempotency_key,
        } => {
            let input: serde_json::Value = serde_json::from_str(&input)
                .map_err(|e| CommandError::User(format!("--input is not valid JSON: {e}")))?;

            let outcome = engine
                .client()
                .start(
                    &name,
                    input,
                    StartOptions {
                        idempotency_key,
                        ..Default::default()
                    },
                )
                .await?;

            if json {
                println!(
                    "{}",
                    json!({ "run_id": outcome.run_id, "created": outcome.created })
                );
            } else if outcome.created {
                println!("started {}", outcome.run_id);
            } else {
                println!("already running as {} (idempotency key)", outcome.run_id);
            }
            Ok(())
        }
    }
}
