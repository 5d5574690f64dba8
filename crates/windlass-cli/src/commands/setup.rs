//! `setup --check` — readiness probe.

use serde_json::json;
use windlass::{Broker, Storage, WorkflowEngine};

use crate::CommandError;

pub async fn run<S, B>(
    check: bool,
    engine: &WorkflowEngine<S, B>,
    json: bool,
) -> Result<(), CommandError>
where
    S: Storage,
    B: Broker,
{
    if !check {
        return Err(CommandError::User(
            "nothing to do; pass --check to probe the deployment".to_string(),
        ));
    }

    let storage_healthy = engine.client().storage_healthy().await;
    let workflows = engine.descriptors().len();

    if json {
        println!(
            "{}",
            json!({
                "storage_healthy": storage_healthy,
                "registered_workflows": workflows,
            })
        );
    } else {
        println!(
            "storage:   {}",
            if storage_healthy { "ok" } else { "unreachable" }
        );
        println!("workflows: {workflows} registered");
    }

    if storage_healthy {
        Ok(())
    } else {
        Err(CommandError::Unexpected(anyhow::anyhow!(
            "storage is unreachable"
        )))
    }
}
