//! Schedule ticker.
//!
//! Pops due schedule specs and starts their workflows with a firing-derived
//! idempotency key (`sched_{schedule_id}_{fire_unix_ts}`), so a firing
//! delivered twice (two ticker instances, or a crash between start and
//! advance) collapses into one run.

use std::sync::Arc;

use tracing::{info, warn};

use crate::broker::Broker;
use crate::client::{self, StartOptions, WorkflowClient};
use crate::error::{Error, Result};
use crate::runtime::registry::EngineContext;
use crate::store::Storage;

/// One scheduler pass. Returns the number of schedules fired.
pub(crate) async fn sweep_schedules<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
) -> Result<u32>
where
    S: Storage,
    B: Broker,
{
    let now = ctx.clock.now();
    let mut fired = 0u32;

    for spec in ctx.store.due_schedules(now).await? {
        let idempotency_key = format!(
            "sched_{}_{}",
            spec.schedule_id,
            spec.next_fire_at.unix_timestamp()
        );

        let outcome = client
            .start(
                &spec.workflow_name,
                spec.input.clone(),
                StartOptions {
                    idempotency_key: Some(idempotency_key),
                    ..Default::default()
                },
            )
            .await;

        match outcome {
            Ok(started) => {
                info!(
                    schedule_id = %spec.schedule_id,
                    workflow = %spec.workflow_name,
                    run_id = %started.run_id,
                    deduplicated = !started.created,
                    "schedule fired"
                );
            }
            Err(Error::UnknownWorkflow(name)) => {
                // Leave the spec in place; a worker with the workflow
                // registered will pick it up.
                warn!(schedule_id = %spec.schedule_id, workflow = %name, "schedule fired for unregistered workflow");
                continue;
            }
            Err(err) => return Err(err),
        }

        let next = client::next_fire(&spec.cadence, now)?;
        ctx.store.advance_schedule(&spec.schedule_id, next).await?;
        fired += 1;
    }

    Ok(fired)
}
