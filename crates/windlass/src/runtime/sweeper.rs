//! Recovery and wake sweeping.
//!
//! The recovery sweeper detects work orphaned by worker loss: runs whose
//! claim expired while non-terminal, steps whose lease expired mid-flight,
//! and active runs that went quiet between durable writes. Recovery is
//! bounded: a run that exhausts `max_recovery_attempts` is interrupted,
//! and a step that exhausts its budget fails with a recovery-exhausted
//! error.
//!
//! The wake sweeper drains the persistent timer index: due sleeps re-tick
//! their runs, due hook expiries CAS the hook and re-tick, and run timeouts
//! request cancellation.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{Broker, Task};
use crate::client::WorkflowClient;
use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::model::{HookStatus, RunStatus, StepStatus, WakeKind};
use crate::runtime::dispatcher;
use crate::runtime::registry::EngineContext;
use crate::store::{self, RunUpdate, Storage, StepUpdate};

/// One recovery pass. Returns the number of recovery actions taken.
pub(crate) async fn sweep_recovery<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
) -> Result<u32>
where
    S: Storage,
    B: Broker,
{
    let now = ctx.clock.now();
    let mut actions = 0u32;

    // Runs whose tick claim expired while non-terminal.
    for claim in ctx.store.pop_expired_claims(now).await? {
        let Some(run) = ctx.store.get_run(&claim.run_id).await? else {
            continue;
        };
        if run.status.is_terminal() {
            continue;
        }

        if run.recovery_attempts >= run.max_recovery_attempts {
            warn!(
                run_id = %run.run_id,
                attempts = run.recovery_attempts,
                "recovery exhausted; interrupting run"
            );
            let event = Event::workflow_interrupted(
                &run.run_id,
                now,
                "worker lost and recovery attempts exhausted",
                run.recovery_attempts,
            );
            store::append_event(&ctx.store, event).await?;
            ctx.store
                .update_run_status(
                    &run.run_id,
                    &[RunStatus::Pending, RunStatus::Running, RunStatus::Suspended],
                    RunStatus::Interrupted,
                    RunUpdate {
                        error: Some("interrupted: recovery attempts exhausted".to_string()),
                        completed_at: Some(now),
                        ..Default::default()
                    },
                )
                .await?;
            ctx.store.cancel_wakes(&run.run_id).await?;
            ctx.broker.cancel_steps(&run.run_id).await?;
            dispatcher::notify_parent(ctx, client, &run, |parent_id| {
                Event::child_failed(parent_id, now, &run.run_id, "interrupted")
            })
            .await?;
        } else {
            let attempts = run.recovery_attempts + 1;
            info!(
                run_id = %run.run_id,
                attempt = attempts,
                lost_worker = %claim.worker_id,
                "recovering run after expired claim"
            );
            ctx.store.set_recovery_attempts(&run.run_id, attempts).await?;
            client.enqueue_tick(&run.run_id, None).await?;
        }
        actions += 1;
    }

    // Steps whose execution lease expired.
    for step in ctx.store.list_expired_step_leases(now).await? {
        // The worker may have died after appending the terminal event but
        // before settling the record; the log wins.
        let events = ctx.store.read_events(&step.run_id, None).await?;
        let terminal = events
            .iter()
            .find(|e| e.kind.is_step_terminal() && e.step_id() == Some(step.step_id.as_str()));
        if let Some(terminal) = terminal {
            debug!(step_id = %step.step_id, "reconciling step record against terminal event");
            let status = if terminal.kind == EventKind::StepCompleted {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            };
            ctx.store
                .update_step(
                    &step.step_id,
                    StepStatus::Running,
                    StepUpdate {
                        status: Some(status),
                        result: terminal.data.get("result").cloned(),
                        error: terminal.data_str("error").map(str::to_string),
                        completed_at: Some(now),
                        lock: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
            client.enqueue_tick(&step.run_id, None).await?;
            actions += 1;
            continue;
        }

        if step.recovery_attempts >= ctx.config.max_recovery_attempts {
            warn!(
                step_id = %step.step_id,
                run_id = %step.run_id,
                "step recovery exhausted"
            );
            let event = Event::step_failed(
                &step.run_id,
                now,
                &step.step_id,
                "worker lost and step recovery attempts exhausted",
                false,
                step.attempt,
            );
            store::append_event(&ctx.store, event).await?;
            ctx.store
                .update_step(
                    &step.step_id,
                    StepStatus::Running,
                    StepUpdate {
                        status: Some(StepStatus::Failed),
                        error: Some("recovery attempts exhausted".to_string()),
                        completed_at: Some(now),
                        lock: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
            client.enqueue_tick(&step.run_id, None).await?;
        } else {
            info!(
                step_id = %step.step_id,
                run_id = %step.run_id,
                attempt = step.recovery_attempts + 1,
                "re-enqueuing step after expired lease"
            );
            let released = ctx
                .store
                .update_step(
                    &step.step_id,
                    StepStatus::Running,
                    StepUpdate {
                        status: Some(StepStatus::Pending),
                        lock: Some(None),
                        recovery_attempts: Some(step.recovery_attempts + 1),
                        ..Default::default()
                    },
                )
                .await?;
            if released {
                ctx.broker
                    .enqueue(
                        Task::RunStep {
                            run_id: step.run_id.clone(),
                            step_id: step.step_id.clone(),
                        },
                        None,
                    )
                    .await?;
            }
        }
        actions += 1;
    }

    // PENDING steps whose broker message never arrived (lost between the
    // tick's commit and its enqueue, or a dropped retry redelivery). The
    // step claim CAS makes a duplicate enqueue benign.
    for step in ctx
        .store
        .list_orphaned_pending_steps(now, ctx.config.step_lease)
        .await?
    {
        if store::step_has_terminal_event(&ctx.store, &step.run_id, &step.step_id).await? {
            continue;
        }
        info!(
            step_id = %step.step_id,
            run_id = %step.run_id,
            "re-enqueuing pending step with no visible task"
        );
        ctx.broker
            .enqueue(
                Task::RunStep {
                    run_id: step.run_id.clone(),
                    step_id: step.step_id.clone(),
                },
                None,
            )
            .await?;
        actions += 1;
    }

    // Active runs that went quiet (e.g. a worker died between a durable
    // write and the follow-up tick enqueue). A redundant tick is harmless.
    let mut filter = crate::store::RunFilter::new();
    filter.status = Some(RunStatus::Running);
    for run in ctx.store.list_runs(&filter).await? {
        if run.updated_at + ctx.config.claim_ttl <= now {
            debug!(run_id = %run.run_id, "re-ticking quiet active run");
            client.enqueue_tick(&run.run_id, None).await?;
            actions += 1;
        }
    }

    Ok(actions)
}

/// One wake-index scan. Returns the number of wakes delivered.
pub(crate) async fn sweep_wakes<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
) -> Result<u32>
where
    S: Storage,
    B: Broker,
{
    let now = ctx.clock.now();
    let due = ctx.store.pop_due_wakes(now, ctx.config.wake_batch).await?;
    let mut delivered = 0u32;

    for wake in due {
        match wake.kind {
            WakeKind::SleepDue { sleep_id } => {
                debug!(run_id = %wake.run_id, sleep_id, "sleep due; enqueueing tick");
                client.enqueue_tick(&wake.run_id, None).await?;
            }
            WakeKind::HookExpiry { hook_id } => {
                let expired = ctx
                    .store
                    .transition_hook(&hook_id, HookStatus::Expired, None, now)
                    .await?;
                if expired {
                    info!(run_id = %wake.run_id, hook_id = %hook_id, "hook expired");
                    let event = Event::hook_expired(&wake.run_id, now, &hook_id);
                    store::append_event(&ctx.store, event).await?;
                    client.enqueue_tick(&wake.run_id, None).await?;
                }
            }
            WakeKind::RunTimeout => {
                let run = ctx.store.get_run(&wake.run_id).await?;
                if run.is_some_and(|r| !r.status.is_terminal()) {
                    info!(run_id = %wake.run_id, "run exceeded max duration; requesting cancellation");
                    client
                        .cancel(&wake.run_id, Some("max_duration exceeded"))
                        .await?;
                    client.enqueue_tick(&wake.run_id, None).await?;
                }
            }
        }
        delivered += 1;
    }

    Ok(delivered)
}
