//! Workflow-tick execution.
//!
//! One tick = claim the run, reconcile due sleeps and hook expiries,
//! propagate cancellation, re-drive the body under the replay engine,
//! commit the buffered actions, and classify the outcome. Every path is
//! idempotent against the event log, so at-least-once tick delivery is
//! benign: a duplicate tick observes the terminal events written by the
//! first and becomes a no-op.

use std::sync::Arc;

use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Task};
use crate::client::WorkflowClient;
use crate::error::{Error, Result, WorkflowError};
use crate::event::{Event, EventKind};
use crate::ids;
use crate::model::{
    CancellationPolicy, HookStatus, RunStatus, StepRecord, WorkflowRun,
};
use crate::replay::{ReplayState, StepReplay, WorkflowCtx};
use crate::runtime::registry::EngineContext;
use crate::store::{self, RunUpdate, Storage};

/// How a tick ended, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// Terminal run, unknown run, or a parked parent: nothing to do.
    Noop,
    Completed,
    Failed,
    Suspended,
    Cancelled,
    ContinuedAsNew,
}

/// Execute one workflow-tick. Engine errors abort the tick without
/// appending events; the broker redelivers.
pub(crate) async fn run_tick<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
    run_id: &str,
) -> Result<TickOutcome>
where
    S: Storage,
    B: Broker,
{
    let Some(run) = ctx.store.get_run(run_id).await? else {
        warn!(run_id, "tick for unknown run");
        return Ok(TickOutcome::Noop);
    };
    if run.status.is_terminal() {
        debug!(run_id, status = %run.status, "tick on terminal run is a no-op");
        return Ok(TickOutcome::Noop);
    }

    let now = ctx.clock.now();
    let claim = ctx
        .store
        .claim_run(run_id, &ctx.worker_id, ctx.config.claim_ttl, now)
        .await?;
    if claim.is_none() {
        return Err(Error::Conflict(format!(
            "run {run_id} is claimed by another worker"
        )));
    }

    // Re-read under the claim: the recovery sweeper may have settled the
    // run between the first read and the claim.
    let run = match ctx.store.get_run(run_id).await? {
        Some(run) if !run.status.is_terminal() => run,
        _ => {
            ctx.store.release_claim(run_id, &ctx.worker_id).await?;
            return Ok(TickOutcome::Noop);
        }
    };

    let outcome = tick_claimed(ctx, client, run, now).await;
    ctx.store.release_claim(run_id, &ctx.worker_id).await?;
    outcome
}

async fn tick_claimed<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
    run: WorkflowRun,
    now: OffsetDateTime,
) -> Result<TickOutcome>
where
    S: Storage,
    B: Broker,
{
    let run_id = run.run_id.clone();
    let mut events = ctx.store.read_events(&run_id, None).await?;

    // Complete sleeps whose wake time has passed, so replay advances past
    // them on this tick.
    let replay = ReplayState::from_events(&events);
    for (sleep_id, wake_at) in replay.pending_sleeps() {
        if wake_at <= now {
            let event = Event::sleep_completed(&run_id, now, &sleep_id);
            events.push(store::append_event(&ctx.store, event).await?);
        }
    }

    // Expire overdue hooks in-tick as well; the wake sweeper normally beats
    // us to it, but the log must win over timer delivery glitches.
    for hook_id in &replay.pending_hooks {
        let Some(hook) = ctx.store.get_hook(hook_id).await? else {
            continue;
        };
        if hook.status == HookStatus::Pending
            && hook.expires_at.is_some_and(|at| at <= now)
        {
            let expired = ctx
                .store
                .transition_hook(hook_id, HookStatus::Expired, None, now)
                .await?;
            if expired {
                let event = Event::hook_expired(&run_id, now, hook_id);
                events.push(store::append_event(&ctx.store, event).await?);
            }
        }
    }

    let replay = ReplayState::from_events(&events);

    // Recreate child runs whose insert was lost between the parent's
    // `child_workflow.started` commit and the crash that followed it. The
    // event carries everything needed, so the recreation is deterministic.
    for child in replay.outstanding_children() {
        if ctx.store.get_run(&child.child_run_id).await?.is_none() {
            warn!(
                run_id,
                child_run_id = %child.child_run_id,
                "recreating child run missing after worker loss"
            );
            let mut child_run = WorkflowRun::new(
                child.child_run_id.clone(),
                &child.workflow_name,
                child.input.clone(),
                now,
            );
            child_run.parent_run_id = Some(run_id.clone());
            child_run.nesting_depth = run.nesting_depth + 1;
            if let Some(descriptor) = ctx
                .registry
                .workflow(&child.workflow_name)
                .map(|w| w.descriptor())
            {
                child_run.max_duration_ms = descriptor.max_duration_ms;
                child_run.max_recovery_attempts = descriptor.max_recovery_attempts;
            }
            client.create_and_start_run(child_run).await?;
        }
    }

    // Likewise for steps: a `step.started` with no record means the worker
    // died before inserting it. Rebuild the record from the event and
    // re-enqueue; the terminal-event guard keeps duplicates harmless.
    for event in &events {
        if event.kind != EventKind::StepStarted {
            continue;
        }
        let Some(step_id) = event.step_id() else {
            continue;
        };
        if !matches!(replay.steps.get(step_id), Some(StepReplay::Started)) {
            continue;
        }
        if ctx.store.get_step(step_id).await?.is_some() {
            continue;
        }
        let step_name = event.data_str("step_name").unwrap_or_default();
        let Some(handler) = ctx.registry.step(step_name) else {
            continue;
        };
        warn!(run_id, step_id, step = step_name, "recreating step record missing after worker loss");
        let args = event.data.get("args").cloned().unwrap_or(serde_json::Value::Null);
        let record = StepRecord::new(
            step_id,
            &run_id,
            step_name,
            args,
            handler.options().max_retries,
            now,
        );
        ctx.store.put_step(record).await?;
        ctx.broker
            .enqueue(
                Task::RunStep {
                    run_id: run_id.clone(),
                    step_id: step_id.to_string(),
                },
                None,
            )
            .await?;
    }

    // Cancellation propagates to children before the body observes it: with
    // TERMINATE the request is forwarded, with WAIT it is withheld, and in
    // both cases the parent parks until every child has a terminal event on
    // this log. ABANDON children are left alone.
    if replay.cancellation.is_some() {
        let mut blocking = 0usize;
        for child in replay.outstanding_children() {
            match child.policy {
                CancellationPolicy::Terminate => {
                    client.cancel(&child.child_run_id, Some("parent cancelled")).await?;
                    blocking += 1;
                }
                CancellationPolicy::Wait => blocking += 1,
                CancellationPolicy::Abandon => {}
            }
        }
        if blocking > 0 {
            info!(
                run_id,
                children = blocking,
                "cancellation parked awaiting child terminal events"
            );
            ctx.store
                .update_run_status(
                    &run_id,
                    &[RunStatus::Pending, RunStatus::Running, RunStatus::Suspended],
                    RunStatus::Suspended,
                    RunUpdate::default(),
                )
                .await?;
            return Ok(TickOutcome::Noop);
        }
    }

    let Some(workflow) = ctx.registry.workflow(&run.workflow_name).cloned() else {
        let message = format!("workflow '{}' is not registered", run.workflow_name);
        warn!(run_id, workflow = %run.workflow_name, "failing run: {message}");
        return finalize_failed(ctx, client, &run, now, &message).await;
    };

    let started_update = RunUpdate {
        started_at: run.started_at.is_none().then_some(now),
        updated_at: Some(now),
        ..Default::default()
    };
    ctx.store
        .update_run_status(
            &run_id,
            &[RunStatus::Pending, RunStatus::Suspended, RunStatus::Running],
            RunStatus::Running,
            started_update,
        )
        .await?;

    // Steps already launched on earlier ticks keep the run RUNNING while
    // the body waits on them.
    let has_inflight_steps = replay
        .steps
        .values()
        .any(|s| matches!(s, StepReplay::Started));

    let workflow_ctx = WorkflowCtx::new(
        &run_id,
        run.nesting_depth,
        ctx.config.nesting_limit,
        now,
        replay,
    );
    let body_outcome = workflow.run(&workflow_ctx, run.input.clone()).await;
    let actions = workflow_ctx.take_actions();

    // A body referencing an unregistered step is a definition bug; fail the
    // run before recording any of this tick's operations.
    for launch in &actions.step_launches {
        if ctx.registry.step(&launch.step_name).is_none() {
            let message = format!("step '{}' is not registered", launch.step_name);
            warn!(run_id, step = %launch.step_name, "failing run: {message}");
            return finalize_failed(ctx, client, &run, now, &message).await;
        }
    }

    // Commit buffered events first: the log is the source of truth, and
    // tasks are enqueued only for recorded operations.
    store::append_events(&ctx.store, actions.events).await?;
    for hook in actions.hook_creates {
        ctx.store.put_hook(hook).await?;
    }
    for wake in actions.wakes {
        ctx.store.schedule_wake(wake).await?;
    }

    let launched_steps = !actions.step_launches.is_empty();
    for launch in actions.step_launches {
        let options = ctx
            .registry
            .step(&launch.step_name)
            .expect("launch validated above")
            .options();
        let record = StepRecord::new(
            &launch.step_id,
            &run_id,
            &launch.step_name,
            launch.args,
            options.max_retries,
            now,
        );
        ctx.store.put_step(record).await?;
        ctx.broker
            .enqueue(
                Task::RunStep {
                    run_id: run_id.clone(),
                    step_id: launch.step_id,
                },
                None,
            )
            .await?;
    }

    for child in actions.child_starts {
        let mut child_run =
            WorkflowRun::new(child.child_run_id, &child.workflow_name, child.input, now);
        child_run.parent_run_id = Some(run_id.clone());
        child_run.nesting_depth = run.nesting_depth + 1;
        if let Some(descriptor) = ctx
            .registry
            .workflow(&child.workflow_name)
            .map(|w| w.descriptor())
        {
            child_run.max_duration_ms = descriptor.max_duration_ms;
            child_run.max_recovery_attempts = descriptor.max_recovery_attempts;
        }
        client.create_and_start_run(child_run).await?;
    }

    match body_outcome {
        Ok(result) => finalize_completed(ctx, client, &run, now, result).await,
        Err(WorkflowError::Suspended(reason)) => {
            let status = if launched_steps || has_inflight_steps {
                // Step tasks will call back with a tick; the run is active.
                RunStatus::Running
            } else {
                RunStatus::Suspended
            };
            ctx.store
                .update_run_status(
                    &run_id,
                    &[RunStatus::Running],
                    status,
                    RunUpdate {
                        updated_at: Some(now),
                        ..Default::default()
                    },
                )
                .await?;
            debug!(run_id, %reason, status = %status, "workflow suspended");
            Ok(TickOutcome::Suspended)
        }
        Err(WorkflowError::Cancelled { reason }) => {
            finalize_cancelled(ctx, client, &run, now, reason.as_deref()).await
        }
        Err(WorkflowError::ContinueAsNew { input }) => {
            finalize_continued(ctx, client, &run, now, input).await
        }
        Err(user_error) => {
            let message = user_error.to_string();
            finalize_failed(ctx, client, &run, now, &message).await
        }
    }
}

async fn finalize_completed<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
    run: &WorkflowRun,
    now: OffsetDateTime,
    result: serde_json::Value,
) -> Result<TickOutcome>
where
    S: Storage,
    B: Broker,
{
    let event = Event::workflow_completed(&run.run_id, now, &result);
    store::append_event(&ctx.store, event).await?;
    ctx.store
        .update_run_status(
            &run.run_id,
            &[RunStatus::Pending, RunStatus::Running, RunStatus::Suspended],
            RunStatus::Completed,
            RunUpdate {
                result: Some(result.clone()),
                completed_at: Some(now),
                ..Default::default()
            },
        )
        .await?;

    cleanup_terminal(ctx, &run.run_id, now, false).await?;
    notify_parent(ctx, client, run, |parent_id| {
        Event::child_completed(parent_id, now, &run.run_id, &result)
    })
    .await?;

    info!(run_id = %run.run_id, workflow = %run.workflow_name, "workflow completed");
    Ok(TickOutcome::Completed)
}

pub(crate) async fn finalize_failed<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
    run: &WorkflowRun,
    now: OffsetDateTime,
    message: &str,
) -> Result<TickOutcome>
where
    S: Storage,
    B: Broker,
{
    let event = Event::workflow_failed(&run.run_id, now, message);
    store::append_event(&ctx.store, event).await?;
    ctx.store
        .update_run_status(
            &run.run_id,
            &[RunStatus::Pending, RunStatus::Running, RunStatus::Suspended],
            RunStatus::Failed,
            RunUpdate {
                error: Some(message.to_string()),
                completed_at: Some(now),
                ..Default::default()
            },
        )
        .await?;

    cleanup_terminal(ctx, &run.run_id, now, true).await?;
    notify_parent(ctx, client, run, |parent_id| {
        Event::child_failed(parent_id, now, &run.run_id, message)
    })
    .await?;

    info!(run_id = %run.run_id, error = message, "workflow failed");
    Ok(TickOutcome::Failed)
}

async fn finalize_cancelled<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
    run: &WorkflowRun,
    now: OffsetDateTime,
    reason: Option<&str>,
) -> Result<TickOutcome>
where
    S: Storage,
    B: Broker,
{
    let event = Event::workflow_cancelled(&run.run_id, now, reason);
    store::append_event(&ctx.store, event).await?;
    ctx.store
        .update_run_status(
            &run.run_id,
            &[RunStatus::Pending, RunStatus::Running, RunStatus::Suspended],
            RunStatus::Cancelled,
            RunUpdate {
                completed_at: Some(now),
                ..Default::default()
            },
        )
        .await?;

    cleanup_terminal(ctx, &run.run_id, now, true).await?;
    notify_parent(ctx, client, run, |parent_id| {
        Event::child_cancelled(parent_id, now, &run.run_id)
    })
    .await?;

    info!(run_id = %run.run_id, reason = reason.unwrap_or(""), "workflow cancelled");
    Ok(TickOutcome::Cancelled)
}

async fn finalize_continued<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
    run: &WorkflowRun,
    now: OffsetDateTime,
    input: serde_json::Value,
) -> Result<TickOutcome>
where
    S: Storage,
    B: Broker,
{
    let descriptor = ctx
        .registry
        .workflow(&run.workflow_name)
        .map(|w| w.descriptor());
    let input = match &descriptor {
        Some(descriptor) => match descriptor.validate(&input) {
            Ok(input) => input,
            Err(message) => {
                let message = format!("continue-as-new input invalid: {message}");
                return finalize_failed(ctx, client, run, now, &message).await;
            }
        },
        None => input,
    };

    let new_run_id = ids::new_run_id();
    let successor_id = new_run_id.clone();
    let event = Event::workflow_continued_as_new(&run.run_id, now, &new_run_id, &input);
    store::append_event(&ctx.store, event).await?;
    ctx.store
        .update_run_status(
            &run.run_id,
            &[RunStatus::Pending, RunStatus::Running, RunStatus::Suspended],
            RunStatus::Completed,
            RunUpdate {
                result: Some(json!({ "continued_to": new_run_id.clone() })),
                completed_at: Some(now),
                continued_to: Some(new_run_id.clone()),
                ..Default::default()
            },
        )
        .await?;

    cleanup_terminal(ctx, &run.run_id, now, false).await?;

    // The successor is a continuation, not a child: lineage points back but
    // the nesting depth carries over unchanged.
    let mut successor = WorkflowRun::new(new_run_id, &run.workflow_name, input, now);
    successor.parent_run_id = Some(run.run_id.clone());
    successor.nesting_depth = run.nesting_depth;
    successor.tags = run.tags.clone();
    successor.metadata = run.metadata.clone();
    if let Some(descriptor) = descriptor {
        successor.max_duration_ms = descriptor.max_duration_ms;
        successor.max_recovery_attempts = descriptor.max_recovery_attempts;
    }
    client.create_and_start_run(successor).await?;

    notify_parent(ctx, client, run, |parent_id| {
        Event::child_completed(
            parent_id,
            now,
            &run.run_id,
            &json!({ "continued_to": successor_id }),
        )
    })
    .await?;

    info!(run_id = %run.run_id, "workflow continued as new");
    Ok(TickOutcome::ContinuedAsNew)
}

/// Dispose pending hooks, drop pending wakes, and (for abnormal endings)
/// sweep pending step tasks off the broker.
async fn cleanup_terminal<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    run_id: &str,
    now: OffsetDateTime,
    cancel_pending_steps: bool,
) -> Result<()>
where
    S: Storage,
    B: Broker,
{
    for hook in ctx.store.list_hooks(run_id).await? {
        if hook.status == HookStatus::Pending {
            let disposed = ctx
                .store
                .transition_hook(&hook.hook_id, HookStatus::Disposed, None, now)
                .await?;
            if disposed {
                let event = Event::hook_disposed(run_id, now, &hook.hook_id);
                store::append_event(&ctx.store, event).await?;
            }
        }
    }

    ctx.store.cancel_wakes(run_id).await?;

    if cancel_pending_steps {
        let removed = ctx.broker.cancel_steps(run_id).await?;
        if removed > 0 {
            debug!(run_id, removed, "cancelled pending step tasks");
        }
    }
    Ok(())
}

/// Record this run's terminal outcome on its parent's log and re-tick the
/// parent. Continuations are skipped: only runs the parent spawned via a
/// `child_workflow.started` event notify.
pub(crate) async fn notify_parent<S, B, F>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
    run: &WorkflowRun,
    build_event: F,
) -> Result<()>
where
    S: Storage,
    B: Broker,
    F: FnOnce(&str) -> Event,
{
    let Some(parent_id) = &run.parent_run_id else {
        return Ok(());
    };

    let parent_events = ctx.store.read_events(parent_id, None).await?;
    let is_child = parent_events.iter().any(|e| {
        e.kind == EventKind::ChildWorkflowStarted && e.child_run_id() == Some(&run.run_id)
    });
    if !is_child {
        return Ok(());
    }

    store::append_event(&ctx.store, build_event(parent_id)).await?;
    client.enqueue_tick(parent_id, None).await?;
    Ok(())
}
