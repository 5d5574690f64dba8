//! Step-task execution.
//!
//! A step task executes exactly one logical step invocation. Delivery is
//! at-least-once, so the handler is guarded by the event log: if a terminal
//! event for this `step_id` already exists, the task acks without running
//! anything. A step that begins executing runs to completion; cancellation
//! is only observed before execution starts.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Task};
use crate::client::WorkflowClient;
use crate::error::{Error, Result, StepError};
use crate::event::{Event, EventKind};
use crate::model::{StepRecord, StepStatus};
use crate::runtime::registry::EngineContext;
use crate::store::{self, Storage, StepUpdate};

/// Execute one step task. Engine errors abort without appending events; the
/// broker redelivers.
pub(crate) async fn run_step<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
    run_id: &str,
    step_id: &str,
) -> Result<()>
where
    S: Storage,
    B: Broker,
{
    let Some(record) = ctx.store.get_step(step_id).await? else {
        warn!(run_id, step_id, "step task for unknown record");
        return Ok(());
    };

    // Idempotent replay protection: a terminal event means a previous
    // delivery already settled this invocation.
    if store::step_has_terminal_event(&ctx.store, run_id, step_id).await? {
        debug!(run_id, step_id, "step already terminal; duplicate delivery acked");
        return Ok(());
    }

    let now = ctx.clock.now();

    // Cooperative cancellation checkpoint before execution. Once running,
    // the step is never interrupted. Log order decides: a step whose
    // `step.started` was recorded after `cancellation.requested` was
    // deliberately scheduled during cancellation handling (a shielded
    // compensation) and must execute.
    let run = ctx.store.get_run(run_id).await?;
    let cancelled = match &run {
        Some(run) if run.status.is_terminal() => true,
        Some(_) => {
            let events = ctx.store.read_events(run_id, None).await?;
            let cancel_seq = events
                .iter()
                .find(|e| e.kind == EventKind::CancellationRequested)
                .and_then(|e| e.sequence);
            let started_seq = events
                .iter()
                .find(|e| e.kind == EventKind::StepStarted && e.step_id() == Some(step_id))
                .and_then(|e| e.sequence);
            match (cancel_seq, started_seq) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(cancel), Some(started)) => cancel > started,
            }
        }
        None => true,
    };
    if cancelled {
        info!(run_id, step_id, "step cancelled before execution");
        let event = Event::step_cancelled(
            run_id,
            now,
            step_id,
            &record.step_name,
            Some("run cancelled"),
        );
        store::append_event(&ctx.store, event).await?;
        ctx.store
            .update_step(
                step_id,
                record.status,
                StepUpdate {
                    status: Some(StepStatus::Failed),
                    error: Some("cancelled before execution".to_string()),
                    completed_at: Some(now),
                    lock: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        client.enqueue_tick(run_id, None).await?;
        return Ok(());
    }

    // Claim the step with a lease so the sweeper can recover it if this
    // worker dies mid-execution.
    let claimed = ctx
        .store
        .update_step(
            step_id,
            StepStatus::Pending,
            StepUpdate {
                status: Some(StepStatus::Running),
                started_at: record.started_at.is_none().then_some(now),
                lock: Some(Some((ctx.worker_id.clone(), now + ctx.config.step_lease))),
                ..Default::default()
            },
        )
        .await?;
    if !claimed {
        let current = ctx.store.get_step(step_id).await?;
        if current.is_some_and(|s| s.status.is_terminal()) {
            return Ok(());
        }
        return Err(Error::Conflict(format!(
            "step {step_id} is executing on another worker"
        )));
    }

    let Some(handler) = ctx.registry.step(&record.step_name).cloned() else {
        let message = format!("step '{}' is not registered", record.step_name);
        warn!(run_id, step_id, "{message}");
        return settle_failure(ctx, client, &record, now, &message, false).await;
    };

    let options = handler.options();
    info!(
        run_id,
        step_id,
        step = %record.step_name,
        attempt = record.attempt,
        "executing step"
    );

    let outcome = match tokio::time::timeout(options.timeout, handler.call(record.args.clone()))
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(StepError::retryable(format!(
            "timed out after {:?}",
            options.timeout
        ))),
    };

    let now = ctx.clock.now();
    match outcome {
        Ok(result) => {
            let event = Event::step_completed(run_id, now, step_id, &result);
            store::append_event(&ctx.store, event).await?;
            ctx.store
                .update_step(
                    step_id,
                    StepStatus::Running,
                    StepUpdate {
                        status: Some(StepStatus::Completed),
                        result: Some(result),
                        completed_at: Some(now),
                        lock: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
            client.enqueue_tick(run_id, None).await?;
            info!(run_id, step_id, step = %record.step_name, "step completed");
            Ok(())
        }
        Err(StepError::Retryable {
            message,
            retry_after,
        }) if record.attempt < record.max_retries => {
            let delay = retry_after.unwrap_or_else(|| options.retry.backoff(record.attempt));
            let retry_at = now + delay;
            let event =
                Event::step_retrying(run_id, now, step_id, record.attempt, retry_at, &message);
            store::append_event(&ctx.store, event).await?;
            ctx.store
                .update_step(
                    step_id,
                    StepStatus::Running,
                    StepUpdate {
                        status: Some(StepStatus::Pending),
                        attempt: Some(record.attempt + 1),
                        error: Some(message.clone()),
                        lock: Some(None),
                        retry_at: Some(retry_at),
                        ..Default::default()
                    },
                )
                .await?;
            ctx.broker
                .enqueue(
                    Task::RunStep {
                        run_id: run_id.to_string(),
                        step_id: step_id.to_string(),
                    },
                    Some(delay),
                )
                .await?;
            info!(
                run_id,
                step_id,
                step = %record.step_name,
                attempt = record.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "step retrying"
            );
            Ok(())
        }
        Err(err) => {
            let retryable = err.is_retryable();
            let message = match err {
                StepError::Retryable { message, .. } | StepError::Fatal { message } => message,
            };
            settle_failure(ctx, client, &record, now, &message, retryable).await
        }
    }
}

/// Record a terminal failure for the step and wake the workflow.
async fn settle_failure<S, B>(
    ctx: &Arc<EngineContext<S, B>>,
    client: &WorkflowClient<S, B>,
    record: &StepRecord,
    now: OffsetDateTime,
    message: &str,
    was_retryable: bool,
) -> Result<()>
where
    S: Storage,
    B: Broker,
{
    let event = Event::step_failed(
        &record.run_id,
        now,
        &record.step_id,
        message,
        was_retryable,
        record.attempt,
    );
    store::append_event(&ctx.store, event).await?;
    ctx.store
        .update_step(
            &record.step_id,
            StepStatus::Running,
            StepUpdate {
                status: Some(StepStatus::Failed),
                error: Some(message.to_string()),
                completed_at: Some(now),
                lock: Some(None),
                ..Default::default()
            },
        )
        .await?;
    client.enqueue_tick(&record.run_id, None).await?;
    warn!(
        run_id = %record.run_id,
        step_id = %record.step_id,
        step = %record.step_name,
        attempt = record.attempt,
        error = message,
        "step failed"
    );
    Ok(())
}
