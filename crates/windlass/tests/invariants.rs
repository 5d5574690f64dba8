//! Invariant and boundary-behavior tests: log shape, idempotency, terminal
//! stickiness, recovery bounds, and worker-loss reconciliation.

mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use windlass::{
    step_fn, CancellationPolicy, Clock, Error, EventKind, RunStatus, StartOptions, StepStatus,
    Storage, Workflow, WorkflowCtx, WorkflowDescriptor, WorkflowError,
};

use support::{count_kind, init_test_tracing, TestApp, TestAppBuilder};

/// `gated`: one step that blocks until the test releases it (or forever).
struct GatedWorkflow;

#[async_trait]
impl Workflow for GatedWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("gated")
    }

    async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError> {
        ctx.step("gated_step", input)
    }
}

/// `spawner`: recursively spawns itself as a child.
struct SpawnerWorkflow;

#[async_trait]
impl Workflow for SpawnerWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("spawner")
    }

    async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError> {
        let child = ctx.child_workflow("spawner", input)?;
        Ok(json!({ "child": child }))
    }
}

#[tokio::test]
async fn event_log_is_gapless_and_steps_settle_once() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("order", json!({ "order_id": "A", "amount": 3 }), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_terminal(&run_id).await?;

    let events = app.events(&run_id).await?;

    // Monotonic log: sequences are 1..N with no gaps.
    let sequences: Vec<u64> = events.iter().filter_map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=events.len() as u64).collect();
    assert_eq!(sequences, expected);

    // At-most-once: each step_id has exactly one terminal event.
    let mut terminal_by_step = std::collections::HashMap::new();
    for event in events.iter().filter(|e| e.kind.is_step_terminal()) {
        *terminal_by_step
            .entry(event.step_id().unwrap().to_string())
            .or_insert(0u32) += 1;
    }
    assert_eq!(terminal_by_step.len(), 3);
    assert!(terminal_by_step.values().all(|count| *count == 1));

    // Result and error are mutually exclusive on the record.
    let run = app.client().get_run(&run_id).await?;
    assert!(run.result.is_some() && run.error.is_none());

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn terminal_status_is_sticky() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("payment", json!({ "id": "p9" }), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_terminal(&run_id).await?;
    let events_before = app.events(&run_id).await?;

    // Cancelling a completed run is ignored entirely.
    app.client().cancel(&run_id, Some("too late")).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let run = app.client().get_run(&run_id).await?;
    assert_eq!(run.status, RunStatus::Completed);
    let events_after = app.events(&run_id).await?;
    assert_eq!(events_before.len(), events_after.len());
    assert_eq!(count_kind(&events_after, EventKind::CancellationRequested), 0);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn replay_is_deterministic_across_redundant_ticks() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("approval", json!({}), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_status(&run_id, RunStatus::Suspended).await?;
    let baseline = app.events(&run_id).await?;

    // Re-ticking a suspended run any number of times adds nothing.
    for _ in 0..3 {
        assert!(app.client().resume(&run_id).await?);
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    let run = app.client().get_run(&run_id).await?;
    assert_eq!(run.status, RunStatus::Suspended);
    let events = app.events(&run_id).await?;
    assert_eq!(events.len(), baseline.len());

    // The run still finishes normally afterwards.
    app.client().signal_hook(&run_id, "approval", json!({"ok": 1})).await?;
    app.wait_for_terminal(&run_id).await?;

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn api_errors_surface_their_kinds() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    // Unknown workflow.
    let err = app
        .client()
        .start("nope", json!({}), StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownWorkflow(_)));

    // Descriptor validation.
    let err = app
        .client()
        .start("order", json!({ "amount": 7 }), StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = app
        .client()
        .start("order", json!({ "order_id": 9, "amount": 7 }), StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // Unknown run and hook.
    let err = app.client().cancel("run_missing", None).await.unwrap_err();
    assert!(matches!(err, Error::RunNotFound(_)));

    let run_id = app
        .client()
        .start("payment", json!({ "id": "p1" }), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_terminal(&run_id).await?;
    let err = app
        .client()
        .signal_hook(&run_id, "nonexistent", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HookNotFound { .. }));

    // Resume is a no-op off SUSPENDED.
    assert!(!app.client().resume(&run_id).await?);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn expired_claim_recovers_within_bounds() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("approval", json!({}), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_status(&run_id, RunStatus::Suspended).await?;

    // A worker claimed the run and died without releasing.
    app.store
        .claim_run(&run_id, "dead-worker", Duration::from_secs(5), app.clock.now())
        .await?;
    app.clock.advance(Duration::from_secs(6));

    let run = support::wait_until(support::TEST_TIMEOUT, || async {
        let run = app.client().get_run(&run_id).await?;
        Ok((run.recovery_attempts == 1).then_some(run))
    })
    .await?;
    assert!(run.recovery_attempts <= run.max_recovery_attempts);
    assert_eq!(run.status, RunStatus::Suspended);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn recovery_exhaustion_interrupts_the_run() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("approval", json!({}), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_status(&run_id, RunStatus::Suspended).await?;

    app.store.set_recovery_attempts(&run_id, 3).await?;
    app.store
        .claim_run(&run_id, "dead-worker", Duration::from_secs(5), app.clock.now())
        .await?;
    app.clock.advance(Duration::from_secs(6));

    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Interrupted);
    assert_eq!(run.recovery_attempts, 3);
    assert!(run.error.as_deref().unwrap().contains("recovery"));

    let events = app.events(&run_id).await?;
    assert_eq!(count_kind(&events, EventKind::WorkflowInterrupted), 1);

    // Terminal stickiness holds for INTERRUPTED too.
    app.client().cancel(&run_id, None).await?;
    tokio::time::sleep(Duration::from_millis(80)).await;
    let run = app.client().get_run(&run_id).await?;
    assert_eq!(run.status, RunStatus::Interrupted);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn lost_step_lease_is_reexecuted_elsewhere() -> Result<()> {
    init_test_tracing();

    // First worker's gated step blocks forever (a hung worker).
    let blocked = TestApp::builder()
        .with(|b| {
            b.register_workflow(GatedWorkflow)
                .register_step(step_fn("gated_step", |_args| async move {
                    std::future::pending::<()>().await;
                    unreachable!()
                }))
        })
        .config(windlass::RuntimeConfig {
            step_lease: Duration::from_secs(30),
            ..support::test_runtime_config()
        })
        .build_and_run()
        .await?;

    let run_id = blocked
        .client()
        .start("gated", json!({}), StartOptions::default())
        .await?
        .run_id;

    // The step is claimed and stuck executing.
    let step = support::wait_until(support::TEST_TIMEOUT, || async {
        let steps = blocked.client().steps(&run_id).await?;
        Ok(steps.into_iter().find(|s| s.status == StepStatus::Running))
    })
    .await?;
    assert!(step.locked_by.is_some());

    // A healthy worker joins the fleet; its version of the step succeeds.
    let healthy = TestAppBuilder::sharing(&blocked)
        .with(|b| {
            b.register_workflow(GatedWorkflow)
                .register_step(step_fn("gated_step", |_args| async move {
                    Ok(json!({ "rescued": true }))
                }))
        })
        .build_and_run()
        .await?;
    blocked.shutdown().await;

    healthy.clock.advance(Duration::from_secs(31));

    let run = healthy.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result.unwrap()["rescued"], json!(true));

    let events = healthy.events(&run_id).await?;
    assert_eq!(count_kind(&events, EventKind::StepStarted), 1);
    assert_eq!(count_kind(&events, EventKind::StepCompleted), 1);

    healthy.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn crash_between_terminal_event_and_tick_is_reconciled() -> Result<()> {
    init_test_tracing();

    let blocked = TestApp::builder()
        .with(|b| {
            b.register_workflow(GatedWorkflow)
                .register_step(step_fn("gated_step", |_args| async move {
                    std::future::pending::<()>().await;
                    unreachable!()
                }))
        })
        .config(windlass::RuntimeConfig {
            step_lease: Duration::from_secs(30),
            ..support::test_runtime_config()
        })
        .build_and_run()
        .await?;

    let run_id = blocked
        .client()
        .start("gated", json!({}), StartOptions::default())
        .await?
        .run_id;
    let step = support::wait_until(support::TEST_TIMEOUT, || async {
        let steps = blocked.client().steps(&run_id).await?;
        Ok(steps.into_iter().find(|s| s.status == StepStatus::Running))
    })
    .await?;

    // The dying worker managed to append step.completed but never settled
    // the record or enqueued the follow-up tick.
    let completed = windlass::Event::step_completed(
        &run_id,
        blocked.clock.now(),
        &step.step_id,
        &json!({ "ok": true }),
    );
    windlass::store::append_event(&blocked.store, completed).await?;

    let rescuer = TestAppBuilder::sharing(&blocked)
        .with(|b| {
            b.register_workflow(GatedWorkflow)
                .register_step(step_fn("gated_step", |_args| async move {
                    Err(windlass::StepError::fatal("must not re-execute"))
                }))
        })
        .build_and_run()
        .await?;
    blocked.shutdown().await;

    rescuer.clock.advance(Duration::from_secs(31));

    // The sweeper reconciles against the log and re-ticks; the body
    // advances exactly once past the step without re-executing it.
    let run = rescuer.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result.unwrap()["ok"], json!(true));

    let events = rescuer.events(&run_id).await?;
    assert_eq!(count_kind(&events, EventKind::StepCompleted), 1);
    assert_eq!(count_kind(&events, EventKind::StepFailed), 0);

    // The sweeper reconciles the record against the log shortly after.
    support::wait_until(support::TEST_TIMEOUT, || async {
        let steps = rescuer.client().steps(&run_id).await?;
        Ok((steps[0].status == StepStatus::Completed).then_some(()))
    })
    .await?;

    rescuer.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn nesting_limit_bounds_child_spawns() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder()
        .with(|b| b.register_workflow(SpawnerWorkflow))
        .config(windlass::RuntimeConfig {
            nesting_limit: 1,
            ..support::test_runtime_config()
        })
        .build_and_run()
        .await?;

    let root_id = app
        .client()
        .start("spawner", json!({}), StartOptions::default())
        .await?
        .run_id;

    // The root may spawn (depth 1); the child's own spawn (depth 2) is a
    // fatal child-start error that propagates up as a child failure.
    let root = app.wait_for_terminal(&root_id).await?;
    assert_eq!(root.status, RunStatus::Failed);
    assert!(root.error.as_deref().unwrap().contains("failed"));

    let children = app.client().children(&root_id).await?;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, RunStatus::Failed);
    assert!(children[0]
        .error
        .as_deref()
        .unwrap()
        .contains("nesting limit"));
    assert!(children[0].nesting_depth <= 1);

    // The public API enforces the same bound directly.
    let err = app
        .client()
        .start(
            "spawner",
            json!({}),
            StartOptions {
                parent_run_id: Some(children[0].run_id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NestingLimit { .. }));

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn abandoned_children_outlive_parent_cancellation() -> Result<()> {
    init_test_tracing();

    struct AbandoningParent;

    #[async_trait]
    impl Workflow for AbandoningParent {
        fn descriptor(&self) -> WorkflowDescriptor {
            WorkflowDescriptor::new("abandoning_parent")
        }

        async fn run(&self, ctx: &WorkflowCtx, _input: Value) -> Result<Value, WorkflowError> {
            let child = ctx.spawn_child("approval", json!({}), CancellationPolicy::Abandon)?;
            ctx.hook("block")?;
            Ok(json!({ "child": child }))
        }
    }

    let app = TestApp::builder()
        .with_standard_workflows()
        .with(|b| b.register_workflow(AbandoningParent))
        .build_and_run()
        .await?;

    let parent_id = app
        .client()
        .start("abandoning_parent", json!({}), StartOptions::default())
        .await?
        .run_id;

    let children = support::wait_until(support::TEST_TIMEOUT, || async {
        let children = app.client().children(&parent_id).await?;
        Ok((children.len() == 1
            && children[0].status == RunStatus::Suspended)
        .then_some(children))
    })
    .await?;

    app.client().cancel(&parent_id, Some("user")).await?;
    let parent = app.wait_for_terminal(&parent_id).await?;
    assert_eq!(parent.status, RunStatus::Cancelled);

    // The abandoned child is untouched and still signalable.
    let child = app.client().get_run(&children[0].run_id).await?;
    assert_eq!(child.status, RunStatus::Suspended);
    let child_events = app.events(&child.run_id).await?;
    assert_eq!(count_kind(&child_events, EventKind::CancellationRequested), 0);

    assert!(app
        .client()
        .signal_hook(&child.run_id, "approval", json!({"late": true}))
        .await?);
    let child = app.wait_for_terminal(&child.run_id).await?;
    assert_eq!(child.status, RunStatus::Completed);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancel_during_sleep_defuses_the_wake() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("sleepy", json!({}), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_status(&run_id, RunStatus::Suspended).await?;

    app.client().cancel(&run_id, Some("user")).await?;
    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Cancelled);

    let settled = app.events(&run_id).await?;
    assert_eq!(count_kind(&settled, EventKind::SleepStarted), 1);
    assert_eq!(count_kind(&settled, EventKind::SleepCompleted), 0);

    // When the original wake time passes, nothing stirs: the wake was
    // cancelled with the run, and any straggler tick is a no-op.
    app.clock.advance(Duration::from_secs(31));
    tokio::time::sleep(Duration::from_millis(150)).await;

    let after = app.events(&run_id).await?;
    assert_eq!(settled.len(), after.len());
    let run = app.client().get_run(&run_id).await?;
    assert_eq!(run.status, RunStatus::Cancelled);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn hook_expiry_raises_into_the_body() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("approval", json!({}), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_status(&run_id, RunStatus::Suspended).await?;

    app.clock.advance(Duration::from_secs(24 * 3600 + 1));

    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("expired"));

    let events = app.events(&run_id).await?;
    assert_eq!(count_kind(&events, EventKind::HookExpired), 1);
    assert_eq!(count_kind(&events, EventKind::HookReceived), 0);

    // Late signal is rejected.
    assert!(!app.client().signal_hook(&run_id, "approval", json!({})).await?);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn fatal_step_failure_fails_the_run_without_retries() -> Result<()> {
    init_test_tracing();

    struct FatalWorkflow;

    #[async_trait]
    impl Workflow for FatalWorkflow {
        fn descriptor(&self) -> WorkflowDescriptor {
            WorkflowDescriptor::new("fatal")
        }

        async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError> {
            ctx.step("explode", input)
        }
    }

    let app = TestApp::builder()
        .with(|b| {
            b.register_workflow(FatalWorkflow)
                .register_step(step_fn("explode", |_args| async move {
                    Err(windlass::StepError::fatal("unrecoverable"))
                }))
        })
        .build_and_run()
        .await?;

    let run_id = app
        .client()
        .start("fatal", json!({}), StartOptions::default())
        .await?
        .run_id;

    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("unrecoverable"));

    let events = app.events(&run_id).await?;
    assert_eq!(count_kind(&events, EventKind::StepRetrying), 0);
    assert_eq!(count_kind(&events, EventKind::StepFailed), 1);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn hook_signal_recorded_before_body_reaches_the_await() -> Result<()> {
    init_test_tracing();

    // The body does slow work in parallel with the hook's lifetime: the
    // hook is created on the first tick, the signal lands while the step
    // is still in flight, and the await returns immediately afterwards.
    struct EagerSignalWorkflow;

    #[async_trait]
    impl Workflow for EagerSignalWorkflow {
        fn descriptor(&self) -> WorkflowDescriptor {
            WorkflowDescriptor::new("eager_signal")
        }

        async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError> {
            let slow = ctx.step("slow", input)?;
            let payload = ctx.hook("go")?;
            Ok(json!({ "slow": slow, "payload": payload }))
        }
    }

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let step_gate = Arc::clone(&gate);

    let app = TestApp::builder()
        .with(move |b| {
            b.register_workflow(EagerSignalWorkflow)
                .register_step(step_fn("slow", move |_args| {
                    let gate = Arc::clone(&step_gate);
                    async move {
                        let _permit = gate.acquire().await;
                        Ok(json!({ "done": true }))
                    }
                }))
        })
        .build_and_run()
        .await?;

    let run_id = app
        .client()
        .start("eager_signal", json!({}), StartOptions::default())
        .await?
        .run_id;

    // Step in flight; the hook does not exist yet, so a signal 404s.
    support::wait_until(support::TEST_TIMEOUT, || async {
        let steps = app.client().steps(&run_id).await?;
        Ok(steps.iter().any(|s| s.status == StepStatus::Running).then_some(()))
    })
    .await?;
    let err = app.client().signal_hook(&run_id, "go", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::HookNotFound { .. }));

    // Let the step finish; the hook gets created and the run suspends.
    gate.add_permits(1);
    app.wait_for_status(&run_id, RunStatus::Suspended).await?;

    assert!(app.client().signal_hook(&run_id, "go", json!({"n": 7})).await?);
    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result.unwrap()["payload"]["n"], json!(7));

    app.shutdown().await;
    Ok(())
}
