//! End-to-end scenarios over the in-memory store and broker.

mod support;

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use windlass::{
    Cadence, EventKind, RunStatus, StartOptions, Task,
};

use support::{
    assert_event_kinds, count_kind, init_test_tracing, FailureCounter, TestApp, TestAppBuilder,
};

#[tokio::test]
async fn three_step_run_completes_with_ordered_log() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let outcome = app
        .client()
        .start(
            "order",
            json!({ "order_id": "A", "amount": 10 }),
            StartOptions::default(),
        )
        .await?;
    assert!(outcome.created);

    let run = app.wait_for_terminal(&outcome.run_id).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.error.is_none());
    assert_eq!(run.result.as_ref().unwrap()["ok"], json!(true));

    let events = app.events(&outcome.run_id).await?;
    assert_event_kinds(
        &events,
        &[
            EventKind::WorkflowStarted,
            EventKind::StepStarted,
            EventKind::StepCompleted,
            EventKind::StepStarted,
            EventKind::StepCompleted,
            EventKind::StepStarted,
            EventKind::StepCompleted,
            EventKind::WorkflowCompleted,
        ],
    );

    // The three step.started events are validate, charge, notify in order.
    let step_names: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::StepStarted)
        .filter_map(|e| e.data_str("step_name"))
        .collect();
    assert_eq!(step_names, vec!["validate", "charge", "notify"]);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn retry_twice_then_succeed() -> Result<()> {
    init_test_tracing();
    let counter = FailureCounter::default();
    let handler_counter = counter.clone();
    let app = TestApp::builder()
        .with(move |b| support::register_standard_with_counter(b, handler_counter, 2))
        .build_and_run()
        .await?;

    let run_id = app
        .client()
        .start("flaky", json!({}), StartOptions::default())
        .await?
        .run_id;

    // Each retry is redelivered after a 1s (clock-driven) backoff.
    app.wait_for_event(&run_id, EventKind::StepRetrying).await?;
    app.clock.advance(Duration::from_secs(2));
    support::wait_until(support::TEST_TIMEOUT, || async {
        let events = app.events(&run_id).await?;
        Ok((count_kind(&events, EventKind::StepRetrying) >= 2).then_some(()))
    })
    .await?;
    app.clock.advance(Duration::from_secs(2));

    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Completed);

    let events = app.events(&run_id).await?;
    assert_eq!(count_kind(&events, EventKind::StepRetrying), 2);
    assert_eq!(count_kind(&events, EventKind::StepCompleted), 1);
    assert_eq!(count_kind(&events, EventKind::StepFailed), 0);

    let attempts: Vec<u64> = events
        .iter()
        .filter(|e| e.kind == EventKind::StepRetrying)
        .filter_map(|e| e.data["attempt"].as_u64())
        .collect();
    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(counter.calls(), 3);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn sleep_survives_worker_handoff() -> Result<()> {
    init_test_tracing();
    let first_worker = TestApp::builder()
        .with_standard_workflows()
        .build_and_run()
        .await?;

    let run_id = first_worker
        .client()
        .start("sleepy", json!({}), StartOptions::default())
        .await?
        .run_id;

    first_worker.wait_for_status(&run_id, RunStatus::Suspended).await?;
    let events = first_worker.events(&run_id).await?;
    assert_eq!(count_kind(&events, EventKind::SleepStarted), 1);
    assert_eq!(count_kind(&events, EventKind::SleepCompleted), 0);

    // Kill the worker mid-sleep; a fresh worker over the same storage and
    // broker picks the run up when the wake comes due.
    let clock = first_worker.clock.clone();
    let second_worker = TestAppBuilder::sharing(&first_worker)
        .with_standard_workflows()
        .build_and_run()
        .await?;
    first_worker.shutdown().await;

    clock.advance(Duration::from_secs(31));

    let run = second_worker.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Completed);

    let events = second_worker.events(&run_id).await?;
    assert_eq!(count_kind(&events, EventKind::SleepStarted), 1);
    assert_eq!(count_kind(&events, EventKind::SleepCompleted), 1);

    let started = events
        .iter()
        .find(|e| e.kind == EventKind::SleepStarted)
        .unwrap();
    let completed = events
        .iter()
        .find(|e| e.kind == EventKind::SleepCompleted)
        .unwrap();
    assert!(completed.timestamp >= started.timestamp + Duration::from_secs(30));
    assert!(completed.sequence > started.sequence);

    // The second step ran exactly once, after the sleep.
    let second_steps: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::StepStarted && e.data_str("step_name") == Some("second"))
        .collect();
    assert_eq!(second_steps.len(), 1);

    second_worker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn idempotent_start_collapses_duplicates() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let options = || StartOptions {
        idempotency_key: Some("pay-p1".to_string()),
        ..Default::default()
    };

    let (first, second) = tokio::join!(
        app.client().start("payment", json!({ "id": "p1" }), options()),
        app.client().start("payment", json!({ "id": "p1" }), options()),
    );
    let first = first?;
    let second = second?;

    assert_eq!(first.run_id, second.run_id);
    assert!(first.created != second.created, "exactly one call creates");

    app.wait_for_terminal(&first.run_id).await?;
    let events = app.events(&first.run_id).await?;
    assert_eq!(count_kind(&events, EventKind::WorkflowStarted), 1);

    // A later duplicate still returns the same run.
    let third = app
        .client()
        .start("payment", json!({ "id": "p1" }), options())
        .await?;
    assert_eq!(third.run_id, first.run_id);
    assert!(!third.created);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancel_suspended_run_disposes_pending_hook() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("approval", json!({}), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_status(&run_id, RunStatus::Suspended).await?;

    app.client().cancel(&run_id, Some("user")).await?;

    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Cancelled);

    let events = app.events(&run_id).await?;
    assert_eq!(count_kind(&events, EventKind::CancellationRequested), 1);
    assert_eq!(count_kind(&events, EventKind::WorkflowCancelled), 1);
    assert_eq!(count_kind(&events, EventKind::HookReceived), 0);
    assert_eq!(count_kind(&events, EventKind::HookDisposed), 1);

    let hooks = app.client().hooks(&run_id).await?;
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].status, windlass::HookStatus::Disposed);

    // A signal after disposal is rejected, not accepted.
    let accepted = app.client().signal_hook(&run_id, "approval", json!({})).await?;
    assert!(!accepted);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn parent_cancellation_terminates_children_first() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let parent_id = app
        .client()
        .start("parent", json!({}), StartOptions::default())
        .await?
        .run_id;

    // Both children spawned and suspended on their hooks.
    let children = support::wait_until(support::TEST_TIMEOUT, || async {
        let children = app.client().children(&parent_id).await?;
        Ok((children.len() == 2
            && children.iter().all(|c| c.status == RunStatus::Suspended))
        .then_some(children))
    })
    .await?;

    app.client().cancel(&parent_id, Some("user")).await?;

    let parent = app.wait_for_terminal(&parent_id).await?;
    assert_eq!(parent.status, RunStatus::Cancelled);

    for child in &children {
        let child_run = app.client().get_run(&child.run_id).await?;
        assert_eq!(child_run.status, RunStatus::Cancelled);
        assert_eq!(child_run.nesting_depth, parent.nesting_depth + 1);
        assert_eq!(child_run.parent_run_id.as_deref(), Some(parent_id.as_str()));

        let child_events = app.events(&child.run_id).await?;
        assert_eq!(count_kind(&child_events, EventKind::CancellationRequested), 1);
        assert_eq!(count_kind(&child_events, EventKind::WorkflowCancelled), 1);
    }

    // Ordering: both child-terminal events precede the parent's own
    // workflow.cancelled on the parent log.
    let parent_events = app.events(&parent_id).await?;
    let cancelled_seq = parent_events
        .iter()
        .find(|e| e.kind == EventKind::WorkflowCancelled)
        .and_then(|e| e.sequence)
        .unwrap();
    let child_terminal_seqs: Vec<u64> = parent_events
        .iter()
        .filter(|e| e.kind == EventKind::ChildWorkflowCancelled)
        .filter_map(|e| e.sequence)
        .collect();
    assert_eq!(child_terminal_seqs.len(), 2);
    assert!(child_terminal_seqs.iter().all(|seq| *seq < cancelled_seq));

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn hook_signal_resumes_with_payload() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("approval", json!({}), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_status(&run_id, RunStatus::Suspended).await?;

    let accepted = app
        .client()
        .signal_hook(&run_id, "approval", json!({ "by": "alice" }))
        .await?;
    assert!(accepted);

    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result.unwrap()["approved"]["by"], json!("alice"));

    // The second signal is rejected and writes no second event.
    let again = app
        .client()
        .signal_hook(&run_id, "approval", json!({ "by": "bob" }))
        .await?;
    assert!(!again);
    let events = app.events(&run_id).await?;
    assert_eq!(count_kind(&events, EventKind::HookReceived), 1);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn parallel_steps_join_in_input_order() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("fanout", json!({}), StartOptions::default())
        .await?
        .run_id;

    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        run.result.unwrap(),
        json!([{"branch": "a"}, {"branch": "b"}, {"branch": "c"}])
    );

    // All three branches launched before any completed: the three
    // step.started events are contiguous at the head of the step log.
    let events = app.events(&run_id).await?;
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).take(4).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::WorkflowStarted,
            EventKind::StepStarted,
            EventKind::StepStarted,
            EventKind::StepStarted,
        ]
    );
    assert_eq!(count_kind(&events, EventKind::StepCompleted), 3);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn child_workflow_result_returns_to_parent() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("delegator", json!({}), StartOptions::default())
        .await?
        .run_id;

    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result.unwrap()["child"]["ok"], json!(true));

    let events = app.events(&run_id).await?;
    assert_eq!(count_kind(&events, EventKind::ChildWorkflowStarted), 1);
    assert_eq!(count_kind(&events, EventKind::ChildWorkflowCompleted), 1);

    let children = app.client().children(&run_id).await?;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].workflow_name, "payment");
    assert_eq!(children[0].status, RunStatus::Completed);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn continue_as_new_chains_runs() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let root_id = app
        .client()
        .start("countdown", json!({ "remaining": 2 }), StartOptions::default())
        .await?
        .run_id;

    // Follow the continuation chain to the final run.
    let mut current = app.wait_for_terminal(&root_id).await?;
    let mut hops = 0;
    while let Some(next) = current.continued_to.clone() {
        current = app.wait_for_terminal(&next).await?;
        hops += 1;
        assert!(hops <= 3, "continuation chain too long");
    }

    assert_eq!(hops, 2);
    assert_eq!(current.status, RunStatus::Completed);
    assert_eq!(current.result.unwrap()["remaining"], json!(0));
    // A continuation resets history: fresh log, same depth as the root.
    assert_eq!(current.nesting_depth, 0);

    let root_events = app.events(&root_id).await?;
    assert_eq!(count_kind(&root_events, EventKind::WorkflowContinuedAsNew), 1);
    let final_events = app.events(&current.run_id).await?;
    assert_eq!(count_kind(&final_events, EventKind::WorkflowStarted), 1);
    assert_eq!(count_kind(&final_events, EventKind::WorkflowContinuedAsNew), 0);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shielded_compensation_runs_before_cancel_lands() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("guarded", json!({}), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_status(&run_id, RunStatus::Suspended).await?;

    app.client().cancel(&run_id, Some("user")).await?;

    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Cancelled);

    let events = app.events(&run_id).await?;
    // The compensation step ran to completion under the shield.
    let unreserve_completed = events.iter().any(|e| {
        e.kind == EventKind::StepStarted && e.data_str("step_name") == Some("unreserve")
    });
    assert!(unreserve_completed);
    assert_eq!(count_kind(&events, EventKind::StepCompleted), 2);
    assert_eq!(count_kind(&events, EventKind::WorkflowCancelled), 1);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn run_timeout_requests_cancellation() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start(
            "approval",
            json!({}),
            StartOptions {
                max_duration: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        )
        .await?
        .run_id;
    app.wait_for_status(&run_id, RunStatus::Suspended).await?;

    app.clock.advance(Duration::from_secs(61));

    let run = app.wait_for_terminal(&run_id).await?;
    assert_eq!(run.status, RunStatus::Cancelled);

    let events = app.events(&run_id).await?;
    let request = events
        .iter()
        .find(|e| e.kind == EventKind::CancellationRequested)
        .unwrap();
    assert_eq!(request.data_str("reason"), Some("max_duration exceeded"));

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn interval_schedule_fires_with_collapsing_keys() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    app.client()
        .create_schedule(
            "payment",
            json!({ "id": "scheduled" }),
            Cadence::Interval { interval_ms: 60_000 },
        )
        .await?;

    // Nothing fires before the first due time.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(app.client().list_runs(&windlass::RunFilter::new()).await?.is_empty());

    app.clock.advance(Duration::from_secs(61));
    let first = support::wait_until(support::TEST_TIMEOUT, || async {
        let runs = app.client().list_runs(&windlass::RunFilter::new()).await?;
        Ok((!runs.is_empty()).then_some(runs))
    })
    .await?;
    assert_eq!(first.len(), 1);
    assert!(first[0]
        .idempotency_key
        .as_deref()
        .unwrap()
        .starts_with("sched_"));
    app.wait_for_terminal(&first[0].run_id).await?;

    // The next interval produces a second, distinct firing.
    app.clock.advance(Duration::from_secs(61));
    support::wait_until(support::TEST_TIMEOUT, || async {
        let runs = app.client().list_runs(&windlass::RunFilter::new()).await?;
        Ok((runs.len() == 2).then_some(()))
    })
    .await?;

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_tick_delivery_is_a_noop() -> Result<()> {
    init_test_tracing();
    let app = TestApp::builder().with_standard_workflows().build_and_run().await?;

    let run_id = app
        .client()
        .start("order", json!({ "order_id": "B", "amount": 1 }), StartOptions::default())
        .await?
        .run_id;
    app.wait_for_terminal(&run_id).await?;
    let before = app.events(&run_id).await?;

    // Redeliver a tick for the already-terminal run.
    use windlass::Broker as _;
    app.broker
        .enqueue(
            Task::WorkflowTick {
                run_id: run_id.clone(),
            },
            None,
        )
        .await?;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let after = app.events(&run_id).await?;
    assert_eq!(before.len(), after.len(), "duplicate tick appended events");

    app.shutdown().await;
    Ok(())
}
