//! Test harness: an engine over in-memory storage, an in-memory broker,
//! and a hand-advanced clock, with background workers and polling helpers.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use windlass::{
    step_fn, Event, EventKind, InMemoryBroker, ManualClock, MemoryStore, NonEmpty, ParamSpec,
    ParamType, RunStatus, RuntimeConfig, StepError, StepOptions, StepRequest, RetryPolicy,
    WorkerMode, Workflow, WorkflowCtx, WorkflowDescriptor, WorkflowEngine, WorkflowError,
    WorkflowRun,
};

pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("windlass=debug")
        .try_init();
}

/// Fast runtime config for tests.
pub fn test_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        poll_wait: Duration::from_millis(10),
        nack_delay: Duration::from_millis(10),
        sweep_interval: Duration::from_millis(25),
        wake_poll_interval: Duration::from_millis(25),
        schedule_poll_interval: Duration::from_millis(25),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Poll until the check returns `Some(T)` or the timeout expires.
pub async fn wait_until<F, Fut, T>(timeout: Duration, check: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(result) = check().await? {
            return Ok(result);
        }
        if tokio::time::Instant::now() > deadline {
            return Err(anyhow!("timeout waiting for condition"));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Assert the event kinds of a log, in order.
pub fn assert_event_kinds(events: &[Event], expected: &[EventKind]) {
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds, expected,
        "event kind sequence mismatch:\n  got:      {kinds:?}\n  expected: {expected:?}"
    );
}

/// Count events of one kind.
pub fn count_kind(events: &[Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

/// Background engine with shared store/broker/clock. Dropping the app
/// signals worker shutdown.
pub struct TestApp {
    pub engine: WorkflowEngine<MemoryStore, InMemoryBroker>,
    pub store: MemoryStore,
    pub broker: InMemoryBroker,
    pub clock: ManualClock,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestApp {
    pub fn builder() -> TestAppBuilder {
        let clock = ManualClock::new(OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap());
        TestAppBuilder {
            store: MemoryStore::new(),
            broker: InMemoryBroker::new(Arc::new(clock.clone())),
            clock,
            config: test_runtime_config(),
            register: Vec::new(),
            mode: WorkerMode::All,
        }
    }

    pub fn client(&self) -> &windlass::WorkflowClient<MemoryStore, InMemoryBroker> {
        self.engine.client()
    }

    /// Stop this app's workers (simulates losing the whole worker process).
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub async fn wait_for_status(&self, run_id: &str, status: RunStatus) -> Result<WorkflowRun> {
        let client = self.client();
        wait_until(TEST_TIMEOUT, || async {
            let run = client.get_run(run_id).await?;
            Ok((run.status == status).then_some(run))
        })
        .await
        .with_context(|| format!("waiting for {run_id} to reach {status}"))
    }

    pub async fn wait_for_terminal(&self, run_id: &str) -> Result<WorkflowRun> {
        let client = self.client();
        wait_until(TEST_TIMEOUT, || async {
            let run = client.get_run(run_id).await?;
            Ok(run.status.is_terminal().then_some(run))
        })
        .await
        .with_context(|| format!("waiting for {run_id} to reach a terminal status"))
    }

    pub async fn wait_for_event(&self, run_id: &str, kind: EventKind) -> Result<Vec<Event>> {
        let client = self.client();
        wait_until(TEST_TIMEOUT, || async {
            let events = client.events(run_id).await?;
            Ok(events.iter().any(|e| e.kind == kind).then_some(events))
        })
        .await
        .with_context(|| format!("waiting for {kind} on {run_id}"))
    }

    pub async fn events(&self, run_id: &str) -> Result<Vec<Event>> {
        Ok(self.client().events(run_id).await?)
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

type RegisterFn = Box<
    dyn FnOnce(
        windlass::EngineBuilder<MemoryStore, InMemoryBroker>,
    ) -> windlass::EngineBuilder<MemoryStore, InMemoryBroker>,
>;

pub struct TestAppBuilder {
    store: MemoryStore,
    broker: InMemoryBroker,
    clock: ManualClock,
    config: RuntimeConfig,
    register: Vec<RegisterFn>,
    mode: WorkerMode,
}

impl TestAppBuilder {
    /// Reuse another app's store/broker/clock (worker handoff tests).
    pub fn sharing(app: &TestApp) -> Self {
        TestAppBuilder {
            store: app.store.clone(),
            broker: app.broker.clone(),
            clock: app.clock.clone(),
            config: test_runtime_config(),
            register: Vec::new(),
            mode: WorkerMode::All,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with<F>(mut self, register: F) -> Self
    where
        F: FnOnce(
                windlass::EngineBuilder<MemoryStore, InMemoryBroker>,
            ) -> windlass::EngineBuilder<MemoryStore, InMemoryBroker>
            + 'static,
    {
        self.register.push(Box::new(register));
        self
    }

    /// Register the standard test workflows and steps.
    pub fn with_standard_workflows(self) -> Self {
        self.with(register_standard)
    }

    pub async fn build_and_run(self) -> Result<TestApp> {
        let mut builder = WorkflowEngine::builder(self.store.clone(), self.broker.clone())
            .clock(Arc::new(self.clock.clone()))
            .config(self.config);
        for register in self.register {
            builder = register(builder);
        }
        let engine = builder.build()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let worker_engine = engine.clone();
        let mode = self.mode;
        let handle = tokio::spawn(async move {
            let _ = worker_engine
                .run_worker(mode, async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(TestApp {
            engine,
            store: self.store,
            broker: self.broker,
            clock: self.clock,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }
}

// ---------------------------------------------------------------------------
// Standard test workflows
// ---------------------------------------------------------------------------

/// `order`: validate → charge → notify, each echoing `{ok: true}`.
pub struct OrderWorkflow;

#[async_trait]
impl Workflow for OrderWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("order")
            .param(ParamSpec::required("order_id", ParamType::String))
            .param(ParamSpec::required("amount", ParamType::Number))
    }

    async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError> {
        let validated = ctx.step("validate", input.clone())?;
        let charged = ctx.step("charge", validated)?;
        ctx.step("notify", charged)
    }
}

/// `payment`: a single charge step.
pub struct PaymentWorkflow;

#[async_trait]
impl Workflow for PaymentWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("payment").param(ParamSpec::required("id", ParamType::String))
    }

    async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError> {
        ctx.step("charge", input)
    }
}

/// `flaky`: one step that must be retried.
pub struct FlakyWorkflow;

#[async_trait]
impl Workflow for FlakyWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("flaky")
    }

    async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError> {
        ctx.step("flaky", input)
    }
}

/// `sleepy`: first → sleep 30s → second.
pub struct SleepyWorkflow;

#[async_trait]
impl Workflow for SleepyWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("sleepy")
    }

    async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError> {
        let first = ctx.step("first", input)?;
        ctx.sleep(Duration::from_secs(30))?;
        ctx.step("second", first)
    }
}

/// `approval`: waits on a hook with a 24h expiry.
pub struct ApprovalWorkflow;

#[async_trait]
impl Workflow for ApprovalWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("approval")
    }

    async fn run(&self, ctx: &WorkflowCtx, _input: Value) -> Result<Value, WorkflowError> {
        let payload = ctx.hook_with(
            "approval",
            windlass::HookOptions {
                timeout: Some(Duration::from_secs(24 * 3600)),
                schema: None,
            },
        )?;
        Ok(json!({ "approved": payload }))
    }
}

/// `fanout`: three parallel steps, results joined in input order.
pub struct FanoutWorkflow;

#[async_trait]
impl Workflow for FanoutWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("fanout")
    }

    async fn run(&self, ctx: &WorkflowCtx, _input: Value) -> Result<Value, WorkflowError> {
        let results = ctx.parallel(NonEmpty::from((
            StepRequest::new("echo", json!({"branch": "a"})),
            vec![
                StepRequest::new("echo", json!({"branch": "b"})),
                StepRequest::new("echo", json!({"branch": "c"})),
            ],
        )))?;
        Ok(Value::Array(results))
    }
}

/// `parent`: spawns two detached `approval` children, then blocks on a hook
/// that never arrives. Used for cancellation propagation.
pub struct ParentWorkflow;

#[async_trait]
impl Workflow for ParentWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("parent")
    }

    async fn run(&self, ctx: &WorkflowCtx, _input: Value) -> Result<Value, WorkflowError> {
        let first = ctx.spawn_child("approval", json!({}), windlass::CancellationPolicy::Terminate)?;
        let second = ctx.spawn_child("approval", json!({}), windlass::CancellationPolicy::Terminate)?;
        ctx.hook("block")?;
        Ok(json!({ "children": [first, second] }))
    }
}

/// `delegator`: awaits one `payment` child and returns its result.
pub struct DelegatorWorkflow;

#[async_trait]
impl Workflow for DelegatorWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("delegator")
    }

    async fn run(&self, ctx: &WorkflowCtx, _input: Value) -> Result<Value, WorkflowError> {
        let child_result = ctx.child_workflow("payment", json!({ "id": "delegated" }))?;
        Ok(json!({ "child": child_result }))
    }
}

/// `countdown`: continues-as-new until `remaining` reaches zero.
pub struct CountdownWorkflow;

#[async_trait]
impl Workflow for CountdownWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("countdown")
            .param(ParamSpec::required("remaining", ParamType::Number))
    }

    async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError> {
        let remaining = input["remaining"].as_i64().unwrap_or(0);
        let ticked = ctx.step("tick", json!({ "remaining": remaining }))?;
        if remaining > 0 {
            return Err(ctx.continue_as_new(json!({ "remaining": remaining - 1 })));
        }
        Ok(ticked)
    }
}

/// `guarded`: on cancellation, runs a shielded compensation step before
/// conceding.
pub struct GuardedWorkflow;

#[async_trait]
impl Workflow for GuardedWorkflow {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor::new("guarded")
    }

    async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError> {
        match ctx.step("reserve", input.clone()).and_then(|r| {
            ctx.hook("release")?;
            Ok(r)
        }) {
            Ok(result) => Ok(result),
            Err(WorkflowError::Cancelled { reason }) => {
                {
                    let _shield = ctx.shield();
                    ctx.step("unreserve", input)?;
                }
                Err(WorkflowError::Cancelled { reason })
            }
            Err(other) => Err(other),
        }
    }
}

/// Shared counter handle for the flaky step.
#[derive(Clone, Default)]
pub struct FailureCounter(Arc<AtomicU32>);

impl FailureCounter {
    pub fn calls(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn register_standard(
    builder: windlass::EngineBuilder<MemoryStore, InMemoryBroker>,
) -> windlass::EngineBuilder<MemoryStore, InMemoryBroker> {
    register_standard_with_counter(builder, FailureCounter::default(), 2)
}

/// Standard registrations with a configurable flaky step: fails the first
/// `failures` calls with a retryable error, then succeeds.
pub fn register_standard_with_counter(
    builder: windlass::EngineBuilder<MemoryStore, InMemoryBroker>,
    counter: FailureCounter,
    failures: u32,
) -> windlass::EngineBuilder<MemoryStore, InMemoryBroker> {
    let flaky_counter = counter.0;
    builder
        .register_workflow(OrderWorkflow)
        .register_workflow(PaymentWorkflow)
        .register_workflow(FlakyWorkflow)
        .register_workflow(SleepyWorkflow)
        .register_workflow(ApprovalWorkflow)
        .register_workflow(FanoutWorkflow)
        .register_workflow(ParentWorkflow)
        .register_workflow(DelegatorWorkflow)
        .register_workflow(CountdownWorkflow)
        .register_workflow(GuardedWorkflow)
        .register_step(step_fn("validate", |args| async move {
            Ok(json!({ "ok": true, "input": args }))
        }))
        .register_step(step_fn("charge", |args| async move {
            Ok(json!({ "ok": true, "charged": args }))
        }))
        .register_step(step_fn("notify", |_args| async move {
            Ok(json!({ "ok": true }))
        }))
        .register_step(step_fn("first", |args| async move { Ok(args) }))
        .register_step(step_fn("second", |args| async move { Ok(args) }))
        .register_step(step_fn("echo", |args| async move { Ok(args) }))
        .register_step(step_fn("tick", |args| async move { Ok(args) }))
        .register_step(step_fn("reserve", |args| async move { Ok(args) }))
        .register_step(step_fn("unreserve", |_args| async move {
            Ok(json!({ "released": true }))
        }))
        .register_step(
            step_fn("flaky", move |_args| {
                let counter = Arc::clone(&flaky_counter);
                async move {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if call <= failures {
                        Err(StepError::retryable(format!("induced failure {call}")))
                    } else {
                        Ok(json!({ "succeeded_on": call }))
                    }
                }
            })
            .with_options(StepOptions {
                max_retries: 3,
                retry: RetryPolicy::fixed(Duration::from_secs(1)),
                ..Default::default()
            }),
        )
}
