//! Public API: start, cancel, signal hooks, resume, and queries.
//!
//! All operations are stateless with respect to the caller; a
//! [`WorkflowClient`] can be cloned freely and used from any process that
//! shares the storage and broker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::broker::{Broker, Task};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::ids;
use crate::model::{
    Cadence, HookRecord, HookStatus, RunStatus, ScheduleSpec, StepRecord, WakeEntry, WakeKind,
    WorkflowRun,
};
use crate::runtime::registry::EngineContext;
use crate::store::{self, CreateRunOutcome, RunFilter, Storage};

/// Options for [`WorkflowClient::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Collapses duplicate starts: a second start with the same
    /// `(workflow_name, idempotency_key)` returns the existing run.
    pub idempotency_key: Option<String>,
    /// Start as a child of an existing run. Subject to the nesting limit.
    pub parent_run_id: Option<String>,
    /// Wall-clock budget; overrides the descriptor default.
    pub max_duration: Option<Duration>,
    pub tags: Vec<String>,
    pub metadata: Option<Value>,
}

/// Result of a start call.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub run_id: String,
    /// `false` when an idempotency key collapsed this start into an
    /// existing run.
    pub created: bool,
}

/// Handle for the public engine API.
pub struct WorkflowClient<S, B> {
    ctx: Arc<EngineContext<S, B>>,
}

impl<S, B> Clone for WorkflowClient<S, B> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<S, B> WorkflowClient<S, B>
where
    S: Storage,
    B: Broker,
{
    pub(crate) fn new(ctx: Arc<EngineContext<S, B>>) -> Self {
        Self { ctx }
    }

    /// Start a run of a registered workflow.
    ///
    /// Validates the input against the workflow's descriptor, persists the
    /// run and its `workflow.started` event, schedules the run-timeout wake
    /// when a `max_duration` applies, and enqueues the first workflow-tick.
    ///
    /// With an idempotency key, a duplicate start returns the existing
    /// `run_id` and makes no other changes.
    pub async fn start(
        &self,
        workflow_name: &str,
        input: Value,
        options: StartOptions,
    ) -> Result<StartOutcome> {
        let descriptor = self
            .ctx
            .registry
            .workflow(workflow_name)
            .ok_or_else(|| Error::UnknownWorkflow(workflow_name.to_string()))?
            .descriptor();

        let input = descriptor.validate(&input).map_err(Error::Validation)?;
        let now = self.ctx.clock.now();

        let (parent_run_id, nesting_depth) = match &options.parent_run_id {
            Some(parent_id) => {
                let parent = self.require_run(parent_id).await?;
                let depth = parent.nesting_depth + 1;
                if depth > self.ctx.config.nesting_limit {
                    return Err(Error::NestingLimit {
                        depth,
                        limit: self.ctx.config.nesting_limit,
                    });
                }
                (Some(parent.run_id), depth)
            }
            None => (None, 0),
        };

        let mut run = WorkflowRun::new(ids::new_run_id(), workflow_name, input, now);
        run.idempotency_key = options.idempotency_key;
        run.parent_run_id = parent_run_id;
        run.nesting_depth = nesting_depth;
        run.max_duration_ms = options
            .max_duration
            .map(|d| d.as_millis() as u64)
            .or(descriptor.max_duration_ms);
        run.max_recovery_attempts = descriptor.max_recovery_attempts;
        run.tags = options.tags;
        if let Some(metadata) = options.metadata {
            run.metadata = metadata;
        }

        self.create_and_start_run(run).await
    }

    /// Persist a fully-formed run, record `workflow.started`, and enqueue
    /// its first tick. Shared by `start`, child spawns, and continuations.
    pub(crate) async fn create_and_start_run(&self, run: WorkflowRun) -> Result<StartOutcome> {
        let now = run.created_at;
        let run_id = run.run_id.clone();
        let workflow_name = run.workflow_name.clone();
        let input = run.input.clone();
        let metadata = run.metadata.clone();
        let max_duration_ms = run.max_duration_ms;

        match self.ctx.store.create_run(run).await? {
            CreateRunOutcome::Existing(existing) => {
                debug!(
                    run_id = %existing.run_id,
                    workflow = %workflow_name,
                    "start collapsed by idempotency key"
                );
                return Ok(StartOutcome {
                    run_id: existing.run_id,
                    created: false,
                });
            }
            CreateRunOutcome::Created => {}
        }

        let started =
            Event::workflow_started(&run_id, now, &workflow_name, &input, &metadata);
        store::append_event(&self.ctx.store, started).await?;

        if let Some(ms) = max_duration_ms {
            self.ctx
                .store
                .schedule_wake(WakeEntry {
                    run_id: run_id.clone(),
                    wake_at: now + Duration::from_millis(ms),
                    kind: WakeKind::RunTimeout,
                })
                .await?;
        }

        self.enqueue_tick(&run_id, None).await?;
        info!(run_id = %run_id, workflow = %workflow_name, "workflow run started");

        Ok(StartOutcome {
            run_id,
            created: true,
        })
    }

    /// Request cooperative cancellation of a run.
    ///
    /// Appends `cancellation.requested` (once) and, when the run is parked,
    /// enqueues an immediate tick so the request is observed without
    /// waiting for another wake source. Terminal runs are ignored.
    pub async fn cancel(&self, run_id: &str, reason: Option<&str>) -> Result<()> {
        let run = self.require_run(run_id).await?;
        if run.status.is_terminal() {
            debug!(run_id, "cancel ignored: run already terminal");
            return Ok(());
        }

        let events = self.ctx.store.read_events(run_id, None).await?;
        let already_requested = events
            .iter()
            .any(|e| e.kind == EventKind::CancellationRequested);

        if !already_requested {
            let now = self.ctx.clock.now();
            let event = Event::cancellation_requested(run_id, now, reason);
            store::append_event(&self.ctx.store, event).await?;
            info!(run_id, reason = reason.unwrap_or(""), "cancellation requested");
        }

        if matches!(run.status, RunStatus::Suspended | RunStatus::Pending) {
            self.enqueue_tick(run_id, None).await?;
        }
        Ok(())
    }

    /// Deliver an external signal to a hook, by name or by hook id.
    ///
    /// Returns `Ok(true)` when the payload was accepted (the hook moved
    /// PENDING→RECEIVED and a tick was enqueued), `Ok(false)` when the hook
    /// exists but is no longer pending, and [`Error::HookNotFound`] when no
    /// such hook exists for the run.
    pub async fn signal_hook(
        &self,
        run_id: &str,
        hook: &str,
        payload: Value,
    ) -> Result<bool> {
        self.require_run(run_id).await?;

        let record = self.resolve_hook(run_id, hook).await?;
        if record.status != HookStatus::Pending {
            debug!(run_id, hook_id = %record.hook_id, status = %record.status, "signal rejected");
            return Ok(false);
        }

        let now = self.ctx.clock.now();
        let accepted = self
            .ctx
            .store
            .transition_hook(&record.hook_id, HookStatus::Received, Some(payload.clone()), now)
            .await?;
        if !accepted {
            // Lost the CAS to a concurrent signal or expiry.
            return Ok(false);
        }

        let event = Event::hook_received(run_id, now, &record.hook_id, &payload);
        store::append_event(&self.ctx.store, event).await?;
        self.enqueue_tick(run_id, None).await?;
        info!(run_id, hook_id = %record.hook_id, "hook signal accepted");
        Ok(true)
    }

    /// Enqueue a tick for a SUSPENDED run (operator use). Returns whether a
    /// tick was enqueued.
    pub async fn resume(&self, run_id: &str) -> Result<bool> {
        let run = self.require_run(run_id).await?;
        if run.status != RunStatus::Suspended {
            return Ok(false);
        }
        self.enqueue_tick(run_id, None).await?;
        Ok(true)
    }

    // -- queries --------------------------------------------------------------

    pub async fn get_run(&self, run_id: &str) -> Result<WorkflowRun> {
        self.require_run(run_id).await
    }

    pub async fn events(&self, run_id: &str) -> Result<Vec<Event>> {
        self.require_run(run_id).await?;
        self.ctx.store.read_events(run_id, None).await
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>> {
        self.ctx.store.list_runs(filter).await
    }

    pub async fn steps(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        self.ctx.store.list_steps(run_id).await
    }

    pub async fn hooks(&self, run_id: &str) -> Result<Vec<HookRecord>> {
        self.ctx.store.list_hooks(run_id).await
    }

    /// Direct children of a run.
    pub async fn children(&self, run_id: &str) -> Result<Vec<WorkflowRun>> {
        let mut filter = RunFilter::new();
        filter.parent_run_id = Some(run_id.to_string());
        self.ctx.store.list_runs(&filter).await
    }

    /// Storage health probe, surfaced by `GET /health`.
    pub async fn storage_healthy(&self) -> bool {
        self.ctx.store.healthy().await.is_ok()
    }

    // -- schedules ------------------------------------------------------------

    /// Create a persisted trigger that starts `workflow_name` on a cadence.
    /// Each firing uses a schedule-derived idempotency key, so duplicate
    /// fires collapse.
    pub async fn create_schedule(
        &self,
        workflow_name: &str,
        input: Value,
        cadence: Cadence,
    ) -> Result<String> {
        let descriptor = self
            .ctx
            .registry
            .workflow(workflow_name)
            .ok_or_else(|| Error::UnknownWorkflow(workflow_name.to_string()))?
            .descriptor();
        let input = descriptor.validate(&input).map_err(Error::Validation)?;

        let now = self.ctx.clock.now();
        let next_fire_at = next_fire(&cadence, now)?;
        let spec = ScheduleSpec {
            schedule_id: ids::new_schedule_id(),
            workflow_name: workflow_name.to_string(),
            input,
            cadence,
            enabled: true,
            next_fire_at,
            created_at: now,
        };
        let schedule_id = spec.schedule_id.clone();
        self.ctx.store.put_schedule(spec).await?;
        info!(schedule_id = %schedule_id, workflow = workflow_name, "schedule created");
        Ok(schedule_id)
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleSpec>> {
        self.ctx.store.list_schedules().await
    }

    // -- internals ------------------------------------------------------------

    pub(crate) async fn enqueue_tick(&self, run_id: &str, delay: Option<Duration>) -> Result<()> {
        self.ctx
            .broker
            .enqueue(
                Task::WorkflowTick {
                    run_id: run_id.to_string(),
                },
                delay,
            )
            .await
    }

    async fn require_run(&self, run_id: &str) -> Result<WorkflowRun> {
        self.ctx
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    /// Resolve a hook by id or name, preferring a PENDING match by name.
    async fn resolve_hook(&self, run_id: &str, hook: &str) -> Result<HookRecord> {
        if let Some(record) = self.ctx.store.get_hook(hook).await? {
            if record.run_id == run_id {
                return Ok(record);
            }
        }
        if let Some(record) = self.ctx.store.find_pending_hook(run_id, hook).await? {
            return Ok(record);
        }
        // A non-pending hook with this name still resolves (the caller gets
        // a rejection instead of a 404).
        let hooks = self.ctx.store.list_hooks(run_id).await?;
        hooks
            .into_iter()
            .find(|h| h.name == hook)
            .ok_or_else(|| Error::HookNotFound {
                run_id: run_id.to_string(),
                hook: hook.to_string(),
            })
    }
}

/// Next firing time for a cadence, strictly after `now`.
pub(crate) fn next_fire(cadence: &Cadence, now: OffsetDateTime) -> Result<OffsetDateTime> {
    match cadence {
        Cadence::Interval { interval_ms } => {
            if *interval_ms == 0 {
                return Err(Error::Validation("schedule interval must be positive".into()));
            }
            Ok(now + Duration::from_millis(*interval_ms))
        }
        Cadence::Cron { expression } => {
            let schedule = crate::cron::CronExpr::parse(expression)
                .map_err(|e| Error::Validation(format!("invalid cron expression: {e}")))?;
            Ok(schedule.next_after(now))
        }
    }
}
