//! Deterministic replay of workflow bodies against the event log.
//!
//! The body is re-driven from the top on every tick. Operations are
//! correlated with events by encounter order: the n-th step call, sleep,
//! hook await, or child spawn corresponds to the n-th recorded operation of
//! that family, with ids derived from `(run_id, logical name, call_index)`
//! so the correlation survives across ticks and workers.
//!
//! Per operation:
//! - terminal event in the log → return the recorded value (or raise the
//!   recorded failure) without executing anything;
//! - started event only → suspend (the wake source was scheduled on the
//!   tick that first encountered it);
//! - first encounter → buffer the started event plus its task or wake, then
//!   suspend.
//!
//! Buffered actions are committed by the dispatcher after the body yields;
//! nothing inside the body touches storage or the broker directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use nonempty::NonEmpty;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{Suspension, WorkflowError};
use crate::event::{Event, EventKind};
use crate::ids;
use crate::model::{CancellationPolicy, HookRecord, WakeEntry, WakeKind};
use crate::workflow::{ChildOptions, HookOptions, StepRequest};

/// Recorded outcome of a step, as seen in the event log.
#[derive(Debug, Clone)]
pub(crate) enum StepReplay {
    Started,
    Completed(Value),
    Failed { error: String },
    Cancelled,
}

/// Recorded state of a hook.
#[derive(Debug, Clone)]
pub(crate) enum HookReplay {
    Created,
    Received(Value),
    Expired { name: String },
}

/// Recorded state of a child run, as seen on the parent's log.
#[derive(Debug, Clone)]
pub(crate) enum ChildReplay {
    Completed(Value),
    Failed { error: String },
    Cancelled,
}

/// A `child_workflow.started` record in encounter order. Carries enough to
/// recreate the child run if a crash separated the event from the insert.
#[derive(Debug, Clone)]
pub(crate) struct ChildStarted {
    pub child_run_id: String,
    pub workflow_name: String,
    pub input: Value,
    pub policy: CancellationPolicy,
}

/// Execution state reconstructed from a run's event log.
///
/// Built once per tick and shared by the dispatcher (pre-pass decisions:
/// due sleeps, outstanding children, cancellation) and the [`WorkflowCtx`]
/// (operation resolution).
#[derive(Debug, Default)]
pub(crate) struct ReplayState {
    pub steps: HashMap<String, StepReplay>,
    pub started_sleeps: HashMap<String, OffsetDateTime>,
    pub completed_sleeps: HashSet<String>,
    pub hooks: HashMap<String, HookReplay>,
    pub child_starts: Vec<ChildStarted>,
    pub child_outcomes: HashMap<String, ChildReplay>,
    /// `Some(reason)` once `cancellation.requested` is in the log.
    pub cancellation: Option<Option<String>>,
    /// Hook ids created but not yet received/expired/disposed.
    pub pending_hooks: HashSet<String>,
}

impl ReplayState {
    pub fn from_events(events: &[Event]) -> Self {
        let mut state = ReplayState::default();

        for event in events {
            match event.kind {
                EventKind::StepStarted => {
                    if let Some(id) = event.step_id() {
                        // Retries re-run the same logical invocation; never
                        // regress a terminal outcome.
                        state
                            .steps
                            .entry(id.to_string())
                            .or_insert(StepReplay::Started);
                    }
                }
                EventKind::StepCompleted => {
                    if let Some(id) = event.step_id() {
                        let result = event.data.get("result").cloned().unwrap_or(Value::Null);
                        state.steps.insert(id.to_string(), StepReplay::Completed(result));
                    }
                }
                EventKind::StepFailed => {
                    if let Some(id) = event.step_id() {
                        let error = event
                            .data_str("error")
                            .unwrap_or("step failed")
                            .to_string();
                        state.steps.insert(id.to_string(), StepReplay::Failed { error });
                    }
                }
                EventKind::StepCancelled => {
                    if let Some(id) = event.step_id() {
                        state.steps.insert(id.to_string(), StepReplay::Cancelled);
                    }
                }
                EventKind::StepRetrying => {}

                EventKind::SleepStarted => {
                    if let (Some(id), Some(wake_at)) = (event.sleep_id(), event.data_time("wake_at")) {
                        state.started_sleeps.insert(id.to_string(), wake_at);
                    }
                }
                EventKind::SleepCompleted => {
                    if let Some(id) = event.sleep_id() {
                        state.completed_sleeps.insert(id.to_string());
                    }
                }

                EventKind::HookCreated => {
                    if let Some(id) = event.hook_id() {
                        state.hooks.insert(id.to_string(), HookReplay::Created);
                        state.pending_hooks.insert(id.to_string());
                    }
                }
                EventKind::HookReceived => {
                    if let Some(id) = event.hook_id() {
                        let payload = event.data.get("payload").cloned().unwrap_or(Value::Null);
                        state.hooks.insert(id.to_string(), HookReplay::Received(payload));
                        state.pending_hooks.remove(id);
                    }
                }
                EventKind::HookExpired => {
                    if let Some(id) = event.hook_id() {
                        let name = event.data_str("name").unwrap_or(id).to_string();
                        state.hooks.insert(id.to_string(), HookReplay::Expired { name });
                        state.pending_hooks.remove(id);
                    }
                }
                EventKind::HookDisposed => {
                    if let Some(id) = event.hook_id() {
                        state.pending_hooks.remove(id);
                    }
                }

                EventKind::ChildWorkflowStarted => {
                    if let Some(child_run_id) = event.child_run_id() {
                        let policy = event
                            .data_str("cancellation_policy")
                            .and_then(CancellationPolicy::parse)
                            .unwrap_or_default();
                        state.child_starts.push(ChildStarted {
                            child_run_id: child_run_id.to_string(),
                            workflow_name: event
                                .data_str("workflow_name")
                                .unwrap_or_default()
                                .to_string(),
                            input: event.data.get("input").cloned().unwrap_or(Value::Null),
                            policy,
                        });
                    }
                }
                EventKind::ChildWorkflowCompleted => {
                    if let Some(id) = event.child_run_id() {
                        let result = event.data.get("result").cloned().unwrap_or(Value::Null);
                        state
                            .child_outcomes
                            .insert(id.to_string(), ChildReplay::Completed(result));
                    }
                }
                EventKind::ChildWorkflowFailed => {
                    if let Some(id) = event.child_run_id() {
                        let error = event
                            .data_str("error")
                            .unwrap_or("child failed")
                            .to_string();
                        state
                            .child_outcomes
                            .insert(id.to_string(), ChildReplay::Failed { error });
                    }
                }
                EventKind::ChildWorkflowCancelled => {
                    if let Some(id) = event.child_run_id() {
                        state
                            .child_outcomes
                            .insert(id.to_string(), ChildReplay::Cancelled);
                    }
                }

                EventKind::CancellationRequested => {
                    if state.cancellation.is_none() {
                        state.cancellation =
                            Some(event.data_str("reason").map(str::to_string));
                    }
                }

                _ => {}
            }
        }

        state
    }

    /// Sleeps whose `sleep.started` has no paired `sleep.completed`.
    pub fn pending_sleeps(&self) -> Vec<(String, OffsetDateTime)> {
        self.started_sleeps
            .iter()
            .filter(|(id, _)| !self.completed_sleeps.contains(*id))
            .map(|(id, wake_at)| (id.clone(), *wake_at))
            .collect()
    }

    /// Children with a `child_workflow.started` but no terminal event.
    pub fn outstanding_children(&self) -> Vec<&ChildStarted> {
        self.child_starts
            .iter()
            .filter(|c| !self.child_outcomes.contains_key(&c.child_run_id))
            .collect()
    }
}

/// Side effects buffered during one tick, committed after the body yields.
#[derive(Debug, Default)]
pub(crate) struct Actions {
    /// Events to append, in issue order.
    pub events: Vec<Event>,
    /// Step tasks to launch (record creation + enqueue) after commit.
    pub step_launches: Vec<StepLaunch>,
    /// Hook records to create.
    pub hook_creates: Vec<HookRecord>,
    /// Persistent wake-ups to schedule.
    pub wakes: Vec<WakeEntry>,
    /// Child runs to create and tick after commit.
    pub child_starts: Vec<ChildStartRequest>,
}

#[derive(Debug)]
pub(crate) struct StepLaunch {
    pub step_id: String,
    pub step_name: String,
    pub args: Value,
}

#[derive(Debug)]
pub(crate) struct ChildStartRequest {
    pub child_run_id: String,
    pub workflow_name: String,
    pub input: Value,
    pub policy: CancellationPolicy,
}

struct CtxInner {
    step_index: u32,
    sleep_index: u32,
    hook_index: u32,
    child_index: u32,
    shield_depth: u32,
    actions: Actions,
}

/// Handle through which a workflow body issues operations.
///
/// Every method is a cooperative checkpoint: once `cancellation.requested`
/// is in the log, the next unshielded operation observes
/// [`WorkflowError::Cancelled`]. Use [`WorkflowCtx::shield`] around
/// compensation sequences that must run to completion first.
pub struct WorkflowCtx {
    run_id: String,
    nesting_depth: u32,
    nesting_limit: u32,
    now: OffsetDateTime,
    replay: ReplayState,
    inner: Mutex<CtxInner>,
}

impl WorkflowCtx {
    pub(crate) fn new(
        run_id: impl Into<String>,
        nesting_depth: u32,
        nesting_limit: u32,
        now: OffsetDateTime,
        replay: ReplayState,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            nesting_depth,
            nesting_limit,
            now,
            replay,
            inner: Mutex::new(CtxInner {
                step_index: 0,
                sleep_index: 0,
                hook_index: 0,
                child_index: 0,
                shield_depth: 0,
                actions: Actions::default(),
            }),
        }
    }

    /// The id of the run this body is executing.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The tick's frozen timestamp. Deterministic within a tick; use steps
    /// for anything that must observe real wall-clock time.
    pub fn now(&self) -> OffsetDateTime {
        self.now
    }

    /// Execute a step with default correlation by name and encounter order.
    ///
    /// Returns the recorded result when the step already completed, raises
    /// the recorded failure when it exhausted retries, and suspends the run
    /// otherwise.
    pub fn step(&self, step_name: &str, args: Value) -> Result<Value, WorkflowError> {
        self.step_with(StepRequest::new(step_name, args))
    }

    /// Execute a step from an explicit request.
    pub fn step_with(&self, request: StepRequest) -> Result<Value, WorkflowError> {
        let mut inner = self.lock();
        self.checkpoint(&inner)?;

        let index = inner.step_index;
        inner.step_index += 1;

        match self.resolve_step(&mut inner, index, &request) {
            StepResolution::Done(value) => Ok(value),
            StepResolution::Failed { error } => Err(WorkflowError::StepFailed {
                step_name: request.step_name,
                message: error,
            }),
            StepResolution::Cancelled => Err(WorkflowError::Cancelled { reason: None }),
            StepResolution::Waiting => Err(WorkflowError::Suspended(Suspension::Step)),
        }
    }

    /// Execute several steps concurrently, suspending until all have
    /// terminal events. Results are returned in input order; the first
    /// failure in input order is raised once every branch is terminal.
    pub fn parallel(&self, requests: NonEmpty<StepRequest>) -> Result<Vec<Value>, WorkflowError> {
        let mut inner = self.lock();
        self.checkpoint(&inner)?;

        let mut resolutions = Vec::with_capacity(requests.len());
        for request in requests.iter() {
            let index = inner.step_index;
            inner.step_index += 1;
            resolutions.push((request.clone(), self.resolve_step(&mut inner, index, request)));
        }

        if resolutions
            .iter()
            .any(|(_, r)| matches!(r, StepResolution::Waiting))
        {
            return Err(WorkflowError::Suspended(Suspension::Step));
        }

        let mut results = Vec::with_capacity(resolutions.len());
        for (request, resolution) in resolutions {
            match resolution {
                StepResolution::Done(value) => results.push(value),
                StepResolution::Failed { error } => {
                    return Err(WorkflowError::StepFailed {
                        step_name: request.step_name,
                        message: error,
                    });
                }
                StepResolution::Cancelled => {
                    return Err(WorkflowError::Cancelled { reason: None });
                }
                StepResolution::Waiting => unreachable!("waiting branches suspend above"),
            }
        }
        Ok(results)
    }

    /// Suspend the run until `duration` has elapsed on the wall clock.
    ///
    /// Survives crashes and worker handoff: the wake is persisted, and the
    /// sleep completes on the first tick at or after its wake time.
    pub fn sleep(&self, duration: Duration) -> Result<(), WorkflowError> {
        let mut inner = self.lock();
        self.checkpoint(&inner)?;

        let index = inner.sleep_index;
        inner.sleep_index += 1;
        let sleep_id = ids::sleep_id(index);

        if self.replay.completed_sleeps.contains(&sleep_id) {
            return Ok(());
        }

        if !self.replay.started_sleeps.contains_key(&sleep_id) {
            let wake_at = self.now + duration;
            inner.actions.events.push(Event::sleep_started(
                &self.run_id,
                self.now,
                &sleep_id,
                duration.as_secs(),
                wake_at,
            ));
            inner.actions.wakes.push(WakeEntry {
                run_id: self.run_id.clone(),
                wake_at,
                kind: WakeKind::SleepDue { sleep_id },
            });
        }

        Err(WorkflowError::Suspended(Suspension::Sleep))
    }

    /// Await an external signal on a named hook.
    pub fn hook(&self, name: &str) -> Result<Value, WorkflowError> {
        self.hook_with(name, HookOptions::default())
    }

    /// Await an external signal with an expiry and/or payload schema.
    pub fn hook_with(&self, name: &str, options: HookOptions) -> Result<Value, WorkflowError> {
        let mut inner = self.lock();
        self.checkpoint(&inner)?;

        let index = inner.hook_index;
        inner.hook_index += 1;
        let hook_id = ids::hook_id(&self.run_id, name, index);

        match self.replay.hooks.get(&hook_id) {
            Some(HookReplay::Received(payload)) => Ok(payload.clone()),
            Some(HookReplay::Expired { name }) => Err(WorkflowError::HookExpired {
                name: name.clone(),
            }),
            Some(HookReplay::Created) => Err(WorkflowError::Suspended(Suspension::Hook)),
            None => {
                let expires_at = options.timeout.map(|t| self.now + t);
                inner.actions.events.push(Event::hook_created(
                    &self.run_id,
                    self.now,
                    &hook_id,
                    name,
                    expires_at,
                ));
                let mut record =
                    HookRecord::new(&hook_id, &self.run_id, name, expires_at, self.now);
                record.schema = options.schema;
                inner.actions.hook_creates.push(record);
                if let Some(expires_at) = expires_at {
                    inner.actions.wakes.push(WakeEntry {
                        run_id: self.run_id.clone(),
                        wake_at: expires_at,
                        kind: WakeKind::HookExpiry { hook_id },
                    });
                }
                Err(WorkflowError::Suspended(Suspension::Hook))
            }
        }
    }

    /// Spawn a child run and await its terminal event, returning its result.
    pub fn child_workflow(&self, workflow_name: &str, input: Value) -> Result<Value, WorkflowError> {
        match self.child_with(workflow_name, input, ChildOptions::default())? {
            ChildHandle::Finished(value) => Ok(value),
            ChildHandle::Detached(_) => unreachable!("default child options wait"),
        }
    }

    /// Spawn a child run without awaiting it, returning its run id.
    pub fn spawn_child(
        &self,
        workflow_name: &str,
        input: Value,
        policy: CancellationPolicy,
    ) -> Result<String, WorkflowError> {
        let options = ChildOptions {
            wait: false,
            cancellation_policy: policy,
        };
        match self.child_with(workflow_name, input, options)? {
            ChildHandle::Detached(run_id) => Ok(run_id),
            ChildHandle::Finished(_) => unreachable!("detached child options"),
        }
    }

    /// Spawn a child run with explicit options.
    pub fn child_with(
        &self,
        workflow_name: &str,
        input: Value,
        options: ChildOptions,
    ) -> Result<ChildHandle, WorkflowError> {
        let mut inner = self.lock();
        self.checkpoint(&inner)?;

        let index = inner.child_index as usize;
        inner.child_index += 1;

        let child_run_id = match self.replay.child_starts.get(index) {
            Some(started) => started.child_run_id.clone(),
            None => {
                let depth = self.nesting_depth + 1;
                if depth > self.nesting_limit {
                    return Err(WorkflowError::NestingLimitExceeded {
                        depth,
                        limit: self.nesting_limit,
                    });
                }
                let child_run_id = ids::new_run_id();
                inner.actions.events.push(Event::child_started(
                    &self.run_id,
                    self.now,
                    &child_run_id,
                    workflow_name,
                    options.cancellation_policy.as_str(),
                    &input,
                ));
                inner.actions.child_starts.push(ChildStartRequest {
                    child_run_id: child_run_id.clone(),
                    workflow_name: workflow_name.to_string(),
                    input,
                    policy: options.cancellation_policy,
                });
                child_run_id
            }
        };

        if !options.wait {
            return Ok(ChildHandle::Detached(child_run_id));
        }

        match self.replay.child_outcomes.get(&child_run_id) {
            Some(ChildReplay::Completed(value)) => Ok(ChildHandle::Finished(value.clone())),
            Some(ChildReplay::Failed { error }) => Err(WorkflowError::ChildFailed {
                child_run_id,
                message: error.clone(),
            }),
            Some(ChildReplay::Cancelled) => Err(WorkflowError::ChildCancelled { child_run_id }),
            None => Err(WorkflowError::Suspended(Suspension::Child)),
        }
    }

    /// Finalize this run and start a successor with fresh history.
    ///
    /// Returns the control-flow error the body must propagate:
    ///
    /// ```ignore
    /// return Err(ctx.continue_as_new(json!({ "cursor": next_cursor })));
    /// ```
    pub fn continue_as_new(&self, input: Value) -> WorkflowError {
        WorkflowError::ContinueAsNew { input }
    }

    /// Open a region in which cancellation checkpoints are deferred.
    ///
    /// Step completions are still observed; the region just never raises
    /// [`WorkflowError::Cancelled`], so compensation sequences run to
    /// completion. The deferral ends when the guard drops.
    pub fn shield(&self) -> ShieldGuard<'_> {
        let mut inner = self.lock();
        inner.shield_depth += 1;
        ShieldGuard { ctx: self }
    }

    /// `Some(reason)` once cancellation has been requested for this run.
    ///
    /// Lets a body ask without tripping a checkpoint.
    pub fn cancellation_requested(&self) -> Option<Option<String>> {
        self.replay.cancellation.clone()
    }

    pub(crate) fn take_actions(self) -> Actions {
        self.inner
            .into_inner()
            .map(|inner| inner.actions)
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().expect("workflow ctx lock poisoned")
    }

    fn checkpoint(&self, inner: &CtxInner) -> Result<(), WorkflowError> {
        if inner.shield_depth == 0 {
            if let Some(reason) = &self.replay.cancellation {
                return Err(WorkflowError::Cancelled {
                    reason: reason.clone(),
                });
            }
        }
        Ok(())
    }

    fn resolve_step(
        &self,
        inner: &mut CtxInner,
        index: u32,
        request: &StepRequest,
    ) -> StepResolution {
        let step_id = ids::step_id(&self.run_id, &request.step_name, index);

        match self.replay.steps.get(&step_id) {
            Some(StepReplay::Completed(value)) => StepResolution::Done(value.clone()),
            Some(StepReplay::Failed { error }) => StepResolution::Failed {
                error: error.clone(),
            },
            Some(StepReplay::Cancelled) => StepResolution::Cancelled,
            Some(StepReplay::Started) => StepResolution::Waiting,
            None => {
                inner.actions.events.push(Event::step_started(
                    &self.run_id,
                    self.now,
                    &step_id,
                    &request.step_name,
                    &request.args,
                    1,
                ));
                inner.actions.step_launches.push(StepLaunch {
                    step_id,
                    step_name: request.step_name.clone(),
                    args: request.args.clone(),
                });
                StepResolution::Waiting
            }
        }
    }
}

enum StepResolution {
    Done(Value),
    Failed { error: String },
    Cancelled,
    Waiting,
}

/// Result of [`WorkflowCtx::child_with`].
#[derive(Debug, Clone)]
pub enum ChildHandle {
    /// The awaited child's recorded result.
    Finished(Value),
    /// The detached child's run id.
    Detached(String),
}

/// Defers cancellation checkpoints until dropped. See [`WorkflowCtx::shield`].
pub struct ShieldGuard<'a> {
    ctx: &'a WorkflowCtx,
}

impl Drop for ShieldGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.ctx.lock();
        inner.shield_depth = inner.shield_depth.saturating_sub(1);
    }
}
