//! Storage contract for runs, events, steps, hooks, claims, wakes, and
//! schedules.
//!
//! Two implementations are provided:
//!
//! - [`MemoryStore`] — in-memory, for tests and single-process development
//! - [`PgStore`] — PostgreSQL, for production (requires the `postgres`
//!   feature)
//!
//! The event log is the source of truth. Run status transitions follow the
//! reconciling pattern: the terminal event is appended first, then status is
//! updated; every task handler is idempotent against the log, and the
//! recovery sweeper re-ticks any run whose worker died between the two
//! writes.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use crate::error::Result;
use crate::event::Event;
use crate::model::{
    HookRecord, HookStatus, RunClaim, RunStatus, ScheduleSpec, StepRecord, StepStatus, WakeEntry,
    WorkflowRun,
};

/// Outcome of an idempotent run insert.
#[derive(Debug, Clone)]
pub enum CreateRunOutcome {
    /// The run was inserted.
    Created,
    /// `(workflow_name, idempotency_key)` already existed; nothing changed.
    Existing(WorkflowRun),
}

/// Fields applied together with a status CAS.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub continued_to: Option<String>,
    /// Activity marker; the sweeper treats runs with a stale `updated_at`
    /// as quiet and re-ticks them.
    pub updated_at: Option<OffsetDateTime>,
}

/// Fields applied together with a step status CAS.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub status: Option<StepStatus>,
    pub attempt: Option<u32>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    /// `Some(None)` clears the lease; `Some(Some(..))` sets it.
    pub lock: Option<Option<(String, OffsetDateTime)>>,
    /// Next retry due time, recorded on the retrying transition.
    pub retry_at: Option<OffsetDateTime>,
    pub recovery_attempts: Option<u32>,
}

/// Filter for run listings. Not in the hot path.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_name: Option<String>,
    pub status: Option<RunStatus>,
    pub parent_run_id: Option<String>,
    pub created_after: Option<OffsetDateTime>,
    pub created_before: Option<OffsetDateTime>,
    /// Offset cursor into the (status, created_at)-ordered listing.
    pub cursor: u64,
    pub limit: u32,
}

impl RunFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }
}

/// Storage backend contract.
///
/// All mutations are single optimistic CAS operations; no long-held locks.
/// Sequence numbers are per-run, strictly increasing from 1, enforced by a
/// `(run_id, sequence)` uniqueness constraint.
#[async_trait]
pub trait Storage: Send + Sync + Clone + 'static {
    // -- runs -----------------------------------------------------------------

    /// Insert a run. Atomic with the unique `(workflow_name,
    /// idempotency_key)` constraint: on conflict, returns the existing run
    /// and changes nothing.
    async fn create_run(&self, run: WorkflowRun) -> Result<CreateRunOutcome>;

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    async fn get_run_by_idempotency_key(
        &self,
        workflow_name: &str,
        key: &str,
    ) -> Result<Option<WorkflowRun>>;

    /// CAS the run's status from one of `from` to `to`, applying `update`.
    /// Returns `false` (and changes nothing) if the current status is not in
    /// `from` — terminal statuses stay sticky through this guard.
    async fn update_run_status(
        &self,
        run_id: &str,
        from: &[RunStatus],
        to: RunStatus,
        update: RunUpdate,
    ) -> Result<bool>;

    async fn set_recovery_attempts(&self, run_id: &str, attempts: u32) -> Result<()>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>>;

    // -- events ---------------------------------------------------------------

    /// Append with CAS on the next sequence: fails with
    /// [`crate::Error::Conflict`] unless `expected_sequence` is exactly one
    /// past the run's latest. Use [`append_event`] for the retry loop.
    async fn append_event_at(&self, expected_sequence: u64, event: Event) -> Result<Event>;

    /// The run's latest assigned sequence (0 when the log is empty).
    async fn latest_sequence(&self, run_id: &str) -> Result<u64>;

    /// Ordered events, optionally starting from a sequence (inclusive).
    async fn read_events(&self, run_id: &str, from_sequence: Option<u64>) -> Result<Vec<Event>>;

    // -- steps ----------------------------------------------------------------

    async fn put_step(&self, step: StepRecord) -> Result<()>;

    async fn get_step(&self, step_id: &str) -> Result<Option<StepRecord>>;

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>>;

    /// CAS the step from `from`, applying `update`. Returns `false` if the
    /// current status differs.
    async fn update_step(&self, step_id: &str, from: StepStatus, update: StepUpdate)
        -> Result<bool>;

    /// RUNNING steps whose lease expired before `now`.
    async fn list_expired_step_leases(&self, now: OffsetDateTime) -> Result<Vec<StepRecord>>;

    /// PENDING steps whose task message appears lost: due (past `retry_at`,
    /// or never retried and past `created_at`) by more than `grace`.
    async fn list_orphaned_pending_steps(
        &self,
        now: OffsetDateTime,
        grace: Duration,
    ) -> Result<Vec<StepRecord>>;

    // -- hooks ----------------------------------------------------------------

    async fn put_hook(&self, hook: HookRecord) -> Result<()>;

    async fn get_hook(&self, hook_id: &str) -> Result<Option<HookRecord>>;

    /// The PENDING hook with this name for the run, if any.
    async fn find_pending_hook(&self, run_id: &str, name: &str) -> Result<Option<HookRecord>>;

    async fn list_hooks(&self, run_id: &str) -> Result<Vec<HookRecord>>;

    /// CAS `PENDING → to`. Sets the payload (and `received_at`) only for the
    /// RECEIVED transition. Returns `false` if the hook was not PENDING.
    async fn transition_hook(
        &self,
        hook_id: &str,
        to: HookStatus,
        payload: Option<Value>,
        now: OffsetDateTime,
    ) -> Result<bool>;

    // -- run claims -----------------------------------------------------------

    /// Acquire an exclusive, time-bounded lease on the run. Returns `None`
    /// when another worker holds an unexpired claim. Re-claiming by the
    /// current holder renews the lease.
    async fn claim_run(
        &self,
        run_id: &str,
        worker_id: &str,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<Option<RunClaim>>;

    /// Release the claim if `worker_id` still holds it.
    async fn release_claim(&self, run_id: &str, worker_id: &str) -> Result<()>;

    /// Claims that expired before `now` (for the recovery sweeper). Each is
    /// returned at most once; popping consumes the expired claim row.
    async fn pop_expired_claims(&self, now: OffsetDateTime) -> Result<Vec<RunClaim>>;

    // -- wakes (persistent timer index) ---------------------------------------

    async fn schedule_wake(&self, wake: WakeEntry) -> Result<()>;

    /// Wakes due at or before `now`, consumed atomically.
    async fn pop_due_wakes(&self, now: OffsetDateTime, limit: u32) -> Result<Vec<WakeEntry>>;

    /// Drop all pending wakes for a run (on terminal transitions). Returns
    /// the number removed.
    async fn cancel_wakes(&self, run_id: &str) -> Result<u64>;

    // -- schedules ------------------------------------------------------------

    async fn put_schedule(&self, spec: ScheduleSpec) -> Result<()>;

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleSpec>>;

    async fn list_schedules(&self) -> Result<Vec<ScheduleSpec>>;

    /// Enabled schedules with `next_fire_at <= now`.
    async fn due_schedules(&self, now: OffsetDateTime) -> Result<Vec<ScheduleSpec>>;

    /// Advance a schedule's `next_fire_at` after a firing.
    async fn advance_schedule(&self, schedule_id: &str, next_fire_at: OffsetDateTime)
        -> Result<()>;

    // -- health ---------------------------------------------------------------

    /// Probe the backend; `Err` surfaces through `GET /health`.
    async fn healthy(&self) -> Result<()>;
}

/// Append an event, retrying the sequence CAS by re-reading the latest
/// sequence. This is the normal append path; [`Storage::append_event_at`]
/// exists for callers composing multi-event suffixes that must not
/// interleave.
pub async fn append_event<S: Storage>(store: &S, event: Event) -> Result<Event> {
    const MAX_ATTEMPTS: u32 = 16;

    let mut attempt = 0;
    loop {
        let next = store.latest_sequence(&event.run_id).await? + 1;
        match store.append_event_at(next, event.clone()).await {
            Ok(appended) => return Ok(appended),
            Err(err) if err.is_conflict() && attempt < MAX_ATTEMPTS => {
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Append a batch of events contiguously, retrying lost races as a whole.
pub async fn append_events<S: Storage>(store: &S, events: Vec<Event>) -> Result<Vec<Event>> {
    let mut appended = Vec::with_capacity(events.len());
    for event in events {
        appended.push(append_event(store, event).await?);
    }
    Ok(appended)
}

/// Convenience guard used by handlers checking idempotency: `true` when the
/// log already holds a terminal event for this step.
pub async fn step_has_terminal_event<S: Storage>(
    store: &S,
    run_id: &str,
    step_id: &str,
) -> Result<bool> {
    let events = store.read_events(run_id, None).await?;
    Ok(events
        .iter()
        .any(|e| e.kind.is_step_terminal() && e.step_id() == Some(step_id)))
}
