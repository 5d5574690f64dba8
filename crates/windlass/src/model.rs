//! Durable records: runs, steps, hooks, claims, wakes, and schedules.
//!
//! These are the shapes persisted through the [`Storage`](crate::store::Storage)
//! contract. The event log remains the source of truth for execution state;
//! the step and hook records are indexes kept alongside it for efficient
//! lookup, and the run record carries status plus bookkeeping (recovery
//! attempts, lineage, idempotency).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Workflow run execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    /// Recoverable infrastructure failure exhausted its recovery budget.
    Interrupted,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses are sticky: no event changes them afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Interrupted | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a wire-format status name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "suspended" => RunStatus::Suspended,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "interrupted" => RunStatus::Interrupted,
            "cancelled" => RunStatus::Cancelled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a workflow definition against concrete inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_name: String,
    pub status: RunStatus,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,

    /// Workflow input as a single JSON object, validated against the
    /// workflow's descriptor at start.
    pub input: Value,
    /// Result once COMPLETED. Mutually exclusive with `error`.
    pub result: Option<Value>,
    /// Failure message once FAILED/INTERRUPTED. Mutually exclusive with `result`.
    pub error: Option<String>,

    /// Collapses duplicate starts; unique per workflow name when present.
    pub idempotency_key: Option<String>,
    /// Wall-clock budget for the run; enforced via a timeout wake that
    /// requests cancellation when due.
    pub max_duration_ms: Option<u64>,
    pub metadata: Value,
    pub tags: Vec<String>,

    /// Recovery bookkeeping for worker-loss tolerance.
    pub recovery_attempts: u32,
    pub max_recovery_attempts: u32,

    /// Lineage: parent run for children, predecessor for continuations.
    pub parent_run_id: Option<String>,
    /// 0 for root runs; bounded by the configured nesting limit.
    pub nesting_depth: u32,
    /// Successor run id once this run continued-as-new.
    pub continued_to: Option<String>,
}

impl WorkflowRun {
    /// A fresh PENDING run with the given identity and input.
    pub fn new(
        run_id: impl Into<String>,
        workflow_name: impl Into<String>,
        input: Value,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            input,
            result: None,
            error: None,
            idempotency_key: None,
            max_duration_ms: None,
            metadata: Value::Object(Default::default()),
            tags: Vec::new(),
            recovery_attempts: 0,
            max_recovery_attempts: 3,
            parent_run_id: None,
            nesting_depth: 0,
            continued_to: None,
        }
    }
}

/// Step execution status.
///
/// Terminal step outcomes live in the event log; the record mirrors them for
/// efficient lookup. A cancelled step is recorded as FAILED with a
/// cancellation error alongside its `step.cancelled` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable summary of one logical step invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Deterministic id derived from `(run_id, step_name, call_index)`.
    pub step_id: String,
    pub run_id: String,
    pub step_name: String,
    pub status: StepStatus,

    /// 1-based attempt counter; incremented on each retry.
    pub attempt: u32,
    pub max_retries: u32,
    pub args: Value,
    pub result: Option<Value>,
    pub error: Option<String>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,

    /// Lease held by the step worker currently executing this step.
    pub locked_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub locked_until: Option<OffsetDateTime>,

    /// When the next retry delivery is due, while status is PENDING after a
    /// retryable failure. Lets the sweeper tell a step waiting out its
    /// backoff from one whose task message was lost.
    #[serde(with = "time::serde::rfc3339::option")]
    pub retry_at: Option<OffsetDateTime>,

    /// Times the sweeper re-enqueued this step after a lost lease.
    pub recovery_attempts: u32,
}

impl StepRecord {
    pub fn new(
        step_id: impl Into<String>,
        run_id: impl Into<String>,
        step_name: impl Into<String>,
        args: Value,
        max_retries: u32,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            run_id: run_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Pending,
            attempt: 1,
            max_retries,
            args,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            locked_by: None,
            locked_until: None,
            retry_at: None,
            recovery_attempts: 0,
        }
    }
}

/// Hook status. `PENDING → RECEIVED | EXPIRED | DISPOSED` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    Pending,
    Received,
    Expired,
    Disposed,
}

impl HookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookStatus::Pending => "pending",
            HookStatus::Received => "received",
            HookStatus::Expired => "expired",
            HookStatus::Disposed => "disposed",
        }
    }
}

impl std::fmt::Display for HookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, durable inbox slot a workflow may await.
///
/// Mutated from two sides: the workflow worker creates and disposes hooks,
/// external callers signal them. Payload assignment is single-writer via a
/// CAS on `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRecord {
    /// Deterministic id derived from `(run_id, name, call_index)`.
    pub hook_id: String,
    pub run_id: String,
    pub name: String,
    pub status: HookStatus,

    /// Set exactly once, on the PENDING→RECEIVED transition.
    pub payload: Option<Value>,
    /// Optional JSON schema advertised for the payload. Opaque to the engine.
    pub schema: Option<Value>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub received_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl HookRecord {
    pub fn new(
        hook_id: impl Into<String>,
        run_id: impl Into<String>,
        name: impl Into<String>,
        expires_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            hook_id: hook_id.into(),
            run_id: run_id.into(),
            name: name.into(),
            status: HookStatus::Pending,
            payload: None,
            schema: None,
            created_at: now,
            received_at: None,
            expires_at,
        }
    }
}

/// Exclusive, time-bounded lease on a run.
///
/// Acts as a lease rather than a mutex: it auto-expires so a dead worker
/// never wedges a run. The recovery sweeper scans for expired claims on
/// non-terminal runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunClaim {
    pub run_id: String,
    pub worker_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub claimed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// What a persistent timer entry should do when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WakeKind {
    /// A sleep's wake-up: re-tick the run, which completes due sleeps.
    SleepDue { sleep_id: String },
    /// Hook timeout: CAS the hook PENDING→EXPIRED and re-tick.
    HookExpiry { hook_id: String },
    /// `max_duration` elapsed: request cancellation.
    RunTimeout,
}

/// Persistent timer index entry, scanned by the wake sweeper.
///
/// Used for every wall-clock wake the broker cannot be trusted to hold
/// across restarts (the durable truth for sleeps lives here, not in the
/// broker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeEntry {
    pub run_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub wake_at: OffsetDateTime,
    pub kind: WakeKind,
}

/// How a parent's cancellation treats an outstanding child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    /// Forward `cancellation.requested` to the child (default).
    #[default]
    Terminate,
    /// Leave the child running.
    Abandon,
    /// Do not forward, but block parent termination until the child finishes.
    Wait,
}

impl CancellationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationPolicy::Terminate => "terminate",
            CancellationPolicy::Abandon => "abandon",
            CancellationPolicy::Wait => "wait",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "terminate" => CancellationPolicy::Terminate,
            "abandon" => CancellationPolicy::Abandon,
            "wait" => CancellationPolicy::Wait,
            _ => return None,
        })
    }
}

/// Trigger cadence for a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cadence", rename_all = "snake_case")]
pub enum Cadence {
    /// Fire every `interval_ms` milliseconds.
    Interval { interval_ms: u64 },
    /// Five-field cron expression (minute hour day-of-month month day-of-week).
    Cron { expression: String },
}

/// Persisted trigger spec: fires `start` with a schedule-derived idempotency
/// key per firing so duplicate fires collapse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub schedule_id: String,
    pub workflow_name: String,
    pub input: Value,
    pub cadence: Cadence,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub next_fire_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
