//! Event types for the append-only run log.
//!
//! Every observable fact about a run is recorded as an [`Event`]. Events are
//! immutable and totally ordered per run by `sequence` (assigned by storage
//! with a `(run_id, sequence)` uniqueness constraint, starting at 1, no
//! gaps). Replay reconstructs all execution state from this log alone, so
//! event payloads carry the stable identifier of their subject (`step_id`,
//! `sleep_id`, `hook_id`, `child_run_id`) plus type-specific fields.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::ids;

/// All event types in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    // Workflow lifecycle
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    /// Infrastructure failure (worker loss, recovery exhausted).
    #[serde(rename = "workflow.interrupted")]
    WorkflowInterrupted,
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
    /// Reserved; no public API emits this yet.
    #[serde(rename = "workflow.paused")]
    WorkflowPaused,
    /// Reserved; no public API emits this yet.
    #[serde(rename = "workflow.resumed")]
    WorkflowResumed,
    #[serde(rename = "workflow.continued_as_new")]
    WorkflowContinuedAsNew,

    // Step lifecycle
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "step.retrying")]
    StepRetrying,
    #[serde(rename = "step.cancelled")]
    StepCancelled,

    // Sleep
    #[serde(rename = "sleep.started")]
    SleepStarted,
    #[serde(rename = "sleep.completed")]
    SleepCompleted,

    // Hooks
    #[serde(rename = "hook.created")]
    HookCreated,
    #[serde(rename = "hook.received")]
    HookReceived,
    #[serde(rename = "hook.expired")]
    HookExpired,
    #[serde(rename = "hook.disposed")]
    HookDisposed,

    // Child workflows (recorded on the parent's log)
    #[serde(rename = "child_workflow.started")]
    ChildWorkflowStarted,
    #[serde(rename = "child_workflow.completed")]
    ChildWorkflowCompleted,
    #[serde(rename = "child_workflow.failed")]
    ChildWorkflowFailed,
    #[serde(rename = "child_workflow.cancelled")]
    ChildWorkflowCancelled,

    // Control
    #[serde(rename = "cancellation.requested")]
    CancellationRequested,
}

impl EventKind {
    /// The wire name of this event kind (e.g. `"workflow.started"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow.started",
            EventKind::WorkflowCompleted => "workflow.completed",
            EventKind::WorkflowFailed => "workflow.failed",
            EventKind::WorkflowInterrupted => "workflow.interrupted",
            EventKind::WorkflowCancelled => "workflow.cancelled",
            EventKind::WorkflowPaused => "workflow.paused",
            EventKind::WorkflowResumed => "workflow.resumed",
            EventKind::WorkflowContinuedAsNew => "workflow.continued_as_new",
            EventKind::StepStarted => "step.started",
            EventKind::StepCompleted => "step.completed",
            EventKind::StepFailed => "step.failed",
            EventKind::StepRetrying => "step.retrying",
            EventKind::StepCancelled => "step.cancelled",
            EventKind::SleepStarted => "sleep.started",
            EventKind::SleepCompleted => "sleep.completed",
            EventKind::HookCreated => "hook.created",
            EventKind::HookReceived => "hook.received",
            EventKind::HookExpired => "hook.expired",
            EventKind::HookDisposed => "hook.disposed",
            EventKind::ChildWorkflowStarted => "child_workflow.started",
            EventKind::ChildWorkflowCompleted => "child_workflow.completed",
            EventKind::ChildWorkflowFailed => "child_workflow.failed",
            EventKind::ChildWorkflowCancelled => "child_workflow.cancelled",
            EventKind::CancellationRequested => "cancellation.requested",
        }
    }

    /// Returns `true` for the kinds that end a run.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowCompleted
                | EventKind::WorkflowFailed
                | EventKind::WorkflowInterrupted
                | EventKind::WorkflowCancelled
                | EventKind::WorkflowContinuedAsNew
        )
    }

    /// Returns `true` for the kinds that end a step invocation.
    pub fn is_step_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::StepCompleted | EventKind::StepFailed | EventKind::StepCancelled
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable, sequenced record describing a fact about a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event id (`evt_` + 16 hex chars).
    pub event_id: String,
    /// The run this event belongs to.
    pub run_id: String,
    /// Strictly increasing position within the run, starting at 1.
    ///
    /// `None` until the event is appended; storage assigns it.
    pub sequence: Option<u64>,
    /// The event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// When the event was recorded (UTC).
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Type-specific payload.
    pub data: Value,
}

impl Event {
    /// Create an unsequenced event. Prefer the typed constructors below.
    pub fn new(run_id: impl Into<String>, kind: EventKind, timestamp: OffsetDateTime, data: Value) -> Self {
        Self {
            event_id: ids::new_event_id(),
            run_id: run_id.into(),
            sequence: None,
            kind,
            timestamp,
            data,
        }
    }

    // -- workflow lifecycle ---------------------------------------------------

    pub fn workflow_started(
        run_id: &str,
        now: OffsetDateTime,
        workflow_name: &str,
        input: &Value,
        metadata: &Value,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::WorkflowStarted,
            now,
            json!({
                "workflow_name": workflow_name,
                "input": input,
                "metadata": metadata,
            }),
        )
    }

    pub fn workflow_completed(run_id: &str, now: OffsetDateTime, result: &Value) -> Self {
        Self::new(
            run_id,
            EventKind::WorkflowCompleted,
            now,
            json!({ "result": result }),
        )
    }

    pub fn workflow_failed(run_id: &str, now: OffsetDateTime, error: &str) -> Self {
        Self::new(
            run_id,
            EventKind::WorkflowFailed,
            now,
            json!({ "error": error }),
        )
    }

    pub fn workflow_interrupted(
        run_id: &str,
        now: OffsetDateTime,
        reason: &str,
        recovery_attempt: u32,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::WorkflowInterrupted,
            now,
            json!({ "reason": reason, "recovery_attempt": recovery_attempt }),
        )
    }

    pub fn workflow_cancelled(run_id: &str, now: OffsetDateTime, reason: Option<&str>) -> Self {
        Self::new(
            run_id,
            EventKind::WorkflowCancelled,
            now,
            json!({ "reason": reason }),
        )
    }

    pub fn workflow_continued_as_new(
        run_id: &str,
        now: OffsetDateTime,
        new_run_id: &str,
        input: &Value,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::WorkflowContinuedAsNew,
            now,
            json!({ "new_run_id": new_run_id, "input": input }),
        )
    }

    // -- steps ----------------------------------------------------------------

    pub fn step_started(
        run_id: &str,
        now: OffsetDateTime,
        step_id: &str,
        step_name: &str,
        args: &Value,
        attempt: u32,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::StepStarted,
            now,
            json!({
                "step_id": step_id,
                "step_name": step_name,
                "args": args,
                "attempt": attempt,
            }),
        )
    }

    pub fn step_completed(run_id: &str, now: OffsetDateTime, step_id: &str, result: &Value) -> Self {
        Self::new(
            run_id,
            EventKind::StepCompleted,
            now,
            json!({ "step_id": step_id, "result": result }),
        )
    }

    pub fn step_failed(
        run_id: &str,
        now: OffsetDateTime,
        step_id: &str,
        error: &str,
        is_retryable: bool,
        attempt: u32,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::StepFailed,
            now,
            json!({
                "step_id": step_id,
                "error": error,
                "is_retryable": is_retryable,
                "attempt": attempt,
            }),
        )
    }

    pub fn step_retrying(
        run_id: &str,
        now: OffsetDateTime,
        step_id: &str,
        attempt: u32,
        retry_at: OffsetDateTime,
        error: &str,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::StepRetrying,
            now,
            json!({
                "step_id": step_id,
                "attempt": attempt,
                "retry_at": rfc3339(retry_at),
                "error": error,
            }),
        )
    }

    pub fn step_cancelled(
        run_id: &str,
        now: OffsetDateTime,
        step_id: &str,
        step_name: &str,
        reason: Option<&str>,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::StepCancelled,
            now,
            json!({ "step_id": step_id, "step_name": step_name, "reason": reason }),
        )
    }

    // -- sleeps ---------------------------------------------------------------

    pub fn sleep_started(
        run_id: &str,
        now: OffsetDateTime,
        sleep_id: &str,
        duration_seconds: u64,
        wake_at: OffsetDateTime,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::SleepStarted,
            now,
            json!({
                "sleep_id": sleep_id,
                "duration_seconds": duration_seconds,
                "wake_at": rfc3339(wake_at),
            }),
        )
    }

    pub fn sleep_completed(run_id: &str, now: OffsetDateTime, sleep_id: &str) -> Self {
        Self::new(
            run_id,
            EventKind::SleepCompleted,
            now,
            json!({ "sleep_id": sleep_id }),
        )
    }

    // -- hooks ----------------------------------------------------------------

    pub fn hook_created(
        run_id: &str,
        now: OffsetDateTime,
        hook_id: &str,
        name: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::HookCreated,
            now,
            json!({
                "hook_id": hook_id,
                "name": name,
                "expires_at": expires_at.map(rfc3339),
            }),
        )
    }

    pub fn hook_received(run_id: &str, now: OffsetDateTime, hook_id: &str, payload: &Value) -> Self {
        Self::new(
            run_id,
            EventKind::HookReceived,
            now,
            json!({ "hook_id": hook_id, "payload": payload }),
        )
    }

    pub fn hook_expired(run_id: &str, now: OffsetDateTime, hook_id: &str) -> Self {
        Self::new(
            run_id,
            EventKind::HookExpired,
            now,
            json!({ "hook_id": hook_id }),
        )
    }

    pub fn hook_disposed(run_id: &str, now: OffsetDateTime, hook_id: &str) -> Self {
        Self::new(
            run_id,
            EventKind::HookDisposed,
            now,
            json!({ "hook_id": hook_id }),
        )
    }

    // -- child workflows ------------------------------------------------------

    pub fn child_started(
        run_id: &str,
        now: OffsetDateTime,
        child_run_id: &str,
        workflow_name: &str,
        cancellation_policy: &str,
        input: &Value,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::ChildWorkflowStarted,
            now,
            json!({
                "child_run_id": child_run_id,
                "workflow_name": workflow_name,
                "cancellation_policy": cancellation_policy,
                "input": input,
            }),
        )
    }

    pub fn child_completed(run_id: &str, now: OffsetDateTime, child_run_id: &str, result: &Value) -> Self {
        Self::new(
            run_id,
            EventKind::ChildWorkflowCompleted,
            now,
            json!({ "child_run_id": child_run_id, "result": result }),
        )
    }

    pub fn child_failed(run_id: &str, now: OffsetDateTime, child_run_id: &str, error: &str) -> Self {
        Self::new(
            run_id,
            EventKind::ChildWorkflowFailed,
            now,
            json!({ "child_run_id": child_run_id, "error": error }),
        )
    }

    pub fn child_cancelled(run_id: &str, now: OffsetDateTime, child_run_id: &str) -> Self {
        Self::new(
            run_id,
            EventKind::ChildWorkflowCancelled,
            now,
            json!({ "child_run_id": child_run_id }),
        )
    }

    // -- control --------------------------------------------------------------

    pub fn cancellation_requested(run_id: &str, now: OffsetDateTime, reason: Option<&str>) -> Self {
        Self::new(
            run_id,
            EventKind::CancellationRequested,
            now,
            json!({ "reason": reason }),
        )
    }

    // -- payload accessors ----------------------------------------------------

    /// The `step_id` field of the payload, if present.
    pub fn step_id(&self) -> Option<&str> {
        self.data.get("step_id").and_then(Value::as_str)
    }

    /// The `sleep_id` field of the payload, if present.
    pub fn sleep_id(&self) -> Option<&str> {
        self.data.get("sleep_id").and_then(Value::as_str)
    }

    /// The `hook_id` field of the payload, if present.
    pub fn hook_id(&self) -> Option<&str> {
        self.data.get("hook_id").and_then(Value::as_str)
    }

    /// The `child_run_id` field of the payload, if present.
    pub fn child_run_id(&self) -> Option<&str> {
        self.data.get("child_run_id").and_then(Value::as_str)
    }

    /// A string field of the payload by name.
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// An RFC 3339 timestamp field of the payload by name.
    pub fn data_time(&self, field: &str) -> Option<OffsetDateTime> {
        let raw = self.data_str(field)?;
        OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339).ok()
    }
}

fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| t.to_string())
}
