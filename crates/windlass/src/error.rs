//! Error types for windlass.

use std::time::Duration;

use thiserror::Error;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
///
/// These are the errors surfaced by the public API and the storage/broker
/// layers. Failures *inside* a workflow body travel as [`WorkflowError`];
/// failures inside a step handler travel as [`StepError`].
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize or deserialize a persisted payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No run exists with the given id.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// No pending hook matches the given name or id for the run.
    #[error("hook not found: {run_id}/{hook}")]
    HookNotFound {
        /// The run the signal targeted.
        run_id: String,
        /// The hook name or id that did not resolve.
        hook: String,
    },

    /// An idempotency key is already bound to a different workflow start.
    #[error("idempotency conflict for key '{key}': held by run {existing_run_id}")]
    IdempotencyConflict {
        /// The conflicting key.
        key: String,
        /// The run already holding the key.
        existing_run_id: String,
    },

    /// Workflow name was not registered with the engine.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// Step name was not registered with the engine.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// Workflow or step name was registered more than once.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// Malformed input at the API boundary.
    #[error("validation error: {0}")]
    Validation(String),

    /// Child spawn would exceed the configured nesting limit.
    #[error("nesting limit exceeded: depth {depth} with limit {limit}")]
    NestingLimit {
        /// Depth the spawn would have reached.
        depth: u32,
        /// The configured limit.
        limit: u32,
    },

    /// Lost an optimistic-concurrency race (sequence or status CAS).
    ///
    /// Internal; callers retry by re-reading and re-composing.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),
}

impl Error {
    /// Returns `true` for optimistic-concurrency conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

/// Outcome of a user step handler.
///
/// The step worker maps these onto the retry machinery: `Retryable` failures
/// are retried up to the step's `max_retries` with the configured backoff,
/// `Fatal` failures are recorded immediately regardless of remaining
/// attempts.
#[derive(Debug, Error)]
pub enum StepError {
    /// Transient failure; the engine retries with backoff.
    #[error("retryable: {message}")]
    Retryable {
        /// Human-readable failure description, recorded in the event log.
        message: String,
        /// Overrides the step's backoff for this retry when set.
        retry_after: Option<Duration>,
    },

    /// Unrecoverable failure; recorded as `step.failed` immediately.
    #[error("fatal: {message}")]
    Fatal {
        /// Human-readable failure description, recorded in the event log.
        message: String,
    },
}

impl StepError {
    /// Transient failure with the step's configured backoff.
    pub fn retryable(message: impl Into<String>) -> Self {
        StepError::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Transient failure with an explicit retry delay.
    pub fn retry_after(message: impl Into<String>, delay: Duration) -> Self {
        StepError::Retryable {
            message: message.into(),
            retry_after: Some(delay),
        }
    }

    /// Unrecoverable failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        StepError::Fatal {
            message: message.into(),
        }
    }

    /// Returns `true` if the engine may retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Retryable { .. })
    }
}

/// Why a workflow body suspended.
///
/// Carried by [`WorkflowError::Suspended`] so the dispatcher can log and
/// classify the suspension; the body itself never inspects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suspension {
    /// Waiting for one or more step tasks to reach a terminal event.
    Step,
    /// Waiting for a wall-clock wake-up.
    Sleep,
    /// Waiting for an external hook signal.
    Hook,
    /// Waiting for a child run to reach a terminal event.
    Child,
}

impl std::fmt::Display for Suspension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Suspension::Step => "step",
            Suspension::Sleep => "sleep",
            Suspension::Hook => "hook",
            Suspension::Child => "child",
        };
        f.write_str(s)
    }
}

/// Errors observed by (or unwinding out of) a workflow body.
///
/// Bodies propagate these with `?`. Two variants are pure control flow and
/// never reach users: [`WorkflowError::Suspended`] parks the run until its
/// wake source fires, and [`WorkflowError::ContinueAsNew`] finalizes the run
/// and starts a successor. The dispatcher intercepts both.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A step exhausted its retries or failed fatally.
    #[error("step '{step_name}' failed: {message}")]
    StepFailed {
        /// Logical step name.
        step_name: String,
        /// Recorded failure message.
        message: String,
    },

    /// An awaited child run failed (or was interrupted).
    #[error("child workflow {child_run_id} failed: {message}")]
    ChildFailed {
        /// The child's run id.
        child_run_id: String,
        /// Recorded failure message.
        message: String,
    },

    /// An awaited child run was cancelled.
    #[error("child workflow {child_run_id} was cancelled")]
    ChildCancelled {
        /// The child's run id.
        child_run_id: String,
    },

    /// A hook await expired before any signal arrived.
    #[error("hook '{name}' expired")]
    HookExpired {
        /// The hook's logical name.
        name: String,
    },

    /// Cooperative cancellation, raised at the next checkpoint after
    /// `cancellation.requested`.
    #[error("cancelled{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled {
        /// Reason supplied by the canceller, if any.
        reason: Option<String>,
    },

    /// Spawning a child would exceed the nesting limit. Fatal to the body.
    #[error("child spawn at depth {depth} exceeds nesting limit {limit}")]
    NestingLimitExceeded {
        /// Depth the child would have had.
        depth: u32,
        /// The configured limit.
        limit: u32,
    },

    /// Fatal application failure raised by the body itself.
    #[error("{message}")]
    Fatal {
        /// Recorded failure message.
        message: String,
    },

    /// Internal control flow: the body is waiting on an operation whose
    /// outcome is not yet in the event log. Never surfaced to users.
    #[error("suspended on {0}")]
    Suspended(Suspension),

    /// Internal control flow: finalize this run and start a successor with
    /// fresh history. Never surfaced to users.
    #[error("continue as new")]
    ContinueAsNew {
        /// Input for the successor run.
        input: serde_json::Value,
    },
}

impl WorkflowError {
    /// Fatal application failure with the given message.
    pub fn fatal(message: impl Into<String>) -> Self {
        WorkflowError::Fatal {
            message: message.into(),
        }
    }

    /// Returns `true` for the internal control-flow variants.
    pub(crate) fn is_control_flow(&self) -> bool {
        matches!(
            self,
            WorkflowError::Suspended(_) | WorkflowError::ContinueAsNew { .. }
        )
    }
}
