//! Durable, event-sourced workflow execution engine.
//!
//! Windlass runs workflow bodies to completion across process crashes,
//! worker restarts, indefinite sleeps, and external callbacks, while
//! guaranteeing that each step's side effects are recorded at most once per
//! logical invocation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         workflow-tick task                           │
//! │                                                                      │
//! │   1. Claim the run (time-bounded lease)                              │
//! │   2. Rebuild replay state from the ordered event log                 │
//! │   3. Re-drive the body; each operation returns its recorded          │
//! │      outcome or suspends                                             │
//! │   4. Commit buffered events (the log is the source of truth)         │
//! │   5. Enqueue step tasks / schedule wakes / start children            │
//! │   6. Classify: completed | failed | suspended | cancelled |          │
//! │      continued-as-new                                                │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Step tasks execute user handlers and record `step.completed` /
//! `step.failed`, then re-enqueue a workflow-tick. Sleeps, hook expiries,
//! and run timeouts flow through a persistent wake index scanned by a
//! sweeper; a recovery sweeper re-ticks runs and steps whose leases
//! expired, bounded by `max_recovery_attempts`.
//!
//! # Example
//!
//! ```ignore
//! use windlass::{
//!     step_fn, ParamSpec, ParamType, StartOptions, Workflow, WorkflowCtx,
//!     WorkflowDescriptor, WorkflowEngine, WorkflowError,
//! };
//!
//! struct OrderWorkflow;
//!
//! #[async_trait::async_trait]
//! impl Workflow for OrderWorkflow {
//!     fn descriptor(&self) -> WorkflowDescriptor {
//!         WorkflowDescriptor::new("order")
//!             .param(ParamSpec::required("order_id", ParamType::String))
//!     }
//!
//!     async fn run(&self, ctx: &WorkflowCtx, input: serde_json::Value)
//!         -> Result<serde_json::Value, WorkflowError>
//!     {
//!         let validated = ctx.step("validate", input.clone())?;
//!         let charged = ctx.step("charge", validated)?;
//!         ctx.step("notify", charged)
//!     }
//! }
//!
//! let engine = WorkflowEngine::builder(store, broker)
//!     .register_workflow(OrderWorkflow)
//!     .register_step(step_fn("validate", validate))
//!     .register_step(step_fn("charge", charge))
//!     .register_step(step_fn("notify", notify))
//!     .build()?;
//!
//! let run_id = engine
//!     .client()
//!     .start("order", serde_json::json!({"order_id": "A"}), StartOptions::default())
//!     .await?
//!     .run_id;
//! ```
//!
//! # Feature flags
//!
//! - `postgres` — enables [`PgStore`] for production use with PostgreSQL
//!
//! # Design documentation
//!
//! See `DESIGN.md` for architectural decisions and their lineage.

pub mod broker;
mod client;
mod clock;
pub mod cron;
mod error;
mod event;
pub mod http;
mod ids;
mod model;
mod replay;
mod runtime;
pub mod store;
mod workflow;

pub use broker::{Broker, Delivery, InMemoryBroker, Queue, Task};
pub use client::{StartOptions, StartOutcome, WorkflowClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result, StepError, Suspension, WorkflowError};
pub use event::{Event, EventKind};
pub use model::{
    Cadence, CancellationPolicy, HookRecord, HookStatus, RunClaim, RunStatus, ScheduleSpec,
    StepRecord, StepStatus, WakeEntry, WakeKind, WorkflowRun,
};
pub use nonempty::NonEmpty;
pub use replay::{ChildHandle, ShieldGuard, WorkflowCtx};
pub use runtime::{EngineBuilder, Registry, RuntimeConfig, WorkerMode, WorkflowEngine};
pub use store::{CreateRunOutcome, MemoryStore, RunFilter, RunUpdate, Storage, StepUpdate};
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use workflow::{
    step_fn, ChildOptions, FnStepHandler, HookOptions, ParamSpec, ParamType, RetryPolicy,
    StepHandler, StepOptions, StepRequest, Workflow, WorkflowDescriptor,
};
