//! Runtime: registries, workers, dispatch, recovery, and schedules.
//!
//! - [`WorkflowEngine`] / [`EngineBuilder`] — assemble storage, broker,
//!   clock, registry, and configuration
//! - [`RuntimeConfig`] — claims, leases, poll cadences, recovery budgets
//! - [`WorkerMode`] — which task classes a worker process serves

mod config;
pub(crate) mod dispatcher;
pub(crate) mod registry;
pub(crate) mod scheduler;
pub(crate) mod step_task;
pub(crate) mod sweeper;
mod worker;

pub use config::RuntimeConfig;
pub use registry::{EngineBuilder, Registry, WorkflowEngine};
pub use worker::WorkerMode;
