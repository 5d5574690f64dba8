//! Task-queue contract between the scheduler and the workers.
//!
//! Two logical queues flow through the broker: **workflow-ticks** (re-drive
//! one run) and **step-tasks** (execute one step invocation). Schedule
//! wake-ups share the workflow-tick queue. Delivery is at-least-once with
//! acknowledgements; duplicates are benign because every handler re-checks
//! the event log before side effects. The durable truth for wall-clock
//! wake-ups is the storage wake index, not the broker.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryBroker;

use crate::error::Result;

/// The two task classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Re-drive the workflow body of `run_id` once.
    WorkflowTick { run_id: String },
    /// Execute a single step invocation.
    RunStep { run_id: String, step_id: String },
}

impl Task {
    /// The queue this task travels on.
    pub fn queue(&self) -> Queue {
        match self {
            Task::WorkflowTick { .. } => Queue::Workflow,
            Task::RunStep { .. } => Queue::Step,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Task::WorkflowTick { run_id } | Task::RunStep { run_id, .. } => run_id,
        }
    }
}

/// Logical queue names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    Workflow,
    Step,
}

impl Queue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Workflow => "workflow",
            Queue::Step => "step",
        }
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claimed message. Must be settled with `ack` or `nack`; unsettled
/// deliveries reappear after the broker's visibility timeout.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task: Task,
    /// Opaque settlement handle.
    pub receipt: u64,
    /// 1-based delivery attempt.
    pub attempt: u32,
}

/// Broker contract.
///
/// Implementations must support delayed delivery (messages become visible
/// at their due time) and redelivery of unacknowledged messages. The
/// `cancel_steps` primitive is best-effort: the event log stays the durable
/// truth for whether a step may still execute.
#[async_trait]
pub trait Broker: Send + Sync + Clone + 'static {
    /// Enqueue a task, optionally delayed.
    async fn enqueue(&self, task: Task, delay: Option<Duration>) -> Result<()>;

    /// Claim the next visible task on `queue`, waiting up to `wait`.
    /// Returns `None` on timeout.
    async fn dequeue(&self, queue: Queue, wait: Duration) -> Result<Option<Delivery>>;

    /// Settle a delivery as processed.
    async fn ack(&self, queue: Queue, receipt: u64) -> Result<()>;

    /// Return a delivery to the queue, visible again after `delay`.
    async fn nack(&self, queue: Queue, receipt: u64, delay: Duration) -> Result<()>;

    /// Best-effort removal of pending (not in-flight) step tasks for a run.
    /// Returns how many were removed.
    async fn cancel_steps(&self, run_id: &str) -> Result<u64>;
}
