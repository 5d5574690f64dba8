//! Runtime configuration.

use std::time::Duration;

/// Configuration for workers, claims, recovery, and scheduling.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use windlass::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     workflow_workers: 2,
///     step_workers: 4,
///     claim_ttl: Duration::from_secs(60),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Exclusive lease duration for a run while a worker ticks it.
    ///
    /// Must exceed the longest expected tick (replay + commit). Expired
    /// claims make the run eligible for the recovery sweeper. Default: 30s.
    pub claim_ttl: Duration,

    /// Lease duration for a step while a worker executes it. Should exceed
    /// the step timeout. Default: 10 minutes.
    pub step_lease: Duration,

    /// How long a poller blocks on an empty queue before re-checking
    /// shutdown. Default: 250ms.
    pub poll_wait: Duration,

    /// Redelivery delay after an engine error aborts a task without
    /// appending events. Default: 1 second.
    pub nack_delay: Duration,

    /// Number of workflow-tick pollers. Default: 1.
    pub workflow_workers: usize,

    /// Number of step-task pollers. Default: 2.
    pub step_workers: usize,

    /// Recovery sweeper cadence. Default: 5 seconds.
    pub sweep_interval: Duration,

    /// Wake-index scan cadence (sleeps, hook expiry, run timeouts).
    /// Default: 1 second.
    pub wake_poll_interval: Duration,

    /// Maximum wakes consumed per scan. Default: 64.
    pub wake_batch: u32,

    /// Schedule ticker cadence. Default: 2 seconds.
    pub schedule_poll_interval: Duration,

    /// Default recovery budget for runs whose descriptor does not override
    /// it. Default: 3.
    pub max_recovery_attempts: u32,

    /// Maximum child-workflow nesting depth (0 = root). Default: 3.
    pub nesting_limit: u32,

    /// Maximum time to wait for in-flight tasks during shutdown.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Worker identifier used in claims and leases. A UUID is generated
    /// when unset.
    pub worker_id: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::from_secs(30),
            step_lease: Duration::from_secs(600),
            poll_wait: Duration::from_millis(250),
            nack_delay: Duration::from_secs(1),
            workflow_workers: 1,
            step_workers: 2,
            sweep_interval: Duration::from_secs(5),
            wake_poll_interval: Duration::from_secs(1),
            wake_batch: 64,
            schedule_poll_interval: Duration::from_secs(2),
            max_recovery_attempts: 3,
            nesting_limit: 3,
            shutdown_timeout: Duration::from_secs(30),
            worker_id: None,
        }
    }
}
