//! Worker pollers and lifecycle.
//!
//! A worker process runs some combination of workflow-tick pollers,
//! step-task pollers, the recovery/wake sweeper, and the schedule ticker,
//! selected by [`WorkerMode`]. A workflow-tick for a given run is
//! serialized across the fleet by the run claim; step tasks for one run can
//! execute in parallel only when the body forked them.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery, Queue, Task};
use crate::client::WorkflowClient;
use crate::error::Result;
use crate::runtime::registry::{EngineContext, WorkflowEngine};
use crate::runtime::{dispatcher, scheduler, step_task, sweeper};
use crate::store::Storage;

/// Which task classes this worker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerMode {
    /// Workflow ticks, step tasks, sweeps, and schedules.
    #[default]
    All,
    /// Workflow ticks and sweeps only.
    WorkflowOnly,
    /// Step tasks only.
    StepOnly,
    /// Schedule ticker only.
    ScheduleOnly,
}

impl WorkerMode {
    fn workflow_pollers(&self, configured: usize) -> usize {
        match self {
            WorkerMode::All | WorkerMode::WorkflowOnly => configured.max(1),
            _ => 0,
        }
    }

    fn step_pollers(&self, configured: usize) -> usize {
        match self {
            WorkerMode::All | WorkerMode::StepOnly => configured.max(1),
            _ => 0,
        }
    }

    fn runs_sweeper(&self) -> bool {
        matches!(self, WorkerMode::All | WorkerMode::WorkflowOnly)
    }

    fn runs_scheduler(&self) -> bool {
        matches!(self, WorkerMode::All | WorkerMode::ScheduleOnly)
    }
}

impl<S, B> WorkflowEngine<S, B>
where
    S: Storage,
    B: Broker,
{
    /// Run workers until the shutdown future completes.
    ///
    /// # Example
    ///
    /// ```ignore
    /// engine
    ///     .run_worker(WorkerMode::All, async {
    ///         tokio::signal::ctrl_c().await.ok();
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_worker<F>(&self, mode: WorkerMode, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::clone(&self.ctx);
        let client = self.client().clone();

        let workflow_pollers = mode.workflow_pollers(ctx.config.workflow_workers);
        let step_pollers = mode.step_pollers(ctx.config.step_workers);

        info!(
            worker_id = %ctx.worker_id,
            ?mode,
            workflows = ctx.registry.workflow_count(),
            workflow_pollers,
            step_pollers,
            "worker starting"
        );

        let mut handles = Vec::new();

        for i in 0..workflow_pollers {
            let poller = QueuePoller {
                ctx: Arc::clone(&ctx),
                client: client.clone(),
                queue: Queue::Workflow,
                label: format!("{}-workflow-{i}", ctx.worker_id),
            };
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { poller.run(rx).await }));
        }

        for i in 0..step_pollers {
            let poller = QueuePoller {
                ctx: Arc::clone(&ctx),
                client: client.clone(),
                queue: Queue::Step,
                label: format!("{}-step-{i}", ctx.worker_id),
            };
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { poller.run(rx).await }));
        }

        if mode.runs_sweeper() {
            let sweeper_ctx = Arc::clone(&ctx);
            let sweeper_client = client.clone();
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                run_sweeper(sweeper_ctx, sweeper_client, rx).await;
            }));
        }

        if mode.runs_scheduler() {
            let scheduler_ctx = Arc::clone(&ctx);
            let scheduler_client = client.clone();
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                run_scheduler(scheduler_ctx, scheduler_client, rx).await;
            }));
        }

        shutdown.await;
        let _ = shutdown_tx.send(true);

        let all_workers = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        match tokio::time::timeout(ctx.config.shutdown_timeout, all_workers).await {
            Ok(()) => info!(worker_id = %ctx.worker_id, "worker stopped gracefully"),
            Err(_) => warn!(
                worker_id = %ctx.worker_id,
                timeout_secs = ctx.config.shutdown_timeout.as_secs(),
                "shutdown timeout exceeded, forcing stop"
            ),
        }

        Ok(())
    }
}

struct QueuePoller<S, B> {
    ctx: Arc<EngineContext<S, B>>,
    client: WorkflowClient<S, B>,
    queue: Queue,
    label: String,
}

impl<S, B> QueuePoller<S, B>
where
    S: Storage,
    B: Broker,
{
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(poller = %self.label, queue = %self.queue, "poller started");

        loop {
            tokio::select! {
                delivery = self.ctx.broker.dequeue(self.queue, self.ctx.config.poll_wait) => {
                    match delivery {
                        Ok(Some(delivery)) => self.handle(delivery).await,
                        Ok(None) => {}
                        Err(e) => {
                            error!(poller = %self.label, error = %e, "dequeue failed");
                            tokio::time::sleep(self.ctx.config.nack_delay).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(poller = %self.label, "poller shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let receipt = delivery.receipt;
        let outcome = match &delivery.task {
            Task::WorkflowTick { run_id } => {
                dispatcher::run_tick(&self.ctx, &self.client, run_id)
                    .await
                    .map(|outcome| debug!(run_id, ?outcome, "tick handled"))
            }
            Task::RunStep { run_id, step_id } => {
                step_task::run_step(&self.ctx, &self.client, run_id, step_id).await
            }
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.ctx.broker.ack(self.queue, receipt).await {
                    error!(poller = %self.label, error = %e, "ack failed");
                }
            }
            Err(e) => {
                // Engine errors (lost claims, storage hiccups) redeliver;
                // handlers are idempotent against the log.
                debug!(poller = %self.label, error = %e, "task aborted; redelivering");
                if let Err(e) = self
                    .ctx
                    .broker
                    .nack(self.queue, receipt, self.ctx.config.nack_delay)
                    .await
                {
                    error!(poller = %self.label, error = %e, "nack failed");
                }
            }
        }
    }
}

async fn run_sweeper<S, B>(
    ctx: Arc<EngineContext<S, B>>,
    client: WorkflowClient<S, B>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Storage,
    B: Broker,
{
    let mut recovery = interval(ctx.config.sweep_interval);
    recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut wakes = interval(ctx.config.wake_poll_interval);
    wakes.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(worker_id = %ctx.worker_id, "sweeper started");

    loop {
        tokio::select! {
            _ = recovery.tick() => {
                if let Err(e) = sweeper::sweep_recovery(&ctx, &client).await {
                    error!(error = %e, "recovery sweep failed");
                }
            }
            _ = wakes.tick() => {
                if let Err(e) = sweeper::sweep_wakes(&ctx, &client).await {
                    error!(error = %e, "wake sweep failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("sweeper shutting down");
                    break;
                }
            }
        }
    }
}

async fn run_scheduler<S, B>(
    ctx: Arc<EngineContext<S, B>>,
    client: WorkflowClient<S, B>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Storage,
    B: Broker,
{
    let mut ticker = interval(ctx.config.schedule_poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(worker_id = %ctx.worker_id, "schedule ticker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = scheduler::sweep_schedules(&ctx, &client).await {
                    error!(error = %e, "schedule sweep failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("schedule ticker shutting down");
                    break;
                }
            }
        }
    }
}
