//! In-memory storage backend.
//!
//! Single-mutex implementation for tests and single-process development.
//! Every operation takes the lock once, so the CAS semantics of the
//! contract hold trivially; nothing here awaits while holding the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use super::{CreateRunOutcome, RunFilter, RunUpdate, Storage, StepUpdate};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::model::{
    HookRecord, HookStatus, RunClaim, RunStatus, ScheduleSpec, StepRecord, StepStatus, WakeEntry,
    WorkflowRun,
};

#[derive(Default)]
struct Inner {
    runs: HashMap<String, WorkflowRun>,
    /// `(workflow_name, idempotency_key)` → run_id.
    idempotency: HashMap<(String, String), String>,
    /// run_id → ordered events (sequence = position + 1).
    events: HashMap<String, Vec<Event>>,
    steps: HashMap<String, StepRecord>,
    hooks: HashMap<String, HookRecord>,
    claims: HashMap<String, RunClaim>,
    wakes: Vec<WakeEntry>,
    schedules: HashMap<String, ScheduleSpec>,
}

/// In-memory store. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn create_run(&self, run: WorkflowRun) -> Result<CreateRunOutcome> {
        let mut inner = self.lock();

        if let Some(key) = &run.idempotency_key {
            let idem_key = (run.workflow_name.clone(), key.clone());
            if let Some(existing_id) = inner.idempotency.get(&idem_key) {
                let existing = inner
                    .runs
                    .get(existing_id)
                    .cloned()
                    .ok_or_else(|| Error::Storage("idempotency index dangling".into()))?;
                return Ok(CreateRunOutcome::Existing(existing));
            }
            inner.idempotency.insert(idem_key, run.run_id.clone());
        }

        if inner.runs.contains_key(&run.run_id) {
            return Err(Error::Conflict(format!("run {} already exists", run.run_id)));
        }
        inner.runs.insert(run.run_id.clone(), run);
        Ok(CreateRunOutcome::Created)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        Ok(self.lock().runs.get(run_id).cloned())
    }

    async fn get_run_by_idempotency_key(
        &self,
        workflow_name: &str,
        key: &str,
    ) -> Result<Option<WorkflowRun>> {
        let inner = self.lock();
        let run_id = inner
            .idempotency
            .get(&(workflow_name.to_string(), key.to_string()));
        Ok(run_id.and_then(|id| inner.runs.get(id)).cloned())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        from: &[RunStatus],
        to: RunStatus,
        update: RunUpdate,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(run) = inner.runs.get_mut(run_id) else {
            return Err(Error::RunNotFound(run_id.to_string()));
        };
        if !from.contains(&run.status) {
            return Ok(false);
        }

        run.status = to;
        if let Some(result) = update.result {
            run.result = Some(result);
            run.error = None;
        }
        if let Some(error) = update.error {
            run.error = Some(error);
            run.result = None;
        }
        if update.started_at.is_some() {
            run.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            run.completed_at = update.completed_at;
        }
        if update.continued_to.is_some() {
            run.continued_to = update.continued_to;
        }
        run.updated_at = update
            .updated_at
            .or(update.completed_at)
            .or(update.started_at)
            .unwrap_or(run.updated_at);
        Ok(true)
    }

    async fn set_recovery_attempts(&self, run_id: &str, attempts: u32) -> Result<()> {
        let mut inner = self.lock();
        let Some(run) = inner.runs.get_mut(run_id) else {
            return Err(Error::RunNotFound(run_id.to_string()));
        };
        run.recovery_attempts = attempts;
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>> {
        let inner = self.lock();
        let mut runs: Vec<_> = inner
            .runs
            .values()
            .filter(|run| {
                filter
                    .workflow_name
                    .as_ref()
                    .is_none_or(|name| &run.workflow_name == name)
                    && filter.status.is_none_or(|status| run.status == status)
                    && filter
                        .parent_run_id
                        .as_ref()
                        .is_none_or(|parent| run.parent_run_id.as_ref() == Some(parent))
                    && filter.created_after.is_none_or(|t| run.created_at >= t)
                    && filter.created_before.is_none_or(|t| run.created_at <= t)
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.run_id.cmp(&b.run_id)));

        let limit = if filter.limit == 0 { 100 } else { filter.limit } as usize;
        Ok(runs
            .into_iter()
            .skip(filter.cursor as usize)
            .take(limit)
            .collect())
    }

    async fn append_event_at(&self, expected_sequence: u64, mut event: Event) -> Result<Event> {
        let mut inner = self.lock();
        let log = inner.events.entry(event.run_id.clone()).or_default();
        let next = log.len() as u64 + 1;
        if expected_sequence != next {
            return Err(Error::Conflict(format!(
                "sequence {expected_sequence} for run {} but next is {next}",
                event.run_id
            )));
        }
        event.sequence = Some(next);
        log.push(event.clone());
        Ok(event)
    }

    async fn latest_sequence(&self, run_id: &str) -> Result<u64> {
        Ok(self
            .lock()
            .events
            .get(run_id)
            .map(|log| log.len() as u64)
            .unwrap_or(0))
    }

    async fn read_events(&self, run_id: &str, from_sequence: Option<u64>) -> Result<Vec<Event>> {
        let inner = self.lock();
        let log = inner.events.get(run_id).cloned().unwrap_or_default();
        match from_sequence {
            Some(from) => Ok(log
                .into_iter()
                .filter(|e| e.sequence.unwrap_or(0) >= from)
                .collect()),
            None => Ok(log),
        }
    }

    async fn put_step(&self, step: StepRecord) -> Result<()> {
        self.lock().steps.insert(step.step_id.clone(), step);
        Ok(())
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<StepRecord>> {
        Ok(self.lock().steps.get(step_id).cloned())
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        let inner = self.lock();
        let mut steps: Vec<_> = inner
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.step_id.cmp(&b.step_id)));
        Ok(steps)
    }

    async fn update_step(
        &self,
        step_id: &str,
        from: StepStatus,
        update: StepUpdate,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(step) = inner.steps.get_mut(step_id) else {
            return Err(Error::Storage(format!("step {step_id} not found")));
        };
        if step.status != from {
            return Ok(false);
        }

        if let Some(status) = update.status {
            step.status = status;
        }
        if let Some(attempt) = update.attempt {
            step.attempt = attempt;
        }
        if let Some(result) = update.result {
            step.result = Some(result);
            step.error = None;
        }
        if let Some(error) = update.error {
            step.error = Some(error);
        }
        if update.started_at.is_some() {
            step.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            step.completed_at = update.completed_at;
            step.updated_at = update.completed_at.unwrap_or(step.updated_at);
        }
        if let Some(lock) = update.lock {
            match lock {
                Some((worker_id, until)) => {
                    step.locked_by = Some(worker_id);
                    step.locked_until = Some(until);
                }
                None => {
                    step.locked_by = None;
                    step.locked_until = None;
                }
            }
        }
        if update.retry_at.is_some() {
            step.retry_at = update.retry_at;
        }
        if let Some(recovery) = update.recovery_attempts {
            step.recovery_attempts = recovery;
        }
        Ok(true)
    }

    async fn list_expired_step_leases(&self, now: OffsetDateTime) -> Result<Vec<StepRecord>> {
        let inner = self.lock();
        Ok(inner
            .steps
            .values()
            .filter(|s| {
                s.status == StepStatus::Running
                    && s.locked_until.is_some_and(|until| until <= now)
            })
            .cloned()
            .collect())
    }

    async fn list_orphaned_pending_steps(
        &self,
        now: OffsetDateTime,
        grace: Duration,
    ) -> Result<Vec<StepRecord>> {
        let inner = self.lock();
        Ok(inner
            .steps
            .values()
            .filter(|s| {
                s.status == StepStatus::Pending
                    && s.retry_at.unwrap_or(s.created_at) + grace <= now
            })
            .cloned()
            .collect())
    }

    async fn put_hook(&self, hook: HookRecord) -> Result<()> {
        self.lock().hooks.insert(hook.hook_id.clone(), hook);
        Ok(())
    }

    async fn get_hook(&self, hook_id: &str) -> Result<Option<HookRecord>> {
        Ok(self.lock().hooks.get(hook_id).cloned())
    }

    async fn find_pending_hook(&self, run_id: &str, name: &str) -> Result<Option<HookRecord>> {
        let inner = self.lock();
        Ok(inner
            .hooks
            .values()
            .find(|h| h.run_id == run_id && h.name == name && h.status == HookStatus::Pending)
            .cloned())
    }

    async fn list_hooks(&self, run_id: &str) -> Result<Vec<HookRecord>> {
        let inner = self.lock();
        let mut hooks: Vec<_> = inner
            .hooks
            .values()
            .filter(|h| h.run_id == run_id)
            .cloned()
            .collect();
        hooks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.hook_id.cmp(&b.hook_id)));
        Ok(hooks)
    }

    async fn transition_hook(
        &self,
        hook_id: &str,
        to: HookStatus,
        payload: Option<Value>,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(hook) = inner.hooks.get_mut(hook_id) else {
            return Err(Error::HookNotFound {
                run_id: String::new(),
                hook: hook_id.to_string(),
            });
        };
        if hook.status != HookStatus::Pending {
            return Ok(false);
        }

        hook.status = to;
        if to == HookStatus::Received {
            hook.payload = payload;
            hook.received_at = Some(now);
        }
        Ok(true)
    }

    async fn claim_run(
        &self,
        run_id: &str,
        worker_id: &str,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<Option<RunClaim>> {
        let mut inner = self.lock();
        if let Some(existing) = inner.claims.get(run_id) {
            if existing.expires_at > now && existing.worker_id != worker_id {
                return Ok(None);
            }
        }
        let claim = RunClaim {
            run_id: run_id.to_string(),
            worker_id: worker_id.to_string(),
            claimed_at: now,
            expires_at: now + ttl,
        };
        inner.claims.insert(run_id.to_string(), claim.clone());
        Ok(Some(claim))
    }

    async fn release_claim(&self, run_id: &str, worker_id: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner
            .claims
            .get(run_id)
            .is_some_and(|c| c.worker_id == worker_id)
        {
            inner.claims.remove(run_id);
        }
        Ok(())
    }

    async fn pop_expired_claims(&self, now: OffsetDateTime) -> Result<Vec<RunClaim>> {
        let mut inner = self.lock();
        let expired: Vec<RunClaim> = inner
            .claims
            .values()
            .filter(|c| c.expires_at <= now)
            .cloned()
            .collect();
        for claim in &expired {
            inner.claims.remove(&claim.run_id);
        }
        Ok(expired)
    }

    async fn schedule_wake(&self, wake: WakeEntry) -> Result<()> {
        self.lock().wakes.push(wake);
        Ok(())
    }

    async fn pop_due_wakes(&self, now: OffsetDateTime, limit: u32) -> Result<Vec<WakeEntry>> {
        let mut inner = self.lock();
        inner.wakes.sort_by_key(|w| w.wake_at);
        let due = inner
            .wakes
            .iter()
            .take_while(|w| w.wake_at <= now)
            .take(limit as usize)
            .count();
        Ok(inner.wakes.drain(..due).collect())
    }

    async fn cancel_wakes(&self, run_id: &str) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.wakes.len();
        inner.wakes.retain(|w| w.run_id != run_id);
        Ok((before - inner.wakes.len()) as u64)
    }

    async fn put_schedule(&self, spec: ScheduleSpec) -> Result<()> {
        self.lock().schedules.insert(spec.schedule_id.clone(), spec);
        Ok(())
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleSpec>> {
        Ok(self.lock().schedules.get(schedule_id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleSpec>> {
        let inner = self.lock();
        let mut specs: Vec<_> = inner.schedules.values().cloned().collect();
        specs.sort_by(|a, b| a.schedule_id.cmp(&b.schedule_id));
        Ok(specs)
    }

    async fn due_schedules(&self, now: OffsetDateTime) -> Result<Vec<ScheduleSpec>> {
        let inner = self.lock();
        Ok(inner
            .schedules
            .values()
            .filter(|s| s.enabled && s.next_fire_at <= now)
            .cloned()
            .collect())
    }

    async fn advance_schedule(
        &self,
        schedule_id: &str,
        next_fire_at: OffsetDateTime,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(spec) = inner.schedules.get_mut(schedule_id) {
            spec.next_fire_at = next_fire_at;
        }
        Ok(())
    }

    async fn healthy(&self) -> Result<()> {
        Ok(())
    }
}
