//! PostgreSQL store implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use time::OffsetDateTime;

use super::{CreateRunOutcome, RunFilter, RunUpdate, Storage, StepUpdate};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::{
    Cadence, HookRecord, HookStatus, RunClaim, RunStatus, ScheduleSpec, StepRecord, StepStatus,
    WakeEntry, WakeKind, WorkflowRun,
};

/// PostgreSQL-backed store for production use.
///
/// Uses row-level locking (`SELECT ... FOR UPDATE`) for the status CAS
/// operations and `FOR UPDATE SKIP LOCKED` for wake consumption, so
/// multiple workers coordinate without long-held locks.
///
/// # Schema
///
/// All tables live in the `windlass` schema; [`PgStore::migrate`] creates
/// them idempotently:
///
/// | Table       | Purpose                                             |
/// |-------------|-----------------------------------------------------|
/// | `runs`      | Run records; unique `(workflow_name, idempotency_key)` |
/// | `events`    | Append-only log; unique `(run_id, sequence)`        |
/// | `steps`     | Step records with execution leases                  |
/// | `hooks`     | Hook inbox slots                                    |
/// | `claims`    | Run claims (time-bounded leases)                    |
/// | `wakes`     | Persistent timer index                              |
/// | `schedules` | Cron/interval trigger specs                         |
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

const SCHEMA: &str = r#"
CREATE SCHEMA IF NOT EXISTS windlass;

CREATE TABLE IF NOT EXISTS windlass.runs (
    run_id                TEXT PRIMARY KEY,
    workflow_name         TEXT NOT NULL,
    status                TEXT NOT NULL,
    created_at            TIMESTAMPTZ NOT NULL,
    updated_at            TIMESTAMPTZ NOT NULL,
    started_at            TIMESTAMPTZ,
    completed_at          TIMESTAMPTZ,
    input                 JSONB NOT NULL,
    result                JSONB,
    error                 TEXT,
    idempotency_key       TEXT,
    max_duration_ms       BIGINT,
    metadata              JSONB NOT NULL DEFAULT '{}'::jsonb,
    tags                  JSONB NOT NULL DEFAULT '[]'::jsonb,
    recovery_attempts     INTEGER NOT NULL DEFAULT 0,
    max_recovery_attempts INTEGER NOT NULL DEFAULT 3,
    parent_run_id         TEXT,
    nesting_depth         INTEGER NOT NULL DEFAULT 0,
    continued_to          TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS runs_idempotency
    ON windlass.runs (workflow_name, idempotency_key)
    WHERE idempotency_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS runs_status_created
    ON windlass.runs (status, created_at DESC);
CREATE INDEX IF NOT EXISTS runs_parent
    ON windlass.runs (parent_run_id)
    WHERE parent_run_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS windlass.events (
    event_id   TEXT NOT NULL,
    run_id     TEXT NOT NULL,
    sequence   BIGINT NOT NULL,
    type       TEXT NOT NULL,
    timestamp  TIMESTAMPTZ NOT NULL,
    data       JSONB NOT NULL,
    PRIMARY KEY (run_id, sequence)
);

CREATE TABLE IF NOT EXISTS windlass.steps (
    step_id           TEXT PRIMARY KEY,
    run_id            TEXT NOT NULL,
    step_name         TEXT NOT NULL,
    status            TEXT NOT NULL,
    attempt           INTEGER NOT NULL DEFAULT 1,
    max_retries       INTEGER NOT NULL DEFAULT 3,
    args              JSONB NOT NULL,
    result            JSONB,
    error             TEXT,
    created_at        TIMESTAMPTZ NOT NULL,
    updated_at        TIMESTAMPTZ NOT NULL,
    started_at        TIMESTAMPTZ,
    completed_at      TIMESTAMPTZ,
    locked_by         TEXT,
    locked_until      TIMESTAMPTZ,
    retry_at          TIMESTAMPTZ,
    recovery_attempts INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS steps_run ON windlass.steps (run_id);
CREATE INDEX IF NOT EXISTS steps_expired_leases
    ON windlass.steps (locked_until)
    WHERE status = 'running';

CREATE TABLE IF NOT EXISTS windlass.hooks (
    hook_id     TEXT PRIMARY KEY,
    run_id      TEXT NOT NULL,
    name        TEXT NOT NULL,
    status      TEXT NOT NULL,
    payload     JSONB,
    schema      JSONB,
    created_at  TIMESTAMPTZ NOT NULL,
    received_at TIMESTAMPTZ,
    expires_at  TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS hooks_run ON windlass.hooks (run_id);

CREATE TABLE IF NOT EXISTS windlass.claims (
    run_id     TEXT PRIMARY KEY,
    worker_id  TEXT NOT NULL,
    claimed_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS windlass.wakes (
    id      BIGSERIAL PRIMARY KEY,
    run_id  TEXT NOT NULL,
    wake_at TIMESTAMPTZ NOT NULL,
    kind    JSONB NOT NULL
);

CREATE INDEX IF NOT EXISTS wakes_due ON windlass.wakes (wake_at);

CREATE TABLE IF NOT EXISTS windlass.schedules (
    schedule_id   TEXT PRIMARY KEY,
    workflow_name TEXT NOT NULL,
    input         JSONB NOT NULL,
    cadence       JSONB NOT NULL,
    enabled       BOOLEAN NOT NULL DEFAULT TRUE,
    next_fire_at  TIMESTAMPTZ NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS schedules_due
    ON windlass.schedules (next_fire_at)
    WHERE enabled;
"#;

impl PgStore {
    /// Create a store from an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given DSN.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPool::connect(dsn).await?;
        Ok(Self::new(pool))
    }

    /// Create the `windlass` schema and tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn run_for_update(
        tx: &mut Transaction<'_, Postgres>,
        run_id: &str,
    ) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM windlass.runs WHERE run_id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(run_from_row).transpose()
    }
}

fn run_from_row(row: PgRow) -> Result<WorkflowRun> {
    let status: String = row.try_get("status")?;
    let tags: Value = row.try_get("tags")?;
    Ok(WorkflowRun {
        run_id: row.try_get("run_id")?,
        workflow_name: row.try_get("workflow_name")?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| Error::Storage(format!("unknown run status '{status}'")))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        input: row.try_get("input")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        idempotency_key: row.try_get("idempotency_key")?,
        max_duration_ms: row
            .try_get::<Option<i64>, _>("max_duration_ms")?
            .map(|v| v as u64),
        metadata: row.try_get("metadata")?,
        tags: serde_json::from_value(tags)?,
        recovery_attempts: row.try_get::<i32, _>("recovery_attempts")? as u32,
        max_recovery_attempts: row.try_get::<i32, _>("max_recovery_attempts")? as u32,
        parent_run_id: row.try_get("parent_run_id")?,
        nesting_depth: row.try_get::<i32, _>("nesting_depth")? as u32,
        continued_to: row.try_get("continued_to")?,
    })
}

fn event_from_row(row: PgRow) -> Result<Event> {
    let kind: String = row.try_get("type")?;
    let kind: EventKind = serde_json::from_value(Value::String(kind))?;
    Ok(Event {
        event_id: row.try_get("event_id")?,
        run_id: row.try_get("run_id")?,
        sequence: Some(row.try_get::<i64, _>("sequence")? as u64),
        kind,
        timestamp: row.try_get("timestamp")?,
        data: row.try_get("data")?,
    })
}

fn step_from_row(row: PgRow) -> Result<StepRecord> {
    let status: String = row.try_get("status")?;
    let status: StepStatus = serde_json::from_value(Value::String(status))?;
    Ok(StepRecord {
        step_id: row.try_get("step_id")?,
        run_id: row.try_get("run_id")?,
        step_name: row.try_get("step_name")?,
        status,
        attempt: row.try_get::<i32, _>("attempt")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        args: row.try_get("args")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        locked_by: row.try_get("locked_by")?,
        locked_until: row.try_get("locked_until")?,
        retry_at: row.try_get("retry_at")?,
        recovery_attempts: row.try_get::<i32, _>("recovery_attempts")? as u32,
    })
}

fn hook_from_row(row: PgRow) -> Result<HookRecord> {
    let status: String = row.try_get("status")?;
    let status: HookStatus = serde_json::from_value(Value::String(status))?;
    Ok(HookRecord {
        hook_id: row.try_get("hook_id")?,
        run_id: row.try_get("run_id")?,
        name: row.try_get("name")?,
        status,
        payload: row.try_get("payload")?,
        schema: row.try_get("schema")?,
        created_at: row.try_get("created_at")?,
        received_at: row.try_get("received_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn claim_from_row(row: PgRow) -> Result<RunClaim> {
    Ok(RunClaim {
        run_id: row.try_get("run_id")?,
        worker_id: row.try_get("worker_id")?,
        claimed_at: row.try_get("claimed_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn wake_from_row(row: PgRow) -> Result<WakeEntry> {
    let kind: Value = row.try_get("kind")?;
    Ok(WakeEntry {
        run_id: row.try_get("run_id")?,
        wake_at: row.try_get("wake_at")?,
        kind: serde_json::from_value::<WakeKind>(kind)?,
    })
}

fn schedule_from_row(row: PgRow) -> Result<ScheduleSpec> {
    let cadence: Value = row.try_get("cadence")?;
    Ok(ScheduleSpec {
        schedule_id: row.try_get("schedule_id")?,
        workflow_name: row.try_get("workflow_name")?,
        input: row.try_get("input")?,
        cadence: serde_json::from_value::<Cadence>(cadence)?,
        enabled: row.try_get("enabled")?,
        next_fire_at: row.try_get("next_fire_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[async_trait]
impl Storage for PgStore {
    async fn create_run(&self, run: WorkflowRun) -> Result<CreateRunOutcome> {
        let inserted = sqlx::query(
            r#"INSERT INTO windlass.runs (
                   run_id, workflow_name, status, created_at, updated_at,
                   started_at, completed_at, input, result, error,
                   idempotency_key, max_duration_ms, metadata, tags,
                   recovery_attempts, max_recovery_attempts, parent_run_id,
                   nesting_depth, continued_to
               ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)
               ON CONFLICT (workflow_name, idempotency_key)
                   WHERE idempotency_key IS NOT NULL
                   DO NOTHING"#,
        )
        .bind(&run.run_id)
        .bind(&run.workflow_name)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.input)
        .bind(&run.result)
        .bind(&run.error)
        .bind(&run.idempotency_key)
        .bind(run.max_duration_ms.map(|v| v as i64))
        .bind(&run.metadata)
        .bind(serde_json::to_value(&run.tags)?)
        .bind(run.recovery_attempts as i32)
        .bind(run.max_recovery_attempts as i32)
        .bind(&run.parent_run_id)
        .bind(run.nesting_depth as i32)
        .bind(&run.continued_to)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(CreateRunOutcome::Created);
        }

        let key = run
            .idempotency_key
            .as_deref()
            .ok_or_else(|| Error::Conflict(format!("run {} already exists", run.run_id)))?;
        let existing = self
            .get_run_by_idempotency_key(&run.workflow_name, key)
            .await?
            .ok_or_else(|| Error::Storage("idempotency conflict without existing run".into()))?;
        Ok(CreateRunOutcome::Existing(existing))
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM windlass.runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(run_from_row).transpose()
    }

    async fn get_run_by_idempotency_key(
        &self,
        workflow_name: &str,
        key: &str,
    ) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query(
            "SELECT * FROM windlass.runs WHERE workflow_name = $1 AND idempotency_key = $2",
        )
        .bind(workflow_name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(run_from_row).transpose()
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        from: &[RunStatus],
        to: RunStatus,
        update: RunUpdate,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(run) = Self::run_for_update(&mut tx, run_id).await? else {
            return Err(Error::RunNotFound(run_id.to_string()));
        };
        if !from.contains(&run.status) {
            return Ok(false);
        }

        let result = update.result.or_else(|| {
            if update.error.is_some() {
                None
            } else {
                run.result
            }
        });
        let error = if result.is_some() {
            None
        } else {
            update.error.or(run.error)
        };
        let started_at = update.started_at.or(run.started_at);
        let completed_at = update.completed_at.or(run.completed_at);
        let continued_to = update.continued_to.or(run.continued_to);
        let updated_at = update
            .updated_at
            .or(completed_at)
            .or(started_at)
            .unwrap_or(run.updated_at);

        sqlx::query(
            r#"UPDATE windlass.runs
               SET status = $2, result = $3, error = $4, started_at = $5,
                   completed_at = $6, continued_to = $7, updated_at = $8
               WHERE run_id = $1"#,
        )
        .bind(run_id)
        .bind(to.as_str())
        .bind(&result)
        .bind(&error)
        .bind(started_at)
        .bind(completed_at)
        .bind(&continued_to)
        .bind(updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn set_recovery_attempts(&self, run_id: &str, attempts: u32) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE windlass.runs SET recovery_attempts = $2 WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(attempts as i32)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>> {
        let mut builder =
            sqlx::QueryBuilder::<Postgres>::new("SELECT * FROM windlass.runs WHERE TRUE");
        if let Some(workflow_name) = &filter.workflow_name {
            builder.push(" AND workflow_name = ").push_bind(workflow_name);
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(parent) = &filter.parent_run_id {
            builder.push(" AND parent_run_id = ").push_bind(parent);
        }
        if let Some(after) = filter.created_after {
            builder.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            builder.push(" AND created_at <= ").push_bind(before);
        }
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        builder.push(" ORDER BY created_at DESC, run_id ASC");
        builder.push(" LIMIT ").push_bind(limit as i64);
        builder.push(" OFFSET ").push_bind(filter.cursor as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(run_from_row).collect()
    }

    async fn append_event_at(&self, expected_sequence: u64, mut event: Event) -> Result<Event> {
        let latest = self.latest_sequence(&event.run_id).await?;
        if expected_sequence != latest + 1 {
            return Err(Error::Conflict(format!(
                "sequence {expected_sequence} for run {} but next is {}",
                event.run_id,
                latest + 1
            )));
        }

        let result = sqlx::query(
            r#"INSERT INTO windlass.events (event_id, run_id, sequence, type, timestamp, data)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&event.event_id)
        .bind(&event.run_id)
        .bind(expected_sequence as i64)
        .bind(event.kind.as_str())
        .bind(event.timestamp)
        .bind(&event.data)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                event.sequence = Some(expected_sequence);
                Ok(event)
            }
            // A concurrent appender won the slot; callers retry with a
            // fresh read.
            Err(err) if is_unique_violation(&err) => Err(Error::Conflict(format!(
                "sequence {expected_sequence} for run {} was taken",
                event.run_id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn latest_sequence(&self, run_id: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) AS latest FROM windlass.events WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("latest")? as u64)
    }

    async fn read_events(&self, run_id: &str, from_sequence: Option<u64>) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"SELECT * FROM windlass.events
               WHERE run_id = $1 AND sequence >= $2
               ORDER BY sequence ASC"#,
        )
        .bind(run_id)
        .bind(from_sequence.unwrap_or(0) as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    async fn put_step(&self, step: StepRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO windlass.steps (
                   step_id, run_id, step_name, status, attempt, max_retries,
                   args, result, error, created_at, updated_at, started_at,
                   completed_at, locked_by, locked_until, retry_at,
                   recovery_attempts
               ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
               ON CONFLICT (step_id) DO UPDATE SET
                   status = EXCLUDED.status,
                   attempt = EXCLUDED.attempt,
                   args = EXCLUDED.args,
                   result = EXCLUDED.result,
                   error = EXCLUDED.error,
                   updated_at = EXCLUDED.updated_at,
                   started_at = EXCLUDED.started_at,
                   completed_at = EXCLUDED.completed_at,
                   locked_by = EXCLUDED.locked_by,
                   locked_until = EXCLUDED.locked_until,
                   retry_at = EXCLUDED.retry_at,
                   recovery_attempts = EXCLUDED.recovery_attempts"#,
        )
        .bind(&step.step_id)
        .bind(&step.run_id)
        .bind(&step.step_name)
        .bind(step.status.as_str())
        .bind(step.attempt as i32)
        .bind(step.max_retries as i32)
        .bind(&step.args)
        .bind(&step.result)
        .bind(&step.error)
        .bind(step.created_at)
        .bind(step.updated_at)
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(&step.locked_by)
        .bind(step.locked_until)
        .bind(step.retry_at)
        .bind(step.recovery_attempts as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<StepRecord>> {
        let row = sqlx::query("SELECT * FROM windlass.steps WHERE step_id = $1")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(step_from_row).transpose()
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM windlass.steps WHERE run_id = $1 ORDER BY created_at, step_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(step_from_row).collect()
    }

    async fn update_step(
        &self,
        step_id: &str,
        from: StepStatus,
        update: StepUpdate,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM windlass.steps WHERE step_id = $1 FOR UPDATE")
            .bind(step_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(step) = row.map(step_from_row).transpose()? else {
            return Err(Error::Storage(format!("step {step_id} not found")));
        };
        if step.status != from {
            return Ok(false);
        }

        let status = update.status.unwrap_or(step.status);
        let attempt = update.attempt.unwrap_or(step.attempt);
        let result = update.result.or(step.result);
        let error = update.error.or(step.error);
        let started_at = update.started_at.or(step.started_at);
        let completed_at = update.completed_at.or(step.completed_at);
        let (locked_by, locked_until) = match update.lock {
            Some(Some((worker, until))) => (Some(worker), Some(until)),
            Some(None) => (None, None),
            None => (step.locked_by, step.locked_until),
        };
        let retry_at = update.retry_at.or(step.retry_at);
        let recovery_attempts = update.recovery_attempts.unwrap_or(step.recovery_attempts);
        let updated_at = completed_at.or(started_at).unwrap_or(step.updated_at);

        sqlx::query(
            r#"UPDATE windlass.steps
               SET status = $2, attempt = $3, result = $4, error = $5,
                   started_at = $6, completed_at = $7, locked_by = $8,
                   locked_until = $9, retry_at = $10, recovery_attempts = $11,
                   updated_at = $12
               WHERE step_id = $1"#,
        )
        .bind(step_id)
        .bind(status.as_str())
        .bind(attempt as i32)
        .bind(&result)
        .bind(&error)
        .bind(started_at)
        .bind(completed_at)
        .bind(&locked_by)
        .bind(locked_until)
        .bind(retry_at)
        .bind(recovery_attempts as i32)
        .bind(updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_expired_step_leases(&self, now: OffsetDateTime) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            r#"SELECT * FROM windlass.steps
               WHERE status = 'running' AND locked_until IS NOT NULL AND locked_until <= $1"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(step_from_row).collect()
    }

    async fn list_orphaned_pending_steps(
        &self,
        now: OffsetDateTime,
        grace: Duration,
    ) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            r#"SELECT * FROM windlass.steps
               WHERE status = 'pending'
                 AND COALESCE(retry_at, created_at) + ($2 * interval '1 second') <= $1"#,
        )
        .bind(now)
        .bind(grace.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(step_from_row).collect()
    }

    async fn put_hook(&self, hook: HookRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO windlass.hooks (
                   hook_id, run_id, name, status, payload, schema,
                   created_at, received_at, expires_at
               ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
               ON CONFLICT (hook_id) DO NOTHING"#,
        )
        .bind(&hook.hook_id)
        .bind(&hook.run_id)
        .bind(&hook.name)
        .bind(hook.status.as_str())
        .bind(&hook.payload)
        .bind(&hook.schema)
        .bind(hook.created_at)
        .bind(hook.received_at)
        .bind(hook.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_hook(&self, hook_id: &str) -> Result<Option<HookRecord>> {
        let row = sqlx::query("SELECT * FROM windlass.hooks WHERE hook_id = $1")
            .bind(hook_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(hook_from_row).transpose()
    }

    async fn find_pending_hook(&self, run_id: &str, name: &str) -> Result<Option<HookRecord>> {
        let row = sqlx::query(
            r#"SELECT * FROM windlass.hooks
               WHERE run_id = $1 AND name = $2 AND status = 'pending'
               ORDER BY created_at
               LIMIT 1"#,
        )
        .bind(run_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(hook_from_row).transpose()
    }

    async fn list_hooks(&self, run_id: &str) -> Result<Vec<HookRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM windlass.hooks WHERE run_id = $1 ORDER BY created_at, hook_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(hook_from_row).collect()
    }

    async fn transition_hook(
        &self,
        hook_id: &str,
        to: HookStatus,
        payload: Option<Value>,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let received_at = (to == HookStatus::Received).then_some(now);
        let updated = sqlx::query(
            r#"UPDATE windlass.hooks
               SET status = $2,
                   payload = COALESCE($3, payload),
                   received_at = COALESCE($4, received_at)
               WHERE hook_id = $1 AND status = 'pending'"#,
        )
        .bind(hook_id)
        .bind(to.as_str())
        .bind(&payload)
        .bind(received_at)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn claim_run(
        &self,
        run_id: &str,
        worker_id: &str,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<Option<RunClaim>> {
        let expires_at = now + ttl;
        let row = sqlx::query(
            r#"INSERT INTO windlass.claims (run_id, worker_id, claimed_at, expires_at)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (run_id) DO UPDATE
                   SET worker_id = EXCLUDED.worker_id,
                       claimed_at = EXCLUDED.claimed_at,
                       expires_at = EXCLUDED.expires_at
                   WHERE windlass.claims.expires_at <= $3
                      OR windlass.claims.worker_id = EXCLUDED.worker_id
               RETURNING *"#,
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(claim_from_row).transpose()
    }

    async fn release_claim(&self, run_id: &str, worker_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM windlass.claims WHERE run_id = $1 AND worker_id = $2")
            .bind(run_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop_expired_claims(&self, now: OffsetDateTime) -> Result<Vec<RunClaim>> {
        let rows = sqlx::query(
            r#"DELETE FROM windlass.claims
               WHERE run_id IN (
                   SELECT run_id FROM windlass.claims
                   WHERE expires_at <= $1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING *"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(claim_from_row).collect()
    }

    async fn schedule_wake(&self, wake: WakeEntry) -> Result<()> {
        sqlx::query("INSERT INTO windlass.wakes (run_id, wake_at, kind) VALUES ($1, $2, $3)")
            .bind(&wake.run_id)
            .bind(wake.wake_at)
            .bind(serde_json::to_value(&wake.kind)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop_due_wakes(&self, now: OffsetDateTime, limit: u32) -> Result<Vec<WakeEntry>> {
        let rows = sqlx::query(
            r#"DELETE FROM windlass.wakes
               WHERE id IN (
                   SELECT id FROM windlass.wakes
                   WHERE wake_at <= $1
                   ORDER BY wake_at
                   LIMIT $2
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING *"#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(wake_from_row).collect()
    }

    async fn cancel_wakes(&self, run_id: &str) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM windlass.wakes WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }

    async fn put_schedule(&self, spec: ScheduleSpec) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO windlass.schedules (
                   schedule_id, workflow_name, input, cadence, enabled,
                   next_fire_at, created_at
               ) VALUES ($1,$2,$3,$4,$5,$6,$7)
               ON CONFLICT (schedule_id) DO UPDATE SET
                   input = EXCLUDED.input,
                   cadence = EXCLUDED.cadence,
                   enabled = EXCLUDED.enabled,
                   next_fire_at = EXCLUDED.next_fire_at"#,
        )
        .bind(&spec.schedule_id)
        .bind(&spec.workflow_name)
        .bind(&spec.input)
        .bind(serde_json::to_value(&spec.cadence)?)
        .bind(spec.enabled)
        .bind(spec.next_fire_at)
        .bind(spec.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleSpec>> {
        let row = sqlx::query("SELECT * FROM windlass.schedules WHERE schedule_id = $1")
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(schedule_from_row).transpose()
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleSpec>> {
        let rows = sqlx::query("SELECT * FROM windlass.schedules ORDER BY schedule_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(schedule_from_row).collect()
    }

    async fn due_schedules(&self, now: OffsetDateTime) -> Result<Vec<ScheduleSpec>> {
        let rows = sqlx::query(
            "SELECT * FROM windlass.schedules WHERE enabled AND next_fire_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(schedule_from_row).collect()
    }

    async fn advance_schedule(
        &self,
        schedule_id: &str,
        next_fire_at: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query("UPDATE windlass.schedules SET next_fire_at = $2 WHERE schedule_id = $1")
            .bind(schedule_id)
            .bind(next_fire_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn healthy(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
