//! REST surface for observability and control.
//!
//! Read paths serve runs, event logs, and registered workflow descriptors;
//! write paths start runs, request cancellation, and deliver hook signals.
//! Mount with [`router`]:
//!
//! ```ignore
//! let app = windlass::http::router(engine.clone());
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8420").await?;
//! axum::serve(listener, app).await?;
//! ```

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;

use crate::broker::Broker;
use crate::client::StartOptions;
use crate::error::Error;
use crate::model::RunStatus;
use crate::runtime::WorkflowEngine;
use crate::store::{RunFilter, Storage};

/// Build the REST router over an engine.
pub fn router<S, B>(engine: WorkflowEngine<S, B>) -> Router
where
    S: Storage,
    B: Broker,
{
    Router::new()
        .route("/runs", get(list_runs::<S, B>).post(start_run::<S, B>))
        .route("/runs/{run_id}", get(get_run::<S, B>))
        .route("/runs/{run_id}/events", get(get_events::<S, B>))
        .route("/runs/{run_id}/cancel", post(cancel_run::<S, B>))
        .route("/hooks/{run_id}/{hook_name}", post(signal_hook::<S, B>))
        .route("/workflows", get(list_workflows::<S, B>))
        .route("/health", get(health::<S, B>))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// API error with its HTTP mapping.
#[derive(Debug)]
enum ApiError {
    NotFound(String),
    IdempotencyConflict { run_id: String },
    HookNotPending,
    Validation(String),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::RunNotFound(run_id) => ApiError::NotFound(format!("run not found: {run_id}")),
            Error::HookNotFound { run_id, hook } => {
                ApiError::NotFound(format!("hook not found: {run_id}/{hook}"))
            }
            Error::UnknownWorkflow(name) => {
                ApiError::NotFound(format!("unknown workflow: {name}"))
            }
            Error::IdempotencyConflict {
                existing_run_id, ..
            } => ApiError::IdempotencyConflict {
                run_id: existing_run_id,
            },
            Error::Validation(message) => ApiError::Validation(message),
            Error::NestingLimit { depth, limit } => ApiError::Validation(format!(
                "nesting limit exceeded: depth {depth} with limit {limit}"
            )),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, json!({ "error": message }))
            }
            ApiError::IdempotencyConflict { run_id } => (
                StatusCode::CONFLICT,
                json!({ "error": "idempotency key already bound", "run_id": run_id }),
            ),
            ApiError::HookNotPending => (
                StatusCode::GONE,
                json!({ "error": "hook is no longer pending" }),
            ),
            ApiError::Validation(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "error": message }),
            ),
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": message }))
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    /// Workflow name filter.
    query: Option<String>,
    status: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    cursor: Option<u64>,
    limit: Option<u32>,
}

async fn list_runs<S: Storage, B: Broker>(
    State(engine): State<WorkflowEngine<S, B>>,
    Query(params): Query<ListRunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let mut filter = RunFilter::new();
    filter.workflow_name = params.query;
    if let Some(status) = &params.status {
        filter.status = Some(
            RunStatus::parse(status)
                .ok_or_else(|| ApiError::Validation(format!("unknown status '{status}'")))?,
        );
    }
    filter.created_after = parse_time(params.start_time.as_deref())?;
    filter.created_before = parse_time(params.end_time.as_deref())?;
    filter.cursor = params.cursor.unwrap_or(0);
    filter.limit = params.limit.unwrap_or(50).min(500);

    let runs = engine.client().list_runs(&filter).await?;
    let next_cursor = (runs.len() as u64 == filter.limit as u64)
        .then_some(filter.cursor + filter.limit as u64);

    Ok(Json(json!({ "runs": runs, "next_cursor": next_cursor })))
}

#[derive(Debug, Deserialize)]
struct StartRunBody {
    workflow_name: String,
    #[serde(default)]
    kwargs: Value,
    idempotency_key: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

async fn start_run<S: Storage, B: Broker>(
    State(engine): State<WorkflowEngine<S, B>>,
    Json(body): Json<StartRunBody>,
) -> Result<Response, ApiError> {
    let input = if body.kwargs.is_null() {
        json!({})
    } else {
        body.kwargs
    };
    let idempotency_key = body.idempotency_key.clone();

    let outcome = engine
        .client()
        .start(
            &body.workflow_name,
            input,
            StartOptions {
                idempotency_key: body.idempotency_key,
                tags: body.tags,
                ..Default::default()
            },
        )
        .await?;

    if !outcome.created {
        return Err(Error::IdempotencyConflict {
            key: idempotency_key.unwrap_or_default(),
            existing_run_id: outcome.run_id,
        }
        .into());
    }
    Ok((StatusCode::CREATED, Json(json!({ "run_id": outcome.run_id }))).into_response())
}

async fn get_run<S: Storage, B: Broker>(
    State(engine): State<WorkflowEngine<S, B>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = engine.client().get_run(&run_id).await?;
    Ok(Json(serde_json::to_value(run).map_err(|e| ApiError::Internal(e.to_string()))?))
}

async fn get_events<S: Storage, B: Broker>(
    State(engine): State<WorkflowEngine<S, B>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let events = engine.client().events(&run_id).await?;
    Ok(Json(json!({ "events": events })))
}

#[derive(Debug, Deserialize, Default)]
struct CancelBody {
    reason: Option<String>,
}

async fn cancel_run<S: Storage, B: Broker>(
    State(engine): State<WorkflowEngine<S, B>>,
    Path(run_id): Path<String>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<Value>, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);
    engine.client().cancel(&run_id, reason.as_deref()).await?;
    Ok(Json(json!({ "run_id": run_id, "cancellation_requested": true })))
}

async fn signal_hook<S: Storage, B: Broker>(
    State(engine): State<WorkflowEngine<S, B>>,
    Path((run_id, hook_name)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let accepted = engine
        .client()
        .signal_hook(&run_id, &hook_name, payload)
        .await?;
    if !accepted {
        return Err(ApiError::HookNotPending);
    }
    Ok(Json(json!({ "accepted": true })))
}

async fn list_workflows<S: Storage, B: Broker>(
    State(engine): State<WorkflowEngine<S, B>>,
) -> Json<Value> {
    Json(json!({ "workflows": engine.descriptors() }))
}

async fn health<S: Storage, B: Broker>(
    State(engine): State<WorkflowEngine<S, B>>,
) -> Response {
    let storage_healthy = engine.client().storage_healthy().await;
    let status = if storage_healthy { "ok" } else { "degraded" };
    let code = if storage_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({ "status": status, "storage_healthy": storage_healthy })),
    )
        .into_response()
}

fn parse_time(raw: Option<&str>) -> Result<Option<OffsetDateTime>, ApiError> {
    match raw {
        None => Ok(None),
        Some(raw) => OffsetDateTime::parse(raw, &Rfc3339)
            .map(Some)
            .map_err(|_| ApiError::Validation(format!("invalid RFC 3339 timestamp '{raw}'"))),
    }
}
