//! Workflow and step definition traits.
//!
//! A [`Workflow`] is a deterministic body driven by the replay engine: all
//! nondeterminism (clocks, randomness, network) must live inside steps. A
//! [`StepHandler`] is the side-effecting unit executed by step workers with
//! at-least-once delivery and at-most-once recorded outcome per logical
//! invocation.
//!
//! Workflows register an explicit [`WorkflowDescriptor`] (a name plus a
//! `{name, type, required, default}` parameter schema) which the engine
//! validates on every `start` and the REST surface serves directly.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StepError, WorkflowError};
use crate::model::CancellationPolicy;
use crate::replay::WorkflowCtx;

/// Expected JSON type of a workflow parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Number,
    Bool,
    Object,
    Array,
    /// Accepts any JSON value.
    Any,
}

impl ParamType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Bool => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }
}

/// One named workflow parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    /// Filled in when the caller omits an optional parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    /// A required parameter of the given type.
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
        }
    }

    /// An optional parameter with a default value.
    pub fn optional(name: impl Into<String>, param_type: ParamType, default: Value) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default: Some(default),
        }
    }
}

/// Registered metadata for a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDescriptor {
    /// Stable workflow name; the registry key.
    pub name: String,
    /// Parameter schema validated on every start.
    pub params: Vec<ParamSpec>,
    /// Default wall-clock budget for runs of this workflow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    /// Default recovery budget for runs of this workflow.
    pub max_recovery_attempts: u32,
}

impl WorkflowDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            max_duration_ms: None,
            max_recovery_attempts: 3,
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.max_duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    /// Validate an input object against this schema, filling defaults.
    ///
    /// Returns the normalized input or a message naming the offending
    /// parameter.
    pub fn validate(&self, input: &Value) -> Result<Value, String> {
        let Some(fields) = input.as_object() else {
            return Err("workflow input must be a JSON object".to_string());
        };

        let mut normalized = fields.clone();
        for spec in &self.params {
            match normalized.get(&spec.name) {
                Some(value) => {
                    if !spec.param_type.matches(value) {
                        return Err(format!(
                            "parameter '{}' has wrong type (expected {:?})",
                            spec.name, spec.param_type
                        ));
                    }
                }
                None if spec.required => {
                    return Err(format!("missing required parameter '{}'", spec.name));
                }
                None => {
                    if let Some(default) = &spec.default {
                        normalized.insert(spec.name.clone(), default.clone());
                    }
                }
            }
        }

        Ok(Value::Object(normalized))
    }
}

/// A deterministic workflow body.
///
/// The body is re-driven from the top on every tick; each operation issued
/// through the [`WorkflowCtx`] either returns its recorded outcome or
/// suspends the run. Bodies must be pure functions of their input and the
/// sequence of operation outcomes; encapsulate every other source of
/// nondeterminism inside steps.
///
/// # Example
///
/// ```ignore
/// struct OrderWorkflow;
///
/// #[async_trait]
/// impl Workflow for OrderWorkflow {
///     fn descriptor(&self) -> WorkflowDescriptor {
///         WorkflowDescriptor::new("order")
///             .param(ParamSpec::required("order_id", ParamType::String))
///             .param(ParamSpec::required("amount", ParamType::Number))
///     }
///
///     async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError> {
///         let validated = ctx.step("validate", input.clone())?;
///         let charged = ctx.step("charge", validated)?;
///         ctx.step("notify", charged)
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// The workflow's registered metadata. `descriptor().name` must be
    /// stable across deployments; it is recorded on every run.
    fn descriptor(&self) -> WorkflowDescriptor;

    /// Drive the body once. Called on every tick with the validated input.
    async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, WorkflowError>;
}

/// Retry backoff for step failures: `base_delay * 2^(attempt-1)`, capped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay for exponential backoff. Default: 1 second.
    pub base_delay: Duration,
    /// Cap on the exponential growth. Default: 5 minutes.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Fixed delay on every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// Delay before the retry following a failed `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

/// Per-step execution configuration.
#[derive(Debug, Clone)]
pub struct StepOptions {
    /// Maximum attempts for retryable failures (includes the first).
    /// Default: 3.
    pub max_retries: u32,
    /// Backoff between retries.
    pub retry: RetryPolicy,
    /// Execution timeout per attempt; a timed-out attempt counts as a
    /// retryable failure. Default: 5 minutes.
    pub timeout: Duration,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// A side-effecting unit executed by step workers.
///
/// Handlers run under at-least-once delivery: a crashed worker's task is
/// redelivered, so handlers calling external systems should be idempotent
/// per `step_id`. The engine guarantees at most one *recorded* terminal
/// outcome per logical invocation regardless.
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    /// Stable step name; the registry key referenced by workflow bodies.
    fn name(&self) -> &str;

    /// Retry/timeout configuration for this step.
    fn options(&self) -> StepOptions {
        StepOptions::default()
    }

    /// Execute the step with the recorded arguments.
    async fn call(&self, args: Value) -> Result<Value, StepError>;
}

type BoxedStepFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, StepError>> + Send>>;

/// [`StepHandler`] built from a closure; the common case in tests and small
/// workers.
///
/// ```ignore
/// let charge = step_fn("charge", |args| async move {
///     Ok(serde_json::json!({ "charged": args["amount"] }))
/// });
/// ```
pub struct FnStepHandler {
    name: String,
    options: StepOptions,
    func: Box<dyn Fn(Value) -> BoxedStepFuture + Send + Sync>,
}

/// Build a [`FnStepHandler`] with default options.
pub fn step_fn<F, Fut>(name: impl Into<String>, func: F) -> FnStepHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, StepError>> + Send + 'static,
{
    FnStepHandler {
        name: name.into(),
        options: StepOptions::default(),
        func: Box::new(move |args| Box::pin(func(args))),
    }
}

impl FnStepHandler {
    /// Override the step options.
    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl StepHandler for FnStepHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> StepOptions {
        self.options.clone()
    }

    async fn call(&self, args: Value) -> Result<Value, StepError> {
        (self.func)(args).await
    }
}

/// One step invocation request issued by a workflow body.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub step_name: String,
    pub args: Value,
}

impl StepRequest {
    pub fn new(step_name: impl Into<String>, args: Value) -> Self {
        Self {
            step_name: step_name.into(),
            args,
        }
    }
}

/// Options for a hook await.
#[derive(Debug, Clone, Default)]
pub struct HookOptions {
    /// The hook expires this long after creation; expiry surfaces a
    /// hook-expired error at the await.
    pub timeout: Option<Duration>,
    /// Payload schema advertised to signal callers. Opaque to the engine.
    pub schema: Option<Value>,
}

/// Options for spawning a child workflow.
#[derive(Debug, Clone)]
pub struct ChildOptions {
    /// Await the child's terminal event (default) or detach after spawn.
    pub wait: bool,
    /// How the parent's cancellation treats this child.
    pub cancellation_policy: CancellationPolicy,
}

impl Default for ChildOptions {
    fn default() -> Self {
        Self {
            wait: true,
            cancellation_policy: CancellationPolicy::Terminate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_descriptor() -> WorkflowDescriptor {
        WorkflowDescriptor::new("order")
            .param(ParamSpec::required("order_id", ParamType::String))
            .param(ParamSpec::required("amount", ParamType::Number))
            .param(ParamSpec::optional("notify", ParamType::Bool, json!(true)))
    }

    #[test]
    fn validate_fills_defaults() {
        let input = json!({ "order_id": "A", "amount": 10 });
        let normalized = order_descriptor().validate(&input).unwrap();
        assert_eq!(normalized["notify"], json!(true));
        assert_eq!(normalized["order_id"], json!("A"));
    }

    #[test]
    fn validate_rejects_missing_required() {
        let err = order_descriptor().validate(&json!({ "amount": 10 })).unwrap_err();
        assert!(err.contains("order_id"));
    }

    #[test]
    fn validate_rejects_wrong_type() {
        let err = order_descriptor()
            .validate(&json!({ "order_id": 5, "amount": 10 }))
            .unwrap_err();
        assert!(err.contains("order_id"));
    }

    #[test]
    fn validate_rejects_non_object() {
        assert!(order_descriptor().validate(&json!([1, 2])).is_err());
    }

    #[test]
    fn retry_policy_exponential_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
    }

    #[test]
    fn retry_policy_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.backoff(10), Duration::from_secs(60));
    }

    #[test]
    fn fixed_retry_policy() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5));
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(7), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn step_fn_round_trip() {
        let handler = step_fn("double", |args: Value| async move {
            let n = args["n"].as_i64().unwrap_or(0);
            Ok(json!({ "n": n * 2 }))
        });
        assert_eq!(handler.name(), "double");
        let out = handler.call(json!({ "n": 4 })).await.unwrap();
        assert_eq!(out, json!({ "n": 8 }));
    }
}
