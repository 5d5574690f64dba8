//! Workflow/step registries and the engine builder.
//!
//! There are no process-wide registries: everything a worker needs
//! (storage handle, broker client, clock, registry, configuration) is
//! carried by an [`EngineContext`] threaded explicitly through the runtime.
//! This keeps tests deterministic (inject a fake clock, fake broker,
//! in-memory storage).

use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::Broker;
use crate::client::WorkflowClient;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::runtime::config::RuntimeConfig;
use crate::store::Storage;
use crate::workflow::{StepHandler, Workflow, WorkflowDescriptor};

/// Registered workflows and steps, keyed by their stable names.
pub struct Registry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
    steps: HashMap<String, Arc<dyn StepHandler>>,
}

impl Registry {
    pub(crate) fn workflow(&self, name: &str) -> Option<&Arc<dyn Workflow>> {
        self.workflows.get(name)
    }

    pub(crate) fn step(&self, name: &str) -> Option<&Arc<dyn StepHandler>> {
        self.steps.get(name)
    }

    /// Descriptors of every registered workflow, sorted by name.
    pub fn descriptors(&self) -> Vec<WorkflowDescriptor> {
        let mut descriptors: Vec<_> = self
            .workflows
            .values()
            .map(|w| w.descriptor())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }
}

/// Everything the runtime threads through its components.
pub(crate) struct EngineContext<S, B> {
    pub store: S,
    pub broker: B,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<Registry>,
    pub config: RuntimeConfig,
    pub worker_id: String,
}

/// Builder for a [`WorkflowEngine`].
///
/// # Example
///
/// ```ignore
/// let engine = WorkflowEngine::builder(store, broker)
///     .register_workflow(OrderWorkflow)
///     .register_step(step_fn("charge", charge))
///     .config(RuntimeConfig::default())
///     .build()?;
///
/// let run_id = engine.client().start("order", input, StartOptions::default()).await?;
/// engine.run_worker(WorkerMode::All, shutdown).await?;
/// ```
pub struct EngineBuilder<S, B> {
    store: S,
    broker: B,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
    workflows: HashMap<String, Arc<dyn Workflow>>,
    steps: HashMap<String, Arc<dyn StepHandler>>,
    duplicate: Option<String>,
}

impl<S, B> EngineBuilder<S, B>
where
    S: Storage,
    B: Broker,
{
    pub(crate) fn new(store: S, broker: B) -> Self {
        Self {
            store,
            broker,
            clock: Arc::new(SystemClock),
            config: RuntimeConfig::default(),
            workflows: HashMap::new(),
            steps: HashMap::new(),
            duplicate: None,
        }
    }

    /// Register a workflow definition. Each name registers once; duplicates
    /// are reported at build time.
    pub fn register_workflow<W: Workflow>(mut self, workflow: W) -> Self {
        let name = workflow.descriptor().name;
        if self.workflows.contains_key(&name) {
            self.duplicate.get_or_insert(name);
            return self;
        }
        self.workflows.insert(name, Arc::new(workflow));
        self
    }

    /// Register a step handler. Each name registers once; duplicates are
    /// reported at build time.
    pub fn register_step<H: StepHandler>(mut self, handler: H) -> Self {
        let name = handler.name().to_string();
        if self.steps.contains_key(&name) {
            self.duplicate.get_or_insert(name);
            return self;
        }
        self.steps.insert(name, Arc::new(handler));
        self
    }

    /// Override the runtime configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the clock (tests inject a manual clock here).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the engine, validating registrations.
    pub fn build(self) -> Result<WorkflowEngine<S, B>> {
        if let Some(name) = self.duplicate {
            return Err(Error::DuplicateRegistration(name));
        }

        let worker_id = self
            .config
            .worker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let registry = Arc::new(Registry {
            workflows: self.workflows,
            steps: self.steps,
        });

        let ctx = Arc::new(EngineContext {
            store: self.store,
            broker: self.broker,
            clock: self.clock,
            registry,
            config: self.config,
            worker_id,
        });

        Ok(WorkflowEngine {
            client: WorkflowClient::new(Arc::clone(&ctx)),
            ctx,
        })
    }
}

/// The assembled engine: a [`WorkflowClient`] for the public API plus the
/// worker entry points.
pub struct WorkflowEngine<S, B> {
    pub(crate) ctx: Arc<EngineContext<S, B>>,
    client: WorkflowClient<S, B>,
}

impl<S, B> Clone for WorkflowEngine<S, B> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            client: self.client.clone(),
        }
    }
}

impl<S, B> std::fmt::Debug for WorkflowEngine<S, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine").finish_non_exhaustive()
    }
}

impl<S, B> WorkflowEngine<S, B>
where
    S: Storage,
    B: Broker,
{
    /// Start building an engine over the given storage and broker.
    pub fn builder(store: S, broker: B) -> EngineBuilder<S, B> {
        EngineBuilder::new(store, broker)
    }

    /// The public API handle.
    pub fn client(&self) -> &WorkflowClient<S, B> {
        &self.client
    }

    /// Descriptors of every registered workflow.
    pub fn descriptors(&self) -> Vec<WorkflowDescriptor> {
        self.ctx.registry.descriptors()
    }

    /// This engine's worker identifier.
    pub fn worker_id(&self) -> &str {
        &self.ctx.worker_id
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.ctx.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::error::WorkflowError;
    use crate::replay::WorkflowCtx;
    use crate::store::MemoryStore;
    use crate::workflow::{step_fn, WorkflowDescriptor};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Noop(&'static str);

    #[async_trait]
    impl Workflow for Noop {
        fn descriptor(&self) -> WorkflowDescriptor {
            WorkflowDescriptor::new(self.0)
        }

        async fn run(
            &self,
            _ctx: &WorkflowCtx,
            input: Value,
        ) -> std::result::Result<Value, WorkflowError> {
            Ok(input)
        }
    }

    fn builder() -> EngineBuilder<MemoryStore, InMemoryBroker> {
        let clock = Arc::new(SystemClock);
        WorkflowEngine::builder(MemoryStore::new(), InMemoryBroker::new(clock))
    }

    #[test]
    fn build_with_registrations() {
        let engine = builder()
            .register_workflow(Noop("a"))
            .register_workflow(Noop("b"))
            .register_step(step_fn("s", |args| async move { Ok(args) }))
            .build()
            .unwrap();

        let names: Vec<_> = engine
            .descriptors()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_workflow_rejected_at_build() {
        let err = builder()
            .register_workflow(Noop("a"))
            .register_workflow(Noop("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration(name) if name == "a"));
    }

    #[test]
    fn duplicate_step_rejected_at_build() {
        let err = builder()
            .register_step(step_fn("s", |args| async move { Ok(args) }))
            .register_step(step_fn("s", |args| async move { Ok(args) }))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration(name) if name == "s"));
    }
}
