//! Layered configuration for worker binaries.
//!
//! Resolution precedence: CLI flags → `WINDLASS_*` environment variables →
//! `windlass.config.yaml` → built-in defaults. The config describes the
//! operational surface only; workflows and steps are compiled into the
//! embedding binary.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use windlass::RuntimeConfig;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "windlass.config.yaml";

/// Environment variable prefix. Nested keys use `_`, e.g.
/// `WINDLASS_STORAGE_BACKEND`, `WINDLASS_WORKER_CONCURRENCY`.
pub const ENV_PREFIX: &str = "WINDLASS_";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Workflow discovery hint from other deployments of this format.
    /// Accepted and ignored: Rust workflows are compiled into the binary.
    pub module: Option<String>,
    /// Runtime selector from other deployments of this format. Accepted
    /// and ignored: there is one built-in runtime.
    pub runtime: Option<String>,
    pub storage: StorageConfig,
    pub broker: BrokerConfig,
    /// Accepted for compatibility and ignored: run results live in storage.
    pub result_backend: Option<ResultBackendConfig>,
    pub worker: WorkerConfig,
    pub recovery: RecoveryConfig,
    pub nesting: NestingConfig,
    pub claim: ClaimConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            module: None,
            runtime: None,
            storage: StorageConfig::default(),
            broker: BrokerConfig::default(),
            result_backend: None,
            worker: WorkerConfig::default(),
            recovery: RecoveryConfig::default(),
            nesting: NestingConfig::default(),
            claim: ClaimConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// `memory` or `postgres`.
    pub backend: String,
    /// Connection string for the `postgres` backend.
    pub dsn: Option<String>,
    /// Data directory for file-like backends; unused by the built-ins.
    pub path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            dsn: None,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Broker URL; unset selects the in-process broker.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ResultBackendConfig {
    pub url: Option<String>,
}

impl Default for ResultBackendConfig {
    fn default() -> Self {
        Self { url: None }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Concurrent task pollers per queue.
    pub concurrency: usize,
    /// Soft memory bound in MiB; advisory, logged at startup.
    pub max_memory: Option<u64>,
    /// Recycle the worker after this many tasks; advisory.
    pub max_tasks: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_memory: None,
            max_tasks: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    /// Sweeper cadence in seconds.
    pub interval: u64,
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: 5,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NestingConfig {
    pub limit: u32,
}

impl Default for NestingConfig {
    fn default() -> Self {
        Self { limit: 3 }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClaimConfig {
    /// Run claim TTL in seconds.
    pub ttl: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self { ttl: 30 }
    }
}

impl Config {
    /// Load with full precedence: defaults, then the YAML file (explicit
    /// path or `windlass.config.yaml` when present), then `WINDLASS_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(&std::env::vars().collect());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Overlay recognized `WINDLASS_*` variables.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) {
        let get = |key: &str| vars.get(&format!("{ENV_PREFIX}{key}")).cloned();

        if let Some(backend) = get("STORAGE_BACKEND") {
            self.storage.backend = backend;
        }
        if let Some(dsn) = get("STORAGE_DSN") {
            self.storage.dsn = Some(dsn);
        }
        if let Some(path) = get("STORAGE_PATH") {
            self.storage.path = Some(path);
        }
        if let Some(url) = get("BROKER_URL") {
            self.broker.url = Some(url);
        }
        if let Some(url) = get("RESULT_BACKEND_URL") {
            self.result_backend = Some(ResultBackendConfig { url: Some(url) });
        }
        if let Some(concurrency) = get("WORKER_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.worker.concurrency = concurrency;
        }
        if let Some(interval) = get("RECOVERY_INTERVAL").and_then(|v| v.parse().ok()) {
            self.recovery.interval = interval;
        }
        if let Some(max) = get("RECOVERY_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.recovery.max_attempts = max;
        }
        if let Some(limit) = get("NESTING_LIMIT").and_then(|v| v.parse().ok()) {
            self.nesting.limit = limit;
        }
        if let Some(ttl) = get("CLAIM_TTL").and_then(|v| v.parse().ok()) {
            self.claim.ttl = ttl;
        }
    }

    /// Translate into the engine's runtime configuration.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            claim_ttl: Duration::from_secs(self.claim.ttl),
            workflow_workers: self.worker.concurrency.max(1),
            step_workers: self.worker.concurrency.max(1),
            sweep_interval: Duration::from_secs(self.recovery.interval),
            max_recovery_attempts: self.recovery.max_attempts,
            nesting_limit: self.nesting.limit,
            ..Default::default()
        }
    }
}
