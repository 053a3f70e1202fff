//! Configuration loading
//!
//! Parses `~/.stratum/config.toml`. Every field has a default, so a missing
//! file or a partial file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cache::CacheConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::paths;
use crate::planner::{FailurePolicy, PlannerConfig};
use crate::retry::RetryConfig;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StratumConfig {
    pub orchestrator: OrchestratorSection,
    pub retry: RetrySection,
    pub cache: CacheSection,
    pub planner: PlannerSection,
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Maximum tool calls running at once within a dependency level
    pub max_concurrency: usize,
    /// Per-call timeout
    pub tool_timeout_secs: u64,
    /// Capacity of the progress event channel
    pub event_buffer: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            tool_timeout_secs: 120,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub max_entries: u64,
    /// Zero disables expiry
    pub default_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            default_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub failure_policy: FailurePolicy,
    /// Tasks of one dependency level run concurrently up to this bound
    pub max_parallel_tasks: usize,
    /// Consult the language model for decomposition when one is configured
    pub use_model: bool,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            max_parallel_tasks: 2,
            use_model: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Defaults to ~/.stratum/plans.db
    pub database_path: Option<PathBuf>,
}

impl StratumConfig {
    /// Load from the default location (~/.stratum/config.toml)
    pub fn load_default() -> Result<Self> {
        Self::load(&paths::config_file())
    }

    /// Load config from a file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let config: StratumConfig =
            toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;

        tracing::info!(path = ?path, "Loaded configuration");
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(paths::default_database_path)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            jitter: self.retry.jitter,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.cache.enabled,
            max_entries: self.cache.max_entries,
            default_ttl: (self.cache.default_ttl_secs > 0)
                .then(|| Duration::from_secs(self.cache.default_ttl_secs)),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrency: self.orchestrator.max_concurrency.max(1),
            tool_timeout: Duration::from_secs(self.orchestrator.tool_timeout_secs),
        }
    }

    /// Bounded channel for progress events, sized by `orchestrator.event_buffer`
    pub fn event_channel<T>(&self) -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
        mpsc::channel(self.orchestrator.event_buffer.max(1))
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            failure_policy: self.planner.failure_policy,
            max_parallel_tasks: self.planner.max_parallel_tasks.max(1),
            use_model: self.planner.use_model,
        }
    }
}
