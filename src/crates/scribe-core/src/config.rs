//! Run configuration.
//!
//! Configuration is loaded from a TOML file, overridden by `SCRIBE_*`
//! environment variables, and finally adjusted programmatically through the
//! builder-style setters. Every field has a default so an empty file is a
//! valid configuration.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Generation mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Creative writing; defaults to serial scheduling for determinism.
    Story,
    /// Report writing; may enable retrieval and parallel scheduling.
    Report,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Report
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Story => write!(f, "story"),
            Mode::Report => write!(f, "report"),
        }
    }
}

/// Which cache namespaces persist to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheEnabled {
    Llm,
    Search,
    Both,
    None,
}

impl Default for CacheEnabled {
    fn default() -> Self {
        CacheEnabled::Both
    }
}

impl CacheEnabled {
    pub fn llm(&self) -> bool {
        matches!(self, CacheEnabled::Llm | CacheEnabled::Both)
    }

    pub fn search(&self) -> bool {
        matches!(self, CacheEnabled::Search | CacheEnabled::Both)
    }
}

/// Capability names used per action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Capability invoked for plan actions.
    #[serde(default = "default_plan_model")]
    pub plan: String,
    /// Capability invoked for write/reason actions (and reflect).
    #[serde(default = "default_execute_model")]
    pub execute: String,
    /// Capability invoked for aggregate actions.
    #[serde(default = "default_aggregate_model")]
    pub aggregate: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            plan: default_plan_model(),
            execute: default_execute_model(),
            aggregate: default_aggregate_model(),
        }
    }
}

/// Scheduler limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of nodes in DOING simultaneously.
    #[serde(default = "default_in_flight_limit")]
    pub in_flight_limit: usize,
    /// Containment depth at which nodes may no longer plan.
    #[serde(default = "default_max_layers")]
    pub max_layers: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            in_flight_limit: default_in_flight_limit(),
            max_layers: default_max_layers(),
        }
    }
}

/// Retry budget for capability invocations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts per action before the node fails.
    #[serde(default = "default_retries_max")]
    pub max: u32,
    /// Base backoff delay in milliseconds, doubled per attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max: default_retries_max(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Cache persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheConfig {
    /// Persistence root; `None` keeps the cache in memory only.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Which namespaces persist.
    #[serde(default)]
    pub enabled: CacheEnabled,
}

/// Per-capability-call settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallConfig {
    /// Per-call timeout in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Post-execution verification pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PostReflectConfig {
    /// Route execution results through a reflect action before FINISHED.
    #[serde(default)]
    pub enabled: bool,
}

/// Complete configuration of a run.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ScribeConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retries: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub call: CallConfig,
    #[serde(default)]
    pub post_reflect: PostReflectConfig,
    /// Capability used for retrieval nodes; `None` answers retrieval nodes
    /// through the execute model instead of a search backend.
    #[serde(default)]
    pub search_backend: Option<String>,
}

impl ScribeConfig {
    /// Configuration tuned for the given mode: story runs serially, report
    /// runs with a small parallel window.
    pub fn for_mode(mode: Mode) -> Self {
        let mut config = Self::default();
        config.mode = mode;
        config.scheduler.in_flight_limit = match mode {
            Mode::Story => 1,
            Mode::Report => 4,
        };
        config
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| EngineError::Configuration(format!("{}: {}", path.display(), e)))
    }

    /// Apply `SCRIBE_*` environment overrides on top of this configuration.
    ///
    /// Recognized variables: `SCRIBE_MODE`, `SCRIBE_IN_FLIGHT_LIMIT`,
    /// `SCRIBE_MAX_LAYERS`, `SCRIBE_RETRIES_MAX`, `SCRIBE_CACHE_DIR`,
    /// `SCRIBE_CALL_TIMEOUT_MS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(mode) = std::env::var("SCRIBE_MODE") {
            match mode.as_str() {
                "story" => self.mode = Mode::Story,
                "report" => self.mode = Mode::Report,
                other => tracing::warn!(value = other, "ignoring unknown SCRIBE_MODE"),
            }
        }
        if let Some(limit) = env_parse::<usize>("SCRIBE_IN_FLIGHT_LIMIT") {
            self.scheduler.in_flight_limit = limit.max(1);
        }
        if let Some(layers) = env_parse::<u32>("SCRIBE_MAX_LAYERS") {
            self.scheduler.max_layers = layers;
        }
        if let Some(max) = env_parse::<u32>("SCRIBE_RETRIES_MAX") {
            self.retries.max = max;
        }
        if let Ok(dir) = std::env::var("SCRIBE_CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if let Some(timeout) = env_parse::<u64>("SCRIBE_CALL_TIMEOUT_MS") {
            self.call.timeout_ms = timeout;
        }
        self
    }

    /// Set the in-flight limit.
    pub fn with_in_flight_limit(mut self, limit: usize) -> Self {
        self.scheduler.in_flight_limit = limit.max(1);
        self
    }

    /// Set the maximum planning depth.
    pub fn with_max_layers(mut self, layers: u32) -> Self {
        self.scheduler.max_layers = layers;
        self
    }

    /// Set the retry budget.
    pub fn with_retries(mut self, max: u32, backoff_ms: u64) -> Self {
        self.retries = RetryConfig { max, backoff_ms };
        self
    }

    /// Set the cache persistence root.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = Some(dir.into());
        self
    }

    /// Set the per-call timeout.
    pub fn with_call_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.call.timeout_ms = timeout_ms;
        self
    }

    /// Enable the post-reflect verification pass.
    pub fn with_post_reflect(mut self, enabled: bool) -> Self {
        self.post_reflect.enabled = enabled;
        self
    }

    /// Set the search backend capability for retrieval nodes.
    pub fn with_search_backend(mut self, name: impl Into<String>) -> Self {
        self.search_backend = Some(name.into());
        self
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.in_flight_limit == 0 {
            return Err(EngineError::Configuration(
                "scheduler.in_flight_limit must be >= 1".into(),
            ));
        }
        if self.retries.max == 0 {
            return Err(EngineError::Configuration("retries.max must be >= 1".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_plan_model() -> String {
    "planner".to_string()
}

fn default_execute_model() -> String {
    "writer".to_string()
}

fn default_aggregate_model() -> String {
    "aggregator".to_string()
}

fn default_in_flight_limit() -> usize {
    1
}

fn default_max_layers() -> u32 {
    4
}

fn default_retries_max() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    250
}

fn default_call_timeout_ms() -> u64 {
    120_000
}
