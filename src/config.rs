//! Engine and Backend Configuration
//!
//! [`EngineConfig`] holds engine-wide defaults that individual workflows
//! may override through their `settings`. [`InvokerConfig`] describes the
//! HTTP completion backend and is read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use log::info;
use once_cell::sync::Lazy;

use crate::workflow::WorkflowSettings;

/// Default wall-clock limit for one step invocation.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound applied to any configured step timeout.
pub const MAX_STEP_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a `RUNNING` execution may go without an update before it is
/// reported as stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

/// Lazily-resolved directory for the file-backed store.
///
/// `PROMPTCHAIN_HOME` wins; otherwise `.promptchain` in the current
/// directory.
pub static DEFAULT_STORE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(home) = std::env::var("PROMPTCHAIN_HOME") {
        if !home.trim().is_empty() {
            info!("Using PROMPTCHAIN_HOME store: {}", home);
            return PathBuf::from(home);
        }
    }
    PathBuf::from(".promptchain")
});

/// Engine-wide execution defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Step timeout when a workflow sets none
    pub default_step_timeout: Duration,
    /// Clamp for workflow-supplied timeouts
    pub max_step_timeout: Duration,
    /// Cost ceiling when a workflow sets none
    pub default_cost_ceiling: Option<f64>,
    /// Staleness threshold for orphaned `RUNNING` executions
    pub stale_after: Duration,
    /// Unmapped template variables read initial input of the same name
    pub implicit_initial_inputs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            max_step_timeout: MAX_STEP_TIMEOUT,
            default_cost_ceiling: None,
            stale_after: DEFAULT_STALE_AFTER,
            implicit_initial_inputs: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default per-step timeout.
    pub fn set_default_step_timeout(&mut self, timeout: Duration) {
        self.default_step_timeout = timeout;
    }

    /// Sets the default aggregate cost ceiling.
    pub fn set_default_cost_ceiling(&mut self, ceiling: Option<f64>) {
        self.default_cost_ceiling = ceiling;
    }

    /// Sets the staleness threshold.
    pub fn set_stale_after(&mut self, stale_after: Duration) {
        self.stale_after = stale_after;
    }

    /// Requires every template variable to be explicitly mapped.
    pub fn set_strict_mappings(&mut self, strict: bool) {
        self.implicit_initial_inputs = !strict;
    }

    /// Returns true when unmapped variables are rejected.
    pub fn strict_mappings(&self) -> bool {
        !self.implicit_initial_inputs
    }

    /// Effective step timeout for a workflow.
    pub fn step_timeout(&self, settings: &WorkflowSettings) -> Duration {
        settings
            .step_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_step_timeout)
            .min(self.max_step_timeout)
    }

    /// Effective cost ceiling for a workflow.
    pub fn cost_ceiling(&self, settings: &WorkflowSettings) -> Option<f64> {
        settings.max_cost.or(self.default_cost_ceiling)
    }
}

/// Settings for the OpenAI-compatible HTTP backend.
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub api_base: String,
    /// Bearer token, if the backend needs one
    pub api_key: Option<String>,
    /// Model name sent with each request
    pub model: String,
    /// Cost units per 1000 prompt tokens
    pub input_cost_per_1k: f64,
    /// Cost units per 1000 completion tokens
    pub output_cost_per_1k: f64,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
        }
    }
}

impl InvokerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_base = std::env::var("PROMPTCHAIN_API_BASE")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base);

        let api_key = std::env::var("PROMPTCHAIN_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let model = std::env::var("PROMPTCHAIN_MODEL").unwrap_or(defaults.model);

        let input_cost_per_1k: f64 = std::env::var("PROMPTCHAIN_INPUT_COST_PER_1K")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.input_cost_per_1k);

        let output_cost_per_1k: f64 = std::env::var("PROMPTCHAIN_OUTPUT_COST_PER_1K")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.output_cost_per_1k);

        Self {
            api_base,
            api_key,
            model,
            input_cost_per_1k,
            output_cost_per_1k,
        }
    }

    /// Prices a call from its token usage.
    pub fn price(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.input_cost_per_1k
            + completion_tokens as f64 / 1000.0 * self.output_cost_per_1k
    }
}
