//! Configuration management for graph-agent.
//!
//! Configuration is read once at start-up and then handed, immutable, to every
//! component constructor. It can come from a YAML file, from environment
//! variables, or both (file first, environment overrides):
//! - `GRAPH_AGENT_MAX_STEPS` - Optional. Step budget for one task. Defaults to `100`.
//! - `GRAPH_AGENT_MAX_REPAIR_PER_NODE` - Optional. Local repairs per node. Defaults to `3`.
//! - `GRAPH_AGENT_CONFIDENCE_THRESHOLD` - Optional. Pass threshold. Defaults to `0.7`.
//! - `GRAPH_AGENT_HARD_WEIGHT` / `GRAPH_AGENT_SOFT_WEIGHT` / `GRAPH_AGENT_CONSISTENCY_WEIGHT` -
//!   Optional. Verifier weights, must sum to 1.0. Default `0.6 / 0.3 / 0.1`.
//! - `GRAPH_AGENT_SMALL_MODEL` - Optional. Defaults to `gpt-4o-mini`.
//! - `GRAPH_AGENT_LARGE_MODEL` - Optional. Defaults to `gpt-4o`.
//! - `GRAPH_AGENT_UPGRADE_AFTER_FAILURES` - Optional. Defaults to `3`.
//! - `GRAPH_AGENT_DOM_COMPLEXITY_THRESHOLD` - Optional. Page complexity above
//!   which model decisions go to the large model. Defaults to `0.5`.
//! - `GRAPH_AGENT_WAIT_INTERVAL_MS` / `GRAPH_AGENT_WAIT_TIMEOUT_MS` - Optional. `WAIT_UNTIL` defaults.
//! - `GRAPH_AGENT_MAX_COST_USD` - Optional. Cumulative model spend cap.
//! - `GRAPH_AGENT_NO_PROGRESS_WINDOW` - Optional. Defaults to `3`.
//! - `GRAPH_AGENT_LLM_API_BASE` - Optional. OpenAI-compatible API base.
//! - `GRAPH_AGENT_LLM_API_KEY` - Optional. API key for the model backend.
//! - `GRAPH_AGENT_BROWSER_ENDPOINT` - Optional. Browser control service URL.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance for the verifier weight sum.
pub const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Verifier weights must sum to 1.0 (got {sum}: hard={hard}, soft={soft}, consistency={consistency})")]
    WeightSum {
        hard: f64,
        soft: f64,
        consistency: f64,
        sum: f64,
    },

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Runtime configuration.
///
/// # Invariants
/// - `hard_weight + soft_weight + consistency_weight == 1.0 ± WEIGHT_EPSILON`
/// - every weight and `confidence_threshold` lies in `[0, 1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum node executions for one task
    pub max_steps: usize,

    /// Maximum local repairs per node before escalation
    pub max_repair_per_node: u32,

    /// Minimum confidence for a pass verdict
    pub confidence_threshold: f64,

    pub hard_weight: f64,
    pub soft_weight: f64,
    pub consistency_weight: f64,

    /// Model answering SMALL-tier questions
    pub small_model: String,

    /// Model answering LARGE-tier questions
    pub large_model: String,

    /// Consecutive failures of a node before its decisions go to the large model
    pub upgrade_after_failures: u32,

    /// Page complexity in [0, 1] above which model decisions go LARGE
    pub dom_complexity_threshold: f64,

    /// Default `WAIT_UNTIL` poll interval
    pub wait_interval_ms: u64,

    /// Default `WAIT_UNTIL` deadline
    pub wait_timeout_ms: u64,

    /// Optional cap on cumulative model spend
    pub max_cost_usd: Option<f64>,

    /// Identical page fingerprints in a row that count as no progress
    pub no_progress_window: usize,

    /// OpenAI-compatible chat completions base URL
    pub llm_api_base: String,

    /// API key for the model backend (never read from the config file)
    #[serde(skip)]
    pub llm_api_key: Option<String>,

    /// Browser control service endpoint
    pub browser_endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_steps: 100,
            max_repair_per_node: 3,
            confidence_threshold: 0.7,
            hard_weight: 0.6,
            soft_weight: 0.3,
            consistency_weight: 0.1,
            small_model: "gpt-4o-mini".to_string(),
            large_model: "gpt-4o".to_string(),
            upgrade_after_failures: 3,
            dom_complexity_threshold: 0.5,
            wait_interval_ms: 250,
            wait_timeout_ms: 10_000,
            max_cost_usd: None,
            no_progress_window: 3,
            llm_api_base: "https://api.openai.com/v1".to_string(),
            llm_api_key: None,
            browser_endpoint: "http://127.0.0.1:9333".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// environment value is malformed, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        let config = base.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Parse a YAML file. Missing fields take their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        override_parsed("GRAPH_AGENT_MAX_STEPS", &mut self.max_steps)?;
        override_parsed("GRAPH_AGENT_MAX_REPAIR_PER_NODE", &mut self.max_repair_per_node)?;
        override_parsed("GRAPH_AGENT_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold)?;
        override_parsed("GRAPH_AGENT_HARD_WEIGHT", &mut self.hard_weight)?;
        override_parsed("GRAPH_AGENT_SOFT_WEIGHT", &mut self.soft_weight)?;
        override_parsed("GRAPH_AGENT_CONSISTENCY_WEIGHT", &mut self.consistency_weight)?;
        override_parsed("GRAPH_AGENT_UPGRADE_AFTER_FAILURES", &mut self.upgrade_after_failures)?;
        override_parsed(
            "GRAPH_AGENT_DOM_COMPLEXITY_THRESHOLD",
            &mut self.dom_complexity_threshold,
        )?;
        override_parsed("GRAPH_AGENT_WAIT_INTERVAL_MS", &mut self.wait_interval_ms)?;
        override_parsed("GRAPH_AGENT_WAIT_TIMEOUT_MS", &mut self.wait_timeout_ms)?;
        override_parsed("GRAPH_AGENT_NO_PROGRESS_WINDOW", &mut self.no_progress_window)?;

        if let Ok(model) = std::env::var("GRAPH_AGENT_SMALL_MODEL") {
            self.small_model = model;
        }
        if let Ok(model) = std::env::var("GRAPH_AGENT_LARGE_MODEL") {
            self.large_model = model;
        }
        if let Ok(raw) = std::env::var("GRAPH_AGENT_MAX_COST_USD") {
            let cap = raw.parse::<f64>().map_err(|e| {
                ConfigError::InvalidValue("GRAPH_AGENT_MAX_COST_USD".to_string(), e.to_string())
            })?;
            self.max_cost_usd = Some(cap);
        }
        if let Ok(base) = std::env::var("GRAPH_AGENT_LLM_API_BASE") {
            self.llm_api_base = base;
        }
        if let Ok(key) = std::env::var("GRAPH_AGENT_LLM_API_KEY") {
            self.llm_api_key = Some(key);
        }
        if let Ok(endpoint) = std::env::var("GRAPH_AGENT_BROWSER_ENDPOINT") {
            self.browser_endpoint = endpoint;
        }
        Ok(self)
    }

    /// Check the configuration invariants.
    ///
    /// # Errors
    /// `ConfigError::WeightSum` when the verifier weights do not sum to 1.0,
    /// `ConfigError::InvalidValue` for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("hard_weight", self.hard_weight),
            ("soft_weight", self.soft_weight),
            ("consistency_weight", self.consistency_weight),
            ("confidence_threshold", self.confidence_threshold),
            ("dom_complexity_threshold", self.dom_complexity_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    format!("{} is outside [0, 1]", value),
                ));
            }
        }

        let sum = self.hard_weight + self.soft_weight + self.consistency_weight;
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(ConfigError::WeightSum {
                hard: self.hard_weight,
                soft: self.soft_weight,
                consistency: self.consistency_weight,
                sum,
            });
        }

        if self.max_steps == 0 {
            return Err(ConfigError::InvalidValue(
                "max_steps".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.max_repair_per_node == 0 {
            return Err(ConfigError::InvalidValue(
                "max_repair_per_node".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.wait_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "wait_interval_ms".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if let Some(cap) = self.max_cost_usd {
            if cap < 0.0 || cap.is_nan() {
                return Err(ConfigError::InvalidValue(
                    "max_cost_usd".to_string(),
                    format!("{} is negative", cap),
                ));
            }
        }
        Ok(())
    }
}

fn override_parsed<T>(var: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(var) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(var.to_string(), e.to_string()))?;
    }
    Ok(())
}
