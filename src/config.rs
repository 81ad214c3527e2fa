//! Configuration for the manual correction pipeline
//!
//! Loads pipeline settings from TOML: which AI backend to call, the retry and
//! backoff budget for step execution, and the token rates used for analytics
//! cost estimation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub llm: LlmSection,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Deadline for a single step across all retry attempts, in seconds
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default)]
    pub cost: CostConfig,
}

/// AI backend selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSection {
    /// Provider name (e.g., "anthropic", "openai")
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// Environment variable containing the API key
    pub api_key_env: String,
    /// Optional temperature (0.0 to 2.0)
    pub temperature: Option<f32>,
    /// Optional max tokens per step
    pub max_tokens: Option<u32>,
}

/// Retry budget for transient provider failures on a single step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum attempts per step, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound on any single delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Add uniform random jitter to each delay
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry number `attempt` (1-based), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let raw = self.base_delay_ms as f64 * self.backoff_factor.powi(exp as i32);
        Duration::from_millis((raw as u64).min(self.max_delay_ms))
    }
}

/// Token rates for analytics cost estimation
///
/// Rates default to zero so analytics degrades to latency-only when the
/// deployment has not configured pricing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CostConfig {
    /// Cost per 1000 prompt tokens
    #[serde(default)]
    pub prompt_rate_per_1k: f64,
    /// Cost per 1000 completion tokens
    #[serde(default)]
    pub completion_rate_per_1k: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_jitter() -> bool {
    true
}

fn default_step_timeout_secs() -> u64 {
    120
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.provider.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "llm.provider must not be empty".to_string(),
            ));
        }
        if self.llm.model.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "llm.model must not be empty".to_string(),
            ));
        }
        if let Some(t) = self.llm.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::InvalidConfig(format!(
                    "llm.temperature {t} out of range 0.0..=2.0"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "retry.backoff_factor must be >= 1.0".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "retry.max_delay_ms must be >= retry.base_delay_ms".to_string(),
            ));
        }
        if self.step_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "step_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.llm.api_key_env).map_err(|_| {
            ConfigError::MissingEnvVar(self.llm.api_key_env.clone())
        })
    }

    /// Step deadline as a `Duration`
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Environment variable not set: {0}")]
    MissingEnvVar(String),
}
