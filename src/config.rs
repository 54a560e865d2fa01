use crate::error::{ErrorClass, OptimizerError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Thresholds for the prompt quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Hard minimum character count.
    pub min_length: usize,
    /// Longer instructions get a soft defect.
    pub max_length: usize,
    /// Distinct quoted (or enumerated) alternative phrases required for SYNONYMS.
    pub min_synonyms: usize,
    /// How many of the five required elements must be present.
    pub min_elements: usize,
    /// Soft defects tolerated on an otherwise valid instruction.
    pub max_other_defects: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_length: 350,
            max_length: 4000,
            min_synonyms: 6,
            min_elements: 4,
            max_other_defects: 1,
        }
    }
}

/// Retry, backoff and timeout discipline for every external AI call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the computed delay added as random jitter (0.0 - 1.0).
    pub jitter: f64,
    /// Hard limit for a single attempt.
    pub attempt_timeout_ms: u64,
    pub retryable: Vec<ErrorClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            jitter: 0.25,
            attempt_timeout_ms: 60_000,
            retryable: vec![
                ErrorClass::TransientNetwork,
                ErrorClass::TransientServer,
                ErrorClass::Timeout,
                ErrorClass::RateLimit,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, class: ErrorClass) -> bool {
        self.retryable.contains(&class)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Generate/repair attempts allowed per field in one run.
    pub max_iterations: u32,
    /// Failing documents sampled per field for diagnostics.
    pub samples_per_field: usize,
    pub max_failure_examples: usize,
    pub max_success_examples: usize,
    /// Rejected instructions remembered per field.
    pub history_limit: usize,
    /// Rejected instructions quoted back in a generation request.
    pub previous_instructions_in_request: usize,
    /// Fields (and documents) processed concurrently.
    pub worker_limit: usize,
    /// Enum options named in a request.
    pub option_sample_size: usize,
    pub value_truncate_chars: usize,
    /// Operator's own company, excluded from counter-party answers.
    pub exclude_entity: Option<String>,
    /// Hint such as "contract" or "invoice".
    pub document_type: Option<String>,
    /// Replaces the built-in generation instructions wholesale.
    pub custom_instructions: Option<String>,
    pub validator: ValidatorConfig,
    pub retry: RetryPolicy,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            samples_per_field: 3,
            max_failure_examples: 3,
            max_success_examples: 2,
            history_limit: 5,
            previous_instructions_in_request: 2,
            worker_limit: 4,
            option_sample_size: 10,
            value_truncate_chars: 200,
            exclude_entity: None,
            document_type: None,
            custom_instructions: None,
            validator: ValidatorConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl OptimizerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `OPTIMIZER_*` environment overrides on top of the current values.
    pub fn with_env_overrides(mut self) -> Self {
        self.max_iterations = get_env_var("OPTIMIZER_MAX_ITERATIONS", self.max_iterations);
        self.worker_limit = get_env_var("OPTIMIZER_WORKER_LIMIT", self.worker_limit);
        self.samples_per_field =
            get_env_var("OPTIMIZER_SAMPLES_PER_FIELD", self.samples_per_field);
        self.retry.max_attempts =
            get_env_var("OPTIMIZER_RETRY_MAX_ATTEMPTS", self.retry.max_attempts);
        self.retry.base_delay_ms =
            get_env_var("OPTIMIZER_RETRY_BASE_DELAY_MS", self.retry.base_delay_ms);
        self.retry.max_delay_ms =
            get_env_var("OPTIMIZER_RETRY_MAX_DELAY_MS", self.retry.max_delay_ms);
        self.retry.attempt_timeout_ms =
            get_env_var("OPTIMIZER_ATTEMPT_TIMEOUT_MS", self.retry.attempt_timeout_ms);

        if let Some(entity) = non_empty_env("OPTIMIZER_EXCLUDE_ENTITY") {
            self.exclude_entity = Some(entity);
        }
        if let Some(doc_type) = non_empty_env("OPTIMIZER_DOCUMENT_TYPE") {
            self.document_type = Some(doc_type);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(OptimizerError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.worker_limit == 0 {
            return Err(OptimizerError::Config(
                "worker_limit must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(OptimizerError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(OptimizerError::Config(format!(
                "retry.multiplier {} must be >= 1.0",
                self.retry.multiplier
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(OptimizerError::Config(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(OptimizerError::Config(format!(
                "retry.jitter {} must be between 0.0 and 1.0",
                self.retry.jitter
            )));
        }
        Ok(())
    }
}

fn get_env_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
