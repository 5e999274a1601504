//! Engine policy loading: tick period, flush cadence and every retry/backoff budget.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};
use validator::{Validate, ValidationError};

/// Default location on disk where the engine looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/engine.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "EXAM_ENGINE_CONFIG_PATH";

/// Bounded retry with linear backoff (`attempt * backoff_step`) between attempts.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Validate)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// Backoff unit multiplied by the attempt number.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "backoff_step_ms")]
    pub backoff_step: Duration,
    /// Budget for a single request.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "request_timeout_ms")]
    #[validate(custom(function = validate_positive_duration))]
    pub request_timeout: Duration,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }
}

/// Unbounded retry with exponential backoff capped at `max_delay`.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Validate)]
pub struct BackoffPolicy {
    /// First delay.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "initial_delay_ms")]
    #[validate(custom(function = validate_positive_duration))]
    pub initial_delay: Duration,
    /// Ceiling for the doubling delay.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_delay_ms")]
    #[validate(custom(function = validate_positive_duration))]
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Delay following `current`.
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

/// Terminal call retry policy.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Validate)]
pub struct SubmitPolicy {
    /// Delays between failed terminal calls.
    #[serde(flatten)]
    #[validate(nested)]
    pub backoff: BackoffPolicy,
    /// Failed calls tolerated before the student is told to contact support.
    #[validate(range(min = 1))]
    pub support_after_failures: u32,
    /// Budget for a single terminal call.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "request_timeout_ms")]
    #[validate(custom(function = validate_positive_duration))]
    pub request_timeout: Duration,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
#[serde(default)]
/// Immutable engine configuration shared by every component of a session.
pub struct EngineConfig {
    /// Clock period; one tick removes one second from the countdown.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "tick_interval_ms")]
    pub tick_interval: Duration,
    /// Cadence of the periodic flush of the current answer.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "flush_interval_ms")]
    pub flush_interval: Duration,
    /// Normal answer persistence.
    #[validate(nested)]
    pub save: RetryPolicy,
    /// Shorter budget used while draining before the terminal call.
    #[validate(nested)]
    pub drain: RetryPolicy,
    /// Status re-fetch after connectivity returns.
    #[validate(nested)]
    pub reconcile: BackoffPolicy,
    /// Terminal call.
    #[validate(nested)]
    pub submit: SubmitPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            flush_interval: Duration::from_secs(30),
            save: RetryPolicy {
                max_attempts: 3,
                backoff_step: Duration::from_secs(1),
                request_timeout: Duration::from_secs(10),
            },
            drain: RetryPolicy {
                max_attempts: 2,
                backoff_step: Duration::from_millis(250),
                request_timeout: Duration::from_secs(3),
            },
            reconcile: BackoffPolicy {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
            },
            submit: SubmitPolicy {
                backoff: BackoffPolicy {
                    initial_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(10),
                },
                support_after_failures: 10,
                request_timeout: Duration::from_secs(10),
            },
        }
    }
}

impl EngineConfig {
    /// Load the engine configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        tick_ms = config.tick_interval.as_millis() as u64,
                        save_attempts = config.save.max_attempts,
                        "loaded engine config"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "invalid engine config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "engine config not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read engine config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse and validate a JSON document. Missing top-level keys keep their defaults.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        if config.tick_interval.is_zero() || config.flush_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(config)
    }
}

/// Reasons a configuration document is refused.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Malformed JSON or wrong field types.
    #[error("failed to parse engine config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A budget is outside its allowed range.
    #[error("engine config validation failed: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    /// Tick and flush periods must be positive.
    #[error("tick and flush intervals must be greater than zero")]
    ZeroInterval,
}

/// Rejects zero delays and timeouts, which would turn retry loops into busy loops.
fn validate_positive_duration(duration: &Duration) -> Result<(), ValidationError> {
    if duration.is_zero() {
        let mut err = ValidationError::new("positive_duration");
        err.message = Some("must be at least 1 ms".into());
        return Err(err);
    }
    Ok(())
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
