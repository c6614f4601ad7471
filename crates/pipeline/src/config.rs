use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use kiln_core::error::CoreError;
use kiln_core::quality_gate::{QualityCriteria, DEFAULT_PASS_SCORE};

/// Allowed poll cadence for deployments.
pub const POLL_INTERVAL_RANGE_MS: std::ops::RangeInclusive<u64> = 500..=2_000;

/// Orchestration settings.
///
/// `Default` carries the design values; [`PipelineConfig::from_env`]
/// overrides them from the environment and validates the result.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Concurrent executors, and so concurrent render-engine submissions.
    pub worker_count: usize,
    pub poll_interval: Duration,
    /// Wall-clock limit for one submit-and-poll attempt.
    pub attempt_timeout: Duration,
    /// Backoff before retry `n` is `min(backoff_unit * 2^n, backoff_cap)`.
    pub backoff_unit: Duration,
    pub backoff_cap: Duration,
    /// How long terminal jobs stay in memory.
    pub job_retention: Duration,
    pub system_status_interval: Duration,
    /// Per-observer buffer before a slow observer is dropped.
    pub observer_buffer: usize,
    /// Drain window for in-flight jobs at shutdown.
    pub shutdown_timeout: Duration,
    /// Directory the render engine's artifact paths are relative to.
    pub artifact_root: PathBuf,
    pub quality: QualityCriteria,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            poll_interval: Duration::from_millis(1_000),
            attempt_timeout: Duration::from_secs(300),
            backoff_unit: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            job_retention: Duration::from_secs(3_600),
            system_status_interval: Duration::from_secs(10),
            observer_buffer: 64,
            shutdown_timeout: Duration::from_secs(30),
            artifact_root: PathBuf::from("."),
            quality: QualityCriteria::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default |
    /// |-------------------------------|---------|
    /// | `WORKER_COUNT`                | `3`     |
    /// | `POLL_INTERVAL_MS`            | `1000`  |
    /// | `ATTEMPT_TIMEOUT_SECS`        | `300`   |
    /// | `BACKOFF_CAP_SECS`            | `30`    |
    /// | `JOB_RETENTION_SECS`          | `3600`  |
    /// | `SYSTEM_STATUS_INTERVAL_SECS` | `10`    |
    /// | `OBSERVER_BUFFER`             | `64`    |
    /// | `SHUTDOWN_TIMEOUT_SECS`       | `30`    |
    /// | `ARTIFACT_ROOT`               | `.`     |
    /// | `QUALITY_EXPECTED_OUTPUTS`    | `1`     |
    /// | `QUALITY_MIN_WIDTH`           | `0`     |
    /// | `QUALITY_MIN_HEIGHT`          | `0`     |
    /// | `QUALITY_PASS_SCORE`          | `0.7`   |
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Self::default();

        let config = Self {
            worker_count: env_or("WORKER_COUNT", defaults.worker_count)?,
            poll_interval: Duration::from_millis(env_or("POLL_INTERVAL_MS", 1_000)?),
            attempt_timeout: Duration::from_secs(env_or("ATTEMPT_TIMEOUT_SECS", 300)?),
            backoff_unit: defaults.backoff_unit,
            backoff_cap: Duration::from_secs(env_or("BACKOFF_CAP_SECS", 30)?),
            job_retention: Duration::from_secs(env_or("JOB_RETENTION_SECS", 3_600)?),
            system_status_interval: Duration::from_secs(env_or(
                "SYSTEM_STATUS_INTERVAL_SECS",
                10,
            )?),
            observer_buffer: env_or("OBSERVER_BUFFER", defaults.observer_buffer)?,
            shutdown_timeout: Duration::from_secs(env_or("SHUTDOWN_TIMEOUT_SECS", 30)?),
            artifact_root: std::env::var("ARTIFACT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_root),
            quality: QualityCriteria {
                expected_outputs: env_or("QUALITY_EXPECTED_OUTPUTS", 1)?,
                min_width: env_or("QUALITY_MIN_WIDTH", 0)?,
                min_height: env_or("QUALITY_MIN_HEIGHT", 0)?,
                pass_score: env_or("QUALITY_PASS_SCORE", DEFAULT_PASS_SCORE)?,
                ..defaults.quality
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values outside their operating range.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.worker_count == 0 {
            return Err(CoreError::Validation(
                "worker count must be at least 1".to_string(),
            ));
        }
        let poll_ms = self.poll_interval.as_millis() as u64;
        if !POLL_INTERVAL_RANGE_MS.contains(&poll_ms) {
            return Err(CoreError::Validation(format!(
                "poll interval must be between {} and {} ms, got {poll_ms}",
                POLL_INTERVAL_RANGE_MS.start(),
                POLL_INTERVAL_RANGE_MS.end()
            )));
        }
        if self.attempt_timeout < self.poll_interval {
            return Err(CoreError::Validation(
                "attempt timeout must be at least one poll interval".to_string(),
            ));
        }
        if self.backoff_cap.is_zero() {
            return Err(CoreError::Validation(
                "backoff cap must be positive".to_string(),
            ));
        }
        if self.job_retention.is_zero() || self.system_status_interval.is_zero() {
            return Err(CoreError::Validation(
                "retention and status interval must be positive".to_string(),
            ));
        }
        if self.observer_buffer == 0 {
            return Err(CoreError::Validation(
                "observer buffer must be at least 1".to_string(),
            ));
        }
        self.quality.validate()
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CoreError::Validation(format!("{name} is invalid ({raw:?}): {e}"))),
        Err(_) => Ok(default),
    }
}
