//! Process configuration, loaded from environment variables.

use std::time::Duration;

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {variable}: {value:?}")]
    InvalidValue { variable: String, value: String },
}

/// Runtime knobs for the controller process.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Workers of the workload reconciler; other kinds run one worker each.
    pub workload_workers: usize,
    /// Minimum delay between a wake signal and the next scheduling cycle,
    /// coalescing event bursts.
    pub wake_interval: Duration,
    /// Deadline for an admission write; on expiry the commit is abandoned
    /// and the workload stays pending.
    pub commit_deadline: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workload_workers: 1,
            wake_interval: Duration::from_millis(100),
            commit_deadline: Duration::from_secs(5),
        }
    }
}

impl ControllerConfig {
    /// Read configuration from `GATEHOUSE_*` environment variables, falling
    /// back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            workload_workers: parse_env("GATEHOUSE_QUEUE_WORKERS", defaults.workload_workers)?,
            wake_interval: Duration::from_millis(parse_env(
                "GATEHOUSE_WAKE_INTERVAL_MS",
                defaults.wake_interval.as_millis() as u64,
            )?),
            commit_deadline: Duration::from_millis(parse_env(
                "GATEHOUSE_COMMIT_DEADLINE_MS",
                defaults.commit_deadline.as_millis() as u64,
            )?),
        })
    }
}

fn parse_env<T: std::str::FromStr>(variable: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(variable) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            variable: variable.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}
