//! Engine configuration
//!
//! Defaults can be overridden from `CONFLUX_*` environment variables or
//! loaded from a YAML document.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::history::HistoryLevel;
use crate::CoreError;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// How much audit data is mirrored into the history model
    #[serde(default)]
    pub history_level: HistoryLevel,

    /// Retries given to every new job
    #[serde(default = "default_job_retries")]
    pub default_job_retries: u32,

    /// Async job executor settings
    #[serde(default)]
    pub async_executor: AsyncExecutorConfig,
}

/// Settings of the job acquisition loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AsyncExecutorConfig {
    /// Value written into `lock_owner` of acquired jobs
    #[serde(default = "default_lock_owner")]
    pub lock_owner: String,

    /// How long an acquired job stays locked before another worker may reclaim it
    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,

    /// Upper bound on jobs locked per acquisition
    #[serde(default = "default_max_jobs_per_acquisition")]
    pub max_jobs_per_acquisition: usize,

    /// Delay between acquisition cycles
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay before a failed job with retries left becomes due again; 0 re-queues it immediately
    #[serde(default)]
    pub retry_wait_ms: u64,

    /// Only acquire jobs of this tenant
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Longest lock duration, poll interval or retry wait accepted by `validate`
pub const MAX_INTERVAL_MS: u64 = 10 * 365 * 24 * 3_600_000; // 10 years

fn default_job_retries() -> u32 {
    3
}

fn default_lock_owner() -> String {
    format!("conflux-{}", uuid::Uuid::new_v4())
}

fn default_lock_duration_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_max_jobs_per_acquisition() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for AsyncExecutorConfig {
    fn default() -> Self {
        Self {
            lock_owner: default_lock_owner(),
            lock_duration_ms: default_lock_duration_ms(),
            max_jobs_per_acquisition: default_max_jobs_per_acquisition(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_wait_ms: 0,
            tenant_id: None,
        }
    }
}

impl AsyncExecutorConfig {
    /// Lock duration as a `Duration`
    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_level: HistoryLevel::default(),
            default_job_retries: default_job_retries(),
            async_executor: AsyncExecutorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Ok(level) = env::var("CONFLUX_HISTORY_LEVEL") {
            match level.parse::<HistoryLevel>() {
                Ok(level) => config.history_level = level,
                Err(_) => warn!("Invalid CONFLUX_HISTORY_LEVEL value: {}", level),
            }
        }

        if let Ok(retries) = env::var("CONFLUX_JOB_RETRIES") {
            if let Ok(retries) = retries.parse::<u32>() {
                config.default_job_retries = retries;
            } else {
                warn!("Invalid CONFLUX_JOB_RETRIES value: {}", retries);
            }
        }

        if let Ok(owner) = env::var("CONFLUX_LOCK_OWNER") {
            config.async_executor.lock_owner = owner;
        }

        if let Ok(duration) = env::var("CONFLUX_LOCK_DURATION_MS") {
            if let Ok(duration) = duration.parse::<u64>() {
                config.async_executor.lock_duration_ms = duration;
            } else {
                warn!("Invalid CONFLUX_LOCK_DURATION_MS value: {}", duration);
            }
        }

        if let Ok(max_jobs) = env::var("CONFLUX_MAX_JOBS_PER_ACQUISITION") {
            if let Ok(max_jobs) = max_jobs.parse::<usize>() {
                config.async_executor.max_jobs_per_acquisition = max_jobs;
            } else {
                warn!("Invalid CONFLUX_MAX_JOBS_PER_ACQUISITION value: {}", max_jobs);
            }
        }

        if let Ok(interval) = env::var("CONFLUX_POLL_INTERVAL_MS") {
            if let Ok(interval) = interval.parse::<u64>() {
                config.async_executor.poll_interval_ms = interval;
            } else {
                warn!("Invalid CONFLUX_POLL_INTERVAL_MS value: {}", interval);
            }
        }

        if let Ok(wait) = env::var("CONFLUX_RETRY_WAIT_MS") {
            if let Ok(wait) = wait.parse::<u64>() {
                config.async_executor.retry_wait_ms = wait;
            } else {
                warn!("Invalid CONFLUX_RETRY_WAIT_MS value: {}", wait);
            }
        }

        if let Ok(tenant) = env::var("CONFLUX_TENANT_ID") {
            config.async_executor.tenant_id = Some(tenant);
        }

        config
    }

    /// Parse configuration from a YAML document; missing keys take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CoreError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.async_executor.lock_duration_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "lock_duration_ms must be positive".to_string(),
            ));
        }
        if self.async_executor.max_jobs_per_acquisition == 0 {
            return Err(CoreError::ConfigurationError(
                "max_jobs_per_acquisition must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("lock_duration_ms", self.async_executor.lock_duration_ms),
            ("poll_interval_ms", self.async_executor.poll_interval_ms),
            ("retry_wait_ms", self.async_executor.retry_wait_ms),
        ] {
            if value > MAX_INTERVAL_MS {
                return Err(CoreError::ConfigurationError(format!(
                    "{} must not exceed {}",
                    name, MAX_INTERVAL_MS
                )));
            }
        }
        Ok(())
    }

    /// Builder-style history level override
    pub fn with_history_level(mut self, level: HistoryLevel) -> Self {
        self.history_level = level;
        self
    }
}
