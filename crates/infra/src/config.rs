//! Engine configuration.
//!
//! Loaded from JSON (every field optional, missing fields take the defaults
//! below) and/or from `TXFLOW_*` environment variables:
//!
//! | variable | field |
//! |---|---|
//! | `TXFLOW_LOCK_OWNER` | `lock_owner` |
//! | `TXFLOW_LOCK_TIME_MS` | `lock_time_ms` |
//! | `TXFLOW_MAX_JOBS_PER_ACQUISITION` | `max_jobs_per_acquisition` |
//! | `TXFLOW_WAIT_TIME_BETWEEN_ACQUISITIONS_MS` | `wait_time_between_acquisitions_ms` |
//! | `TXFLOW_MAX_BACKOFF_MS` | `max_backoff_ms` |
//! | `TXFLOW_WORKER_THREADS` | `worker_threads` |
//! | `TXFLOW_DEFAULT_RETRIES` | `default_retries` |
//! | `TXFLOW_FAILED_JOB_RETRY_TIME_CYCLE` | `failed_job_retry_time_cycle` |
//! | `TXFLOW_OPTIMISTIC_LOCKING_ON_FOREIGN_KEY_VIOLATION` | `optimistic_locking_on_foreign_key_violation` |
//! | `TXFLOW_LOCK_WAIT_TIMEOUT_MS` | `lock_wait_timeout_ms` |
//! | `TXFLOW_EVER_LIVING_JOB_INTERVAL_MS` | `ever_living_job_interval_ms` |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use txflow_core::MAX_INTERVAL_MS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity written to `lock_owner` of acquired jobs.
    pub lock_owner: String,
    pub lock_time_ms: u64,
    pub max_jobs_per_acquisition: usize,
    pub wait_time_between_acquisitions_ms: u64,
    pub max_backoff_ms: u64,
    pub worker_threads: usize,
    /// Retries given to newly created jobs.
    pub default_retries: i32,
    /// Engine-wide retry cycle used when a job definition has none.
    pub failed_job_retry_time_cycle: Option<String>,
    /// Map foreign key violations during flush to optimistic locking failures.
    pub optimistic_locking_on_foreign_key_violation: bool,
    pub lock_wait_timeout_ms: u64,
    pub ever_living_job_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_owner: Uuid::now_v7().to_string(),
            lock_time_ms: 300_000,
            max_jobs_per_acquisition: 3,
            wait_time_between_acquisitions_ms: 5_000,
            max_backoff_ms: 60_000,
            worker_threads: 3,
            default_retries: 3,
            failed_job_retry_time_cycle: None,
            optimistic_locking_on_foreign_key_violation: true,
            lock_wait_timeout_ms: 10_000,
            ever_living_job_interval_ms: 60_000,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid engine configuration JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine configuration {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Defaults overridden by `TXFLOW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup (the environment in production).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(owner) = lookup("TXFLOW_LOCK_OWNER") {
            self.lock_owner = owner;
        }
        override_parsed(&lookup, "TXFLOW_LOCK_TIME_MS", &mut self.lock_time_ms)?;
        override_parsed(&lookup, "TXFLOW_MAX_JOBS_PER_ACQUISITION", &mut self.max_jobs_per_acquisition)?;
        override_parsed(
            &lookup,
            "TXFLOW_WAIT_TIME_BETWEEN_ACQUISITIONS_MS",
            &mut self.wait_time_between_acquisitions_ms,
        )?;
        override_parsed(&lookup, "TXFLOW_MAX_BACKOFF_MS", &mut self.max_backoff_ms)?;
        override_parsed(&lookup, "TXFLOW_WORKER_THREADS", &mut self.worker_threads)?;
        override_parsed(&lookup, "TXFLOW_DEFAULT_RETRIES", &mut self.default_retries)?;
        if let Some(cycle) = lookup("TXFLOW_FAILED_JOB_RETRY_TIME_CYCLE") {
            self.failed_job_retry_time_cycle = Some(cycle).filter(|c| !c.trim().is_empty());
        }
        override_parsed(
            &lookup,
            "TXFLOW_OPTIMISTIC_LOCKING_ON_FOREIGN_KEY_VIOLATION",
            &mut self.optimistic_locking_on_foreign_key_violation,
        )?;
        override_parsed(&lookup, "TXFLOW_LOCK_WAIT_TIMEOUT_MS", &mut self.lock_wait_timeout_ms)?;
        override_parsed(
            &lookup,
            "TXFLOW_EVER_LIVING_JOB_INTERVAL_MS",
            &mut self.ever_living_job_interval_ms,
        )?;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.lock_owner.is_empty(), "lock_owner must not be empty");
        anyhow::ensure!(self.max_jobs_per_acquisition > 0, "max_jobs_per_acquisition must be positive");
        anyhow::ensure!(self.worker_threads > 0, "worker_threads must be positive");
        anyhow::ensure!(self.default_retries >= 0, "default_retries must not be negative");
        anyhow::ensure!(self.lock_time_ms > 0, "lock_time_ms must be positive");
        anyhow::ensure!(
            self.lock_time_ms <= MAX_INTERVAL_MS,
            "lock_time_ms must not exceed {MAX_INTERVAL_MS}"
        );
        anyhow::ensure!(
            self.ever_living_job_interval_ms <= MAX_INTERVAL_MS,
            "ever_living_job_interval_ms must not exceed {MAX_INTERVAL_MS}"
        );
        Ok(())
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn with_retry_time_cycle(mut self, cycle: impl Into<String>) -> Self {
        self.failed_job_retry_time_cycle = Some(cycle.into());
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_wait_time_between_acquisitions(mut self, wait: Duration) -> Self {
        self.wait_time_between_acquisitions_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_lock_time(mut self, lock_time: Duration) -> Self {
        self.lock_time_ms = lock_time.as_millis() as u64;
        self
    }

    pub fn with_ever_living_job_interval(mut self, interval: Duration) -> Self {
        self.ever_living_job_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_foreign_key_as_conflict(mut self, enabled: bool) -> Self {
        self.optimistic_locking_on_foreign_key_violation = enabled;
        self
    }

    pub fn lock_time(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lock_time_ms.min(MAX_INTERVAL_MS) as i64)
    }

    pub fn ever_living_job_interval(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.ever_living_job_interval_ms.min(MAX_INTERVAL_MS) as i64)
    }

    pub fn wait_time_between_acquisitions(&self) -> Duration {
        Duration::from_millis(self.wait_time_between_acquisitions_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}

fn override_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}"))?;
    }
    Ok(())
}
