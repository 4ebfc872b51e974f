//! Engine configuration.
//!
//! Defaults suit a single-process deployment; every value can be overridden
//! through `BATCHFLOW_*` environment variables or the `with_*` setters.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::jobs::retry::RetryPolicy;

const ENV_PREFIX: &str = "BATCHFLOW_";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Entity ids per chunk job.
    pub chunk_size: u32,
    /// Chunk jobs created per seed invocation.
    pub jobs_per_seed: u32,
    /// Retry budget and backoff applied to every job.
    pub retry: RetryPolicy,
    pub lock_duration: Duration,
    /// Upper bound on jobs locked per acquisition cycle.
    pub acquisition_limit: usize,
    pub acquisition_interval: Duration,
    pub workers: usize,
    /// Delay between monitor polls of an unfinished batch.
    pub monitor_interval: Duration,
    /// Identity written into job locks; must be unique per engine instance.
    pub lock_owner: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            jobs_per_seed: 10,
            retry: RetryPolicy::default(),
            lock_duration: Duration::from_secs(300),
            acquisition_limit: 3,
            acquisition_interval: Duration::from_millis(500),
            workers: 4,
            monitor_interval: Duration::from_secs(30),
            lock_owner: generated_lock_owner(),
        }
    }
}

fn generated_lock_owner() -> String {
    format!("batchflow-{}", Uuid::now_v7())
}

impl EngineConfig {
    /// Build a config from `BATCHFLOW_*` environment variables.
    ///
    /// Unset variables keep their default; unparsable ones are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let read = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = parse_var(&read, "CHUNK_SIZE") {
            config.chunk_size = v;
        }
        if let Some(v) = parse_var(&read, "JOBS_PER_SEED") {
            config.jobs_per_seed = v;
        }
        if let Some(v) = parse_var::<u32>(&read, "DEFAULT_RETRIES") {
            config.retry.max_retries = v.max(1);
        }
        if let Some(v) = parse_var(&read, "LOCK_DURATION_MS") {
            config.lock_duration = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&read, "ACQUISITION_LIMIT") {
            config.acquisition_limit = v;
        }
        if let Some(v) = parse_var(&read, "ACQUISITION_INTERVAL_MS") {
            config.acquisition_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&read, "WORKERS") {
            config.workers = v;
        }
        if let Some(v) = parse_var(&read, "MONITOR_INTERVAL_MS") {
            config.monitor_interval = Duration::from_millis(v);
        }
        if let Some(owner) = read("LOCK_OWNER").filter(|s| !s.trim().is_empty()) {
            config.lock_owner = owner;
        }

        config.normalized()
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self.normalized()
    }

    pub fn with_jobs_per_seed(mut self, jobs_per_seed: u32) -> Self {
        self.jobs_per_seed = jobs_per_seed;
        self.normalized()
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_acquisition_limit(mut self, limit: usize) -> Self {
        self.acquisition_limit = limit;
        self.normalized()
    }

    pub fn with_acquisition_interval(mut self, interval: Duration) -> Self {
        self.acquisition_interval = interval;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self.normalized()
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    /// Monitor interval as a chrono duration for timestamp arithmetic.
    pub fn monitor_interval_chrono(&self) -> chrono::Duration {
        to_chrono(self.monitor_interval)
    }

    fn normalized(mut self) -> Self {
        self.chunk_size = self.chunk_size.max(1);
        self.jobs_per_seed = self.jobs_per_seed.max(1);
        self.acquisition_limit = self.acquisition_limit.max(1);
        self.workers = self.workers.max(1);
        self
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn parse_var<T>(read: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = read(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(err) => {
            warn!(
                variable = %format!("{ENV_PREFIX}{name}"),
                value = %raw,
                error = %err,
                "ignoring invalid configuration value"
            );
            None
        }
    }
}
