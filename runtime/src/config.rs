//! Worker pool configuration

use std::num::NonZeroUsize;

use crate::error::RuntimeError;

/// Environment variable overriding the worker count.
pub const WORKERS_ENV: &str = "KERNRUN_WORKERS";

/// Environment variable overriding the pending-dispatch queue depth.
pub const QUEUE_DEPTH_ENV: &str = "KERNRUN_QUEUE_DEPTH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads; every dispatch is split this many ways.
    pub workers: usize,

    /// Dispatches that may be queued before `dispatch` blocks.
    pub queue_depth: usize,

    /// Prefix for worker thread names (`<prefix>-<index>`).
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            queue_depth: 20, // room to avoid blocking calls to dispatch
            thread_name: "kernrun-worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// One worker; every workgroup runs on the same thread in index order.
    pub fn single_threaded() -> Self {
        Self {
            workers: 1,
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Defaults overridden by `KERNRUN_WORKERS` and `KERNRUN_QUEUE_DEPTH`.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RuntimeError> {
        let mut config = Self::default();
        if let Some(value) = lookup(WORKERS_ENV) {
            config.workers = parse_positive(WORKERS_ENV, &value)?;
        }
        if let Some(value) = lookup(QUEUE_DEPTH_ENV) {
            config.queue_depth = parse_positive(QUEUE_DEPTH_ENV, &value)?;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.workers == 0 {
            return Err(RuntimeError::Config("worker count must be at least 1".into()));
        }
        if self.queue_depth == 0 {
            return Err(RuntimeError::Config("queue depth must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize, RuntimeError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(RuntimeError::Config(format!(
            "{} must be a positive integer, got '{}'",
            key, value
        ))),
    }
}
