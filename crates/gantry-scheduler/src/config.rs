//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Hold back jobs of queue-behind runs while an older run of their
    /// concurrency group is unfinished. When off, such runs execute side by
    /// side.
    #[serde(default = "default_true")]
    pub concurrency_group_queue_enabled: bool,
    /// Capacity of the token to task cache. Zero disables the cache.
    #[serde(default = "default_token_cache_size")]
    pub token_cache_size: usize,
    /// Number of reconcile workers.
    #[serde(default = "default_emitter_workers")]
    pub emitter_workers: usize,
    /// Delay before a failed reconcile is queued again, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Compression applied to task logs.
    #[serde(default)]
    pub log_compression: LogCompression,
    /// Capacity of the commit-status dedup cache.
    #[serde(default = "default_status_cache_size")]
    pub status_cache_size: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCompression {
    None,
    #[default]
    Zstd,
}

impl LogCompression {
    pub fn is_zstd(&self) -> bool {
        *self == LogCompression::Zstd
    }
}

fn default_true() -> bool {
    true
}

fn default_token_cache_size() -> usize {
    20
}

fn default_emitter_workers() -> usize {
    4
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_status_cache_size() -> usize {
    1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_group_queue_enabled: default_true(),
            token_cache_size: default_token_cache_size(),
            emitter_workers: default_emitter_workers(),
            retry_backoff_ms: default_retry_backoff_ms(),
            log_compression: LogCompression::default(),
            status_cache_size: default_status_cache_size(),
        }
    }
}

impl SchedulerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
