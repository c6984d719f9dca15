//! Queue configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,

    /// Attempt ceiling for tasks that do not set their own.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Idle wait between empty claim attempts, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Backoff applied to failed attempts.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Database path for durable task storage (None = in-memory).
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Timeout for callback delivery, in seconds.
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
}

fn default_worker_count() -> u32 {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_callback_timeout_secs() -> u64 {
    10
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            default_max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            retry: RetryPolicy::default(),
            db_path: None,
            callback_timeout_secs: default_callback_timeout_secs(),
        }
    }
}

impl QueueConfig {
    /// Idle wait between empty claim attempts.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Callback delivery timeout.
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.default_max_attempts, 3);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"worker_count": 8, "retry": {"base_delay_ms": 50}}"#).unwrap();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.retry.base_delay_ms, 50);
        assert_eq!(config.retry.multiplier, 2);
        assert_eq!(config.default_max_attempts, 3);
    }
}
