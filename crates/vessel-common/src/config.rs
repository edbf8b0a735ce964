//! Configuration for queues and timer threads
//!
//! Both config types can be built in code (`Default` + field updates) or
//! loaded from a TOML document. Durations are written in milliseconds:
//!
//! ```toml
//! worker_name = "orders-queue"
//! flush_poll_interval_ms = 2
//! flush_timeout_ms = 5000
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::time::Duration;

/// Default dispatch worker thread name
pub const DEFAULT_WORKER_NAME: &str = "vessel-queue";

/// Default timer thread name
pub const DEFAULT_TIMER_THREAD_NAME: &str = "vessel-timer";

/// Default sleep between `flush` polls
pub const DEFAULT_FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Settings for an [`AsyncMessageQueue`](crate::message::AsyncMessageQueue)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Name given to the dispatch worker thread
    pub worker_name: String,

    /// Sleep between polls while `flush` waits for the queue to drain
    #[serde(rename = "flush_poll_interval_ms", with = "millis")]
    pub flush_poll_interval: Duration,

    /// Upper bound on a `flush` wait (None = wait until drained)
    #[serde(rename = "flush_timeout_ms", with = "optional_millis")]
    pub flush_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_name: DEFAULT_WORKER_NAME.to_string(),
            flush_poll_interval: DEFAULT_FLUSH_POLL_INTERVAL,
            flush_timeout: None,
        }
    }
}

impl QueueConfig {
    /// Parse a queue config from TOML; missing keys keep their defaults
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Set the worker thread name
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Bound `flush` to the given wait
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = Some(timeout);
        self
    }
}

/// Settings for a [`TimerScheduler`](crate::scheduler::TimerScheduler)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Name given to the timer thread
    pub thread_name: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_TIMER_THREAD_NAME.to_string(),
        }
    }
}

impl TimerConfig {
    /// Parse a timer config from TOML; missing keys keep their defaults
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.worker_name, DEFAULT_WORKER_NAME);
        assert_eq!(config.flush_poll_interval, Duration::from_millis(1));
        assert_eq!(config.flush_timeout, None);
    }

    #[test]
    fn test_queue_config_from_toml() {
        let config = QueueConfig::from_toml_str(
            r#"
            worker_name = "orders"
            flush_poll_interval_ms = 5
            flush_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.worker_name, "orders");
        assert_eq!(config.flush_poll_interval, Duration::from_millis(5));
        assert_eq!(config.flush_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_queue_config_partial_toml_keeps_defaults() {
        let config = QueueConfig::from_toml_str("flush_timeout_ms = 10").unwrap();
        assert_eq!(config.worker_name, DEFAULT_WORKER_NAME);
        assert_eq!(config.flush_poll_interval, DEFAULT_FLUSH_POLL_INTERVAL);
        assert_eq!(config.flush_timeout, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_queue_config_rejects_bad_types() {
        let err = QueueConfig::from_toml_str("flush_poll_interval_ms = \"fast\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_timer_config_from_toml() {
        let config = TimerConfig::from_toml_str("thread_name = \"timeouts\"").unwrap();
        assert_eq!(config.thread_name, "timeouts");
        assert_eq!(TimerConfig::default().thread_name, DEFAULT_TIMER_THREAD_NAME);
    }
}
