//! Error types for queues, timers, serialization, and configuration
//!
//! Completion failures are not represented here: they travel as
//! [`Outcome::Failure`](crate::completion::Outcome) values through the chain.

use std::time::Duration;

/// Errors raised by [`AsyncMessageQueue`](crate::message::AsyncMessageQueue)
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The dispatch worker thread could not be spawned
    #[error("Failed to spawn queue worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// A bounded flush gave up before the queue drained
    #[error("Flush timed out after {waited:?} with {remaining} message(s) still buffered")]
    FlushTimedOut {
        /// How long the caller waited
        waited: Duration,
        /// Messages still buffered when the wait ended
        remaining: usize,
    },
}

/// Errors raised by [`TimerScheduler`](crate::scheduler::TimerScheduler)
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The timer thread could not be spawned
    #[error("Failed to spawn timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors raised by the JSON helpers in [`serialization`](crate::serialization)
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// serde_json rejected the input or the value
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while loading [`config`](crate::config) values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed into the config type
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
