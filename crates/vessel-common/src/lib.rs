//! Vessel common runtime primitives
//!
//! This crate provides the concurrency building blocks the rest of the
//! runtime is written against:
//! - Completion handles with chainable continuations and timeouts
//! - Repeatable completion handles for recurring producers
//! - A timer thread implementing the scheduler interface
//! - Single-consumer asynchronous message queues with dead-letter routing
//! - JSON helpers and configuration loading

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod completion;
pub mod config;
pub mod error;
pub mod message;
pub mod scheduler;
pub mod serialization;

pub use completion::{Completes, Failure, FailureCause, LinkState, Outcome, RepeatableCompletes};
pub use config::{QueueConfig, TimerConfig};
pub use error::{ConfigError, QueueError, SchedulerError, SerializationError};
pub use message::{
    listener_fn, AsyncMessageQueue, AsyncMessageQueueBuilder, BasicMessage, Message, MessageQueue,
    MessageQueueListener,
};
pub use scheduler::{Cancellable, Scheduled, ScheduledAction, Scheduler, SchedulerExt, TimerScheduler};
