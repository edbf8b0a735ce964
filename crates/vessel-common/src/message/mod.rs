//! Messages and single-consumer message queues
//!
//! A queue delivers [`Message`]s to exactly one [`MessageQueueListener`], one
//! at a time, in enqueue order. Messages whose delivery fails can be routed
//! to a second queue acting as the dead-letter sink.

mod executor;
mod queue;

pub use queue::{AsyncMessageQueue, AsyncMessageQueueBuilder};

use crate::error::QueueError;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A message carried by a [`MessageQueue`]
pub trait Message: Send + Sync + fmt::Debug {
    /// Unique identity of this message
    fn id(&self) -> &str;

    /// When the event described by the message happened
    fn occurred_on(&self) -> DateTime<Utc>;

    /// The payload, for downcasting with `payload_as`
    fn payload(&self) -> &(dyn Any + Send + Sync);

    /// Name of the message type, as understood by receivers
    fn type_name(&self) -> &str;

    /// Version of the message type
    fn version(&self) -> &Version;
}

impl dyn Message {
    /// The payload as a `P`, if that is its type
    pub fn payload_as<P: Any>(&self) -> Option<&P> {
        self.payload().downcast_ref::<P>()
    }
}

/// General purpose [`Message`] with a typed payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicMessage<P> {
    id: String,
    occurred_on: DateTime<Utc>,
    payload: P,
    type_name: String,
    version: Version,
}

impl<P> BasicMessage<P>
where
    P: Send + Sync + fmt::Debug + 'static,
{
    /// A message with a fresh id, the current time, version 1.0.0, and the
    /// payload's Rust type name
    pub fn new(payload: P) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            occurred_on: Utc::now(),
            payload,
            type_name: std::any::type_name::<P>().to_string(),
            version: Version::new(1, 0, 0),
        }
    }

    /// Override the type name
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    /// Override the version
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Override the occurrence time
    pub fn with_occurred_on(mut self, occurred_on: DateTime<Utc>) -> Self {
        self.occurred_on = occurred_on;
        self
    }

    /// The typed payload
    pub fn payload_ref(&self) -> &P {
        &self.payload
    }

    /// Wrap for enqueueing
    pub fn into_shared(self) -> Arc<dyn Message> {
        Arc::new(self)
    }
}

impl<P> Message for BasicMessage<P>
where
    P: Send + Sync + fmt::Debug + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn occurred_on(&self) -> DateTime<Utc> {
        self.occurred_on
    }

    fn payload(&self) -> &(dyn Any + Send + Sync) {
        &self.payload
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn version(&self) -> &Version {
        &self.version
    }
}

/// The single consumer of a [`MessageQueue`]
///
/// Returning `Err`, or panicking, counts as a delivery failure. The worker
/// survives either way; the message goes to the dead-letter queue if one is
/// configured.
pub trait MessageQueueListener: Send + Sync {
    /// Handle one message
    fn handle_message(&self, message: Arc<dyn Message>) -> anyhow::Result<()>;
}

/// Listener backed by a closure; see [`listener_fn`]
pub struct FnListener<F>(F);

impl<F> MessageQueueListener for FnListener<F>
where
    F: Fn(Arc<dyn Message>) -> anyhow::Result<()> + Send + Sync,
{
    fn handle_message(&self, message: Arc<dyn Message>) -> anyhow::Result<()> {
        (self.0)(message)
    }
}

/// Build a listener from a closure
pub fn listener_fn<F>(function: F) -> FnListener<F>
where
    F: Fn(Arc<dyn Message>) -> anyhow::Result<()> + Send + Sync,
{
    FnListener(function)
}

/// Single-consumer message queue
pub trait MessageQueue: Send + Sync {
    /// Append `message`; dropped silently when the queue is not open
    fn enqueue(&self, message: Arc<dyn Message>);

    /// Bind the consumer and open the queue; replaces any earlier listener
    fn register_listener(&self, listener: Arc<dyn MessageQueueListener>);

    /// Block until every buffered message has been dispatched
    fn flush(&self) -> Result<(), QueueError>;

    /// No buffered messages and no dispatch in flight
    fn is_empty(&self) -> bool;

    /// Stop accepting messages, optionally flushing the buffered ones first
    fn close(&self, flush: bool) -> Result<(), QueueError>;
}
