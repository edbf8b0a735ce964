//! Asynchronous single-consumer message queue
//!
//! Enqueue appends to a lock-free FIFO and admits one dispatch unit to the
//! queue's worker. Each unit pops the head message and hands it to the
//! listener. The worker is a single thread, so delivery is in order and never
//! overlaps. A failed delivery is logged and the message is forwarded to the
//! dead-letter queue, if any; there is no retry and no second level of
//! dead-lettering.

use super::executor::SingleWorkerExecutor;
use super::{Message, MessageQueue, MessageQueueListener};
use crate::completion::panic_message;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crossbeam::queue::SegQueue;
use parking_lot::RwLock;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// State shared with dispatch units on the worker
struct QueueShared {
    fifo: SegQueue<Arc<dyn Message>>,
    /// A unit is between popping a message and finishing its delivery
    dispatching: AtomicBool,
    /// A listener has been registered
    listening: AtomicBool,
    closed: AtomicBool,
    /// Written by `register_listener` only; read once per dispatch
    listener: RwLock<Option<Arc<dyn MessageQueueListener>>>,
    dead_letters: Option<Arc<dyn MessageQueue>>,
}

/// Clears the dispatching flag however the dispatch ends
struct DispatchGuard<'a>(&'a AtomicBool);

impl<'a> DispatchGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl QueueShared {
    fn is_open(&self) -> bool {
        self.listening.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    fn is_empty(&self) -> bool {
        // FIFO before flag: the flag is raised before the pop, so a message
        // is always visible in one place or the other
        self.fifo.is_empty() && !self.dispatching.load(Ordering::SeqCst)
    }

    /// One dispatch step on the worker
    fn dispatch_next(&self) {
        let _guard = DispatchGuard::enter(&self.dispatching);

        let Some(message) = self.fifo.pop() else {
            return;
        };
        let listener = self.listener.read().clone();
        let Some(listener) = listener else {
            tracing::debug!(message_id = message.id(), "no listener registered; message lost");
            return;
        };

        let delivery = panic::catch_unwind(AssertUnwindSafe(|| {
            listener.handle_message(Arc::clone(&message))
        }));
        let reason = match delivery {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => format!("listener panicked: {}", panic_message(payload.as_ref())),
        };

        tracing::warn!(
            message_id = message.id(),
            message_type = message.type_name(),
            %reason,
            "message delivery failed"
        );
        match &self.dead_letters {
            Some(dead_letters) => {
                tracing::warn!(message_id = message.id(), "message routed to dead letters");
                dead_letters.enqueue(message);
            }
            None => tracing::warn!(message_id = message.id(), "no dead-letter queue; message lost"),
        }
    }
}

/// Message queue with a dedicated dispatch worker
///
/// The queue opens when a listener is registered, either through the
/// builder or [`register_listener`](MessageQueue::register_listener), and
/// stays open until closed. Dropping the queue closes it with a flush.
///
/// # Example
///
/// ```rust,ignore
/// let dead_letters = Arc::new(AsyncMessageQueue::builder()
///     .listener(listener_fn(|message| { archive(message); Ok(()) }))
///     .build()?);
///
/// let queue = AsyncMessageQueue::builder()
///     .listener(listener_fn(|message| handle(message)))
///     .dead_letters(dead_letters)
///     .build()?;
///
/// queue.enqueue(BasicMessage::new(order).into_shared());
/// queue.close(true)?;
/// ```
pub struct AsyncMessageQueue {
    shared: Arc<QueueShared>,
    executor: SingleWorkerExecutor,
    config: QueueConfig,
}

impl AsyncMessageQueue {
    /// A queue with default config, no listener, and no dead-letter queue
    pub fn new() -> Result<Self, QueueError> {
        Self::builder().build()
    }

    /// Configure a queue
    pub fn builder() -> AsyncMessageQueueBuilder {
        AsyncMessageQueueBuilder::default()
    }

    /// Whether enqueued messages are accepted
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Whether a message is being delivered right now
    pub fn is_dispatching(&self) -> bool {
        self.shared.dispatching.load(Ordering::SeqCst)
    }

    /// Messages buffered and not yet picked up by the worker
    pub fn len(&self) -> usize {
        self.shared.fifo.len()
    }

    /// The config this queue was built with
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl MessageQueue for AsyncMessageQueue {
    fn enqueue(&self, message: Arc<dyn Message>) {
        if !self.shared.is_open() {
            tracing::debug!(message_id = message.id(), "queue not open; message dropped");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let unit = Box::new(move || shared.dispatch_next());
        let fifo = &self.shared.fifo;
        if !self.executor.execute(unit, || fifo.push(message)) {
            tracing::debug!("queue worker shut down; message dropped");
        }
    }

    fn register_listener(&self, listener: Arc<dyn MessageQueueListener>) {
        *self.shared.listener.write() = Some(listener);
        self.shared.listening.store(true, Ordering::Release);
    }

    fn flush(&self) -> Result<(), QueueError> {
        if self.executor.is_worker_thread() {
            // The caller is the dispatch in flight; waiting would never end
            tracing::debug!("flush called from the queue worker; skipped");
            return Ok(());
        }

        let started = Instant::now();
        while !self.shared.is_empty() {
            if let Some(limit) = self.config.flush_timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(QueueError::FlushTimedOut {
                        waited,
                        remaining: self.len(),
                    });
                }
            }
            thread::sleep(self.config.flush_poll_interval);
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    fn close(&self, flush: bool) -> Result<(), QueueError> {
        self.shared.closed.store(true, Ordering::Release);

        let flushed = if flush { self.flush() } else { Ok(()) };

        self.executor.shutdown();
        if flush {
            self.executor.join();
        }
        flushed
    }
}

impl Drop for AsyncMessageQueue {
    fn drop(&mut self) {
        if let Err(e) = self.close(true) {
            tracing::warn!(%e, "queue dropped before it drained");
        }
    }
}

impl fmt::Debug for AsyncMessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncMessageQueue")
            .field("worker", &self.config.worker_name)
            .field("open", &self.is_open())
            .field("buffered", &self.len())
            .field("dispatching", &self.is_dispatching())
            .field("shut_down", &self.executor.is_shutdown())
            .field("dead_letters", &self.shared.dead_letters.is_some())
            .finish()
    }
}

/// Builder for [`AsyncMessageQueue`]
#[derive(Default)]
pub struct AsyncMessageQueueBuilder {
    config: QueueConfig,
    listener: Option<Arc<dyn MessageQueueListener>>,
    dead_letters: Option<Arc<dyn MessageQueue>>,
}

impl AsyncMessageQueueBuilder {
    /// Use `config` instead of the defaults
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the consumer; the queue is built open
    pub fn listener(mut self, listener: impl MessageQueueListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Bind a consumer that is shared with other owners
    pub fn shared_listener(mut self, listener: Arc<dyn MessageQueueListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Route failed deliveries to `dead_letters`
    pub fn dead_letters(mut self, dead_letters: Arc<dyn MessageQueue>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Spawn the worker and build the queue
    pub fn build(self) -> Result<AsyncMessageQueue, QueueError> {
        let executor = SingleWorkerExecutor::start(&self.config.worker_name)?;
        let listening = self.listener.is_some();

        Ok(AsyncMessageQueue {
            shared: Arc::new(QueueShared {
                fifo: SegQueue::new(),
                dispatching: AtomicBool::new(false),
                listening: AtomicBool::new(listening),
                closed: AtomicBool::new(false),
                listener: RwLock::new(self.listener),
                dead_letters: self.dead_letters,
            }),
            executor,
            config: self.config,
        })
    }
}
