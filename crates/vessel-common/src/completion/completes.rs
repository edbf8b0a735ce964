//! Single-shot completion handles and their continuation chains

use super::continuation::{AtomicLinkState, Continuation, LinkState, Step};
use super::outcome::{Failure, FailureCause, Outcome};
use super::repeatable::RepeatableCompletes;
use super::scheduled::TimeoutContinuation;
use crate::scheduler::{Cancellable, Scheduler};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Callback run once with a link's terminal outcome
type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

/// Delivery of one resolved link's callbacks
type Delivery = Box<dyn FnOnce()>;

thread_local! {
    /// Deliveries queued by resolutions nested inside another delivery on
    /// this thread; `Some` while the outermost one is draining
    static DEFERRED: RefCell<Option<VecDeque<Delivery>>> = const { RefCell::new(None) };
}

/// Clears the drain marker even if a delivery unwinds
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        DEFERRED.with(|deferred| *deferred.borrow_mut() = None);
    }
}

/// Run `delivery` now, or queue it behind the delivery already running
///
/// Resolving a link resolves its children from inside its callbacks. Queuing
/// the nested resolutions keeps the stack flat however long the chain is.
fn run_delivery(delivery: Delivery) {
    let delivery = DEFERRED.with(|deferred| match deferred.borrow_mut().as_mut() {
        Some(queue) => {
            queue.push_back(delivery);
            None
        }
        None => Some(delivery),
    });
    let Some(delivery) = delivery else {
        return;
    };

    DEFERRED.with(|deferred| *deferred.borrow_mut() = Some(VecDeque::new()));
    let _guard = DrainGuard;

    delivery();
    while let Some(next) =
        DEFERRED.with(|deferred| deferred.borrow_mut().as_mut().and_then(VecDeque::pop_front))
    {
        next();
    }
}

/// Flags every link can raise on the root of its chain
///
/// Links only ever hold this as a `Weak`, so a child never keeps its root
/// alive just to write a flag.
pub(crate) trait ChainFlags: Send + Sync {
    fn mark_failed(&self);
    fn mark_timed_out(&self);
}

/// Callbacks waiting for a link to resolve
struct Listeners<T> {
    /// Set under the lock once the outcome is published
    resolved: bool,
    callbacks: Vec<Callback<T>>,
}

/// Shared state of one link
pub(crate) struct Node<T> {
    /// Winner-takes-all terminal state
    state: AtomicLinkState,
    /// Outcome of this link, written once by the winning signal
    outcome: OnceCell<Outcome<T>>,
    /// This link (or a link downstream of it, for roots) failed
    failed: AtomicBool,
    /// This link (or a link downstream of it, for roots) timed out
    timed_out: AtomicBool,
    listeners: Mutex<Listeners<T>>,
    /// Root of the chain; `None` for the root itself
    parent: Option<Weak<dyn ChainFlags>>,
    /// Timer facility for `timeout_after`, inherited down the chain
    scheduler: Option<Arc<dyn Scheduler>>,
    /// Pending timeout on this link, cancelled on resolution
    timer: Mutex<Option<Cancellable>>,
    /// Blocking waiters (`await_outcome`)
    done: Mutex<bool>,
    done_signal: Condvar,
}

impl<T> Node<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(parent: Option<Weak<dyn ChainFlags>>, scheduler: Option<Arc<dyn Scheduler>>) -> Self {
        Self {
            state: AtomicLinkState::new(),
            outcome: OnceCell::new(),
            failed: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            listeners: Mutex::new(Listeners {
                resolved: false,
                callbacks: Vec::new(),
            }),
            parent,
            scheduler,
            timer: Mutex::new(None),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
        }
    }

    fn parent(&self) -> Option<Arc<dyn ChainFlags>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Accept a terminal signal for this link
    ///
    /// Returns false, discarding `outcome`, if another signal already won.
    pub(crate) fn resolve(&self, outcome: Outcome<T>, via: LinkState) -> bool {
        if !self.state.transition(via) {
            return false;
        }

        if outcome.is_failure() {
            self.failed.store(true, Ordering::Release);
            if let Some(parent) = self.parent() {
                parent.mark_failed();
            }
        }
        if via == LinkState::TimedOut {
            self.timed_out.store(true, Ordering::Release);
            if let Some(parent) = self.parent() {
                parent.mark_timed_out();
            }
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }

        // Only the transition winner gets here, so the cell is still empty
        let _ = self.outcome.set(outcome);

        let callbacks = {
            let mut listeners = self.listeners.lock();
            listeners.resolved = true;
            mem::take(&mut listeners.callbacks)
        };

        {
            let mut done = self.done.lock();
            *done = true;
            self.done_signal.notify_all();
        }

        if callbacks.is_empty() {
            return true;
        }
        if let Some(outcome) = self.outcome.get() {
            let outcome = outcome.clone();
            run_delivery(Box::new(move || {
                for callback in callbacks {
                    callback(&outcome);
                }
            }));
        }
        true
    }

    /// Run `callback` with the outcome now, or when the link resolves
    pub(crate) fn on_resolved(&self, callback: Callback<T>) {
        let mut listeners = self.listeners.lock();
        if !listeners.resolved {
            listeners.callbacks.push(callback);
            return;
        }
        drop(listeners);

        if let Some(outcome) = self.outcome.get() {
            callback(outcome);
        }
    }

    pub(crate) fn set_timer(&self, timer: Cancellable) {
        *self.timer.lock() = Some(timer);
    }

    pub(crate) fn state(&self) -> LinkState {
        self.state.load()
    }
}

impl<T> ChainFlags for Node<T>
where
    T: Send + Sync,
{
    fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }
}

/// Eventual outcome of an asynchronous operation
///
/// A `Completes` is both the producer side (`complete`, `fail`) and the
/// consumer side (`and_then` and friends) of a single-shot result. Each
/// consumer method returns a new handle for the next link in the chain.
/// Continuations registered after the outcome is known run immediately on
/// the calling thread; otherwise they run on whichever thread delivers the
/// terminal signal.
///
/// A link resolved from inside another link's continuation has its own
/// continuations queued until the running one returns, so chains of any
/// length resolve without growing the stack. The queue is drained before the
/// outermost `complete` returns. A continuation must therefore not block on
/// the outcome of a link downstream of one it just resolved on the same
/// thread.
///
/// # Example
///
/// ```rust,ignore
/// let scheduler = TimerScheduler::start()?;
/// let request = Completes::using_scheduler(scheduler);
///
/// let reply = request
///     .timeout_after(Duration::from_millis(500), String::new())
///     .and_then(|body| body.len())
///     .otherwise(|_failure| 0);
///
/// request.complete("pong".to_string());
/// assert_eq!(reply.await_outcome(), Outcome::Success(4));
/// ```
pub struct Completes<T> {
    node: Arc<Node<T>>,
}

impl<T> Clone for Completes<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<T> Default for Completes<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completes<T>
where
    T: Clone + Send + Sync + 'static,
{
    // ========================================================================
    // Construction and producer side
    // ========================================================================

    /// A pending handle with no scheduler (`timeout_after` is disabled)
    pub fn new() -> Self {
        Self {
            node: Arc::new(Node::new(None, None)),
        }
    }

    /// A pending handle whose chain can use `scheduler` for timeouts
    pub fn using_scheduler(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            node: Arc::new(Node::new(None, Some(scheduler))),
        }
    }

    /// A handle that has already completed with `value`
    pub fn completed(value: T) -> Self {
        let completes = Self::new();
        completes.complete(value);
        completes
    }

    /// A handle that has already failed with `value` as its failed outcome
    pub fn failed(value: T) -> Self {
        let completes = Self::new();
        completes.fail(value);
        completes
    }

    /// Complete with `value`; returns false if the handle was already resolved
    pub fn complete(&self, value: T) -> bool {
        self.node.resolve(Outcome::Success(value), LinkState::Executed)
    }

    /// Fail with `value` as the failed outcome; returns false if already resolved
    pub fn fail(&self, value: T) -> bool {
        self.node.resolve(
            Outcome::Failure(Failure::with_value(FailureCause::Failed, value)),
            LinkState::Executed,
        )
    }

    /// Resolve with an explicit outcome; returns false if already resolved
    pub fn resolve(&self, outcome: Outcome<T>) -> bool {
        self.node.resolve(outcome, LinkState::Executed)
    }

    // ========================================================================
    // Continuations
    // ========================================================================

    /// Transform the value once it is available
    pub fn and_then<R, F>(&self, function: F) -> Completes<R>
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.link(Continuation::Map(Box::new(function)))
    }

    /// Transform the value with a fallible function; `Err` fails the link
    pub fn and_then_try<R, E, F>(&self, function: F) -> Completes<R>
    where
        R: Clone + Send + Sync + 'static,
        E: fmt::Display,
        F: FnOnce(T) -> Result<R, E> + Send + 'static,
    {
        self.link(Continuation::TryMap(Box::new(move |value: T| {
            function(value).map_err(|e| e.to_string())
        })))
    }

    /// Chain an operation that itself completes later
    ///
    /// The returned handle tracks the inner completion, not the wrapper.
    pub fn and_then_flat<R, F>(&self, function: F) -> Completes<R>
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Completes<R> + Send + 'static,
    {
        self.link(Continuation::FlatMap(Box::new(function)))
    }

    /// Consume the value for its side effects
    pub fn and_then_consume<F>(&self, consumer: F) -> Completes<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.link(Continuation::Map(Box::new(consumer)))
    }

    /// Recover a failed chain by producing a replacement value
    ///
    /// Successful outcomes pass through unchanged.
    pub fn otherwise<F>(&self, recover: F) -> Completes<T>
    where
        F: FnOnce(Failure<T>) -> T + Send + 'static,
    {
        self.link(Continuation::Recover {
            on_success: Box::new(|value: T| value),
            on_failure: Box::new(move |failure: Failure<T>| Outcome::Success(recover(failure))),
        })
    }

    /// Observe a failure without recovering from it
    pub fn otherwise_consume<F>(&self, consumer: F) -> Completes<T>
    where
        F: FnOnce(&Failure<T>) + Send + 'static,
    {
        self.link(Continuation::Recover {
            on_success: Box::new(|value: T| value),
            on_failure: Box::new(move |failure: Failure<T>| {
                consumer(&failure);
                Outcome::Failure(failure)
            }),
        })
    }

    /// Race the antecedent against a timer
    ///
    /// If `timeout` elapses before this handle resolves, the returned link
    /// fails with [`FailureCause::TimedOut`] carrying `failed_value`, and the
    /// late outcome is discarded. If this handle resolves first, the timer is
    /// cancelled. A zero `timeout`, or a chain without a scheduler, disables
    /// the timer.
    pub fn timeout_after(&self, timeout: Duration, failed_value: T) -> Completes<T> {
        let child = self.child();

        if !timeout.is_zero() {
            match &self.node.scheduler {
                Some(scheduler) => {
                    TimeoutContinuation::arm(&child.node, scheduler.as_ref(), timeout, failed_value);
                }
                None => tracing::debug!(
                    ?timeout,
                    "timeout_after ignored: chain has no scheduler"
                ),
            }
        }

        let target = Arc::clone(&child.node);
        self.node.on_resolved(Box::new(move |outcome: &Outcome<T>| {
            target.resolve(outcome.clone(), LinkState::Executed);
        }));
        child
    }

    /// A repeatable view fed by this handle's outcome
    ///
    /// The returned handle receives this outcome as its first cycle and
    /// accepts further cycles through its own producer methods.
    pub fn repeat(&self) -> RepeatableCompletes<T> {
        let repeatable = RepeatableCompletes::new();
        let target = repeatable.clone();
        self.node.on_resolved(Box::new(move |outcome: &Outcome<T>| {
            target.resolve(outcome.clone());
        }));
        repeatable
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Whether a terminal outcome is available
    pub fn is_completed(&self) -> bool {
        self.node.outcome.get().is_some()
    }

    /// Whether this link failed; on a root, whether any link of its chain did
    pub fn has_failed(&self) -> bool {
        self.node.failed.load(Ordering::Acquire)
    }

    /// Whether this link timed out; on a root, whether any link of its chain did
    pub fn is_timed_out(&self) -> bool {
        self.node.timed_out.load(Ordering::Acquire)
    }

    /// Which signal resolved this link, if any
    pub fn link_state(&self) -> LinkState {
        self.node.state()
    }

    /// The terminal outcome, if available
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.node.outcome.get().cloned()
    }

    /// The success value or, for a failure, its failed outcome value
    pub fn outcome_value(&self) -> Option<T> {
        self.outcome().and_then(Outcome::into_value)
    }

    /// Block until the outcome is available
    pub fn await_outcome(&self) -> Outcome<T> {
        let mut done = self.node.done.lock();
        loop {
            if let Some(outcome) = self.node.outcome.get() {
                return outcome.clone();
            }
            self.node.done_signal.wait(&mut done);
        }
    }

    /// Block until the outcome is available or `timeout` elapses
    pub fn await_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.await_outcome());
        };
        let mut done = self.node.done.lock();
        loop {
            if let Some(outcome) = self.node.outcome.get() {
                return Some(outcome.clone());
            }
            if self.node.done_signal.wait_until(&mut done, deadline).timed_out() {
                return self.node.outcome.get().cloned();
            }
        }
    }

    // ========================================================================
    // Chain plumbing
    // ========================================================================

    /// Back-reference to this chain's root, as handed to new links
    fn root(&self) -> Weak<dyn ChainFlags> {
        match &self.node.parent {
            Some(root) => root.clone(),
            None => {
                let root: Weak<Node<T>> = Arc::downgrade(&self.node);
                root
            }
        }
    }

    /// A pending link in the same chain
    fn child<R>(&self) -> Completes<R>
    where
        R: Clone + Send + Sync + 'static,
    {
        Completes {
            node: Arc::new(Node::new(Some(self.root()), self.node.scheduler.clone())),
        }
    }

    fn link<R>(&self, continuation: Continuation<T, R>) -> Completes<R>
    where
        R: Clone + Send + Sync + 'static,
    {
        let child = self.child::<R>();
        let target = Arc::clone(&child.node);

        self.node.on_resolved(Box::new(move |outcome: &Outcome<T>| {
            match continuation.apply(outcome.clone()) {
                Step::Ready(result) => {
                    target.resolve(result, LinkState::Executed);
                }
                Step::Follow(inner) => {
                    inner.node.on_resolved(Box::new(move |result: &Outcome<R>| {
                        target.resolve(result.clone(), LinkState::Executed);
                    }));
                }
            }
        }));

        child
    }
}

impl<T> fmt::Debug for Completes<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completes")
            .field("state", &self.node.state.load())
            .field("outcome", &self.node.outcome.get())
            .field("failed", &self.node.failed.load(Ordering::Acquire))
            .field("timed_out", &self.node.timed_out.load(Ordering::Acquire))
            .finish()
    }
}
