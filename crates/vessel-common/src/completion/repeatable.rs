//! Completion handles that resolve once per cycle
//!
//! A [`RepeatableCompletes`] serves producers that emit more than once, such
//! as subscriptions. Continuations stay registered across cycles: each cycle
//! rebinds the antecedent outcome and builds a fresh one-shot continuation
//! from the stored function. The executed flag guards one cycle at a time and
//! is reset when the cycle finishes instead of being sealed.

use super::continuation::{Continuation, Step};
use super::outcome::{Failure, FailureCause, Outcome};
use super::completes::Completes;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Callback run once per cycle
type CycleCallback<T> = Arc<dyn Fn(&Outcome<T>) + Send + Sync>;

/// Work item processed under the executed flag
enum Cycle<T> {
    /// Deliver a new outcome to every registered callback
    Emit(Outcome<T>),
    /// Attach a callback and replay the latest outcome to it
    Register(CycleCallback<T>),
}

struct RepeatNode<T> {
    /// A cycle is being delivered; reset after every cycle
    executed: AtomicBool,
    /// Cycles and registrations waiting to run, in submission order
    queued: SegQueue<Cycle<T>>,
    /// Outcome of the latest delivered cycle
    antecedent: Mutex<Option<Outcome<T>>>,
    callbacks: Mutex<Vec<CycleCallback<T>>>,
    cycles: AtomicU64,
    /// The latest cycle failed
    failed: AtomicBool,
}

impl<T> RepeatNode<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn emit(&self, outcome: Outcome<T>) {
        self.submit(Cycle::Emit(outcome));
    }

    /// Registrations share the delivery queue, so a late callback's replay
    /// can never be overtaken by a newer cycle.
    fn register(&self, callback: CycleCallback<T>) {
        self.submit(Cycle::Register(callback));
    }

    fn submit(&self, cycle: Cycle<T>) {
        self.queued.push(cycle);

        // Whoever holds the executed flag drains the queue; a submit that
        // loses the flag leaves its item for that holder. The re-check after
        // the reset catches items pushed between the last pop and the reset.
        loop {
            if self
                .executed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            while let Some(cycle) = self.queued.pop() {
                match cycle {
                    Cycle::Emit(outcome) => self.deliver(outcome),
                    Cycle::Register(callback) => self.attach(callback),
                }
            }

            self.executed.store(false, Ordering::Release);
            if self.queued.is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, outcome: Outcome<T>) {
        self.failed.store(outcome.is_failure(), Ordering::Release);
        self.cycles.fetch_add(1, Ordering::AcqRel);

        *self.antecedent.lock() = Some(outcome.clone());
        let callbacks = self.callbacks.lock().clone();

        for callback in callbacks {
            callback(&outcome);
        }
    }

    fn attach(&self, callback: CycleCallback<T>) {
        self.callbacks.lock().push(Arc::clone(&callback));

        let current = self.antecedent.lock().clone();
        if let Some(outcome) = current {
            callback(&outcome);
        }
    }
}

/// Multi-cycle completion handle
///
/// Every call to [`complete`](Self::complete) or [`fail`](Self::fail) starts a
/// new cycle. Cycles are delivered one at a time, in emit order, to every
/// registered continuation; a continuation registered late first sees the
/// latest cycle. A registration made while another thread is delivering is
/// applied by that thread, after the cycle in progress. Failure is judged per cycle: a failed cycle short-circuits
/// downstream transformations for that cycle only.
pub struct RepeatableCompletes<T> {
    node: Arc<RepeatNode<T>>,
}

impl<T> Clone for RepeatableCompletes<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<T> Default for RepeatableCompletes<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RepeatableCompletes<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A handle with no cycles yet
    pub fn new() -> Self {
        Self {
            node: Arc::new(RepeatNode {
                executed: AtomicBool::new(false),
                queued: SegQueue::new(),
                antecedent: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
                cycles: AtomicU64::new(0),
                failed: AtomicBool::new(false),
            }),
        }
    }

    /// Start a successful cycle with `value`
    pub fn complete(&self, value: T) {
        self.node.emit(Outcome::Success(value));
    }

    /// Start a failed cycle with `value` as the failed outcome
    pub fn fail(&self, value: T) {
        self.node
            .emit(Outcome::Failure(Failure::with_value(FailureCause::Failed, value)));
    }

    /// Start a cycle with an explicit outcome
    pub fn resolve(&self, outcome: Outcome<T>) {
        self.node.emit(outcome);
    }

    /// Transform every cycle's value
    pub fn and_then<R, F>(&self, function: F) -> RepeatableCompletes<R>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let function = Arc::new(function);
        self.link(move || {
            let function = Arc::clone(&function);
            Continuation::Map(Box::new(move |value: T| function(value)))
        })
    }

    /// Transform every cycle's value with a fallible function
    pub fn and_then_try<R, E, F>(&self, function: F) -> RepeatableCompletes<R>
    where
        R: Clone + Send + Sync + 'static,
        E: fmt::Display,
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
    {
        let function = Arc::new(function);
        self.link(move || {
            let function = Arc::clone(&function);
            Continuation::TryMap(Box::new(move |value: T| {
                function(value).map_err(|e| e.to_string())
            }))
        })
    }

    /// Chain an operation that completes later, once per cycle
    pub fn and_then_flat<R, F>(&self, function: F) -> RepeatableCompletes<R>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(T) -> Completes<R> + Send + Sync + 'static,
    {
        let function = Arc::new(function);
        self.link(move || {
            let function = Arc::clone(&function);
            Continuation::FlatMap(Box::new(move |value: T| function(value)))
        })
    }

    /// Consume every cycle's value
    pub fn and_then_consume<F>(&self, consumer: F) -> RepeatableCompletes<()>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.and_then(consumer)
    }

    /// Recover failed cycles with a replacement value
    pub fn otherwise<F>(&self, recover: F) -> RepeatableCompletes<T>
    where
        F: Fn(Failure<T>) -> T + Send + Sync + 'static,
    {
        let recover = Arc::new(recover);
        self.link(move || {
            let recover = Arc::clone(&recover);
            Continuation::Recover {
                on_success: Box::new(|value: T| value),
                on_failure: Box::new(move |failure: Failure<T>| Outcome::Success(recover(failure))),
            }
        })
    }

    /// Observe failed cycles without recovering them
    pub fn otherwise_consume<F>(&self, consumer: F) -> RepeatableCompletes<T>
    where
        F: Fn(&Failure<T>) + Send + Sync + 'static,
    {
        let consumer = Arc::new(consumer);
        self.link(move || {
            let consumer = Arc::clone(&consumer);
            Continuation::Recover {
                on_success: Box::new(|value: T| value),
                on_failure: Box::new(move |failure: Failure<T>| {
                    consumer(&failure);
                    Outcome::Failure(failure)
                }),
            }
        })
    }

    /// Outcome of the latest cycle
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.node.antecedent.lock().clone()
    }

    /// Latest success value or failed outcome value
    pub fn outcome_value(&self) -> Option<T> {
        self.outcome().and_then(Outcome::into_value)
    }

    /// Number of cycles delivered so far
    pub fn cycles(&self) -> u64 {
        self.node.cycles.load(Ordering::Acquire)
    }

    /// Whether the latest cycle failed
    pub fn has_failed(&self) -> bool {
        self.node.failed.load(Ordering::Acquire)
    }

    /// Register a downstream link; `arm` builds the continuation for one cycle
    fn link<R, A>(&self, arm: A) -> RepeatableCompletes<R>
    where
        R: Clone + Send + Sync + 'static,
        A: Fn() -> Continuation<T, R> + Send + Sync + 'static,
    {
        let child = RepeatableCompletes::<R>::new();
        let target = Arc::clone(&child.node);

        self.node.register(Arc::new(move |outcome: &Outcome<T>| {
            match arm().apply(outcome.clone()) {
                Step::Ready(result) => target.emit(result),
                Step::Follow(inner) => {
                    let on_value = Arc::clone(&target);
                    inner.and_then_consume(move |value| on_value.emit(Outcome::Success(value)));
                    let on_failure = Arc::clone(&target);
                    inner.otherwise_consume(move |failure| {
                        on_failure.emit(Outcome::Failure(failure.propagate()))
                    });
                }
            }
        }));

        child
    }
}

impl<T> fmt::Debug for RepeatableCompletes<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatableCompletes")
            .field("cycles", &self.node.cycles.load(Ordering::Acquire))
            .field("latest", &*self.node.antecedent.lock())
            .finish()
    }
}
