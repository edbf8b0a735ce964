//! Timer thread backing [`TimerScheduler`]
//!
//! A single thread waits on a condvar for the earliest deadline in a min-heap.
//! Scheduling a timer pushes an entry and wakes the thread so it can re-arm
//! for an earlier deadline. Callbacks run on the timer thread, outside the
//! heap lock, so they may freely schedule or cancel other timers.

use super::{Cancellable, ScheduledAction, Scheduler};
use crate::config::TimerConfig;
use crate::error::SchedulerError;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Entry in the timer heap
struct TimerEntry {
    /// When to fire
    fire_at: Instant,
    /// Insertion order, breaks ties between equal deadlines
    seq: u64,
    /// Callback to run
    action: ScheduledAction,
    /// Re-arm period for repeating timers
    repeat: Option<Duration>,
    /// Cancellation flag shared with the caller
    handle: Cancellable,
}

// Reverse ordering for min-heap (earliest deadline first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Heap state guarded by the timer mutex
struct TimerState {
    /// Pending timers, earliest first
    pending: BinaryHeap<TimerEntry>,
    /// Next insertion sequence number
    next_seq: u64,
    /// Heap size at which cancelled entries are swept out
    prune_at: usize,
}

/// Smallest heap worth sweeping for cancelled entries
const MIN_PRUNE_LEN: usize = 64;

impl TimerState {
    /// Drop cancelled entries once the heap has doubled since the last sweep
    fn prune_cancelled(&mut self) {
        if self.pending.len() < self.prune_at {
            return;
        }
        self.pending.retain(|entry| !entry.handle.is_cancelled());
        self.prune_at = (self.pending.len() * 2).max(MIN_PRUNE_LEN);
    }
}

/// State shared between the scheduler handle and its thread
struct TimerShared {
    state: Mutex<TimerState>,
    /// Wakes the timer thread on new entries and shutdown
    notify: Condvar,
    shutdown: AtomicBool,
}

impl TimerShared {
    fn push(&self, action: ScheduledAction, fire_at: Instant, repeat: Option<Duration>) -> Cancellable {
        if self.shutdown.load(AtomicOrdering::Acquire) {
            tracing::debug!("timer scheduler is stopped; dropping scheduled callback");
            return Cancellable::cancelled();
        }

        let handle = Cancellable::new();
        let mut state = self.state.lock();
        state.prune_cancelled();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(TimerEntry {
            fire_at,
            seq,
            action,
            repeat,
            handle: handle.clone(),
        });
        // The new entry may be earlier than the one the thread is waiting on
        self.notify.notify_one();
        handle
    }

    fn run_loop(&self) {
        tracing::trace!("timer thread started");
        let mut due = Vec::new();

        loop {
            {
                let mut state = self.state.lock();

                // Re-check under the lock: stop() may have notified between
                // iterations, and that notification would otherwise be lost.
                if self.shutdown.load(AtomicOrdering::Acquire) {
                    break;
                }

                let now = Instant::now();
                while state.pending.peek().is_some_and(|entry| entry.fire_at <= now) {
                    if let Some(entry) = state.pending.pop() {
                        if !entry.handle.is_cancelled() {
                            due.push(entry);
                        }
                    }
                }

                if due.is_empty() {
                    match state.pending.peek().map(|next| next.fire_at) {
                        Some(fire_at) => {
                            let timeout = fire_at.saturating_duration_since(now);
                            self.notify.wait_for(&mut state, timeout);
                        }
                        None => self.notify.wait(&mut state),
                    }
                    continue;
                }
            }

            for entry in due.drain(..) {
                if entry.handle.is_cancelled() {
                    continue;
                }

                let action = Arc::clone(&entry.action);
                if panic::catch_unwind(AssertUnwindSafe(|| action())).is_err() {
                    tracing::error!("scheduled callback panicked; timer thread continues");
                }

                if entry.handle.is_cancelled() {
                    continue;
                }
                if let Some(period) = entry.repeat {
                    // A period that overflows the clock ends the repetition
                    if let Some(fire_at) = entry.fire_at.checked_add(period) {
                        let mut state = self.state.lock();
                        let seq = state.next_seq;
                        state.next_seq += 1;
                        state.pending.push(TimerEntry {
                            fire_at,
                            seq,
                            ..entry
                        });
                    }
                }
            }
        }

        tracing::trace!("timer thread shutting down");
    }
}

/// Thread-backed [`Scheduler`]
///
/// Dropping the last handle stops the thread. Pending timers are discarded
/// on stop without firing.
pub struct TimerScheduler {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerScheduler {
    /// Start a timer thread with default settings
    pub fn start() -> Result<Arc<Self>, SchedulerError> {
        Self::with_config(TimerConfig::default())
    }

    /// Start a timer thread with the given settings
    pub fn with_config(config: TimerConfig) -> Result<Arc<Self>, SchedulerError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                pending: BinaryHeap::new(),
                next_seq: 0,
                prune_at: MIN_PRUNE_LEN,
            }),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(config.thread_name)
            .spawn(move || thread_shared.run_loop())?;

        Ok(Arc::new(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Stop the timer thread; later schedules return cancelled handles
    pub fn stop(&self) {
        {
            // Hold the heap lock so the store cannot slip between the
            // thread's shutdown check and its wait.
            let _state = self.shared.state.lock();
            self.shared.shutdown.store(true, AtomicOrdering::Release);
            self.shared.notify.notify_one();
        }

        if let Some(handle) = self.handle.lock().take() {
            // A callback may drop the last scheduler handle on the timer
            // thread itself; joining there would never return.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Whether the timer thread is accepting new timers
    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.load(AtomicOrdering::Acquire)
    }

    /// Number of timers waiting to fire
    ///
    /// Cancelled timers are counted until their deadline passes or the next
    /// sweep, which runs when the heap has doubled since the last one.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

impl Scheduler for TimerScheduler {
    fn schedule_once(
        &self,
        action: ScheduledAction,
        delay_before: Duration,
        interval: Duration,
    ) -> Cancellable {
        let fire_at = Instant::now()
            .checked_add(delay_before)
            .and_then(|at| at.checked_add(interval));
        match fire_at {
            Some(fire_at) => self.shared.push(action, fire_at, None),
            None => beyond_clock(),
        }
    }

    fn schedule(
        &self,
        action: ScheduledAction,
        delay_before: Duration,
        interval: Duration,
    ) -> Cancellable {
        let repeat = (!interval.is_zero()).then_some(interval);
        match Instant::now().checked_add(delay_before) {
            Some(fire_at) => self.shared.push(action, fire_at, repeat),
            None => beyond_clock(),
        }
    }
}

/// Handle for a deadline the clock cannot represent; it never fires
fn beyond_clock() -> Cancellable {
    tracing::trace!("timer deadline beyond the clock range; it will never fire");
    Cancellable::new()
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
