//! Scheduling interface for timed callbacks
//!
//! The completion engine only needs one-shot timers with cancellation, so the
//! [`Scheduler`] trait is intentionally small. [`TimerScheduler`] is the
//! thread-backed implementation; tests may supply their own.

mod timer;

pub use timer::TimerScheduler;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked by a scheduler when a timer fires
pub type ScheduledAction = Arc<dyn Fn() + Send + Sync>;

/// Something that can be signalled by a scheduler, with caller-supplied data
pub trait Scheduled<D>: Send + Sync {
    /// Called on the scheduler's thread each time the timer fires
    fn interval_signal(&self, data: &D);
}

/// Source of one-shot and repeating timers
pub trait Scheduler: Send + Sync {
    /// Run `action` once, after `delay_before + interval` has elapsed
    fn schedule_once(
        &self,
        action: ScheduledAction,
        delay_before: Duration,
        interval: Duration,
    ) -> Cancellable;

    /// Run `action` after `delay_before`, then every `interval` until cancelled
    ///
    /// A zero `interval` degrades to a single firing.
    fn schedule(
        &self,
        action: ScheduledAction,
        delay_before: Duration,
        interval: Duration,
    ) -> Cancellable;
}

/// Convenience methods for scheduling [`Scheduled`] targets
pub trait SchedulerExt: Scheduler {
    /// Signal `scheduled` once with `data` after `delay_before + interval`
    fn schedule_once_with<D>(
        &self,
        scheduled: Arc<dyn Scheduled<D>>,
        data: D,
        delay_before: Duration,
        interval: Duration,
    ) -> Cancellable
    where
        D: Send + Sync + 'static,
    {
        self.schedule_once(
            Arc::new(move || scheduled.interval_signal(&data)),
            delay_before,
            interval,
        )
    }

    /// Signal `scheduled` repeatedly with `data`
    fn schedule_with<D>(
        &self,
        scheduled: Arc<dyn Scheduled<D>>,
        data: D,
        delay_before: Duration,
        interval: Duration,
    ) -> Cancellable
    where
        D: Send + Sync + 'static,
    {
        self.schedule(
            Arc::new(move || scheduled.interval_signal(&data)),
            delay_before,
            interval,
        )
    }
}

impl<S: Scheduler + ?Sized> SchedulerExt for S {}

/// Handle to a pending scheduled callback
///
/// Cancelling is idempotent. A callback that has already started firing is
/// not interrupted.
#[derive(Clone, Default)]
pub struct Cancellable {
    cancelled: Arc<AtomicBool>,
}

impl Cancellable {
    /// Create a live (not cancelled) handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle that is already cancelled
    pub fn cancelled() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Cancel the callback; returns true only for the call that cancelled it
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Whether the callback has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
