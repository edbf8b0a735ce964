//! Timeout side of the `timeout_after` race
//!
//! Two signals compete for one link: the antecedent delivering its outcome
//! and the scheduler firing the timer. Both go through
//! [`Node::resolve`], whose single compare-and-set out of
//! [`LinkState::Pending`] picks exactly one winner. The loser's outcome is
//! dropped. Completion cancels the timer; a timer that fires anyway finds the
//! link already `Executed` and does nothing.

use super::completes::Node;
use super::continuation::LinkState;
use super::outcome::{Failure, FailureCause, Outcome};
use crate::scheduler::{Scheduled, Scheduler, SchedulerExt};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Timer callback that fails a link with its failed outcome value
pub(crate) struct TimeoutContinuation<T> {
    /// The guarded link; the timer does not keep it alive
    link: Weak<Node<T>>,
    timeout: Duration,
    /// Taken by the first firing
    failed_value: Mutex<Option<T>>,
}

impl<T> TimeoutContinuation<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start the timer for `link` and attach the cancel handle to it
    pub(crate) fn arm(
        link: &Arc<Node<T>>,
        scheduler: &dyn Scheduler,
        timeout: Duration,
        failed_value: T,
    ) {
        let continuation: Arc<dyn Scheduled<()>> = Arc::new(Self {
            link: Arc::downgrade(link),
            timeout,
            failed_value: Mutex::new(Some(failed_value)),
        });
        let timer = scheduler.schedule_once_with(continuation, (), Duration::ZERO, timeout);
        link.set_timer(timer);
    }
}

impl<T> Scheduled<()> for TimeoutContinuation<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn interval_signal(&self, _data: &()) {
        let Some(link) = self.link.upgrade() else {
            return;
        };
        if link.state() != LinkState::Pending {
            return;
        }
        let Some(value) = self.failed_value.lock().take() else {
            return;
        };

        let failure = Failure::with_value(FailureCause::TimedOut(self.timeout), value);
        if link.resolve(Outcome::Failure(failure), LinkState::TimedOut) {
            tracing::debug!(timeout = ?self.timeout, "completion timed out");
        }
    }
}
