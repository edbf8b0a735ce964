//! Shared helpers for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use vessel_common::{Cancellable, ScheduledAction, Scheduler};

struct ManualTimer {
    due_at: Duration,
    action: ScheduledAction,
    handle: Cancellable,
    repeat: Option<Duration>,
}

/// Scheduler driven by a virtual clock
///
/// Nothing fires until [`advance`](ManualScheduler::advance) moves the clock
/// past a timer's deadline, so timeout races can be played out in a fixed
/// order.
#[derive(Default)]
pub struct ManualScheduler {
    now: Mutex<Duration>,
    timers: Mutex<Vec<ManualTimer>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Move the clock forward and fire every live timer that came due
    pub fn advance(&self, by: Duration) {
        let now = {
            let mut now = self.now.lock();
            *now += by;
            *now
        };

        loop {
            let next = {
                let mut timers = self.timers.lock();
                timers.retain(|timer| !timer.handle.is_cancelled());
                let position = timers
                    .iter()
                    .enumerate()
                    .filter(|(_, timer)| timer.due_at <= now)
                    .min_by_key(|(_, timer)| timer.due_at)
                    .map(|(index, _)| index);
                position.map(|index| timers.remove(index))
            };
            let Some(mut timer) = next else {
                break;
            };

            // Fired outside the lock: actions may schedule or cancel timers
            (timer.action)();

            if let Some(period) = timer.repeat {
                if !timer.handle.is_cancelled() {
                    timer.due_at += period;
                    self.timers.lock().push(timer);
                }
            }
        }
    }

    /// Live timers not yet fired
    pub fn pending(&self) -> usize {
        self.timers
            .lock()
            .iter()
            .filter(|timer| !timer.handle.is_cancelled())
            .count()
    }

    fn push(&self, action: ScheduledAction, delay: Duration, repeat: Option<Duration>) -> Cancellable {
        let handle = Cancellable::new();
        let due_at = self.now.lock().saturating_add(delay);
        self.timers.lock().push(ManualTimer {
            due_at,
            action,
            handle: handle.clone(),
            repeat,
        });
        handle
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(
        &self,
        action: ScheduledAction,
        delay_before: Duration,
        interval: Duration,
    ) -> Cancellable {
        self.push(action, delay_before.saturating_add(interval), None)
    }

    fn schedule(
        &self,
        action: ScheduledAction,
        delay_before: Duration,
        interval: Duration,
    ) -> Cancellable {
        let repeat = (!interval.is_zero()).then_some(interval);
        self.push(action, delay_before, repeat)
    }
}
