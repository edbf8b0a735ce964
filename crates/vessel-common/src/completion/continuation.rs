//! Continuation variants and per-link execution state

use super::completes::Completes;
use super::outcome::{Failure, FailureCause, Outcome};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};

/// Execution state of one link
///
/// A link leaves `Pending` exactly once. Normal completion moves it to
/// `Executed`; a winning timeout moves it to `TimedOut`. Both signals race
/// through the same compare-and-set, so at most one of them ever wins.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// No terminal signal has been accepted yet
    Pending = 0,
    /// The antecedent's outcome was delivered
    Executed = 1,
    /// The timeout fired first
    TimedOut = 2,
}

impl LinkState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LinkState::Executed,
            2 => LinkState::TimedOut,
            _ => LinkState::Pending,
        }
    }
}

/// Atomic cell holding a [`LinkState`]
#[derive(Debug)]
pub(crate) struct AtomicLinkState(AtomicU8);

impl AtomicLinkState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(LinkState::Pending as u8))
    }

    pub(crate) fn load(&self) -> LinkState {
        LinkState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move out of `Pending`; returns false if another signal already did
    pub(crate) fn transition(&self, to: LinkState) -> bool {
        self.0
            .compare_exchange(
                LinkState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// The work a link performs on its antecedent's outcome
///
/// The variant is fixed when the link is built (`and_then`, `and_then_try`,
/// `and_then_flat`, `otherwise`). Every variant except `Recover` skips its
/// function when the antecedent failed and forwards the failure instead.
pub(crate) enum Continuation<T, R> {
    /// `T -> R`
    Map(Box<dyn FnOnce(T) -> R + Send>),
    /// `T -> Result<R, reason>`
    TryMap(Box<dyn FnOnce(T) -> Result<R, String> + Send>),
    /// `T -> Completes<R>`, tracking the inner completion
    FlatMap(Box<dyn FnOnce(T) -> Completes<R> + Send>),
    /// Handles both sides: values pass through `on_success`, failures go to
    /// `on_failure`, which may recover or keep the link failed
    Recover {
        on_success: Box<dyn FnOnce(T) -> R + Send>,
        on_failure: Box<dyn FnOnce(Failure<T>) -> Outcome<R> + Send>,
    },
}

/// Result of running a continuation
pub(crate) enum Step<R> {
    /// The link's outcome is known
    Ready(Outcome<R>),
    /// The link's outcome follows an inner completion
    Follow(Completes<R>),
}

impl<T, R> Continuation<T, R> {
    pub(crate) fn apply(self, outcome: Outcome<T>) -> Step<R> {
        match (self, outcome) {
            (Continuation::Recover { on_success, .. }, Outcome::Success(value)) => {
                contained(move || Step::Ready(Outcome::Success(on_success(value))))
            }
            (Continuation::Recover { on_failure, .. }, Outcome::Failure(failure)) => {
                contained(move || Step::Ready(on_failure(failure)))
            }
            (_, Outcome::Failure(failure)) => Step::Ready(Outcome::Failure(failure.propagate())),
            (Continuation::Map(function), Outcome::Success(value)) => {
                contained(move || Step::Ready(Outcome::Success(function(value))))
            }
            (Continuation::TryMap(function), Outcome::Success(value)) => contained(move || {
                Step::Ready(match function(value) {
                    Ok(result) => Outcome::Success(result),
                    Err(reason) => Outcome::Failure(Failure::new(FailureCause::Rejected(reason))),
                })
            }),
            (Continuation::FlatMap(function), Outcome::Success(value)) => {
                contained(move || Step::Follow(function(value)))
            }
        }
    }
}

/// Run a continuation body, turning a panic into a failed outcome
fn contained<R>(body: impl FnOnce() -> Step<R>) -> Step<R> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(step) => step,
        Err(payload) => Step::Ready(Outcome::Failure(Failure::new(FailureCause::Panicked(
            panic_message(payload.as_ref()),
        )))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready<R>(step: Step<R>) -> Outcome<R> {
        match step {
            Step::Ready(outcome) => outcome,
            Step::Follow(_) => panic!("expected a ready outcome"),
        }
    }

    #[test]
    fn test_link_state_single_transition() {
        let state = AtomicLinkState::new();
        assert_eq!(state.load(), LinkState::Pending);

        assert!(state.transition(LinkState::Executed));
        assert!(!state.transition(LinkState::TimedOut));
        assert!(!state.transition(LinkState::Executed));
        assert_eq!(state.load(), LinkState::Executed);
    }

    #[test]
    fn test_map_skips_function_on_failure() {
        let continuation: Continuation<i32, i32> =
            Continuation::Map(Box::new(|_: i32| -> i32 { panic!("must not run") }));
        let outcome = ready(continuation.apply(Outcome::Failure(Failure::with_value(
            FailureCause::Failed,
            0,
        ))));

        assert_eq!(outcome.failure().map(Failure::cause), Some(&FailureCause::Failed));
    }

    #[test]
    fn test_try_map_error_becomes_rejected() {
        let continuation: Continuation<&str, u32> =
            Continuation::TryMap(Box::new(|s: &str| s.parse::<u32>().map_err(|e| e.to_string())));
        let outcome = ready(continuation.apply(Outcome::Success("nope")));

        assert!(matches!(
            outcome.failure().map(Failure::cause),
            Some(FailureCause::Rejected(_))
        ));
    }

    #[test]
    fn test_panic_is_contained() {
        let continuation: Continuation<i32, i32> =
            Continuation::Map(Box::new(|_: i32| -> i32 { panic!("exploded") }));
        let outcome = ready(continuation.apply(Outcome::Success(1)));

        assert_eq!(
            outcome.failure().map(Failure::cause),
            Some(&FailureCause::Panicked("exploded".to_string()))
        );
    }

    #[test]
    fn test_recover_sees_failure() {
        let continuation: Continuation<i32, i32> = Continuation::Recover {
            on_success: Box::new(|v: i32| v),
            on_failure: Box::new(|failure: Failure<i32>| {
                Outcome::Success(failure.into_value().unwrap_or_default() * 10)
            }),
        };
        let outcome = ready(continuation.apply(Outcome::Failure(Failure::with_value(
            FailureCause::Failed,
            4,
        ))));

        assert_eq!(outcome, Outcome::Success(40));
    }
}
