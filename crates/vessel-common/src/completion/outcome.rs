//! Tagged outcomes carried through continuation chains

use std::fmt;
use std::time::Duration;

/// Why a link in a chain failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureCause {
    /// The timer side of a `timeout_after` race won
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The producer reported a failed outcome
    #[error("failed outcome")]
    Failed,

    /// A fallible continuation returned an error
    #[error("rejected: {0}")]
    Rejected(String),

    /// A continuation panicked; the panic was contained at the link
    #[error("continuation panicked: {0}")]
    Panicked(String),
}

/// Failed terminal state of a link
///
/// `value` is the failed outcome value supplied where the failure started
/// (`Completes::fail`, `timeout_after`). Failures propagated from an upstream
/// link of another type keep the cause but carry no value.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure<T> {
    cause: FailureCause,
    value: Option<T>,
}

impl<T> Failure<T> {
    /// A failure with no carried value
    pub fn new(cause: FailureCause) -> Self {
        Self { cause, value: None }
    }

    /// A failure carrying a failed outcome value
    pub fn with_value(cause: FailureCause, value: T) -> Self {
        Self {
            cause,
            value: Some(value),
        }
    }

    /// The cause of the failure
    pub fn cause(&self) -> &FailureCause {
        &self.cause
    }

    /// The failed outcome value, if one was supplied
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Consume the failure, returning its failed outcome value
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// Whether the failure came from a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, FailureCause::TimedOut(_))
    }

    /// The same failure as seen by a downstream link producing `R`
    pub fn propagate<R>(&self) -> Failure<R> {
        Failure::new(self.cause.clone())
    }
}

impl<T> fmt::Display for Failure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.cause, f)
    }
}

/// Terminal state of a link: a value or a failure
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The link produced a value
    Success(T),
    /// The link failed
    Failure(Failure<T>),
}

impl<T> Outcome<T> {
    /// Whether this is a success
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Whether this is a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    /// The success value, if any
    pub fn success(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    /// The failure, if any
    pub fn failure(&self) -> Option<&Failure<T>> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(failure) => Some(failure),
        }
    }

    /// The success value, or the failed outcome value of a failure
    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(failure) => failure.into_value(),
        }
    }

    /// Convert into a `Result`
    pub fn into_result(self) -> Result<T, Failure<T>> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) => Err(failure),
        }
    }
}

impl<T> From<Result<T, Failure<T>>> for Outcome<T> {
    fn from(result: Result<T, Failure<T>>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(failure) => Outcome::Failure(failure),
        }
    }
}
