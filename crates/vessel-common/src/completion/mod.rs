//! Completion handles: composable eventual outcomes
//!
//! A chain is built from links. Each link owns its outcome and a list of
//! continuations waiting on it; the root carries the failed and timed-out
//! flags of the whole chain. Links downstream of the root refer back to it
//! weakly, so a chain is kept alive by its handles and pending callbacks,
//! never by its own back-references.
//!
//! - [`Completes`]: single-shot handle, resolved once
//! - [`RepeatableCompletes`]: multi-cycle handle for recurring producers

mod completes;
mod continuation;
mod outcome;
mod repeatable;
mod scheduled;

pub use completes::Completes;
pub use continuation::LinkState;
pub use outcome::{Failure, FailureCause, Outcome};
pub use repeatable::RepeatableCompletes;

pub(crate) use continuation::panic_message;
