//! # Slackwater
//!
//! > *"Slack water: the still moment before the tide turns"*
//!
//! A Rust library for deadline-aware retries.
//!
//! ## Philosophy
//!
//! **Slackwater** treats time as an explicit input:
//! - Every operation carries an absolute **deadline**, and nested work can
//!   only tighten it
//! - Retry **policies** are small stateful deciders, injected rather than
//!   configured globally
//! - Failure **history** is an immutable value, so earlier errors are never
//!   mutated or lost
//!
//! ## Quick Example
//!
//! ```rust
//! use slackwater::prelude::*;
//! use std::io;
//! use std::time::Duration;
//!
//! // Scope a deadline for everything below this point.
//! let request = ExecutionContext::start(clock::global().deadline_in(Duration::from_secs(2)));
//!
//! let backoff = transient_errors::<io::Error>()
//!     .min_delay(1)
//!     .max_delay(20)
//!     .build()
//!     .unwrap();
//!
//! let mut calls = 0;
//! let op = DeadlineBound::from_context(move || {
//!     calls += 1;
//!     if calls < 3 {
//!         Err(io::Error::new(io::ErrorKind::TimedOut, "upstream slow"))
//!     } else {
//!         Ok(calls)
//!     }
//! });
//!
//! assert_eq!(execute_with_retry(op, backoff, NoRetry).unwrap(), 3);
//! request.close();
//! ```
//!
//! ## Modules
//!
//! - [`clock`]: monotonic readings, deadlines and the process clock
//! - [`timing`]: converting readings to and from wall-clock time
//! - [`context`]: the per-thread stack of execution contexts
//! - [`cancel`]: cooperative cancellation
//! - [`retry`]: policies, the retry loop and error chains
//! - [`testing`]: manual clocks, recording sleepers and scripted operations

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cancel;
pub mod clock;
pub mod context;
pub mod retry;
pub mod testing;
pub mod timing;

// Re-exports
pub use cancel::{CancelToken, Interrupted};
pub use clock::{Clock, ClockReading, Deadline};
pub use context::{ContextGuard, ExecutionContext};
pub use retry::{
    execute_with_retry, DeadlineBound, DeadlineExceeded, Decision, ErrorChain, FibonacciBackoff,
    NoRetry, Retrier, RetryError, RetryPolicy,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancel::{CancelToken, Interrupted};
    pub use crate::clock::{self, Clock, ClockReading, Deadline};
    pub use crate::context::{ContextGuard, ExecutionContext};
    pub use crate::retry::{
        execute_with_retry, transient_errors, Classification, Classified, DeadlineBound,
        DeadlineExceeded, Decision, ErrorChain, FibonacciBackoff, HasDeadline, NoRetry,
        Operation, Retrier, RetryError, RetryPolicy,
    };
}
