//! Deadline-aware retries.
//!
//! A retry loop is made of three parts:
//!
//! - **Operation**: the work, carrying its own absolute deadline
//!   ([`Operation`], usually a [`DeadlineBound`] closure)
//! - **Policies**: one judging errors and one judging successful values,
//!   each answering "stop" or "try again after this delay" ([`RetryPolicy`])
//! - **Executor**: the loop that invokes, consults, records history and
//!   sleeps ([`Retrier`], or [`execute_with_retry`] with defaults)
//!
//! # Quick Start
//!
//! ```rust
//! use slackwater::clock::{Clock, MonotonicClock};
//! use slackwater::retry::{execute_with_retry, DeadlineBound, FibonacciBackoff, NoRetry};
//! use std::time::Duration;
//!
//! // Two immediate retries, then 1ms, 1ms, 2ms, 3ms ... capped at 20ms.
//! let backoff = FibonacciBackoff::<&str>::builder()
//!     .immediate_retries(2)
//!     .min_delay(1)
//!     .max_delay(20)
//!     .build()
//!     .unwrap();
//!
//! let mut calls = 0;
//! let op = DeadlineBound::new(MonotonicClock.deadline_in(Duration::from_secs(2)), move || {
//!     calls += 1;
//!     if calls < 4 { Err("not yet") } else { Ok(calls) }
//! });
//!
//! assert_eq!(execute_with_retry(op, backoff, NoRetry).unwrap(), 4);
//! ```
//!
//! # Policies
//!
//! - [`NoRetry`]: never retries
//! - [`Classified`]: retries by classification at a fixed delay
//! - [`FibonacciBackoff`]: immediate retries, then jittered Fibonacci delays
//!   with per-key state
//! - any closure `FnMut(&V, &mut O) -> Decision<E>`
//!
//! # Error Types
//!
//! - [`RetryError`]: how a loop ended when it did not succeed, with the
//!   failure history as an [`ErrorChain`]
//! - [`DeadlineExceeded`]: the deadline ran out
//! - [`ConfigError`]: a policy or retrier was configured with impossible
//!   bounds

mod chain;
pub mod classify;
mod error;
mod executor;
mod fibonacci;
mod policy;

pub use chain::ErrorChain;
pub use classify::{
    is_non_recoverable, is_retryable, Classification, DefaultClassifier, FailureClassifier,
    DEFAULT_CLASSIFIER,
};
pub use error::{ConfigError, DeadlineExceeded, RetryError};
#[cfg(feature = "async")]
pub use executor::AsyncOperation;
pub use executor::{
    current_operation_name, execute_with_retry, Cancellation, DeadlineBound, Operation, Retrier,
    Sleeper, ThreadSleeper, DEFAULT_MAX_SUPPRESSED,
};
pub use fibonacci::{
    transient_errors, BackoffConfig, FibonacciBackoff, FibonacciBuilder, Jitter, RetryData,
    TimeUnit,
};
pub use policy::{Classified, Decision, Halt, HasDeadline, NoRetry, RetryPolicy};
