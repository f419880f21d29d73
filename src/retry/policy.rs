//! Retry decision policies.
//!
//! A policy looks at the outcome of one attempt and returns a [`Decision`]:
//! stop, or try again after some delay. The executor consults one policy for
//! errors and one for successful values, so "retry on this error" and "retry
//! until the value looks right" are configured independently.
//!
//! Policies are stateful and owned by a single retry loop, so they can keep
//! counters without locking.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, Deadline, ProcessClock};
use crate::retry::classify::Classification;
use crate::retry::DeadlineExceeded;

/// Why a policy stopped the loop, when it has more to say than "stop".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt<E> {
    /// Fail with this error instead of the attempt's outcome.
    Error(E),
    /// The deadline leaves no room for another attempt.
    Timeout(DeadlineExceeded),
}

/// A policy's verdict on one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<E> {
    /// Stop. Without a [`Halt`] the attempt's own outcome is returned.
    Abort(Option<Halt<E>>),
    /// Invoke the operation again after the delay.
    Retry(Duration),
}

impl<E> Decision<E> {
    /// Stop and return the attempt's outcome.
    pub fn abort() -> Self {
        Decision::Abort(None)
    }

    /// Stop and fail with `error`.
    pub fn fail(error: E) -> Self {
        Decision::Abort(Some(Halt::Error(error)))
    }

    /// Stop because the deadline ran out.
    pub fn timeout(timeout: DeadlineExceeded) -> Self {
        Decision::Abort(Some(Halt::Timeout(timeout)))
    }

    /// Retry without waiting.
    pub fn retry_now() -> Self {
        Decision::Retry(Duration::ZERO)
    }

    /// Retry after `delay`.
    pub fn retry_after(delay: Duration) -> Self {
        Decision::Retry(delay)
    }

    /// Returns true for [`Decision::Abort`].
    pub fn is_abort(&self) -> bool {
        matches!(self, Decision::Abort(_))
    }

    /// The delay of a [`Decision::Retry`].
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Decision::Retry(delay) => Some(*delay),
            Decision::Abort(_) => None,
        }
    }
}

/// Anything that carries the deadline of the work it stands for.
pub trait HasDeadline {
    /// The absolute deadline.
    fn deadline(&self) -> Deadline;
}

/// Decides what happens after an attempt.
///
/// `V` is the outcome being judged (an error or a value), `E` the error type
/// a policy may fail with, and `O` the operation. Policies get mutable access
/// to the operation so they can adjust it before the next attempt.
///
/// Closures `FnMut(&V, &mut O) -> Decision<E>` are policies.
///
/// # Examples
///
/// ```rust
/// use slackwater::clock::Deadline;
/// use slackwater::retry::{execute_with_retry, DeadlineBound, Decision, NoRetry};
///
/// let mut calls = 0;
/// let op = DeadlineBound::new(Deadline::NEVER, move || {
///     calls += 1;
///     Ok::<_, String>(calls)
/// });
///
/// // Retry until the value reaches 3.
/// let until_three = |value: &i32, _: &mut _| {
///     if *value < 3 { Decision::retry_now() } else { Decision::abort() }
/// };
///
/// assert_eq!(execute_with_retry(op, NoRetry, until_three).unwrap(), 3);
/// ```
pub trait RetryPolicy<V: ?Sized, E, O: ?Sized> {
    /// Judge one outcome.
    fn decide(&mut self, outcome: &V, operation: &mut O) -> Decision<E>;
}

impl<V: ?Sized, E, O: ?Sized, F> RetryPolicy<V, E, O> for F
where
    F: FnMut(&V, &mut O) -> Decision<E>,
{
    fn decide(&mut self, outcome: &V, operation: &mut O) -> Decision<E> {
        self(outcome, operation)
    }
}

/// Never retries.
///
/// The usual choice for the result policy, and for the error policy of
/// operations that must run exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl<V: ?Sized, E, O: ?Sized> RetryPolicy<V, E, O> for NoRetry {
    fn decide(&mut self, _outcome: &V, _operation: &mut O) -> Decision<E> {
        Decision::abort()
    }
}

/// Retries whatever a classification function says to retry, at a fixed
/// delay.
///
/// [`Classification::RetryImmediate`] always retries without delay. Retries
/// stop at the operation's deadline and, if set, after `max_retries`.
///
/// # Examples
///
/// ```rust
/// use slackwater::clock::Deadline;
/// use slackwater::retry::{execute_with_retry, Classification, Classified, DeadlineBound, NoRetry};
///
/// let mut calls = 0;
/// let op = DeadlineBound::new(Deadline::NEVER, move || {
///     calls += 1;
///     if calls < 3 { Err("busy") } else { Ok(calls) }
/// });
///
/// let on_busy = Classified::new(|e: &&str| {
///     if *e == "busy" { Classification::Retry } else { Classification::Abort }
/// })
/// .with_max_retries(5);
///
/// assert_eq!(execute_with_retry(op, on_busy, NoRetry).unwrap(), 3);
/// ```
pub struct Classified<F> {
    classify: F,
    delay: Duration,
    max_retries: Option<u32>,
    retries: u32,
    clock: Arc<dyn Clock>,
}

impl<F> Classified<F> {
    /// Retry according to `classify`, immediately, until the deadline.
    pub fn new(classify: F) -> Self {
        Self {
            classify,
            delay: Duration::ZERO,
            max_retries: None,
            retries: 0,
            clock: Arc::new(ProcessClock),
        }
    }

    /// Wait `delay` before each retry.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Give up after `n` retries.
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Measure the deadline on `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Retries granted so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

impl<F> std::fmt::Debug for Classified<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classified")
            .field("delay", &self.delay)
            .field("max_retries", &self.max_retries)
            .field("retries", &self.retries)
            .finish()
    }
}

impl<V, E, O, F> RetryPolicy<V, E, O> for Classified<F>
where
    V: ?Sized,
    O: HasDeadline + ?Sized,
    F: FnMut(&V) -> Classification,
{
    fn decide(&mut self, outcome: &V, operation: &mut O) -> Decision<E> {
        let delay = match (self.classify)(outcome) {
            Classification::Abort => return Decision::abort(),
            Classification::RetryImmediate => Duration::ZERO,
            Classification::Retry | Classification::RetryDelayed => self.delay,
        };
        if self.max_retries.is_some_and(|max| self.retries >= max) {
            return Decision::abort();
        }
        let now = self.clock.now();
        let deadline = operation.deadline();
        if now.saturating_add(delay) > deadline.reading() {
            return Decision::timeout(DeadlineExceeded::new(deadline, now));
        }
        self.retries += 1;
        Decision::retry_after(delay)
    }
}
