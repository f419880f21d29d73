//! The retry loop.
//!
//! [`Retrier`] invokes an [`Operation`], asks the error policy about
//! failures and the result policy about values, and either stops or sleeps
//! and tries again. Attempts are strictly sequential on the calling thread.
//!
//! Failures of earlier attempts are never lost: each new failure carries the
//! previous ones as suppressed entries of an [`ErrorChain`], trimmed to the
//! configured limit.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::{CancelToken, Interrupted};
use crate::clock::Deadline;
use crate::retry::chain::ErrorChain;
use crate::retry::policy::{Decision, Halt, HasDeadline, RetryPolicy};
use crate::retry::RetryError;

/// Default limit on suppressed failures kept in a history.
pub const DEFAULT_MAX_SUPPRESSED: usize = 10;

/// A fallible unit of work with a deadline.
pub trait Operation: HasDeadline {
    /// Value of a successful attempt.
    type Output;
    /// Error of a failed attempt.
    type Error;

    /// Run one attempt.
    fn call(&mut self) -> Result<Self::Output, Self::Error>;
}

/// An async fallible unit of work with a deadline.
#[cfg(feature = "async")]
pub trait AsyncOperation: HasDeadline {
    /// Value of a successful attempt.
    type Output;
    /// Error of a failed attempt.
    type Error;

    /// Run one attempt.
    fn call_async(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Self::Output, Self::Error>> + Send;
}

/// A closure paired with the deadline it must finish by.
///
/// `DeadlineBound<F>` is an [`Operation`] when `F: FnMut() -> Result<T, E>`
/// and, with the `async` feature, an [`AsyncOperation`] when `F` returns a
/// future.
///
/// # Examples
///
/// ```rust
/// use slackwater::clock::{Clock, MonotonicClock};
/// use slackwater::retry::{DeadlineBound, HasDeadline, Operation};
/// use std::time::Duration;
///
/// let deadline = MonotonicClock.deadline_in(Duration::from_secs(1));
/// let mut op = DeadlineBound::new(deadline, || Ok::<_, String>("pong"));
///
/// assert_eq!(op.deadline(), deadline);
/// assert_eq!(op.call(), Ok("pong"));
/// ```
#[derive(Debug, Clone)]
pub struct DeadlineBound<F> {
    deadline: Deadline,
    f: F,
}

impl<F> DeadlineBound<F> {
    /// Bind `f` to `deadline`.
    pub fn new(deadline: Deadline, f: F) -> Self {
        Self { deadline, f }
    }

    /// Bind `f` to the deadline of the current execution context, or to
    /// [`Deadline::NEVER`] outside of one.
    pub fn from_context(f: F) -> Self {
        Self::new(crate::context::current_deadline(), f)
    }

    /// Move the deadline.
    pub fn set_deadline(&mut self, deadline: Deadline) {
        self.deadline = deadline;
    }

    /// The wrapped closure.
    pub fn inner_mut(&mut self) -> &mut F {
        &mut self.f
    }

    /// Unwrap the closure.
    pub fn into_inner(self) -> F {
        self.f
    }
}

impl<F> HasDeadline for DeadlineBound<F> {
    fn deadline(&self) -> Deadline {
        self.deadline
    }
}

impl<F, T, E> Operation for DeadlineBound<F>
where
    F: FnMut() -> Result<T, E>,
{
    type Output = T;
    type Error = E;

    fn call(&mut self) -> Result<T, E> {
        (self.f)()
    }
}

#[cfg(feature = "async")]
impl<F, Fut, T, E> AsyncOperation for DeadlineBound<F>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>> + Send,
{
    type Output = T;
    type Error = E;

    fn call_async(&mut self) -> impl std::future::Future<Output = Result<T, E>> + Send {
        (self.f)()
    }
}

/// Waits out the delay between attempts.
pub trait Sleeper: Send + Sync + fmt::Debug {
    /// Sleep for `duration`, returning early with [`Interrupted`] if `cancel`
    /// is cancelled.
    fn sleep(&self, duration: Duration, cancel: Option<&CancelToken>) -> Result<(), Interrupted>;
}

/// Blocks the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: Option<&CancelToken>) -> Result<(), Interrupted> {
        match cancel {
            Some(token) => token.sleep(duration),
            None => {
                std::thread::sleep(duration);
                Ok(())
            }
        }
    }
}

/// Whether a retry loop can be cancelled.
#[derive(Debug, Clone)]
pub enum Cancellation {
    /// Cancelled through the token: checked after failures and before each
    /// sleep, and sleeps wake early.
    Interruptible(CancelToken),
    /// Never cancelled; sleeps run to completion.
    NonInterruptible,
}

impl Default for Cancellation {
    fn default() -> Self {
        Cancellation::Interruptible(CancelToken::new())
    }
}

impl Cancellation {
    /// The token, if interruptible.
    pub fn token(&self) -> Option<&CancelToken> {
        match self {
            Cancellation::Interruptible(token) => Some(token),
            Cancellation::NonInterruptible => None,
        }
    }
}

thread_local! {
    static OPERATION_NAME: RefCell<Option<Arc<str>>> = const { RefCell::new(None) };
}

/// Name of the retried operation running on this thread, if it was given
/// one with [`Retrier::named`].
pub fn current_operation_name() -> Option<Arc<str>> {
    OPERATION_NAME.with(|name| name.borrow().clone())
}

struct NameGuard {
    previous: Option<Arc<str>>,
}

impl NameGuard {
    fn set(name: Option<&Arc<str>>) -> Option<NameGuard> {
        let name = Arc::clone(name?);
        let previous = OPERATION_NAME.with(|current| current.borrow_mut().replace(name));
        Some(NameGuard { previous })
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        OPERATION_NAME.with(|current| *current.borrow_mut() = previous);
    }
}

/// Retry loop configuration.
///
/// # Examples
///
/// ```rust
/// use slackwater::cancel::CancelToken;
/// use slackwater::clock::Deadline;
/// use slackwater::retry::{DeadlineBound, Decision, NoRetry, Retrier};
///
/// let token = CancelToken::new();
/// let retrier = Retrier::new()
///     .named("refresh-index")
///     .with_max_suppressed(3)
///     .with_cancel_token(token.clone());
///
/// let mut calls = 0;
/// let op = DeadlineBound::new(Deadline::NEVER, move || {
///     calls += 1;
///     if calls < 5 { Err(calls) } else { Ok("done") }
/// });
/// let always = |_: &i32, _: &mut _| Decision::retry_now();
///
/// assert_eq!(retrier.execute(op, always, NoRetry).unwrap(), "done");
/// ```
#[derive(Debug, Clone)]
pub struct Retrier {
    max_suppressed: usize,
    cancellation: Cancellation,
    sleeper: Arc<dyn Sleeper>,
    name: Option<Arc<str>>,
}

impl Default for Retrier {
    fn default() -> Self {
        Self {
            max_suppressed: DEFAULT_MAX_SUPPRESSED,
            cancellation: Cancellation::default(),
            sleeper: Arc::new(ThreadSleeper),
            name: None,
        }
    }
}

struct Attempts<E> {
    count: u32,
    history: Option<ErrorChain<E>>,
}

enum Next<T, E> {
    Done(Result<T, RetryError<E>>),
    Sleep(Duration),
}

impl Retrier {
    /// A retrier with default settings and its own cancel token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `n` suppressed failures in the history.
    ///
    /// At least one is always kept, so a failure that ends the loop still
    /// shows the attempt before it.
    pub fn with_max_suppressed(mut self, n: usize) -> Self {
        self.max_suppressed = n.max(1);
        self
    }

    /// Cancel through `token`.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancellation = Cancellation::Interruptible(token);
        self
    }

    /// Set the cancellation mode.
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Ignore cancellation entirely.
    pub fn non_interruptible(self) -> Self {
        self.with_cancellation(Cancellation::NonInterruptible)
    }

    /// Sleep between attempts with `sleeper`.
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Name the operation for diagnostics.
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The cancel token, if interruptible.
    pub fn cancel_token(&self) -> Option<&CancelToken> {
        self.cancellation.token()
    }

    /// Limit on suppressed failures.
    pub fn max_suppressed(&self) -> usize {
        self.max_suppressed
    }

    /// Run `operation` until a policy stops the loop.
    ///
    /// `on_error` judges failed attempts and `on_result` successful ones.
    /// Returns the value of the last attempt, or a [`RetryError`] carrying
    /// the failure history.
    pub fn execute<O, P, R>(
        &self,
        mut operation: O,
        mut on_error: P,
        mut on_result: R,
    ) -> Result<O::Output, RetryError<O::Error>>
    where
        O: Operation,
        P: RetryPolicy<O::Error, O::Error, O>,
        R: RetryPolicy<O::Output, O::Error, O>,
    {
        let mut attempts = Attempts {
            count: 0,
            history: None,
        };
        loop {
            attempts.count += 1;
            let outcome = {
                let _name = NameGuard::set(self.name.as_ref());
                #[cfg(feature = "tracing")]
                let _span = self.attempt_span(attempts.count).entered();
                operation.call()
            };
            let delay = match self.judge(
                &mut attempts,
                outcome,
                &mut operation,
                &mut on_error,
                &mut on_result,
            ) {
                Next::Done(result) => return result,
                Next::Sleep(delay) => delay,
            };
            if !delay.is_zero() && self.sleeper.sleep(delay, self.cancel_token()).is_err() {
                return Err(self.interrupted(attempts.history));
            }
        }
    }

    /// Async counterpart of [`Retrier::execute`].
    ///
    /// Delays use `tokio::time::sleep`, raced against the cancel token. The
    /// configured [`Sleeper`] is not used.
    #[cfg(feature = "async")]
    pub async fn execute_async<O, P, R>(
        &self,
        mut operation: O,
        mut on_error: P,
        mut on_result: R,
    ) -> Result<O::Output, RetryError<O::Error>>
    where
        O: AsyncOperation,
        P: RetryPolicy<O::Error, O::Error, O>,
        R: RetryPolicy<O::Output, O::Error, O>,
    {
        let mut attempts = Attempts {
            count: 0,
            history: None,
        };
        loop {
            attempts.count += 1;
            let outcome = {
                let call = operation.call_async();
                #[cfg(feature = "tracing")]
                let call = tracing::Instrument::instrument(call, self.attempt_span(attempts.count));
                call.await
            };
            let delay = match self.judge(
                &mut attempts,
                outcome,
                &mut operation,
                &mut on_error,
                &mut on_result,
            ) {
                Next::Done(result) => return result,
                Next::Sleep(delay) => delay,
            };
            if delay.is_zero() {
                continue;
            }
            match self.cancel_token() {
                Some(token) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Err(self.interrupted(attempts.history)),
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    #[cfg(feature = "tracing")]
    fn attempt_span(&self, attempt: u32) -> tracing::Span {
        tracing::info_span!(
            "retry_attempt",
            operation = self.name.as_deref().unwrap_or("anonymous"),
            attempt
        )
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_token().is_some_and(CancelToken::is_cancelled)
    }

    fn judge<O, T, E, P, R>(
        &self,
        attempts: &mut Attempts<E>,
        outcome: Result<T, E>,
        operation: &mut O,
        on_error: &mut P,
        on_result: &mut R,
    ) -> Next<T, E>
    where
        P: RetryPolicy<E, E, O>,
        R: RetryPolicy<T, E, O>,
    {
        if outcome.is_err() && self.is_cancelled() {
            let history = self.absorb(attempts.history.take(), outcome.err());
            return Next::Done(Err(self.interrupted(history)));
        }

        let decision = match &outcome {
            Ok(value) => on_result.decide(value, operation),
            Err(error) => on_error.decide(error, operation),
        };
        let delay = match decision {
            Decision::Abort(halt) => {
                return Next::Done(self.finish(outcome, attempts.history.take(), halt));
            }
            Decision::Retry(delay) => delay,
        };

        attempts.history = self.absorb(attempts.history.take(), outcome.err());
        if self.is_cancelled() {
            return Next::Done(Err(self.interrupted(attempts.history.take())));
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            operation = self.name.as_deref().unwrap_or("anonymous"),
            attempt = attempts.count,
            ?delay,
            "retry scheduled"
        );
        Next::Sleep(delay)
    }

    fn finish<T, E>(
        &self,
        outcome: Result<T, E>,
        history: Option<ErrorChain<E>>,
        halt: Option<Halt<E>>,
    ) -> Result<T, RetryError<E>> {
        match (outcome, halt) {
            (Ok(value), None) => Ok(value),
            (Err(error), None) => Err(RetryError::Failed(self.push(history, error))),
            (outcome, Some(Halt::Error(error))) => {
                let history = self.absorb(history, outcome.err());
                Err(RetryError::Failed(self.push(history, error)))
            }
            (outcome, Some(Halt::Timeout(timeout))) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    operation = self.name.as_deref().unwrap_or("anonymous"),
                    %timeout,
                    "retry gave up at deadline"
                );
                Err(RetryError::TimedOut {
                    timeout,
                    history: self.absorb(history, outcome.err()),
                })
            }
        }
    }

    fn interrupted<E>(&self, history: Option<ErrorChain<E>>) -> RetryError<E> {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            operation = self.name.as_deref().unwrap_or("anonymous"),
            "retry interrupted"
        );
        RetryError::Interrupted { history }
    }

    /// `error` with `history` suppressed under it.
    fn push<E>(&self, history: Option<ErrorChain<E>>, error: E) -> ErrorChain<E> {
        let latest = ErrorChain::new(error);
        match history {
            Some(previous) => latest.suppress(previous, self.max_suppressed),
            None => latest,
        }
    }

    fn absorb<E>(&self, history: Option<ErrorChain<E>>, error: Option<E>) -> Option<ErrorChain<E>> {
        match error {
            Some(error) => Some(self.push(history, error)),
            None => history,
        }
    }
}

/// Run `operation` with a default [`Retrier`].
///
/// ```rust
/// use slackwater::clock::Deadline;
/// use slackwater::retry::{execute_with_retry, DeadlineBound, NoRetry};
///
/// let op = DeadlineBound::new(Deadline::NEVER, || Ok::<_, String>(7));
/// assert_eq!(execute_with_retry(op, NoRetry, NoRetry).unwrap(), 7);
/// ```
pub fn execute_with_retry<O, P, R>(
    operation: O,
    on_error: P,
    on_result: R,
) -> Result<O::Output, RetryError<O::Error>>
where
    O: Operation,
    P: RetryPolicy<O::Error, O::Error, O>,
    R: RetryPolicy<O::Output, O::Error, O>,
{
    Retrier::new().execute(operation, on_error, on_result)
}
