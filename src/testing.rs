//! Testing utilities for code built on Slackwater
//!
//! Retry loops are about time, and real time makes tests slow and flaky.
//! This module provides a [`ManualClock`] that only moves when told to, a
//! [`RecordingSleeper`] that records delays instead of sleeping (optionally
//! advancing a manual clock), a [`ScriptedOperation`] that replays a fixed
//! sequence of outcomes, and assertion macros for [`RetryError`] variants.
//!
//! # Examples
//!
//! ```rust
//! use slackwater::clock::{Clock, ClockReading};
//! use slackwater::retry::{Decision, NoRetry, Retrier};
//! use slackwater::testing::{ManualClock, RecordingSleeper, ScriptedOperation};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let clock = Arc::new(ManualClock::new(ClockReading::ZERO));
//! let sleeper = RecordingSleeper::advancing(clock.clone());
//! let retrier = Retrier::new().with_sleeper(sleeper.clone());
//!
//! let op = ScriptedOperation::new(clock.deadline_in(Duration::from_secs(1)), Err("down"))
//!     .then(Ok(200));
//! let calls = op.counter();
//! let wait = |_: &&str, _: &mut _| Decision::retry_after(Duration::from_millis(30));
//!
//! assert_eq!(retrier.execute(op, wait, NoRetry).unwrap(), 200);
//! assert_eq!(calls.get(), 2);
//! assert_eq!(sleeper.delays(), vec![Duration::from_millis(30)]);
//! assert_eq!(clock.now(), ClockReading::from_nanos(30_000_000));
//! ```
//!
//! [`RetryError`]: crate::retry::RetryError

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cancel::{CancelToken, Interrupted};
use crate::clock::{duration_to_nanos, Clock, ClockReading, Deadline};
use crate::retry::{HasDeadline, Operation, Sleeper};

/// A clock that only moves when told to.
///
/// ```rust
/// use slackwater::clock::{Clock, ClockReading};
/// use slackwater::testing::ManualClock;
/// use std::time::Duration;
///
/// let clock = ManualClock::new(ClockReading::from_nanos(100));
/// clock.advance(Duration::from_nanos(50));
/// assert_eq!(clock.now(), ClockReading::from_nanos(150));
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// A clock reading `start`.
    pub fn new(start: ClockReading) -> Self {
        Self {
            nanos: AtomicU64::new(start.as_nanos()),
        }
    }

    /// Move the clock forward, saturating at [`ClockReading::MAX`].
    pub fn advance(&self, duration: Duration) {
        let step = duration_to_nanos(duration);
        let _ = self
            .nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_add(step))
            });
    }

    /// Move the clock to `reading`. Earlier readings are ignored so the
    /// clock never runs backwards.
    pub fn set(&self, reading: ClockReading) {
        self.nanos.fetch_max(reading.as_nanos(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> ClockReading {
        ClockReading::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// A [`Sleeper`] that records delays instead of blocking.
///
/// Clones share the recorded delays, so keep one clone for assertions and
/// hand the other to a [`Retrier`](crate::retry::Retrier). A cancelled
/// token makes the sleep fail with [`Interrupted`] without recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
    clock: Option<Arc<ManualClock>>,
}

impl RecordingSleeper {
    /// A sleeper that only records.
    pub fn new() -> Self {
        Self::default()
    }

    /// A sleeper that also advances `clock` by each delay.
    pub fn advancing(clock: Arc<ManualClock>) -> Self {
        Self {
            delays: Arc::default(),
            clock: Some(clock),
        }
    }

    /// Delays slept so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sum of all delays slept so far.
    pub fn total(&self) -> Duration {
        self.delays().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: Option<&CancelToken>) -> Result<(), Interrupted> {
        if let Some(token) = cancel {
            token.check()?;
        }
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        if let Some(clock) = &self.clock {
            clock.advance(duration);
        }
        Ok(())
    }
}

/// Shared count of operation invocations.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicU32>);

impl CallCounter {
    /// Invocations so far.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// An operation that replays scripted outcomes.
///
/// The last outcome repeats forever once the script is exhausted.
#[derive(Debug, Clone)]
pub struct ScriptedOperation<T, E> {
    deadline: Deadline,
    queued: VecDeque<Result<T, E>>,
    last: Result<T, E>,
    calls: CallCounter,
}

impl<T: Clone, E: Clone> ScriptedOperation<T, E> {
    /// An operation that always returns `outcome`.
    pub fn new(deadline: Deadline, outcome: Result<T, E>) -> Self {
        Self {
            deadline,
            queued: VecDeque::new(),
            last: outcome,
            calls: CallCounter::default(),
        }
    }

    /// Append `outcome` to the script; it becomes the repeating one.
    pub fn then(mut self, outcome: Result<T, E>) -> Self {
        let previous = std::mem::replace(&mut self.last, outcome);
        self.queued.push_back(previous);
        self
    }

    /// A handle counting invocations, usable after the operation is moved
    /// into a retry loop.
    pub fn counter(&self) -> CallCounter {
        self.calls.clone()
    }

    fn next_outcome(&mut self) -> Result<T, E> {
        self.calls.bump();
        self.queued
            .pop_front()
            .unwrap_or_else(|| self.last.clone())
    }
}

impl<T, E> HasDeadline for ScriptedOperation<T, E> {
    fn deadline(&self) -> Deadline {
        self.deadline
    }
}

impl<T: Clone, E: Clone> Operation for ScriptedOperation<T, E> {
    type Output = T;
    type Error = E;

    fn call(&mut self) -> Result<T, E> {
        self.next_outcome()
    }
}

#[cfg(feature = "async")]
impl<T, E> crate::retry::AsyncOperation for ScriptedOperation<T, E>
where
    T: Clone + Send,
    E: Clone + Send,
{
    type Output = T;
    type Error = E;

    fn call_async(&mut self) -> impl std::future::Future<Output = Result<T, E>> + Send {
        let outcome = self.next_outcome();
        async move { outcome }
    }
}

/// Assert that a retry loop failed, optionally with a given primary error.
///
/// # Example
///
/// ```rust
/// use slackwater::assert_failed;
/// use slackwater::clock::Deadline;
/// use slackwater::retry::{execute_with_retry, DeadlineBound, NoRetry};
///
/// let op = DeadlineBound::new(Deadline::NEVER, || Err::<(), _>("refused"));
/// assert_failed!(execute_with_retry(op, NoRetry, NoRetry), "refused");
/// ```
#[macro_export]
macro_rules! assert_failed {
    ($result:expr) => {
        match $result {
            Err($crate::retry::RetryError::Failed(_)) => {}
            other => panic!("Expected Failed, got {:?}", other),
        }
    };
    ($result:expr, $expected:expr) => {
        match $result {
            Err($crate::retry::RetryError::Failed(chain)) => {
                assert_eq!(*chain.error(), $expected);
            }
            other => panic!("Expected Failed with {:?}, got {:?}", $expected, other),
        }
    };
}

/// Assert that a retry loop ran out of time.
#[macro_export]
macro_rules! assert_timed_out {
    ($result:expr) => {
        match $result {
            Err($crate::retry::RetryError::TimedOut { .. }) => {}
            other => panic!("Expected TimedOut, got {:?}", other),
        }
    };
}

/// Assert that a retry loop was cancelled.
#[macro_export]
macro_rules! assert_interrupted {
    ($result:expr) => {
        match $result {
            Err($crate::retry::RetryError::Interrupted { .. }) => {}
            other => panic!("Expected Interrupted, got {:?}", other),
        }
    };
}
