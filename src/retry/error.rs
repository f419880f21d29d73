//! Error types for retry operations.

use std::time::{Duration, SystemTime};

use crate::clock::{ClockReading, Deadline};
use crate::retry::chain::ErrorChain;
use crate::timing::Timing;

/// Error returned when a deadline has passed.
///
/// Carries both the deadline and the reading at which it was found to be
/// exceeded, so the overrun can be reported.
///
/// # Examples
///
/// ```rust
/// use slackwater::clock::{ClockReading, Deadline};
/// use slackwater::retry::DeadlineExceeded;
/// use std::time::Duration;
///
/// let deadline = Deadline::at(ClockReading::from_nanos(1_000_000));
/// let err = DeadlineExceeded::new(deadline, ClockReading::from_nanos(3_000_000));
///
/// assert_eq!(err.overrun(), Duration::from_millis(2));
/// assert!(err.to_string().contains("deadline exceeded"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExceeded {
    deadline: Deadline,
    now: ClockReading,
}

impl DeadlineExceeded {
    /// Create a new DeadlineExceeded error.
    pub fn new(deadline: Deadline, now: ClockReading) -> Self {
        Self { deadline, now }
    }

    /// The deadline that was exceeded.
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// The reading at which the deadline was found exceeded.
    pub fn now(&self) -> ClockReading {
        self.now
    }

    /// How far past the deadline `now` is.
    pub fn overrun(&self) -> Duration {
        self.now.saturating_duration_since(self.deadline.reading())
    }

    /// The deadline as wall-clock time.
    ///
    /// `timing` must be built on the clock the deadline was measured on;
    /// [`crate::timing::global`] for deadlines on the process clock.
    pub fn deadline_wall_clock(&self, timing: &Timing) -> SystemTime {
        timing.to_system_time(self.deadline.reading())
    }
}

impl std::fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "deadline exceeded: deadline {}, now {} ({:?} late)",
            self.deadline,
            self.now,
            self.overrun()
        )
    }
}

impl std::error::Error for DeadlineExceeded {}

/// Error returned by a retry loop.
///
/// Every variant keeps the failure history of earlier attempts as an
/// [`ErrorChain`]: later failures carry earlier ones as suppressed entries.
///
/// # Examples
///
/// ```rust
/// use slackwater::retry::{execute_with_retry, DeadlineBound, NoRetry, RetryError};
/// use slackwater::clock::Deadline;
///
/// let op = DeadlineBound::new(Deadline::NEVER, || Err::<(), _>("boom"));
///
/// match execute_with_retry(op, NoRetry, NoRetry) {
///     Err(RetryError::Failed(chain)) => assert_eq!(*chain.error(), "boom"),
///     other => panic!("unexpected {:?}", other),
/// }
/// ```
#[derive(Debug, Clone)]
pub enum RetryError<E> {
    /// The last attempt failed and the policy gave up, or a policy aborted
    /// with an error of its own.
    Failed(ErrorChain<E>),
    /// The deadline ran out before another attempt could be scheduled.
    TimedOut {
        /// Deadline and reading at the moment the loop gave up.
        timeout: DeadlineExceeded,
        /// Failures recorded before giving up.
        history: Option<ErrorChain<E>>,
    },
    /// Cancellation was requested.
    Interrupted {
        /// Failures recorded before the interruption.
        history: Option<ErrorChain<E>>,
    },
}

impl<E> RetryError<E> {
    /// Returns true if the operation failed for good.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns true if the loop ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Returns true if the loop was cancelled.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// The primary operation error, if the loop ended with one.
    pub fn error(&self) -> Option<&E> {
        match self {
            Self::Failed(chain) => Some(chain.error()),
            _ => None,
        }
    }

    /// The most recent failure chain, whatever the variant.
    pub fn history(&self) -> Option<&ErrorChain<E>> {
        match self {
            Self::Failed(chain) => Some(chain),
            Self::TimedOut { history, .. } | Self::Interrupted { history } => history.as_ref(),
        }
    }

    /// The timeout details, if the loop ran out of time.
    pub fn timeout(&self) -> Option<&DeadlineExceeded> {
        match self {
            Self::TimedOut { timeout, .. } => Some(timeout),
            _ => None,
        }
    }
}

impl<E: Clone> RetryError<E> {
    /// Extract the primary operation error, discarding history.
    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Failed(chain) => Some(chain.into_error()),
            _ => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(chain) => write!(f, "{}", chain),
            Self::TimedOut { timeout, history } => {
                write!(f, "retry timed out: {}", timeout)?;
                if let Some(last) = history {
                    write!(f, "; last failure: {}", last.error())?;
                }
                Ok(())
            }
            Self::Interrupted { history } => {
                write!(f, "retry interrupted")?;
                if let Some(last) = history {
                    write!(f, "; last failure: {}", last.error())?;
                }
                Ok(())
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(chain) => std::error::Error::source(chain),
            Self::TimedOut { history, .. } | Self::Interrupted { history } => history
                .as_ref()
                .map(|h| h as &(dyn std::error::Error + 'static)),
        }
    }
}

/// Error returned when a policy is configured with impossible bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The minimum delay is zero.
    ZeroMinDelay,
    /// The minimum delay is larger than the maximum.
    MinExceedsMax {
        /// Configured minimum delay.
        min: Duration,
        /// Configured maximum delay.
        max: Duration,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroMinDelay => write!(f, "minimum delay must be at least one time unit"),
            Self::MinExceedsMax { min, max } => write!(
                f,
                "minimum delay {:?} exceeds maximum delay {:?}",
                min, max
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod error_tests {
    use super::*;
    use crate::clock::Clock;

    fn deadline(nanos: u64) -> Deadline {
        Deadline::at(ClockReading::from_nanos(nanos))
    }

    #[test]
    fn test_deadline_exceeded_display() {
        let err = DeadlineExceeded::new(deadline(100), ClockReading::from_nanos(250));
        let display = format!("{}", err);
        assert!(display.contains("deadline exceeded"));
        assert!(display.contains("100ns"));
        assert!(display.contains("250ns"));
        assert_eq!(err.overrun(), Duration::from_nanos(150));
    }

    #[test]
    fn test_deadline_wall_clock_uses_given_timing() {
        let clock = std::sync::Arc::new(crate::testing::ManualClock::new(
            ClockReading::from_nanos(1_000_000_000),
        ));
        let timing = Timing::new(clock.clone());
        let err = DeadlineExceeded::new(deadline(3_000_000_000), clock.now());

        let at_now = timing.to_system_time(clock.now());
        assert_eq!(
            err.deadline_wall_clock(&timing),
            at_now + Duration::from_secs(2)
        );
    }

    #[test]
    fn test_retry_error_failed() {
        let err: RetryError<&str> = RetryError::Failed(ErrorChain::new("broken"));
        assert!(err.is_failed());
        assert!(!err.is_timeout());
        assert_eq!(err.error(), Some(&"broken"));
        assert_eq!(err.into_error(), Some("broken"));
    }

    #[test]
    fn test_retry_error_timeout_keeps_history() {
        let err = RetryError::TimedOut {
            timeout: DeadlineExceeded::new(deadline(1), ClockReading::from_nanos(2)),
            history: Some(ErrorChain::new("slow")),
        };
        assert!(err.is_timeout());
        assert!(err.error().is_none());
        assert_eq!(err.history().map(|h| *h.error()), Some("slow"));
        assert!(format!("{}", err).contains("last failure: slow"));
        assert!(err.timeout().is_some());
    }

    #[test]
    fn test_retry_error_interrupted_display() {
        let err: RetryError<String> = RetryError::Interrupted { history: None };
        assert!(err.is_interrupted());
        assert_eq!(format!("{}", err), "retry interrupted");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MinExceedsMax {
            min: Duration::from_secs(2),
            max: Duration::from_secs(1),
        };
        assert!(format!("{}", err).contains("exceeds maximum"));
    }
}
