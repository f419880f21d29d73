//! Monotonic clock source and deadlines
//!
//! Every deadline in this crate is an absolute [`ClockReading`]: an opaque
//! nanosecond count taken from a [`Clock`]. Readings only compare within one
//! process and one clock; use [`crate::timing`] to relate them to wall-clock
//! time.
//!
//! # Examples
//!
//! ```
//! use slackwater::clock::{Clock, MonotonicClock};
//! use std::time::Duration;
//!
//! let clock = MonotonicClock;
//! let deadline = clock.deadline_in(Duration::from_secs(5));
//!
//! assert!(!deadline.is_expired_at(clock.now()));
//! assert!(clock.time_to(deadline) <= Duration::from_secs(5));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::retry::DeadlineExceeded;

/// A point on a [`Clock`]'s timeline, in nanoseconds.
///
/// Readings never decrease within a process for a given clock. They carry no
/// meaning across restarts or machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClockReading(u64);

impl ClockReading {
    /// The earliest representable reading.
    pub const ZERO: ClockReading = ClockReading(0);
    /// The latest representable reading, used as the "never" sentinel.
    pub const MAX: ClockReading = ClockReading(u64::MAX);

    /// Create a reading from raw nanoseconds.
    pub const fn from_nanos(nanos: u64) -> Self {
        ClockReading(nanos)
    }

    /// Raw nanoseconds of this reading.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Add a duration, saturating at [`ClockReading::MAX`].
    pub fn saturating_add(self, duration: Duration) -> Self {
        ClockReading(self.0.saturating_add(duration_to_nanos(duration)))
    }

    /// Subtract a duration, saturating at [`ClockReading::ZERO`].
    pub fn saturating_sub(self, duration: Duration) -> Self {
        ClockReading(self.0.saturating_sub(duration_to_nanos(duration)))
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: ClockReading) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Signed nanoseconds from `self` to `later`, clamped to the `i64` range.
    pub fn signed_nanos_until(self, later: ClockReading) -> i64 {
        let diff = i128::from(later.0) - i128::from(self.0);
        diff.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }
}

impl fmt::Display for ClockReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Convert a duration to nanoseconds, saturating at `u64::MAX`.
pub(crate) fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// An absolute point in monotonic time past which work must not continue.
///
/// A nested deadline is always tightened against its parent with
/// [`Deadline::min`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Deadline(ClockReading);

impl Deadline {
    /// A deadline that is never reached.
    pub const NEVER: Deadline = Deadline(ClockReading::MAX);

    /// Create a deadline at the given reading.
    pub const fn at(reading: ClockReading) -> Self {
        Deadline(reading)
    }

    /// The reading this deadline expires at.
    pub const fn reading(self) -> ClockReading {
        self.0
    }

    /// Returns true for [`Deadline::NEVER`].
    pub fn is_never(self) -> bool {
        self == Deadline::NEVER
    }

    /// The tighter of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        if other.0 < self.0 {
            other
        } else {
            self
        }
    }

    /// Returns true once `now` is past the deadline.
    pub fn is_expired_at(self, now: ClockReading) -> bool {
        now > self.0
    }

    /// Time left at `now`, zero once expired.
    pub fn remaining_at(self, now: ClockReading) -> Duration {
        self.0.saturating_duration_since(now)
    }

    /// Fail with [`DeadlineExceeded`] if `now` is past the deadline.
    pub fn check_at(self, now: ClockReading) -> Result<(), DeadlineExceeded> {
        if self.is_expired_at(now) {
            Err(DeadlineExceeded::new(self, now))
        } else {
            Ok(())
        }
    }
}

impl From<ClockReading> for Deadline {
    fn from(reading: ClockReading) -> Self {
        Deadline(reading)
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            write!(f, "never")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A source of monotonic [`ClockReading`]s.
///
/// Implementations must be cheap, lock-free and must not panic.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current reading.
    fn now(&self) -> ClockReading;

    /// A deadline `timeout` from now, saturating at [`Deadline::NEVER`].
    fn deadline_in(&self, timeout: Duration) -> Deadline {
        Deadline(self.now().saturating_add(timeout))
    }

    /// Time left until `deadline`, zero if it already passed.
    fn time_to(&self, deadline: Deadline) -> Duration {
        deadline.remaining_at(self.now())
    }

    /// Time left until `deadline`, failing once it has passed.
    ///
    /// ```
    /// use slackwater::clock::{Clock, Deadline, MonotonicClock};
    ///
    /// let clock = MonotonicClock;
    /// let past = Deadline::at(clock.now());
    /// std::thread::sleep(std::time::Duration::from_millis(1));
    /// assert!(clock.time_to_strict(past).is_err());
    /// ```
    fn time_to_strict(&self, deadline: Deadline) -> Result<Duration, DeadlineExceeded> {
        let now = self.now();
        deadline.check_at(now)?;
        Ok(deadline.remaining_at(now))
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> ClockReading {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> ClockReading {
        (**self).now()
    }
}

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// The platform monotonic timer, measured from a process-wide anchor.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> ClockReading {
        ClockReading(duration_to_nanos(anchor().elapsed()))
    }
}

/// A millisecond-resolution clock derived from wall-clock time.
///
/// Cheaper than [`MonotonicClock`] where sub-millisecond precision is not
/// needed. Wall-clock steps backwards are absorbed: the clock holds its
/// highest reading until wall time catches up.
#[derive(Debug, Default)]
pub struct CoarseClock {
    high_water: AtomicU64,
}

impl CoarseClock {
    /// Create a coarse clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for CoarseClock {
    fn now(&self) -> ClockReading {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let nanos = u64::try_from(millis.saturating_mul(1_000_000)).unwrap_or(u64::MAX);
        let previous = self.high_water.fetch_max(nanos, Ordering::Relaxed);
        ClockReading(previous.max(nanos))
    }
}

static GLOBAL: OnceLock<Box<dyn Clock>> = OnceLock::new();

/// Error returned by [`install`] when a process clock is already in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockAlreadyInstalled;

impl fmt::Display for ClockAlreadyInstalled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a process clock is already installed")
    }
}

impl std::error::Error for ClockAlreadyInstalled {}

/// Install the process-wide clock.
///
/// Must happen at startup, before anything reads [`global`]. Once a clock is
/// in use it cannot be replaced.
pub fn install(clock: impl Clock + 'static) -> Result<(), ClockAlreadyInstalled> {
    GLOBAL
        .set(Box::new(clock))
        .map_err(|_| ClockAlreadyInstalled)
}

/// The process-wide clock, [`MonotonicClock`] unless [`install`] ran first.
pub fn global() -> &'static dyn Clock {
    GLOBAL.get_or_init(|| Box::new(MonotonicClock)).as_ref()
}

/// Shorthand for `global().now()`.
pub fn now() -> ClockReading {
    global().now()
}

/// A handle that reads the process-wide clock.
///
/// Useful where an owned `Arc<dyn Clock>` is needed but the process clock
/// should stay in charge.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessClock;

impl Clock for ProcessClock {
    fn now(&self) -> ClockReading {
        global().now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_decreases() {
        let clock = MonotonicClock;
        let mut last = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn test_coarse_has_millisecond_resolution() {
        let clock = CoarseClock::new();
        let reading = clock.now();
        assert_eq!(reading.as_nanos() % 1_000_000, 0);
        assert!(clock.now() >= reading);
    }

    #[test]
    fn test_deadline_in_saturates() {
        let clock = MonotonicClock;
        assert_eq!(clock.deadline_in(Duration::MAX), Deadline::NEVER);
    }

    #[test]
    fn test_deadline_min() {
        let a = Deadline::at(ClockReading::from_nanos(10));
        let b = Deadline::at(ClockReading::from_nanos(20));
        assert_eq!(a.min(b), a);
        assert_eq!(b.min(a), a);
        assert_eq!(Deadline::NEVER.min(b), b);
    }

    #[test]
    fn test_remaining_and_check() {
        let deadline = Deadline::at(ClockReading::from_nanos(1_000));
        let before = ClockReading::from_nanos(400);
        let after = ClockReading::from_nanos(1_001);

        assert_eq!(deadline.remaining_at(before), Duration::from_nanos(600));
        assert_eq!(deadline.remaining_at(after), Duration::ZERO);
        assert!(deadline.check_at(before).is_ok());
        assert!(deadline.check_at(ClockReading::from_nanos(1_000)).is_ok());

        let err = deadline.check_at(after).unwrap_err();
        assert_eq!(err.overrun(), Duration::from_nanos(1));
    }

    #[test]
    fn test_signed_nanos_until() {
        let a = ClockReading::from_nanos(5);
        let b = ClockReading::from_nanos(8);
        assert_eq!(a.signed_nanos_until(b), 3);
        assert_eq!(b.signed_nanos_until(a), -3);
        assert_eq!(ClockReading::ZERO.signed_nanos_until(ClockReading::MAX), i64::MAX);
    }

    #[test]
    fn test_display() {
        assert_eq!(Deadline::NEVER.to_string(), "never");
        assert_eq!(ClockReading::from_nanos(42).to_string(), "42ns");
    }
}
