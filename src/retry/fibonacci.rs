//! Fibonacci backoff with jitter.
//!
//! [`FibonacciBackoff`] spends a budget of immediate retries first, then
//! waits along the Fibonacci sequence scaled by the minimum delay
//! (`min, min, 2min, 3min, 5min, ...`) capped at the maximum delay. Delays
//! never reach past the operation's deadline, and are jittered uniformly in
//! `[0, delay)` unless jitter is disabled.
//!
//! Backoff state is kept per classification key, so different kinds of
//! failure inside one retry loop back off independently. The policy is owned
//! by a single loop; build a new one (or use [`FibonacciBackoff::fresh`]) for
//! every loop.
//!
//! # Examples
//!
//! ```rust
//! use slackwater::clock::{Clock, MonotonicClock};
//! use slackwater::retry::{execute_with_retry, transient_errors, DeadlineBound, NoRetry};
//! use std::io;
//! use std::time::Duration;
//!
//! let backoff = transient_errors::<io::Error>()
//!     .immediate_retries(2)
//!     .min_delay(1)
//!     .max_delay(50)
//!     .build()
//!     .unwrap();
//!
//! let mut calls = 0;
//! let op = DeadlineBound::new(MonotonicClock.deadline_in(Duration::from_secs(5)), move || {
//!     calls += 1;
//!     if calls < 3 {
//!         Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
//!     } else {
//!         Ok(calls)
//!     }
//! });
//!
//! assert_eq!(execute_with_retry(op, backoff, NoRetry).unwrap(), 3);
//! ```

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::clock::{duration_to_nanos, Clock, ClockReading, Deadline, ProcessClock};
use crate::retry::classify::{
    root_cause_label, Classification, FailureClassifier, DEFAULT_CLASSIFIER,
};
use crate::retry::policy::{Decision, HasDeadline, RetryPolicy};
use crate::retry::{ConfigError, DeadlineExceeded};

/// Granularity of configured delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TimeUnit {
    /// Nanoseconds.
    Nanos,
    /// Microseconds.
    Micros,
    /// Milliseconds.
    #[default]
    Millis,
    /// Seconds.
    Seconds,
}

impl TimeUnit {
    /// `units` of this unit as a [`Duration`].
    pub fn to_duration(self, units: u64) -> Duration {
        match self {
            TimeUnit::Nanos => Duration::from_nanos(units),
            TimeUnit::Micros => Duration::from_micros(units),
            TimeUnit::Millis => Duration::from_millis(units),
            TimeUnit::Seconds => Duration::from_secs(units),
        }
    }

    /// Whole units in `duration`, rounded down and saturating.
    pub fn from_duration(self, duration: Duration) -> u64 {
        let units = match self {
            TimeUnit::Nanos => duration.as_nanos(),
            TimeUnit::Micros => duration.as_micros(),
            TimeUnit::Millis => duration.as_millis(),
            TimeUnit::Seconds => u128::from(duration.as_secs()),
        };
        u64::try_from(units).unwrap_or(u64::MAX)
    }
}

/// How computed delays are randomised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Jitter {
    /// Use the computed delay as is.
    None,
    /// Uniform in `[0, delay)`.
    #[default]
    Full,
}

impl Jitter {
    fn apply(self, rng: &mut SmallRng, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let nanos = duration_to_nanos(delay);
                if nanos == 0 {
                    delay
                } else {
                    Duration::from_nanos(rng.random_range(0..nanos))
                }
            }
        }
    }
}

/// Plain-data backoff configuration.
///
/// Delays are expressed in `unit`s. With the `serde` feature the struct can
/// be loaded from configuration files; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BackoffConfig {
    /// Zero-delay retries granted per key before backing off.
    pub immediate_retries: u32,
    /// First backoff delay, in `unit`s. Must be positive.
    pub min_delay: u64,
    /// Largest backoff delay, in `unit`s.
    pub max_delay: u64,
    /// Unit of `min_delay` and `max_delay`.
    pub unit: TimeUnit,
    /// Jitter mode.
    pub jitter: Jitter,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            immediate_retries: 2,
            min_delay: 10,
            max_delay: 5_000,
            unit: TimeUnit::Millis,
            jitter: Jitter::Full,
        }
    }
}

impl BackoffConfig {
    /// Check the delay bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_delay == 0 {
            return Err(ConfigError::ZeroMinDelay);
        }
        if self.min_delay > self.max_delay {
            return Err(ConfigError::MinExceedsMax {
                min: self.unit.to_duration(self.min_delay),
                max: self.unit.to_duration(self.max_delay),
            });
        }
        Ok(())
    }
}

/// Backoff state of one classification key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryData {
    immediate_left: u32,
    fib_p1: u64,
    fib_p2: u64,
}

impl RetryData {
    fn new(immediate_retries: u32, min_delay: u64) -> Self {
        Self {
            immediate_left: immediate_retries,
            fib_p1: 0,
            fib_p2: min_delay,
        }
    }

    /// Immediate retries still available.
    pub fn immediate_retries_left(&self) -> u32 {
        self.immediate_left
    }

    /// The two Fibonacci terms, in delay units. The second is the next delay
    /// unless it exceeds the cap.
    pub fn fibonacci(&self) -> (u64, u64) {
        (self.fib_p1, self.fib_p2)
    }

    fn take_immediate(&mut self) -> bool {
        if self.immediate_left > 0 {
            self.immediate_left -= 1;
            true
        } else {
            false
        }
    }

    fn next_delay(&mut self, max_delay: u64) -> u64 {
        if self.fib_p2 > max_delay {
            return max_delay;
        }
        let delay = self.fib_p2;
        let next = self.fib_p1.saturating_add(self.fib_p2);
        self.fib_p1 = self.fib_p2;
        self.fib_p2 = next;
        delay
    }
}

type ClassifyFn<V> = Arc<dyn Fn(&V) -> Classification + Send + Sync>;
type KeyFn<V, K> = Arc<dyn Fn(&V) -> K + Send + Sync>;

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_to_nanos)
        .unwrap_or(0)
}

/// Fibonacci backoff retry policy.
///
/// Each decision:
/// 1. times out if the deadline has already passed;
/// 2. aborts on [`Classification::Abort`];
/// 3. retries at once on [`Classification::RetryImmediate`], budget untouched;
/// 4. otherwise spends an immediate retry of the outcome's key if one is
///    left ([`Classification::RetryDelayed`] keys start with none), or
///    waits for the next Fibonacci delay, clamped to the time remaining and
///    jittered.
///
/// See the [module documentation](self) for an example.
pub struct FibonacciBackoff<V: ?Sized, K = String> {
    classify: ClassifyFn<V>,
    key: KeyFn<V, K>,
    clock: Arc<dyn Clock>,
    config: BackoffConfig,
    seed: Option<u64>,
    rng: SmallRng,
    registry: Option<HashMap<K, RetryData>>,
}

impl<V: ?Sized + 'static> FibonacciBackoff<V, String> {
    /// Start configuring a policy.
    ///
    /// By default every outcome is retried and all outcomes share one key.
    pub fn builder() -> FibonacciBuilder<V, String> {
        FibonacciBuilder {
            classify: Arc::new(|_: &V| Classification::Retry),
            key: Arc::new(|_: &V| String::new()),
            clock: Arc::new(ProcessClock),
            config: BackoffConfig::default(),
            seed: None,
        }
    }
}

impl<E: StdError + 'static> FibonacciBackoff<E, String> {
    /// A policy built from `config` that retries what [`DEFAULT_CLASSIFIER`]
    /// deems retryable, keyed by root cause.
    pub fn from_config(config: BackoffConfig) -> Result<Self, ConfigError> {
        transient_errors().config(config).build()
    }
}

impl<V: ?Sized, K: Eq + Hash> FibonacciBackoff<V, K> {
    /// The configuration this policy was built with.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Backoff state of `key`, if the key has been seen.
    pub fn retry_data(&self, key: &K) -> Option<&RetryData> {
        self.registry.as_ref()?.get(key)
    }

    /// Number of keys with backoff state.
    pub fn tracked_keys(&self) -> usize {
        self.registry.as_ref().map_or(0, HashMap::len)
    }

    /// A policy with the same configuration and no backoff state.
    ///
    /// Seeded policies restart their jitter sequence; others reseed from the
    /// wall clock.
    pub fn fresh(&self) -> Self {
        Self {
            classify: Arc::clone(&self.classify),
            key: Arc::clone(&self.key),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            seed: self.seed,
            rng: SmallRng::seed_from_u64(self.seed.unwrap_or_else(wall_clock_seed)),
            registry: None,
        }
    }

    fn timed_out<E>(&self, deadline: Deadline, now: ClockReading) -> Decision<E> {
        #[cfg(feature = "tracing")]
        tracing::warn!(%deadline, %now, "retry deadline exhausted");
        Decision::timeout(DeadlineExceeded::new(deadline, now))
    }
}

impl<V, E, O, K> RetryPolicy<V, E, O> for FibonacciBackoff<V, K>
where
    V: ?Sized,
    O: HasDeadline + ?Sized,
    K: Eq + Hash,
{
    fn decide(&mut self, outcome: &V, operation: &mut O) -> Decision<E> {
        let deadline = operation.deadline();
        let now = self.clock.now();
        if deadline.is_expired_at(now) {
            return self.timed_out(deadline, now);
        }

        let immediate = match (self.classify)(outcome) {
            Classification::Abort => return Decision::abort(),
            Classification::RetryImmediate => return Decision::retry_now(),
            Classification::Retry => self.config.immediate_retries,
            Classification::RetryDelayed => 0,
        };

        let key = (self.key)(outcome);
        let min_delay = self.config.min_delay;
        let data = self
            .registry
            .get_or_insert_with(HashMap::new)
            .entry(key)
            .or_insert_with(|| RetryData::new(immediate, min_delay));
        if data.take_immediate() {
            return Decision::retry_now();
        }
        let candidate = self
            .config
            .unit
            .to_duration(data.next_delay(self.config.max_delay));

        let remaining = deadline.remaining_at(now);
        if remaining.is_zero() {
            return self.timed_out(deadline, now);
        }
        let delay = self.config.jitter.apply(&mut self.rng, candidate.min(remaining));
        if now.saturating_add(delay) > deadline.reading() {
            return self.timed_out(deadline, now);
        }
        Decision::retry_after(delay)
    }
}

impl<V: ?Sized, K> fmt::Debug for FibonacciBackoff<V, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FibonacciBackoff")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("seed", &self.seed)
            .field(
                "tracked_keys",
                &self.registry.as_ref().map_or(0, HashMap::len),
            )
            .finish()
    }
}

/// Builder for [`FibonacciBackoff`].
pub struct FibonacciBuilder<V: ?Sized, K = String> {
    classify: ClassifyFn<V>,
    key: KeyFn<V, K>,
    clock: Arc<dyn Clock>,
    config: BackoffConfig,
    seed: Option<u64>,
}

impl<V: ?Sized + 'static, K: 'static> FibonacciBuilder<V, K> {
    /// Zero-delay retries granted per key before backing off.
    pub fn immediate_retries(mut self, n: u32) -> Self {
        self.config.immediate_retries = n;
        self
    }

    /// First backoff delay, in the configured unit.
    pub fn min_delay(mut self, units: u64) -> Self {
        self.config.min_delay = units;
        self
    }

    /// Largest backoff delay, in the configured unit.
    pub fn max_delay(mut self, units: u64) -> Self {
        self.config.max_delay = units;
        self
    }

    /// Unit of the delay bounds.
    pub fn unit(mut self, unit: TimeUnit) -> Self {
        self.config.unit = unit;
        self
    }

    /// Jitter mode.
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Replace all numeric settings with `config`.
    pub fn config(mut self, config: BackoffConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed the jitter generator for reproducible delays.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Measure deadlines on `clock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Classify outcomes with `classify`.
    pub fn classify<F>(mut self, classify: F) -> Self
    where
        F: Fn(&V) -> Classification + Send + Sync + 'static,
    {
        self.classify = Arc::new(classify);
        self
    }

    /// Partition backoff state by `key`.
    pub fn key<K2, F>(self, key: F) -> FibonacciBuilder<V, K2>
    where
        F: Fn(&V) -> K2 + Send + Sync + 'static,
    {
        FibonacciBuilder {
            classify: self.classify,
            key: Arc::new(key),
            clock: self.clock,
            config: self.config,
            seed: self.seed,
        }
    }

    /// Validate the configuration and build the policy.
    pub fn build(self) -> Result<FibonacciBackoff<V, K>, ConfigError> {
        self.config.validate()?;
        Ok(FibonacciBackoff {
            classify: self.classify,
            key: self.key,
            clock: self.clock,
            config: self.config,
            seed: self.seed,
            rng: SmallRng::seed_from_u64(self.seed.unwrap_or_else(wall_clock_seed)),
            registry: None,
        })
    }
}

impl<E: StdError + 'static, K: 'static> FibonacciBuilder<E, K> {
    /// Classify errors with a [`FailureClassifier`].
    pub fn classifier<C: FailureClassifier + 'static>(self, classifier: C) -> Self {
        self.classify(move |error: &E| classifier.classify(error))
    }
}

impl<E: StdError + 'static> FibonacciBuilder<E, String> {
    /// Key backoff state by the root cause's type label.
    pub fn key_by_root_cause(self) -> Self {
        self.key(|error: &E| root_cause_label(error))
    }
}

impl<V: ?Sized, K> fmt::Debug for FibonacciBuilder<V, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FibonacciBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("seed", &self.seed)
            .finish()
    }
}

/// Backoff for errors [`DEFAULT_CLASSIFIER`] deems retryable, keyed by root
/// cause, with [`BackoffConfig::default`] delays.
pub fn transient_errors<E: StdError + 'static>() -> FibonacciBuilder<E, String> {
    FibonacciBackoff::builder()
        .classifier(DEFAULT_CLASSIFIER)
        .key_by_root_cause()
}
