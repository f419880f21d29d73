//! Conversion between clock readings and wall-clock time
//!
//! A [`Timing`] pins one [`ClockReading`] to one wall-clock instant and
//! converts everything else relative to that pair. Monotonic and wall clocks
//! drift apart, so the pair is refreshed periodically by a background thread.
//!
//! # Examples
//!
//! ```
//! use slackwater::clock::{Clock, MonotonicClock};
//! use slackwater::timing::Timing;
//! use std::sync::Arc;
//!
//! let clock = Arc::new(MonotonicClock);
//! let timing = Timing::new(clock.clone());
//!
//! let now = clock.now();
//! let wall = timing.to_wall_millis(now);
//! let back = timing.to_clock_reading(wall);
//!
//! // Round trips are accurate to the millisecond.
//! assert!(back.as_nanos().abs_diff(now.as_nanos()) < 1_000_000);
//! ```

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::clock::{Clock, ClockReading, ProcessClock};

/// Default interval between reference refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reference {
    reading: ClockReading,
    wall_millis: i64,
}

/// A refreshable reference pair relating a [`Clock`] to wall-clock time.
#[derive(Debug)]
pub struct Timing {
    clock: Arc<dyn Clock>,
    reference: RwLock<Reference>,
}

impl Timing {
    /// Create a timing reference for `clock`.
    ///
    /// The reference is taken twice so one-off startup costs on the first
    /// read do not skew it.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let reference = sample(clock.as_ref());
        let timing = Timing {
            clock,
            reference: RwLock::new(reference),
        };
        timing.refresh();
        timing
    }

    /// Re-sample the reference pair.
    pub fn refresh(&self) {
        let fresh = sample(self.clock.as_ref());
        *self
            .reference
            .write()
            .unwrap_or_else(PoisonError::into_inner) = fresh;
        #[cfg(feature = "tracing")]
        tracing::trace!(
            reading = fresh.reading.as_nanos(),
            wall_millis = fresh.wall_millis,
            "timing reference refreshed"
        );
    }

    fn reference(&self) -> Reference {
        *self
            .reference
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The clock this reference is built on.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Wall-clock milliseconds since the Unix epoch for `reading`.
    pub fn to_wall_millis(&self, reading: ClockReading) -> i64 {
        let reference = self.reference();
        let nanos = reference.reading.signed_nanos_until(reading);
        reference.wall_millis.saturating_add(nanos / 1_000_000)
    }

    /// Wall-clock time for `reading`.
    pub fn to_system_time(&self, reading: ClockReading) -> SystemTime {
        let millis = self.to_wall_millis(reading);
        let magnitude = Duration::from_millis(millis.unsigned_abs());
        let time = if millis >= 0 {
            UNIX_EPOCH.checked_add(magnitude)
        } else {
            UNIX_EPOCH.checked_sub(magnitude)
        };
        time.unwrap_or(UNIX_EPOCH)
    }

    /// Clock reading for wall-clock milliseconds since the Unix epoch.
    ///
    /// Instants too far from the reference to express in nanoseconds map to
    /// [`ClockReading::MAX`], meaning no effective deadline.
    pub fn to_clock_reading(&self, wall_millis: i64) -> ClockReading {
        let reference = self.reference();
        let delta_millis = i128::from(wall_millis) - i128::from(reference.wall_millis);
        let delta_nanos = delta_millis * 1_000_000;
        if delta_nanos.unsigned_abs() > u128::from(i64::MAX as u64) {
            return ClockReading::MAX;
        }
        let target = i128::from(reference.reading.as_nanos()) + delta_nanos;
        if target < 0 {
            ClockReading::ZERO
        } else {
            u64::try_from(target)
                .map(ClockReading::from_nanos)
                .unwrap_or(ClockReading::MAX)
        }
    }

    /// Clock reading for a wall-clock instant.
    pub fn system_time_to_reading(&self, time: SystemTime) -> ClockReading {
        let millis = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => i64::try_from(after.as_millis()).unwrap_or(i64::MAX),
            Err(before) => i64::try_from(before.duration().as_millis())
                .map(|m| -m)
                .unwrap_or(i64::MIN),
        };
        self.to_clock_reading(millis)
    }

    /// Refresh the reference every `interval` on a background thread.
    ///
    /// The thread stops when the returned handle is dropped.
    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration) -> std::io::Result<RefreshHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let timing = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("slackwater-timing".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => timing.refresh(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(RefreshHandle {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

fn sample(clock: &dyn Clock) -> Reference {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    Reference {
        reading: clock.now(),
        wall_millis: wall,
    }
}

/// Stops a [`Timing`] refresher thread when dropped.
#[derive(Debug)]
pub struct RefreshHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    /// Leave the refresher running for the rest of the process.
    pub fn detach(mut self) {
        if let Some(stop) = self.stop.take() {
            std::mem::forget(stop);
        }
        self.thread.take();
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The process-wide timing reference on [`crate::clock::global`].
///
/// The first call starts an hourly refresher that lives for the rest of the
/// process.
pub fn global() -> &'static Arc<Timing> {
    static GLOBAL: OnceLock<Arc<Timing>> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        let timing = Arc::new(Timing::new(Arc::new(ProcessClock)));
        match timing.spawn_refresher(DEFAULT_REFRESH_INTERVAL) {
            Ok(handle) => handle.detach(),
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("timing refresher could not start: {}", _err);
            }
        }
        timing
    })
}
