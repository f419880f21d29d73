//! Cooperative cancellation
//!
//! A [`CancelToken`] is the interrupt flag of a retry loop. Cancelling it
//! wakes any sleep in progress and makes the loop stop before the next
//! attempt. Work already running is never preempted.
//!
//! ```
//! use slackwater::cancel::CancelToken;
//! use std::time::Duration;
//!
//! let token = CancelToken::new();
//! let remote = token.clone();
//!
//! let sleeper = std::thread::spawn(move || remote.sleep(Duration::from_secs(60)));
//! token.cancel();
//!
//! assert!(sleeper.join().unwrap().is_err());
//! ```

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Error returned when work stops because cancellation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interrupted")
    }
}

impl std::error::Error for Interrupted {}

#[derive(Debug, Default)]
struct Shared {
    cancelled: Mutex<bool>,
    wake: Condvar,
    #[cfg(feature = "async")]
    notify: tokio::sync::Notify,
}

/// A cloneable, thread-safe cancellation flag.
///
/// Clones share the same flag. Once cancelled a token stays cancelled until
/// [`CancelToken::reset`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every sleeper.
    pub fn cancel(&self) {
        let mut cancelled = self
            .shared
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.shared.wake.notify_all();
        #[cfg(feature = "async")]
        self.shared.notify.notify_waiters();
    }

    /// Clear the flag so the token can be reused.
    pub fn reset(&self) {
        *self
            .shared
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self
            .shared
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail with [`Interrupted`] if cancellation was requested.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_cancelled() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Block for `duration`, returning early with [`Interrupted`] on cancel.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let start = Instant::now();
        let mut cancelled = self
            .shared
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return Err(Interrupted);
            }
            let elapsed = start.elapsed();
            if elapsed >= duration {
                return Ok(());
            }
            cancelled = self
                .shared
                .wake
                .wait_timeout(cancelled, duration - elapsed)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Resolve once the token is cancelled.
    #[cfg(feature = "async")]
    pub async fn cancelled(&self) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sleep_completes_without_cancel() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert_eq!(token.sleep(Duration::from_millis(5)), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_cancelled_token_fails_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        assert_eq!(token.sleep(Duration::from_secs(10)), Err(Interrupted));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(token.check(), Err(Interrupted));
    }

    #[test]
    fn test_cancel_wakes_sleeper() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || remote.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(10));
        token.cancel();
        assert_eq!(handle.join().unwrap(), Err(Interrupted));
    }

    #[test]
    fn test_reset() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!token.is_cancelled());
        assert_eq!(token.check(), Ok(()));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancelToken::new();
        let remote = token.clone();
        let waiter = tokio::spawn(async move { remote.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancellation observed")
            .unwrap();
    }
}
