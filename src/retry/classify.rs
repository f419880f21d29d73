//! Failure classification.
//!
//! Decides whether an error means "try again", "give up" or "the process is
//! in trouble". The rules are heuristics over the error's `source()` chain:
//! concrete std error types are recognised by downcasting, user types by the
//! name their `Debug` output starts with.
//!
//! Classification is injected into policies through [`FailureClassifier`];
//! [`DEFAULT_CLASSIFIER`] is the stock rule set.
//!
//! # Examples
//!
//! ```rust
//! use slackwater::retry::{is_non_recoverable, is_retryable};
//! use std::io;
//!
//! let reset = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
//! assert!(is_retryable(&reset));
//!
//! let corrupt = io::Error::new(io::ErrorKind::InvalidData, "bad frame");
//! assert!(!is_retryable(&corrupt));
//!
//! let fd_exhausted = io::Error::other("Too many open files");
//! assert!(is_non_recoverable(&fd_exhausted));
//! ```

use std::collections::TryReserveError;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::mpsc::RecvTimeoutError;

use crate::retry::DeadlineExceeded;

/// What to do about an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Classification {
    /// Give up.
    Abort,
    /// Retry, spending the immediate-retry budget before backing off.
    Retry,
    /// Retry at once without touching any budget.
    RetryImmediate,
    /// Retry, always backing off first.
    RetryDelayed,
}

impl Classification {
    /// Returns true for every variant except [`Classification::Abort`].
    pub fn is_retry(self) -> bool {
        !matches!(self, Classification::Abort)
    }
}

/// Rules for classifying errors.
pub trait FailureClassifier: Send + Sync + fmt::Debug {
    /// Returns true if the error means the process itself is compromised.
    fn is_non_recoverable(&self, error: &(dyn StdError + 'static)) -> bool;

    /// Returns true if the operation that produced the error may succeed
    /// when tried again.
    fn is_retryable(&self, error: &(dyn StdError + 'static)) -> bool;

    /// [`Classification::Retry`] for retryable errors, otherwise
    /// [`Classification::Abort`].
    fn classify(&self, error: &(dyn StdError + 'static)) -> Classification {
        if self.is_retryable(error) {
            Classification::Retry
        } else {
            Classification::Abort
        }
    }
}

/// The stock classification rules.
///
/// Non-recoverable:
/// - allocation failures (`TryReserveError`, `io::ErrorKind::OutOfMemory`)
/// - file descriptor exhaustion ("too many open files")
///
/// Retryable, checked in order:
/// 1. never if non-recoverable
/// 2. never for `io::ErrorKind::PermissionDenied` anywhere in the chain
/// 3. never if the root cause's type name contains `NonTransient`
/// 4. yes if any error in the chain is an I/O error other than
///    `InvalidData`, a timeout, or a type whose name contains `Transient`
/// 5. otherwise no
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultClassifier;

/// The stock rule set as a constant.
pub const DEFAULT_CLASSIFIER: DefaultClassifier = DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn is_non_recoverable(&self, error: &(dyn StdError + 'static)) -> bool {
        sources(error).any(is_fatal)
    }

    fn is_retryable(&self, error: &(dyn StdError + 'static)) -> bool {
        if self.is_non_recoverable(error) {
            return false;
        }
        if sources(error).any(is_security_failure) {
            return false;
        }
        if root_cause_label(error).contains("NonTransient") {
            return false;
        }
        sources(error).any(is_transient_like)
    }
}

/// [`DEFAULT_CLASSIFIER`]'s verdict on whether `error` is non-recoverable.
pub fn is_non_recoverable(error: &(dyn StdError + 'static)) -> bool {
    DEFAULT_CLASSIFIER.is_non_recoverable(error)
}

/// [`DEFAULT_CLASSIFIER`]'s verdict on whether `error` is retryable.
pub fn is_retryable(error: &(dyn StdError + 'static)) -> bool {
    DEFAULT_CLASSIFIER.is_retryable(error)
}

/// `error` followed by each of its sources.
///
/// An `io::Error` carrying a custom payload yields the payload next; its own
/// `source()` skips over it.
pub fn sources<'a>(
    error: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(error), |&e| next_link(e))
}

fn next_link<'a>(error: &'a (dyn StdError + 'static)) -> Option<&'a (dyn StdError + 'static)> {
    if let Some(inner) = error.downcast_ref::<io::Error>().and_then(io::Error::get_ref) {
        return Some(inner as &(dyn StdError + 'static));
    }
    error.source()
}

/// The last error of the `source()` chain.
pub fn root_cause<'a>(error: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    sources(error).last().unwrap_or(error)
}

/// The type name an error's `Debug` output starts with.
///
/// Derived `Debug` prints the struct or variant name first, so this is the
/// closest thing to a runtime type name a `dyn Error` offers. I/O errors are
/// labelled by kind (`io::ConnectionReset`) since their `Debug` output names
/// the internal representation instead. Message-only payloads have no label.
pub fn type_label(error: &(dyn StdError + 'static)) -> String {
    if let Some(io) = error.downcast_ref::<io::Error>() {
        return format!("io::{:?}", io.kind());
    }
    format!("{:?}", error)
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect()
}

/// The deepest non-empty [`type_label`] in the chain; the default backoff
/// key.
pub fn root_cause_label(error: &(dyn StdError + 'static)) -> String {
    sources(error)
        .map(type_label)
        .filter(|label| !label.is_empty())
        .last()
        .unwrap_or_default()
}

#[cfg(unix)]
const FD_EXHAUSTED: &[i32] = &[23, 24];
#[cfg(windows)]
const FD_EXHAUSTED: &[i32] = &[4];
#[cfg(not(any(unix, windows)))]
const FD_EXHAUSTED: &[i32] = &[];

fn is_fatal(error: &(dyn StdError + 'static)) -> bool {
    if error.is::<TryReserveError>() {
        return true;
    }
    if let Some(io) = error.downcast_ref::<io::Error>() {
        if io.kind() == io::ErrorKind::OutOfMemory {
            return true;
        }
        if io.raw_os_error().is_some_and(|code| FD_EXHAUSTED.contains(&code)) {
            return true;
        }
    }
    error.to_string().contains("Too many open files")
}

fn is_security_failure(error: &(dyn StdError + 'static)) -> bool {
    error
        .downcast_ref::<io::Error>()
        .is_some_and(|io| io.kind() == io::ErrorKind::PermissionDenied)
}

fn is_transient_like(error: &(dyn StdError + 'static)) -> bool {
    if let Some(io) = error.downcast_ref::<io::Error>() {
        return io.kind() != io::ErrorKind::InvalidData;
    }
    if error.is::<DeadlineExceeded>() {
        return true;
    }
    if matches!(
        error.downcast_ref::<RecvTimeoutError>(),
        Some(RecvTimeoutError::Timeout)
    ) {
        return true;
    }
    #[cfg(feature = "async")]
    if error.is::<tokio::time::error::Elapsed>() {
        return true;
    }
    let label = type_label(error);
    label.contains("Transient") && !label.contains("NonTransient")
}

#[cfg(test)]
mod classify_tests {
    use super::*;
    use crate::clock::{ClockReading, Deadline};

    #[derive(Debug)]
    struct TransientStoreError;

    impl fmt::Display for TransientStoreError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "store busy")
        }
    }

    impl StdError for TransientStoreError {}

    #[derive(Debug)]
    struct NonTransientStoreError;

    impl fmt::Display for NonTransientStoreError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "schema mismatch")
        }
    }

    impl StdError for NonTransientStoreError {}

    #[derive(Debug)]
    struct QueryFailed {
        source: Box<dyn StdError + Send + Sync>,
    }

    impl fmt::Display for QueryFailed {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "query failed")
        }
    }

    impl StdError for QueryFailed {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(self.source.as_ref())
        }
    }

    #[derive(Debug)]
    struct ParseError;

    impl fmt::Display for ParseError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "parse error")
        }
    }

    impl StdError for ParseError {}

    #[test]
    fn test_io_errors_are_retryable_except_invalid_data() {
        assert!(is_retryable(&io::Error::new(io::ErrorKind::TimedOut, "t")));
        assert!(is_retryable(&io::Error::new(io::ErrorKind::BrokenPipe, "p")));
        assert!(!is_retryable(&io::Error::new(io::ErrorKind::InvalidData, "d")));
    }

    #[test]
    fn test_permission_denied_is_not_retryable() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "handshake rejected");
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_transient_label_heuristic() {
        assert!(is_retryable(&TransientStoreError));
        assert!(!is_retryable(&NonTransientStoreError));
    }

    #[test]
    fn test_transient_anywhere_in_chain() {
        let err = QueryFailed {
            source: Box::new(TransientStoreError),
        };
        assert!(is_retryable(&err));
    }

    #[test]
    fn test_non_transient_root_cause_is_not_retryable() {
        let err = QueryFailed {
            source: Box::new(NonTransientStoreError),
        };
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_unknown_errors_are_not_retryable() {
        assert!(!is_retryable(&ParseError));
        assert!(!is_retryable(&QueryFailed {
            source: Box::new(ParseError)
        }));
    }

    #[test]
    fn test_timeouts_are_retryable() {
        let deadline = Deadline::at(ClockReading::from_nanos(1));
        assert!(is_retryable(&DeadlineExceeded::new(
            deadline,
            ClockReading::from_nanos(2)
        )));
        assert!(is_retryable(&RecvTimeoutError::Timeout));
        assert!(!is_retryable(&RecvTimeoutError::Disconnected));
    }

    #[test]
    fn test_non_recoverable() {
        let mut v: Vec<u8> = Vec::new();
        let alloc = v.try_reserve(usize::MAX).unwrap_err();
        assert!(is_non_recoverable(&alloc));
        assert!(!is_retryable(&alloc));

        let oom = io::Error::from(io::ErrorKind::OutOfMemory);
        assert!(is_non_recoverable(&oom));

        #[cfg(unix)]
        assert!(is_non_recoverable(&io::Error::from_raw_os_error(24)));

        let wrapped = QueryFailed {
            source: Box::new(io::Error::other("Too many open files")),
        };
        assert!(is_non_recoverable(&wrapped));
        assert!(!is_retryable(&wrapped));

        assert!(!is_non_recoverable(&ParseError));
    }

    #[test]
    fn test_wrapped_non_transient_is_not_retryable() {
        let err = io::Error::other(NonTransientStoreError);
        assert_eq!(root_cause_label(&err), "NonTransientStoreError");
        assert!(!is_retryable(&err));

        let nested = QueryFailed {
            source: Box::new(io::Error::new(
                io::ErrorKind::ConnectionReset,
                NonTransientStoreError,
            )),
        };
        assert!(!is_retryable(&nested));
    }

    #[test]
    fn test_wrapped_allocation_failure_is_non_recoverable() {
        let mut v: Vec<u8> = Vec::new();
        let alloc = v.try_reserve(usize::MAX).unwrap_err();
        let err = io::Error::other(alloc);
        assert!(is_non_recoverable(&err));
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_io_labels_name_the_kind() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        let bare = io::Error::from(io::ErrorKind::ConnectionReset);
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");

        assert_eq!(type_label(&reset), "io::ConnectionReset");
        assert_eq!(root_cause_label(&reset), "io::ConnectionReset");
        assert_eq!(root_cause_label(&bare), "io::ConnectionReset");
        assert_eq!(root_cause_label(&timed_out), "io::TimedOut");
        assert_eq!(sources(&reset).count(), 2);
    }

    #[test]
    fn test_type_label_and_root_cause() {
        let err = QueryFailed {
            source: Box::new(TransientStoreError),
        };
        assert_eq!(type_label(&err), "QueryFailed");
        assert_eq!(root_cause_label(&err), "TransientStoreError");
        assert_eq!(sources(&err).count(), 2);
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            DEFAULT_CLASSIFIER.classify(&TransientStoreError),
            Classification::Retry
        );
        assert_eq!(DEFAULT_CLASSIFIER.classify(&ParseError), Classification::Abort);
        assert!(Classification::RetryDelayed.is_retry());
        assert!(!Classification::Abort.is_retry());
    }
}
