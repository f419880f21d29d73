//! Immutable error chains.
//!
//! An [`ErrorChain`] is an error plus its retry history: an explicit cause
//! chain and a list of suppressed errors from earlier attempts. Chains are
//! values. [`ErrorChain::suppress`] and [`ErrorChain::chain`] return new
//! chains and never touch the one they were called on, so a chain handed to
//! another part of the program cannot change under it. Unchanged parts are
//! shared between old and new chains.
//!
//! # Examples
//!
//! ```rust
//! use slackwater::retry::ErrorChain;
//!
//! let first = ErrorChain::new("connection reset");
//! let second = ErrorChain::new("connection refused").suppress(first.clone(), 10);
//!
//! assert_eq!(second.suppressed().len(), 1);
//! assert_eq!(*second.suppressed()[0].error(), "connection reset");
//! assert!(first.suppressed().is_empty());
//! ```

use std::fmt;
use std::sync::Arc;

struct Link<E> {
    error: Arc<E>,
    cause: Option<ErrorChain<E>>,
    suppressed: Vec<ErrorChain<E>>,
    trimmed_suppressed: usize,
    trimmed_causes: usize,
}

/// An error with an explicit cause chain and suppressed history.
pub struct ErrorChain<E> {
    node: Arc<Link<E>>,
}

impl<E> Clone for ErrorChain<E> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<E> ErrorChain<E> {
    /// Wrap an error with no cause and no suppressed errors.
    pub fn new(error: E) -> Self {
        Self {
            node: Arc::new(Link {
                error: Arc::new(error),
                cause: None,
                suppressed: Vec::new(),
                trimmed_suppressed: 0,
                trimmed_causes: 0,
            }),
        }
    }

    /// A copy of this chain with `cause` as its direct cause.
    pub fn with_cause(&self, cause: ErrorChain<E>) -> Self {
        self.relink(Some(cause), 0)
    }

    /// The error at the head of the chain.
    pub fn error(&self) -> &E {
        &self.node.error
    }

    /// The direct cause, if any.
    pub fn cause(&self) -> Option<&ErrorChain<E>> {
        self.node.cause.as_ref()
    }

    /// Errors suppressed by this one, oldest first.
    pub fn suppressed(&self) -> &[ErrorChain<E>] {
        &self.node.suppressed
    }

    /// Number of suppressed errors dropped from this link to respect a limit.
    pub fn trimmed_suppressed(&self) -> usize {
        self.node.trimmed_suppressed
    }

    /// Number of cause links dropped below this link to respect a limit.
    pub fn trimmed_causes(&self) -> usize {
        self.node.trimmed_causes
    }

    /// This link followed by each cause, down to the root.
    pub fn causes(&self) -> impl Iterator<Item = &ErrorChain<E>> {
        std::iter::successors(Some(self), |&link| link.cause())
    }

    /// The errors of [`ErrorChain::causes`].
    pub fn errors(&self) -> impl Iterator<Item = &E> {
        self.causes().map(|link| link.error())
    }

    /// The last link of the cause chain.
    pub fn root(&self) -> &ErrorChain<E> {
        let mut link = self;
        while let Some(cause) = link.cause() {
            link = cause;
        }
        link
    }

    /// Number of links in the cause chain, including this one.
    pub fn chain_len(&self) -> usize {
        self.causes().count()
    }

    /// Total suppressed errors attached anywhere below this link, counting
    /// nested suppression.
    pub fn suppressed_total(&self) -> usize {
        self.node
            .suppressed
            .iter()
            .map(|s| 1 + s.suppressed_total())
            .sum()
    }

    /// Returns true if both chains are the same value, not just equal.
    pub fn ptr_eq(&self, other: &ErrorChain<E>) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// A new chain with `other` added to the suppressed errors.
    ///
    /// When the total nested suppressed count would exceed `max_suppressed`
    /// the oldest entries are dropped first, descending into an entry's own
    /// suppressed list when dropping it whole would remove too much.
    pub fn suppress(&self, other: ErrorChain<E>, max_suppressed: usize) -> Self {
        let mut suppressed = self.node.suppressed.clone();
        suppressed.push(other);
        let total: usize = suppressed.iter().map(|s| 1 + s.suppressed_total()).sum();
        let mut trimmed = self.node.trimmed_suppressed;
        if total > max_suppressed {
            trimmed += trim_oldest(&mut suppressed, total - max_suppressed);
        }
        self.resuppress(suppressed, trimmed)
    }

    /// A new chain whose root cause is followed by `new_root`'s chain.
    ///
    /// At most `max_chained` links are kept in total; when `new_root`'s chain
    /// does not fit it is cut short and the last kept link records how many
    /// links were dropped.
    pub fn chain(&self, new_root: &ErrorChain<E>, max_chained: usize) -> Self {
        let own: Vec<&ErrorChain<E>> = self.causes().collect();
        let keep = max_chained.saturating_sub(own.len());
        let appended = new_root.prefix(keep);
        let mut rebuilt = appended;
        let last = own.len() - 1;
        for (i, link) in own.iter().enumerate().rev() {
            let mut trimmed = link.node.trimmed_causes;
            if i == last && rebuilt.is_none() {
                trimmed += new_root.chain_len();
            }
            rebuilt = Some(link.relink(rebuilt, trimmed));
        }
        rebuilt.unwrap_or_else(|| self.clone())
    }

    /// The first `keep` links of this chain, marking the cut.
    fn prefix(&self, keep: usize) -> Option<Self> {
        if keep == 0 {
            return None;
        }
        let links: Vec<&ErrorChain<E>> = self.causes().take(keep).collect();
        let dropped = self.chain_len() - links.len();
        let last = links.len() - 1;
        let mut rebuilt = None;
        for (i, link) in links.iter().enumerate().rev() {
            let mut trimmed = link.node.trimmed_causes;
            if i == last {
                trimmed += dropped;
            }
            rebuilt = Some(link.relink(rebuilt, trimmed));
        }
        rebuilt
    }

    fn relink(&self, cause: Option<ErrorChain<E>>, trimmed_causes: usize) -> Self {
        Self {
            node: Arc::new(Link {
                error: Arc::clone(&self.node.error),
                cause,
                suppressed: self.node.suppressed.clone(),
                trimmed_suppressed: self.node.trimmed_suppressed,
                trimmed_causes,
            }),
        }
    }

    fn resuppress(&self, suppressed: Vec<ErrorChain<E>>, trimmed_suppressed: usize) -> Self {
        Self {
            node: Arc::new(Link {
                error: Arc::clone(&self.node.error),
                cause: self.node.cause.clone(),
                suppressed,
                trimmed_suppressed,
                trimmed_causes: self.node.trimmed_causes,
            }),
        }
    }
}

impl<E: Clone> ErrorChain<E> {
    /// Extract the head error, discarding the chain.
    pub fn into_error(self) -> E {
        let error = Arc::clone(&self.node.error);
        drop(self);
        Arc::unwrap_or_clone(error)
    }
}

/// Drop `excess` suppressed entries, oldest first. Returns the number dropped.
fn trim_oldest<E>(list: &mut Vec<ErrorChain<E>>, mut excess: usize) -> usize {
    let mut dropped = 0;
    while excess > 0 && !list.is_empty() {
        let weight = 1 + list[0].suppressed_total();
        if weight <= excess {
            list.remove(0);
            excess -= weight;
            dropped += weight;
        } else {
            let oldest = &list[0];
            let mut inner = oldest.node.suppressed.clone();
            let removed = trim_oldest(&mut inner, excess);
            list[0] = oldest.resuppress(inner, oldest.node.trimmed_suppressed + removed);
            excess -= removed;
            dropped += removed;
        }
    }
    dropped
}

impl<E> From<E> for ErrorChain<E> {
    fn from(error: E) -> Self {
        ErrorChain::new(error)
    }
}

impl<E: fmt::Debug> fmt::Debug for ErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ErrorChain");
        s.field("error", &self.node.error);
        if let Some(cause) = &self.node.cause {
            s.field("cause", cause);
        }
        if !self.node.suppressed.is_empty() {
            s.field("suppressed", &self.node.suppressed);
        }
        if self.node.trimmed_suppressed > 0 {
            s.field("trimmed_suppressed", &self.node.trimmed_suppressed);
        }
        if self.node.trimmed_causes > 0 {
            s.field("trimmed_causes", &self.node.trimmed_causes);
        }
        s.finish()
    }
}

impl<E: fmt::Display> fmt::Display for ErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node.error)?;
        for cause in self.causes().skip(1) {
            write!(f, "\n  caused by: {}", cause.error())?;
        }
        let root = self.root();
        if root.trimmed_causes() > 0 {
            write!(f, "\n  ... {} more causes trimmed", root.trimmed_causes())?;
        }
        for suppressed in self.suppressed() {
            write!(f, "\n  suppressed: {}", suppressed.error())?;
        }
        if self.trimmed_suppressed() > 0 {
            write!(
                f,
                "\n  ... {} suppressed trimmed",
                self.trimmed_suppressed()
            )?;
        }
        Ok(())
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ErrorChain<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.node.cause {
            Some(cause) => Some(cause),
            None => std::error::Error::source(&*self.node.error),
        }
    }
}

#[cfg(test)]
mod chain_tests {
    use super::*;

    fn nested(depth: usize) -> ErrorChain<String> {
        let mut chain = ErrorChain::new(format!("e{}", depth));
        for i in (0..depth).rev() {
            chain = ErrorChain::new(format!("e{}", i)).suppress(chain, usize::MAX);
        }
        chain
    }

    fn causal(names: &[&'static str]) -> ErrorChain<&'static str> {
        let mut iter = names.iter().rev();
        let mut chain = ErrorChain::new(*iter.next().unwrap());
        for name in iter {
            chain = ErrorChain::new(*name).with_cause(chain);
        }
        chain
    }

    #[test]
    fn test_suppress_does_not_mutate() {
        let original = ErrorChain::new("primary").suppress(ErrorChain::new("old"), 10);
        let updated = original.suppress(ErrorChain::new("new"), 10);

        assert_eq!(original.suppressed().len(), 1);
        assert_eq!(updated.suppressed().len(), 2);
        assert_eq!(*updated.suppressed()[1].error(), "new");
        assert!(!original.ptr_eq(&updated));
    }

    #[test]
    fn test_suppress_trims_oldest_first() {
        let mut chain = ErrorChain::new(0);
        for i in 1..=5 {
            chain = chain.suppress(ErrorChain::new(i), 3);
        }
        let kept: Vec<i32> = chain.suppressed().iter().map(|s| *s.error()).collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert_eq!(chain.trimmed_suppressed(), 2);
        assert_eq!(chain.suppressed_total(), 3);
    }

    #[test]
    fn test_suppress_trims_inside_nested_entry() {
        // e0 suppresses e1 which suppresses e2 ... e4: four nested entries.
        let deep = nested(4);
        assert_eq!(deep.suppressed_total(), 4);

        let head = ErrorChain::new("head".to_string()).suppress(deep, 3);
        assert_eq!(head.suppressed_total(), 3);
        assert_eq!(head.suppressed()[0].error(), "e0");
    }

    #[test]
    fn test_suppress_with_nested_history_respects_limit() {
        let mut chain = ErrorChain::new(0u32);
        for i in 1..50 {
            chain = ErrorChain::new(i).suppress(chain, 7);
            assert!(chain.suppressed_total() <= 7);
        }
        assert_eq!(*chain.error(), 49);
        assert_eq!(*chain.suppressed()[0].error(), 48);
    }

    #[test]
    fn test_chain_appends_to_root() {
        let target = causal(&["a", "b"]);
        let extra = causal(&["x", "y"]);
        let chained = target.chain(&extra, 10);

        let errors: Vec<&str> = chained.errors().copied().collect();
        assert_eq!(errors, vec!["a", "b", "x", "y"]);
        assert_eq!(target.chain_len(), 2);
        assert_eq!(chained.root().trimmed_causes(), 0);
    }

    #[test]
    fn test_chain_trims_new_root() {
        let target = causal(&["a", "b"]);
        let extra = causal(&["x", "y", "z"]);
        let chained = target.chain(&extra, 3);

        let errors: Vec<&str> = chained.errors().copied().collect();
        assert_eq!(errors, vec!["a", "b", "x"]);
        assert_eq!(chained.root().trimmed_causes(), 2);
        assert!(format!("{}", chained).contains("2 more causes trimmed"));
    }

    #[test]
    fn test_chain_with_no_room() {
        let target = causal(&["a", "b"]);
        let chained = target.chain(&causal(&["x"]), 2);
        assert_eq!(chained.chain_len(), 2);
        assert_eq!(chained.root().trimmed_causes(), 1);
    }

    #[test]
    fn test_chain_keeps_suppressed() {
        let target = ErrorChain::new("a").suppress(ErrorChain::new("s"), 5);
        let chained = target.chain(&ErrorChain::new("x"), 5);
        assert_eq!(chained.suppressed().len(), 1);
        assert_eq!(*chained.cause().unwrap().error(), "x");
        assert!(target.cause().is_none());
    }

    #[test]
    fn test_error_source_follows_explicit_cause() {
        use std::error::Error;
        use std::io;

        let cause = ErrorChain::new(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        let head = ErrorChain::new(io::Error::new(io::ErrorKind::Other, "wrapper")).with_cause(cause);

        let source = head.source().expect("explicit cause");
        assert_eq!(source.to_string(), "slow");
    }

    #[test]
    fn test_into_error() {
        let chain = ErrorChain::new("only".to_string());
        let shared = chain.clone();
        assert_eq!(chain.into_error(), "only");
        assert_eq!(shared.into_error(), "only");
    }

    #[test]
    fn test_display() {
        let chain = ErrorChain::new("head").suppress(ErrorChain::new("older"), 5);
        let output = format!("{}", chain);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines, vec!["head", "  suppressed: older"]);
    }
}
