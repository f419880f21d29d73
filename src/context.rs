//! Execution contexts with nested deadlines
//!
//! An [`ExecutionContext`] describes one unit of work: an optional name, the
//! time it started, the deadline it must finish by and a small map of
//! baggage. Contexts form a per-thread stack. Starting a context returns a
//! [`ContextGuard`]; dropping the guard pops the context again, so the
//! stack always unwinds in step with the code that built it.
//!
//! A nested context can never outlive its parent: its effective deadline is
//! the tighter of the requested deadline and the parent's.
//!
//! # Examples
//!
//! ```
//! use slackwater::clock::{self, Clock};
//! use slackwater::context::{self, ExecutionContext};
//! use std::time::Duration;
//!
//! let outer = ExecutionContext::start(clock::global().deadline_in(Duration::from_secs(1)));
//! {
//!     // Asking for more time than the parent has yields the parent's deadline.
//!     let inner = ExecutionContext::start(clock::global().deadline_in(Duration::from_secs(60)));
//!     assert_eq!(inner.deadline(), outer.deadline());
//!     assert!(context::millis_to_deadline() <= 1_000);
//! }
//! drop(outer);
//!
//! assert!(ExecutionContext::current().is_none());
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::{self, Clock, ClockReading, Deadline, ProcessClock};
use crate::retry::DeadlineExceeded;

type Baggage = HashMap<String, Arc<dyn Any + Send + Sync>>;

struct Node {
    name: Option<String>,
    parent: Option<ExecutionContext>,
    deadline: Deadline,
    start: ClockReading,
    clock: Arc<dyn Clock>,
    baggage: Mutex<Option<Baggage>>,
}

/// A shared handle to one unit of work's context.
///
/// Handles are cheap to clone and may be sent to other threads, for example
/// to continue work there with [`ExecutionContext::start_with_parent`].
#[derive(Clone)]
pub struct ExecutionContext {
    node: Arc<Node>,
}

thread_local! {
    static CURRENT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

impl ExecutionContext {
    /// Start a context under the current one and make it current.
    ///
    /// The effective deadline is `min(deadline, parent.deadline())`.
    pub fn start(deadline: Deadline) -> ContextGuard {
        Self::builder().deadline(deadline).start()
    }

    /// Start a context under an explicit `parent` and make it current.
    ///
    /// Used to hand work over to another thread while keeping the parent's
    /// deadline in force.
    pub fn start_with_parent(parent: &ExecutionContext, deadline: Deadline) -> ContextGuard {
        Self::builder().parent(parent.clone()).deadline(deadline).start()
    }

    /// Configure a context before starting it.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// The calling thread's current context.
    pub fn current() -> Option<ExecutionContext> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// The context's label, if any.
    pub fn name(&self) -> Option<&str> {
        self.node.name.as_deref()
    }

    /// The enclosing context, if any.
    pub fn parent(&self) -> Option<&ExecutionContext> {
        self.node.parent.as_ref()
    }

    /// The effective deadline, already tightened against the parent.
    pub fn deadline(&self) -> Deadline {
        self.node.deadline
    }

    /// The reading taken when the context started.
    pub fn start_time(&self) -> ClockReading {
        self.node.start
    }

    /// The clock deadlines of this context are measured on.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.node.clock
    }

    /// Time since the context started.
    pub fn elapsed(&self) -> Duration {
        self.node.clock.now().saturating_duration_since(self.node.start)
    }

    /// Time left until the deadline, zero once it passed.
    pub fn remaining(&self) -> Duration {
        self.node.clock.time_to(self.node.deadline)
    }

    /// Signed nanoseconds until the deadline; negative once it passed.
    pub fn nanos_to_deadline(&self) -> i64 {
        self.node
            .clock
            .now()
            .signed_nanos_until(self.node.deadline.reading())
    }

    /// Fail with [`DeadlineExceeded`] once the deadline passed.
    pub fn check_deadline(&self) -> Result<(), DeadlineExceeded> {
        self.node.deadline.check_at(self.node.clock.now())
    }

    /// Number of contexts from this one up to the root, inclusive.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut cursor = self.parent();
        while let Some(ctx) = cursor {
            depth += 1;
            cursor = ctx.parent();
        }
        depth
    }

    /// Attach a value to this context, returning the one it replaces.
    ///
    /// Baggage is private to the context: children see it through lookups
    /// but never copy it.
    pub fn put<V: Any + Send + Sync>(
        &self,
        key: impl Into<String>,
        value: V,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        let mut baggage = self
            .node
            .baggage
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        baggage
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), Arc::new(value))
    }

    /// Look up a value on this context, then on its ancestors.
    ///
    /// Returns `None` when no context has the key or the nearest value has a
    /// different type.
    pub fn get<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        let mut cursor = Some(self);
        while let Some(ctx) = cursor {
            let found = ctx
                .node
                .baggage
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .and_then(|map| map.get(key).cloned());
            if let Some(value) = found {
                return value.downcast::<V>().ok();
            }
            cursor = ctx.parent();
        }
        None
    }

    /// Remove a value from this context only.
    pub fn remove(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.node
            .baggage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(|map| map.remove(key))
    }

    /// Returns true if both handles refer to the same context.
    pub fn ptr_eq(&self, other: &ExecutionContext) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.node.name)
            .field("deadline", &self.node.deadline)
            .field("start", &self.node.start)
            .field("depth", &self.depth())
            .finish()
    }
}

/// Builder for [`ExecutionContext`].
#[derive(Debug, Default)]
pub struct ContextBuilder {
    name: Option<String>,
    parent: Option<ExecutionContext>,
    deadline: Option<Deadline>,
    clock: Option<Arc<dyn Clock>>,
}

impl ContextBuilder {
    /// Label the context.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Use `parent` instead of the thread's current context.
    pub fn parent(mut self, parent: ExecutionContext) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Requested deadline; defaults to [`Deadline::NEVER`].
    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Clock to measure the context on.
    ///
    /// Defaults to the parent's clock, or [`ProcessClock`] for a root.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Create the context and push it onto the calling thread's stack.
    pub fn start(self) -> ContextGuard {
        let parent = self.parent.or_else(ExecutionContext::current);
        let clock = self
            .clock
            .or_else(|| parent.as_ref().map(|p| p.node.clock.clone()))
            .unwrap_or_else(|| Arc::new(ProcessClock) as Arc<dyn Clock>);
        let requested = self.deadline.unwrap_or(Deadline::NEVER);
        let deadline = match &parent {
            Some(parent) => requested.min(parent.deadline()),
            None => requested,
        };
        let context = ExecutionContext {
            node: Arc::new(Node {
                name: self.name,
                start: clock.now(),
                parent,
                deadline,
                clock,
                baggage: Mutex::new(None),
            }),
        };
        let previous = CURRENT.with(|current| current.replace(Some(context.clone())));
        ContextGuard {
            context,
            previous,
            closed: false,
            _not_send: PhantomData,
        }
    }
}

/// Scoped ownership of the current context.
///
/// Closing (or dropping) the guard restores whatever context was current
/// when it was started. Guards must be released on the thread that created
/// them, so they are not `Send`.
#[must_use = "the context is popped as soon as the guard is dropped"]
pub struct ContextGuard {
    context: ExecutionContext,
    previous: Option<ExecutionContext>,
    closed: bool,
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    /// The context this guard owns.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Pop the context now instead of at end of scope.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let previous = self.previous.take();
        CURRENT.with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

impl std::ops::Deref for ContextGuard {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        &self.context
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("context", &self.context)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Deadline of the current context, or [`Deadline::NEVER`] without one.
pub fn current_deadline() -> Deadline {
    ExecutionContext::current()
        .map(|ctx| ctx.deadline())
        .unwrap_or(Deadline::NEVER)
}

/// Signed nanoseconds until the current context's deadline.
///
/// Without a current context the deadline is taken as `now + MAX`, which
/// saturates instead of overflowing.
pub fn nanos_to_deadline() -> i64 {
    match ExecutionContext::current() {
        Some(ctx) => ctx.nanos_to_deadline(),
        None => clock::now().signed_nanos_until(ClockReading::MAX),
    }
}

/// Milliseconds until the current context's deadline.
pub fn millis_to_deadline() -> i64 {
    nanos_to_deadline() / 1_000_000
}

/// Seconds until the current context's deadline.
pub fn seconds_to_deadline() -> i64 {
    nanos_to_deadline() / 1_000_000_000
}
