//! Integration tests for execution contexts driving retry loops.
//!
//! These tests check that deadlines set on a context flow into operations
//! built with `DeadlineBound::from_context`, including across threads.

use slackwater::clock::{Clock, ClockReading, Deadline};
use slackwater::context::{self, ExecutionContext};
use slackwater::retry::{
    Classification, Classified, DeadlineBound, HasDeadline, NoRetry, Retrier, RetryError,
};
use slackwater::testing::{ManualClock, RecordingSleeper};
use slackwater::{assert_failed, assert_timed_out};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(ClockReading::from_nanos(1_000_000)))
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

// ============================================================================
// Context stack
// ============================================================================

#[test]
fn nested_contexts_only_tighten() {
    let clock = manual_clock();
    let outer = ExecutionContext::builder()
        .name("request")
        .clock(clock.clone())
        .deadline(clock.deadline_in(ms(100)))
        .start();

    let loose = ExecutionContext::start(clock.deadline_in(ms(500)));
    assert_eq!(loose.deadline(), outer.deadline());
    assert_eq!(loose.depth(), 2);

    let tight = ExecutionContext::start(clock.deadline_in(ms(10)));
    assert!(tight.deadline() < outer.deadline());
    assert_eq!(context::current_deadline(), tight.deadline());
    assert_eq!(context::millis_to_deadline(), 10);

    drop(tight);
    assert_eq!(context::current_deadline(), outer.deadline());
    drop(loose);
    drop(outer);
    assert_eq!(context::current_deadline(), Deadline::NEVER);
}

#[test]
fn guard_restores_the_context_it_replaced() {
    let clock = manual_clock();
    let a = ExecutionContext::builder().name("a").clock(clock).start();
    let b = ExecutionContext::builder().name("b").start();
    let c = ExecutionContext::builder()
        .name("c")
        .parent(a.context().clone())
        .start();

    // `c` was started while `b` was current, so closing it returns to `b`
    // even though its parent is `a`.
    assert_eq!(c.parent().and_then(|p| p.name()), Some("a"));
    c.close();
    let current = ExecutionContext::current().unwrap();
    assert!(current.ptr_eq(&b));

    b.close();
    assert!(ExecutionContext::current().unwrap().ptr_eq(&a));
}

#[test]
fn contexts_are_per_thread() {
    let _outer = ExecutionContext::builder().name("main").start();

    let seen = thread::spawn(|| ExecutionContext::current().is_none())
        .join()
        .unwrap();

    assert!(seen);
    assert_eq!(ExecutionContext::current().unwrap().name(), Some("main"));
}

#[test]
fn baggage_is_visible_to_children_on_other_threads() {
    let clock = manual_clock();
    let root = ExecutionContext::builder()
        .clock(clock.clone())
        .deadline(clock.deadline_in(ms(50)))
        .start();
    root.put("tenant", String::from("acme"));
    let handoff = root.context().clone();

    let (tenant, deadline) = thread::spawn(move || {
        let child = ExecutionContext::start_with_parent(&handoff, Deadline::NEVER);
        let tenant = child.get::<String>("tenant").map(|t| t.as_str().to_owned());
        (tenant, child.deadline())
    })
    .join()
    .unwrap();

    assert_eq!(tenant.as_deref(), Some("acme"));
    assert_eq!(deadline, root.deadline());
}

// ============================================================================
// Contexts bounding retries
// ============================================================================

#[test]
fn context_deadline_stops_retry_loop() {
    let clock = manual_clock();
    let sleeper = RecordingSleeper::advancing(clock.clone());
    let _ctx = ExecutionContext::builder()
        .clock(clock.clone())
        .deadline(clock.deadline_in(ms(25)))
        .start();

    let op = DeadlineBound::from_context(|| Err::<(), _>("busy"));
    let policy = Classified::new(|_: &&str| Classification::Retry)
        .with_delay(ms(10))
        .with_clock(clock.clone());

    let result = Retrier::new()
        .with_sleeper(sleeper.clone())
        .execute(op, policy, NoRetry);

    assert_timed_out!(&result);
    assert_eq!(sleeper.delays(), vec![ms(10), ms(10)]);
    if let Err(RetryError::TimedOut { history, .. }) = result {
        assert_eq!(history.map(|h| h.suppressed_total()), Some(2));
    }
}

#[test]
fn worker_thread_inherits_deadline_for_retries() {
    let clock = manual_clock();
    let root = ExecutionContext::builder()
        .clock(clock.clone())
        .deadline(clock.deadline_in(ms(40)))
        .start();
    let handoff = root.context().clone();
    let expected = root.deadline();

    let observed = thread::spawn(move || {
        let _child = ExecutionContext::start_with_parent(&handoff, Deadline::NEVER);
        let op = DeadlineBound::from_context(|| Err::<(), _>("refused"));
        let deadline = op.deadline();
        let result = Retrier::new().execute(op, NoRetry, NoRetry);
        assert_failed!(result, "refused");
        deadline
    })
    .join()
    .unwrap();

    assert_eq!(observed, expected);
}
