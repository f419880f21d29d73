//! Integration tests for the async retry loop on tokio.
#![cfg(feature = "async")]

use slackwater::clock::{self, Deadline};
use slackwater::retry::{
    transient_errors, DeadlineBound, Decision, FibonacciBackoff, Jitter, NoRetry, Retrier,
};
use slackwater::testing::ScriptedOperation;
use slackwater::{assert_failed, assert_interrupted, assert_timed_out};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Scripted = ScriptedOperation<u32, &'static str>;

/// Retry every failure after `ms` milliseconds.
fn wait(ms: u64) -> impl FnMut(&&'static str, &mut Scripted) -> Decision<&'static str> {
    move |_, _| Decision::retry_after(Duration::from_millis(ms))
}

#[tokio::test]
async fn scripted_failures_then_success() {
    let op = ScriptedOperation::new(Deadline::NEVER, Err("warming up"))
        .then(Err("still warming"))
        .then(Ok(7));
    let calls = op.counter();

    let value = Retrier::new()
        .execute_async(op, wait(2), NoRetry)
        .await
        .unwrap();

    assert_eq!(value, 7);
    assert_eq!(calls.get(), 3);
}

#[tokio::test]
async fn async_closure_with_transient_errors() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let op = DeadlineBound::new(
        clock::global().deadline_in(Duration::from_secs(5)),
        move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::task::yield_now().await;
                if n < 4 {
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
                } else {
                    Ok(n)
                }
            }
        },
    );
    let backoff = transient_errors::<io::Error>()
        .immediate_retries(1)
        .min_delay(1)
        .max_delay(4)
        .build()
        .unwrap();

    let value = Retrier::new()
        .execute_async(op, backoff, NoRetry)
        .await
        .unwrap();

    assert_eq!(value, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn non_retryable_error_fails_fast() {
    let op = DeadlineBound::new(Deadline::NEVER, || async {
        Err::<(), _>(io::Error::new(io::ErrorKind::InvalidData, "truncated frame"))
    });
    let backoff = transient_errors::<io::Error>().build().unwrap();

    let result = Retrier::new().execute_async(op, backoff, NoRetry).await;

    match result {
        Err(err) => {
            assert!(err.is_failed());
            assert_eq!(
                err.error().map(io::Error::kind),
                Some(io::ErrorKind::InvalidData)
            );
        }
        Ok(()) => panic!("expected failure"),
    }
}

#[tokio::test]
async fn deadline_ends_async_loop() {
    let deadline = clock::global().deadline_in(Duration::from_millis(60));
    let op = ScriptedOperation::<u32, &str>::new(deadline, Err("unavailable"));
    let calls = op.counter();
    let backoff = FibonacciBackoff::<&str>::builder()
        .immediate_retries(0)
        .min_delay(5)
        .max_delay(20)
        .jitter(Jitter::None)
        .build()
        .unwrap();

    let start = Instant::now();
    let result = Retrier::new().execute_async(op, backoff, NoRetry).await;

    assert_timed_out!(result);
    assert!(calls.get() > 1);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancel_token_interrupts_sleep() {
    let retrier = Retrier::new().named("poll-queue");
    let token = retrier.cancel_token().unwrap().clone();
    let op = ScriptedOperation::<u32, &str>::new(Deadline::NEVER, Err("empty"));

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let start = Instant::now();
    let result = retrier.execute_async(op, wait(60_000), NoRetry).await;
    canceller.await.unwrap();

    assert_interrupted!(result);
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn non_interruptible_loop_ignores_cancel() {
    let retrier = Retrier::new().non_interruptible();
    assert!(retrier.cancel_token().is_none());

    let op = ScriptedOperation::new(Deadline::NEVER, Err("flaky")).then(Ok(1));
    let value = retrier.execute_async(op, wait(1), NoRetry).await.unwrap();
    assert_eq!(value, 1);
}

#[tokio::test]
async fn no_retry_returns_first_failure() {
    let op = ScriptedOperation::<u32, &str>::new(Deadline::NEVER, Err("refused"));
    let calls = op.counter();

    assert_failed!(
        Retrier::new().execute_async(op, NoRetry, NoRetry).await,
        "refused"
    );
    assert_eq!(calls.get(), 1);
}

#[test]
fn runs_on_a_blocking_caller() {
    let op = ScriptedOperation::new(Deadline::NEVER, Err("cold cache")).then(Ok(42));

    let result = tokio_test::block_on(Retrier::new().execute_async(op, wait(1), NoRetry));

    tokio_test::assert_ok!(result);
}
