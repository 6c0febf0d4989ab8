/// Integration tests for resilience library
use resilience::{
    retry::{with_retry, Attempt, RetryConfig, RetryError},
    timeout::{with_timeout, TimeoutError},
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_default_schedule_three_backoffs() {
    let calls = Arc::new(AtomicU32::new(0));
    let started = Instant::now();

    let counter = calls.clone();
    let result = with_retry(&RetryConfig::default(), &CancellationToken::new(), |_| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(Attempt::Retry("status=503"))
            } else {
                Ok("sent")
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), "sent");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    // 7.5s + 10s + 12.5s
    assert_eq!(started.elapsed(), Duration::from_millis(30_000));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_attempts_are_retried() {
    let config = RetryConfig {
        max_retries: 2,
        base_delay: Duration::from_millis(100),
        step: Duration::from_millis(50),
    };
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let result = with_retry(&config, &CancellationToken::new(), |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            with_timeout(Duration::from_secs(15), tokio::time::sleep(Duration::from_secs(60)))
                .await
                .map_err(Attempt::Retry)
        }
    })
    .await;

    match result {
        Err(RetryError::MaxRetriesExceeded { retries, last }) => {
            assert_eq!(retries, 2);
            assert!(matches!(last, TimeoutError::Elapsed(_)));
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_from_another_task() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(6)).await;
        trigger.cancel();
    });

    let result = with_retry(&RetryConfig::default(), &cancel, |attempt| async move {
        Err::<(), _>(Attempt::Retry(format!("attempt {attempt}")))
    })
    .await;

    match result {
        Err(RetryError::Cancelled(last)) => assert_eq!(last, "attempt 0"),
        other => panic!("unexpected result {other:?}"),
    }
}
