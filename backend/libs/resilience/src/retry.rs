/// Retry policy with linear backoff for transient gateway failures
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,
    /// Fixed part of every backoff delay
    pub base_delay: Duration,
    /// Added once per attempt on top of `base_delay`
    pub step: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(5000),
            step: Duration::from_millis(2500),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): `base_delay + attempt * step`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay + self.step * attempt
    }
}

/// How the caller judged one failed attempt
#[derive(Debug)]
pub enum Attempt<E> {
    /// Transient failure, worth another try after backing off
    Retry(E),
    /// Permanent failure, surfaced immediately
    Abort(E),
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Max retries ({retries}) exceeded: {last}")]
    MaxRetriesExceeded { retries: u32, last: E },
    #[error("Operation failed: {0}")]
    OperationFailed(E),
    #[error("Retry cancelled: {0}")]
    Cancelled(E),
}

impl<E> RetryError<E> {
    /// The last failure observed, whatever stopped the loop
    pub fn into_inner(self) -> E {
        match self {
            RetryError::MaxRetriesExceeded { last, .. } => last,
            RetryError::OperationFailed(e) => e,
            RetryError::Cancelled(e) => e,
        }
    }
}

/// Execute an attempt factory until it succeeds, aborts, runs out of retries or is cancelled
///
/// `f` receives the retry number (0 for the first call) so callers can rebuild their request
/// from scratch on every attempt. A cancellation while sleeping stops the loop and returns the
/// last failure instead of trying again.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
    E: Display,
{
    let mut attempt = 0;

    loop {
        match f(attempt).await {
            Ok(result) => return Ok(result),
            Err(Attempt::Abort(e)) => return Err(RetryError::OperationFailed(e)),
            Err(Attempt::Retry(e)) => {
                if attempt >= config.max_retries {
                    warn!("Max retries ({}) reached: {}", config.max_retries, e);
                    return Err(RetryError::MaxRetriesExceeded {
                        retries: config.max_retries,
                        last: e,
                    });
                }

                attempt += 1;
                let delay = config.delay_for(attempt);

                warn!(
                    "Retry attempt {}/{} after transient failure ({}), waiting {:?}",
                    attempt, config.max_retries, e, delay
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled(e)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_default_schedule() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_millis(7500));
        assert_eq!(config.delay_for(2), Duration::from_millis(10000));
        assert_eq!(config.delay_for(3), Duration::from_millis(12500));
    }

    #[tokio::test]
    async fn test_retry_success_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&RetryConfig::default(), &CancellationToken::new(), move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Attempt<String>>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let start = Instant::now();

        let result = with_retry(&RetryConfig::default(), &CancellationToken::new(), move |_| {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 3 {
                    Err(Attempt::Retry("503"))
                } else {
                    Ok(count)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        // 7.5s + 10s + 12.5s
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_max_retries_exceeded() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&RetryConfig::default(), &CancellationToken::new(), move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(Attempt::Retry("persistent error")) }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::MaxRetriesExceeded { retries: 3, last: "persistent error" })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 4); // Initial + 3 retries
    }

    #[tokio::test]
    async fn test_abort_is_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&RetryConfig::default(), &CancellationToken::new(), move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(Attempt::Abort("gone")) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::OperationFailed("gone"))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_returns_last_failure() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel_clone.cancel();
        });

        let result = with_retry(&RetryConfig::default(), &cancel, move |attempt| {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(Attempt::Retry(format!("failure #{attempt}"))) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().into_inner(), "failure #0");
    }
}
