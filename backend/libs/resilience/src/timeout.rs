/// Timeout wrapper for gateway operations
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Overall bound for a single gateway round-trip and for graceful connection teardown
pub const GATEWAY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),
}

/// Execute a future with timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::Elapsed(duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_success() {
        let value = tokio_test::assert_ok!(with_timeout(Duration::from_secs(1), async { 42 }).await);
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapsed() {
        let result = with_timeout(GATEWAY_TIMEOUT, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            42
        })
        .await;

        assert!(matches!(result, Err(TimeoutError::Elapsed(d)) if d == GATEWAY_TIMEOUT));
    }
}
