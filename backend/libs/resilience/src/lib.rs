/// Resilience primitives for push gateway calls
///
/// This library provides the two patterns every gateway client in the workspace relies on:
/// - **Retry**: a linear backoff schedule for transient gateway statuses, cancellable mid-sleep
/// - **Timeout**: bounded waits for connects, closes and HTTP round-trips
///
/// # Example: retrying a gateway call
///
/// ```rust,no_run
/// use resilience::{with_retry, Attempt, RetryConfig};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let cancel = CancellationToken::new();
///     let result = with_retry(&RetryConfig::default(), &cancel, |_attempt| async {
///         // Issue the request and classify the response here
///         Err::<(), _>(Attempt::Abort("permanent failure"))
///     })
///     .await;
///     assert!(result.is_err());
/// }
/// ```

pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use retry::{with_retry, Attempt, RetryConfig, RetryError};
pub use timeout::{with_timeout, TimeoutError, GATEWAY_TIMEOUT};
