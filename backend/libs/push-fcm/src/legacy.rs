use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use push_core::{PushError, PushMessage, WebGateway};
use resilience::{with_retry, Attempt, RetryConfig, GATEWAY_TIMEOUT};

use crate::client::DEFAULT_ENDPOINT;
use crate::models::{LegacyRequest, LegacyResponse};

const MIN_TIME_TO_LIVE_SECS: i64 = 60;

#[derive(Clone)]
pub struct FcmLegacyConfig {
    pub endpoint: String,
    pub server_key: String,
    pub sender_id: String,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl FcmLegacyConfig {
    pub fn new(server_key: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            server_key: server_key.into(),
            sender_id: sender_id.into(),
            request_timeout: GATEWAY_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

impl std::fmt::Debug for FcmLegacyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcmLegacyConfig")
            .field("endpoint", &self.endpoint)
            .field("sender_id", &self.sender_id)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Sender for the legacy `fcm/send` API
pub struct FcmLegacyGateway {
    config: FcmLegacyConfig,
    client: Client,
}

impl FcmLegacyGateway {
    pub fn new(config: FcmLegacyConfig) -> Result<Self, PushError> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PushError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    async fn send_once(
        &self,
        message: &PushMessage,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<(), Attempt<PushError>> {
        let time_to_live = (message.expire_time() - Utc::now()).num_seconds();
        if time_to_live < MIN_TIME_TO_LIVE_SECS {
            return Err(Attempt::Abort(PushError::Expired));
        }

        let body = LegacyRequest {
            to: message.device_token(),
            time_to_live,
            priority: message.high_priority().then_some("high"),
            data: message.payload(),
        };

        let request = self
            .client
            .post(format!("{}/fcm/send", self.config.endpoint.trim_end_matches('/')))
            .header(AUTHORIZATION, format!("key={}", self.config.server_key))
            .header("Sender", format!("id={}", self.config.sender_id))
            .json(&body);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Attempt::Abort(PushError::Cancelled)),
            response = request.send() => response,
        };
        let response = response.map_err(|e| {
            Attempt::Abort(if e.is_timeout() {
                PushError::Timeout(format!("FCM request timed out: {e}"))
            } else {
                PushError::Connection(format!("FCM request failed: {e}"))
            })
        })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status != StatusCode::OK {
            warn!(
                token = message.token_prefix(),
                status = status.as_u16(),
                attempt,
                "FCM server rejected request"
            );
            let error = PushError::Service(format!("FCM server returns status={}", status.as_u16()));
            return match status {
                StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE => Err(Attempt::Retry(error)),
                _ => Err(Attempt::Abort(error)),
            };
        }

        let result: LegacyResponse = serde_json::from_str(&text).map_err(|e| {
            Attempt::Abort(PushError::Service(format!("invalid FCM response: {e}")))
        })?;

        match classify_result(message, &result, &text) {
            None => {
                debug!(token = message.token_prefix(), attempt, "FCM accepted message");
                Ok(())
            }
            Some(error) => Err(Attempt::Abort(error)),
        }
    }
}

/// Interpret a 200 response; `None` means delivered
fn classify_result(message: &PushMessage, result: &LegacyResponse, raw: &str) -> Option<PushError> {
    if result.failure == 0 && result.canonical_ids == 0 {
        return None;
    }

    if let [single] = result.results.as_slice() {
        if let Some(error) = &single.error {
            return Some(match error.as_str() {
                "NotRegistered" | "MismatchSenderId" => PushError::DeviceNotFound,
                other => PushError::Service(format!(
                    "submit notification to '{}' failed error '{}'",
                    message.token_prefix(),
                    other
                )),
            });
        }
    }

    Some(PushError::Service(format!(
        "submit notification to '{}' failed: {}",
        message.token_prefix(),
        raw
    )))
}

#[async_trait]
impl WebGateway for FcmLegacyGateway {
    fn name(&self) -> &str {
        "fcm-legacy"
    }

    async fn send(&self, message: &PushMessage, cancel: &CancellationToken) -> Result<(), PushError> {
        with_retry(&self.config.retry, cancel, move |attempt| {
            self.send_once(message, cancel, attempt)
        })
        .await
        .map_err(|e| e.into_inner())
    }
}
