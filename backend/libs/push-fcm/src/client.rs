use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use push_core::{PushError, PushMessage, WebGateway};
use resilience::{with_retry, Attempt, RetryConfig, GATEWAY_TIMEOUT};

use crate::errors::{describe_response, is_not_found};
use crate::jwt::JwtSigner;
use crate::models::{AndroidOptions, MessageBody, SendRequest, ServiceAccountKey};
use crate::token_cache::BearerTokenCache;

pub const DEFAULT_ENDPOINT: &str = "https://fcm.googleapis.com";

/// Seconds of validity a message needs left, by priority
const MIN_TTL_HIGH_PRIORITY: i64 = 2;
const MIN_TTL_NORMAL: i64 = 120;

#[derive(Debug, Clone)]
pub struct FcmV1Config {
    pub account: ServiceAccountKey,
    /// Base URL of the send API
    pub endpoint: String,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl FcmV1Config {
    pub fn new(account: ServiceAccountKey) -> Self {
        Self {
            account,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout: GATEWAY_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

/// Firebase Cloud Messaging HTTP v1 sender
pub struct FcmV1Gateway {
    config: FcmV1Config,
    client: Client,
    tokens: BearerTokenCache,
}

impl FcmV1Gateway {
    pub fn new(config: FcmV1Config) -> Result<Self, PushError> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PushError::Config(format!("failed to build HTTP client: {e}")))?;

        let signer = JwtSigner::new(&config.account)?;
        let tokens = BearerTokenCache::new(
            client.clone(),
            signer,
            config.account.token_uri.clone(),
            config.retry.clone(),
        );

        Ok(Self {
            config,
            client,
            tokens,
        })
    }

    pub fn tokens(&self) -> &BearerTokenCache {
        &self.tokens
    }

    fn send_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/messages:send",
            self.config.endpoint.trim_end_matches('/'),
            self.config.account.project_id
        )
    }

    async fn send_once(
        &self,
        message: &PushMessage,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<(), Attempt<PushError>> {
        let body = build_request(message, Utc::now()).map_err(Attempt::Abort)?;
        let authorization = self.tokens.get_token(cancel).await.map_err(Attempt::Abort)?;

        let request = self
            .client
            .post(self.send_url())
            .header(AUTHORIZATION, authorization)
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
        if status.is_success() {
            debug!(token = message.token_prefix(), attempt, "FCM accepted message");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND && is_not_found(&body) {
            debug!(token = message.token_prefix(), "FCM reports unknown device");
            return Err(Attempt::Abort(PushError::DeviceNotFound));
        }

        warn!(
            token = message.token_prefix(),
            status = status.as_u16(),
            attempt,
            "FCM rejected message"
        );

        let error = PushError::Service(format!(
            "FCM send failed: {}",
            describe_response(status, &body)
        ));
        match status {
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE => Err(Attempt::Retry(error)),
            _ => Err(Attempt::Abort(error)),
        }
    }
}

/// Whole seconds until `expire`, rounded to nearest
fn time_to_live_secs(expire: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    ((expire - now).num_milliseconds() + 500).div_euclid(1000)
}

/// Build the `messages:send` body
///
/// Data values must be strings: strings pass through, nulls are skipped, anything else is
/// sent as its JSON text.
pub fn build_request(message: &PushMessage, now: DateTime<Utc>) -> Result<SendRequest<'_>, PushError> {
    let ttl = time_to_live_secs(message.expire_time(), now);
    let min_ttl = if message.high_priority() {
        MIN_TTL_HIGH_PRIORITY
    } else {
        MIN_TTL_NORMAL
    };
    if ttl < min_ttl {
        return Err(PushError::Expired);
    }

    let data = message
        .payload()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Value::Null => return None,
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            Some((key.clone(), Value::String(value)))
        })
        .collect();

    Ok(SendRequest {
        message: MessageBody {
            token: message.device_token(),
            data,
            android: AndroidOptions {
                priority: if message.high_priority() {
                    "high"
                } else {
                    "normal"
                },
                ttl: format!("{ttl}s"),
            },
        },
        validate_only: false,
    })
}

#[async_trait]
impl WebGateway for FcmV1Gateway {
    fn name(&self) -> &str {
        "fcm"
    }

    async fn init(&self, cancel: &CancellationToken) -> Result<(), PushError> {
        self.tokens.get_token(cancel).await.map(|_| ())
    }

    async fn send(&self, message: &PushMessage, cancel: &CancellationToken) -> Result<(), PushError> {
        with_retry(&self.config.retry, cancel, move |attempt| {
            self.send_once(message, cancel, attempt)
        })
        .await
        .map_err(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(high_priority: bool, payload: Value) -> PushMessage {
        PushMessage::with_time_to_live(
            "fcm-registration-token",
            payload.as_object().cloned().unwrap(),
            high_priority,
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    #[test]
    fn test_request_shape() {
        let msg = message(true, json!({ "kind": "sync", "count": 3, "skip": null, "obj": { "a": 1 } }));
        let body = serde_json::to_value(build_request(&msg, Utc::now()).unwrap()).unwrap();

        assert_eq!(body["validate_only"], json!(false));
        assert_eq!(body["message"]["token"], "fcm-registration-token");
        assert_eq!(
            body["message"]["data"],
            json!({ "kind": "sync", "count": "3", "obj": "{\"a\":1}" })
        );
        assert_eq!(body["message"]["android"]["priority"], "high");
        let ttl = body["message"]["android"]["ttl"].as_str().unwrap();
        assert!(ttl == "3600s" || ttl == "3599s", "unexpected ttl {ttl}");
    }

    #[test]
    fn test_ttl_thresholds_depend_on_priority() {
        let now = Utc::now();
        let normal = message(false, json!({}));
        let high = message(true, json!({}));

        // 100 seconds left
        let later = normal.expire_time() - chrono::Duration::seconds(100);
        assert!(matches!(build_request(&normal, later), Err(PushError::Expired)));
        assert!(build_request(&high, high.expire_time() - chrono::Duration::seconds(100)).is_ok());

        // one second left
        let last_second = high.expire_time() - chrono::Duration::seconds(1);
        assert!(matches!(build_request(&high, last_second), Err(PushError::Expired)));
        assert!(build_request(&normal, now).is_ok());
    }

    #[test]
    fn test_time_to_live_rounds_to_nearest_second() {
        let now = Utc::now();
        assert_eq!(time_to_live_secs(now + chrono::Duration::milliseconds(1499), now), 1);
        assert_eq!(time_to_live_secs(now + chrono::Duration::milliseconds(1500), now), 2);
    }
}
