use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Identity, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use push_core::{PushError, PushMessage, WebGateway};
use resilience::{with_retry, Attempt, RetryConfig, GATEWAY_TIMEOUT};

use crate::config::{PRODUCTION_HTTP_SERVER, SANDBOX_HTTP_SERVER};

pub const PUSH_TYPE_ALERT: &str = "alert";
pub const PUSH_TYPE_BACKGROUND: &str = "background";

/// APNs HTTP/2 provider API configuration
#[derive(Clone)]
pub struct ApnsHttpConfig {
    /// Base URL, e.g. `https://api.push.apple.com`
    pub server: String,
    /// Sent as `apns-topic`
    pub bundle_id: String,
    /// Sent as `apns-push-type`
    pub push_type: String,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    /// PEM with the client certificate and its private key
    pub identity_pem: Option<Vec<u8>>,
}

impl ApnsHttpConfig {
    pub fn new(bundle_id: impl Into<String>) -> Self {
        Self {
            server: PRODUCTION_HTTP_SERVER.to_string(),
            bundle_id: bundle_id.into(),
            push_type: PUSH_TYPE_BACKGROUND.to_string(),
            request_timeout: GATEWAY_TIMEOUT,
            retry: RetryConfig::default(),
            identity_pem: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.server = if sandbox {
            SANDBOX_HTTP_SERVER
        } else {
            PRODUCTION_HTTP_SERVER
        }
        .to_string();
        self
    }

    pub fn with_identity_pem(mut self, pem: Vec<u8>) -> Self {
        self.identity_pem = Some(pem);
        self
    }
}

impl std::fmt::Debug for ApnsHttpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApnsHttpConfig")
            .field("server", &self.server)
            .field("bundle_id", &self.bundle_id)
            .field("push_type", &self.push_type)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .field("identity", &self.identity_pem.is_some())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    reason: Option<String>,
}

/// Stateless sender for the APNs HTTP/2 API
pub struct ApnsHttpGateway {
    config: ApnsHttpConfig,
    client: Client,
}

impl ApnsHttpGateway {
    pub fn new(config: ApnsHttpConfig) -> Result<Self, PushError> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout);

        if let Some(pem) = &config.identity_pem {
            let identity = Identity::from_pem(pem)
                .map_err(|e| PushError::Config(format!("invalid APNs client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| PushError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn priority(&self, message: &PushMessage) -> &'static str {
        // Apple rejects priority 10 for anything but alerts
        if message.high_priority() && self.config.push_type == PUSH_TYPE_ALERT {
            "10"
        } else {
            "5"
        }
    }

    async fn send_once(
        &self,
        message: &PushMessage,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<(), Attempt<PushError>> {
        let url = format!(
            "{}/3/device/{}",
            self.config.server.trim_end_matches('/'),
            message.device_token()
        );

        let request = self
            .client
            .post(&url)
            .header("apns-topic", &self.config.bundle_id)
            .header("apns-push-type", &self.config.push_type)
            .header("apns-priority", self.priority(message))
            .header(
                "apns-expiration",
                message.expire_time().timestamp().to_string(),
            )
            .json(message.payload());

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Attempt::Abort(PushError::Cancelled)),
            response = request.send() => response,
        };

        let response = response.map_err(|e| {
            Attempt::Abort(if e.is_timeout() {
                PushError::Timeout(format!("APNs request timed out: {e}"))
            } else {
                PushError::Connection(format!("APNs request failed: {e}"))
            })
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(token = message.token_prefix(), attempt, "APNs accepted notification");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body, message))
    }
}

fn classify(status: StatusCode, body: &str, message: &PushMessage) -> Attempt<PushError> {
    let reason = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.reason);

    warn!(
        token = message.token_prefix(),
        status = status.as_u16(),
        reason = reason.as_deref().unwrap_or("-"),
        "APNs rejected notification"
    );

    if status == StatusCode::GONE || reason.as_deref() == Some("Unregistered") {
        return Attempt::Abort(PushError::DeviceNotFound);
    }

    let error = PushError::Service(match reason {
        Some(reason) => format!("status={} reason={}", status.as_u16(), reason),
        None => format!("status={} body={}", status.as_u16(), body),
    });

    match status {
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE => Attempt::Retry(error),
        _ => Attempt::Abort(error),
    }
}

#[async_trait]
impl WebGateway for ApnsHttpGateway {
    fn name(&self) -> &str {
        "apns"
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

    fn message(high_priority: bool) -> PushMessage {
        PushMessage::with_time_to_live(
            "ab".repeat(32),
            Default::default(),
            high_priority,
            Duration::from_secs(600),
        )
        .unwrap()
    }

    #[test]
    fn test_priority_only_high_for_alerts() {
        let background = ApnsHttpGateway::new(ApnsHttpConfig::new("com.example.app")).unwrap();
        assert_eq!(background.priority(&message(true)), "5");

        let mut config = ApnsHttpConfig::new("com.example.app");
        config.push_type = PUSH_TYPE_ALERT.to_string();
        let alert = ApnsHttpGateway::new(config).unwrap();
        assert_eq!(alert.priority(&message(true)), "10");
        assert_eq!(alert.priority(&message(false)), "5");
    }

    #[test]
    fn test_classify_status() {
        let msg = message(false);
        assert!(matches!(
            classify(StatusCode::GONE, "", &msg),
            Attempt::Abort(PushError::DeviceNotFound)
        ));
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, "", &msg),
            Attempt::Retry(PushError::Service(_))
        ));
        match classify(StatusCode::BAD_REQUEST, r#"{"reason":"BadTopic"}"#, &msg) {
            Attempt::Abort(PushError::Service(text)) => {
                assert_eq!(text, "status=400 reason=BadTopic")
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn test_sandbox_server() {
        let config = ApnsHttpConfig::new("com.example.app").with_sandbox(true);
        assert_eq!(config.server, "https://api.sandbox.push.apple.com");
    }
}
