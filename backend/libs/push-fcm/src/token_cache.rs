use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use push_core::PushError;
use resilience::{with_retry, Attempt, RetryConfig};

use crate::errors::describe_response;
use crate::jwt::JwtSigner;
use crate::models::GoogleTokenResponse;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Tokens with less validity left than this are refreshed before use
const MIN_REMAINING_MINUTES: i64 = 5;

/// An OAuth2 access token ready to be used as an `Authorization` header
#[derive(Debug, Clone)]
pub struct AuthorizationToken {
    /// `"Bearer <access_token>"`
    pub header_value: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now >= Duration::minutes(MIN_REMAINING_MINUTES)
    }
}

/// Shares one access token between all sends of a provider
///
/// The cache lock is held across the refresh, so concurrent callers wait for the single
/// in-flight exchange instead of minting their own.
pub struct BearerTokenCache {
    client: Client,
    signer: JwtSigner,
    token_uri: String,
    retry: RetryConfig,
    cached: Mutex<Option<AuthorizationToken>>,
}

impl BearerTokenCache {
    pub fn new(client: Client, signer: JwtSigner, token_uri: String, retry: RetryConfig) -> Self {
        Self {
            client,
            signer,
            token_uri,
            retry,
            cached: Mutex::new(None),
        }
    }

    /// Current `Authorization` header value, refreshing it when stale
    pub async fn get_token(&self, cancel: &CancellationToken) -> Result<String, PushError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.header_value.clone());
            }
            debug!(expires_at = %token.expires_at, "Access token stale, refreshing");
        }
        *cached = None;

        let token = with_retry(&self.retry, cancel, move |attempt| {
            self.request_token(cancel, attempt)
        })
        .await
        .map_err(|e| e.into_inner())?;

        info!(expires_at = %token.expires_at, "Access token refreshed");
        let header_value = token.header_value.clone();
        *cached = Some(token);
        Ok(header_value)
    }

    async fn request_token(
        &self,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<AuthorizationToken, Attempt<PushError>> {
        let now = Utc::now();
        let assertion = self.signer.sign(now).map_err(Attempt::Abort)?;

        let request = self
            .client
            .post(&self.token_uri)
            .form(&[("assertion", assertion.as_str()), ("grant_type", JWT_BEARER_GRANT)]);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Attempt::Abort(PushError::Cancelled)),
            response = request.send() => response,
        };
        let response = response.map_err(|e| {
            Attempt::Abort(PushError::Authentication(format!(
                "token request failed: {e}"
            )))
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status == StatusCode::OK {
            if let Ok(token) = serde_json::from_str::<GoogleTokenResponse>(&body) {
                if token.token_type == "Bearer" {
                    return Ok(AuthorizationToken {
                        header_value: format!("{} {}", token.token_type, token.access_token),
                        expires_at: now + Duration::seconds(token.expires_in),
                    });
                }
            }
        }

        warn!(
            status = status.as_u16(),
            attempt, "Access token request rejected"
        );

        let error = PushError::Authentication(format!(
            "get access token failed: {}",
            describe_response(status, &body)
        ));
        match status {
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => Err(Attempt::Retry(error)),
            _ => Err(Attempt::Abort(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        let token = AuthorizationToken {
            header_value: "Bearer abc".to_string(),
            expires_at: now + Duration::minutes(6),
        };
        assert!(token.is_fresh(now));
        assert!(!token.is_fresh(now + Duration::minutes(2)));
    }
}
