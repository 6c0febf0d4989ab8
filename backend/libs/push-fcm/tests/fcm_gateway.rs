use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use push_core::{PushError, PushMessage, WebGateway};
use push_fcm::{FcmLegacyConfig, FcmLegacyGateway, FcmV1Config, FcmV1Gateway, ServiceAccountKey};
use resilience::RetryConfig;

const PRIVATE_KEY: &str = include_str!("fixtures/service_account_key.pem");
const SEND_PATH: &str = "/v1/projects/demo-project/messages:send";

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_millis(20),
        step: Duration::from_millis(10),
    }
}

fn v1_gateway(server: &MockServer) -> FcmV1Gateway {
    let account = ServiceAccountKey {
        project_id: "demo-project".to_string(),
        private_key_id: "key-1".to_string(),
        private_key: PRIVATE_KEY.to_string(),
        client_email: "push@demo-project.iam.gserviceaccount.com".to_string(),
        token_uri: format!("{}/token", server.uri()),
    };
    let mut config = FcmV1Config::new(account);
    config.endpoint = server.uri();
    config.retry = fast_retry();
    FcmV1Gateway::new(config).unwrap()
}

async fn mount_token(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer",
        ))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "token_type": "Bearer",
                    "access_token": "ya29.test-token",
                    "expires_in": 3599
                }))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn message() -> PushMessage {
    PushMessage::with_time_to_live(
        "fcm-registration-token",
        json!({ "kind": "sync" }).as_object().cloned().unwrap(),
        false,
        Duration::from_secs(3600),
    )
    .unwrap()
}

#[tokio::test]
async fn test_concurrent_get_token_mints_once() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    let gateway = Arc::new(v1_gateway(&server));
    let cancel = CancellationToken::new();

    let tokens = futures::future::join_all((0..8).map(|_| {
        let gateway = gateway.clone();
        let cancel = cancel.clone();
        async move { gateway.tokens().get_token(&cancel).await }
    }))
    .await;

    for token in tokens {
        assert_eq!(token.unwrap(), "Bearer ya29.test-token");
    }
}

#[tokio::test]
async fn test_send_uses_bearer_token() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .and(header("authorization", "Bearer ya29.test-token"))
        .and(body_string_contains("\"validate_only\":false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/demo-project/messages/1"
        })))
        .expect(2)
        .mount(&server)
        .await;

    let gateway = v1_gateway(&server);
    let cancel = CancellationToken::new();
    gateway.init(&cancel).await.unwrap();
    gateway.send(&message(), &cancel).await.unwrap();
    gateway.send(&message(), &cancel).await.unwrap();
}

#[tokio::test]
async fn test_unknown_device_is_not_retried() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": 404, "message": "Requested entity was not found.", "status": "NOT_FOUND" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = v1_gateway(&server)
        .send(&message(), &CancellationToken::new())
        .await;
    assert_eq!(result, Err(PushError::DeviceNotFound));
}

#[tokio::test]
async fn test_unavailable_is_retried_three_times() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "ok" })))
        .expect(1)
        .mount(&server)
        .await;

    let started = Instant::now();
    v1_gateway(&server)
        .send(&message(), &CancellationToken::new())
        .await
        .unwrap();

    // three backoffs: 30 + 40 + 50 ms
    assert!(started.elapsed() >= Duration::from_millis(120));
}

#[tokio::test]
async fn test_bad_request_reports_google_message() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": 400, "message": "Invalid value at 'message.data'" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = v1_gateway(&server)
        .send(&message(), &CancellationToken::new())
        .await;
    assert_eq!(
        result,
        Err(PushError::Service(
            "FCM send failed: status=400 message=Invalid value at 'message.data'".to_string()
        ))
    );
}

#[tokio::test]
async fn test_rejected_assertion_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Invalid JWT Signature."
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = v1_gateway(&server).init(&CancellationToken::new()).await;
    match result {
        Err(PushError::Authentication(text)) => {
            assert!(text.contains("error_description=Invalid JWT Signature."))
        }
        other => panic!("unexpected result {other:?}"),
    }
}

fn legacy_gateway(server: &MockServer) -> FcmLegacyGateway {
    let mut config = FcmLegacyConfig::new("server-key", "1234567890");
    config.endpoint = server.uri();
    config.retry = fast_retry();
    FcmLegacyGateway::new(config).unwrap()
}

#[tokio::test]
async fn test_legacy_send_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fcm/send"))
        .and(header("authorization", "key=server-key"))
        .and(header("sender", "id=1234567890"))
        .and(body_string_contains("\"to\":\"fcm-registration-token\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "multicast_id": 1, "success": 1, "failure": 0, "canonical_ids": 0,
            "results": [{ "message_id": "0:1" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    legacy_gateway(&server)
        .send(&message(), &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_legacy_not_registered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fcm/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": 0, "failure": 1, "canonical_ids": 0,
            "results": [{ "error": "NotRegistered" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = legacy_gateway(&server)
        .send(&message(), &CancellationToken::new())
        .await;
    assert_eq!(result, Err(PushError::DeviceNotFound));
}

#[tokio::test]
async fn test_legacy_unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fcm/send"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let result = legacy_gateway(&server)
        .send(&message(), &CancellationToken::new())
        .await;
    assert_eq!(
        result,
        Err(PushError::Service("FCM server returns status=401".to_string()))
    );
}
