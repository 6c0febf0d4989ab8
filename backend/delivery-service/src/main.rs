use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use delivery_service::{metrics, Config, DeliveryQueue, Observers};
use push_core::{Payload, PushMessage};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// One line of producer input
#[derive(Debug, Deserialize)]
struct PushRequest {
    token: String,
    #[serde(default)]
    payload: Payload,
    #[serde(default)]
    high_priority: bool,
    #[serde(default = "default_ttl_secs")]
    ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    3600
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,delivery_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(provider = ?config.provider, sandbox = config.sandbox, "Starting delivery service");

    let factory = config
        .provider_config()
        .and_then(|provider| provider.into_factory())
        .context("Failed to initialize push provider")?;

    let observers = Observers::new().on_error(|failure| {
        tracing::error!(reason = %failure.reason(), "{}", failure);
    });
    let queue = DeliveryQueue::new(factory, observers)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut accepted = 0usize;
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let request: PushRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Skipping malformed input line: {}", e);
                continue;
            }
        };

        match PushMessage::with_time_to_live(
            request.token,
            request.payload,
            request.high_priority,
            Duration::from_secs(request.ttl_secs),
        ) {
            Ok(message) => {
                queue.enqueue(message);
                accepted += 1;
            }
            Err(e) => tracing::warn!("Rejected push request: {}", e),
        }
    }

    tracing::info!(accepted, "Input closed, waiting for delivery");
    if queue.wait_idle(DRAIN_TIMEOUT).await.is_err() {
        tracing::warn!(
            queued = queue.queued(),
            "Delivery did not finish within {:?}",
            DRAIN_TIMEOUT
        );
    }
    queue.shutdown().await;

    match metrics::render() {
        Ok(text) => tracing::debug!("Final metrics:\n{}", text),
        Err(e) => tracing::warn!("Failed to render metrics: {}", e),
    }

    tracing::info!("Delivery service stopped");
    Ok(())
}
