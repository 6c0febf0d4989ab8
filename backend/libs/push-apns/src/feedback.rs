use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use push_core::PushError;
use resilience::{with_timeout, GATEWAY_TIMEOUT};

use crate::codec::encode_device_token;
use crate::config::LegacyConfig;
use crate::transport::connect_tls;

const TUPLE_HEADER_SIZE: usize = 6;

/// A device the gateway reported as no longer accepting notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackEntry {
    /// When the gateway determined the app was gone
    pub timestamp: DateTime<Utc>,
    /// Lowercase hex device token
    pub device_token: String,
}

/// Read `{u32 timestamp, u16 length, token}` tuples until the service closes the stream
pub async fn read_feedback<R>(mut reader: R) -> Result<Vec<FeedbackEntry>, PushError>
where
    R: AsyncRead + Unpin,
{
    let mut entries = Vec::new();

    loop {
        let mut header = [0u8; TUPLE_HEADER_SIZE];
        let mut filled = 0;
        while filled < TUPLE_HEADER_SIZE {
            let n = reader
                .read(&mut header[filled..])
                .await
                .map_err(|e| PushError::Connection(format!("reading feedback failed: {e}")))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        match filled {
            0 => break,
            TUPLE_HEADER_SIZE => {}
            n => {
                return Err(PushError::Format(format!(
                    "incomplete feedback tuple ({n} of {TUPLE_HEADER_SIZE} header bytes)"
                )))
            }
        }

        let timestamp = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let token_len = u16::from_be_bytes([header[4], header[5]]) as usize;

        let mut token = vec![0u8; token_len];
        reader
            .read_exact(&mut token)
            .await
            .map_err(|e| PushError::Format(format!("truncated feedback token: {e}")))?;

        let timestamp = DateTime::<Utc>::from_timestamp(i64::from(timestamp), 0)
            .ok_or_else(|| PushError::Format(format!("invalid feedback timestamp {timestamp}")))?;

        entries.push(FeedbackEntry {
            timestamp,
            device_token: encode_device_token(&token),
        });
    }

    debug!(count = entries.len(), "Feedback stream finished");
    Ok(entries)
}

/// Connect to the feedback service and collect every reported device
///
/// The whole read is bounded by the gateway timeout.
pub async fn fetch_feedback(config: &LegacyConfig) -> Result<Vec<FeedbackEntry>, PushError> {
    let (host, port) = config.feedback_address();
    info!(host = %host, port, "Fetching feedback");

    let stream = with_timeout(
        config.connect_timeout,
        connect_tls(&host, port, config.tls.clone()),
    )
    .await
    .map_err(|_| PushError::Timeout(format!("connect({host}:{port}) timed out")))??;

    with_timeout(GATEWAY_TIMEOUT, read_feedback(stream))
        .await
        .map_err(|_| {
            PushError::Timeout(format!(
                "feedback service did not finish within {GATEWAY_TIMEOUT:?}"
            ))
        })?
}
