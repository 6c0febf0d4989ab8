use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::PushError;

/// Ordered JSON object carried by a push message
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Messages must stay deliverable for at least this long after construction
pub const MIN_TIME_TO_LIVE: Duration = Duration::from_secs(60);

/// One notification addressed to one device
///
/// Immutable once built; the delivery engine only ever reads it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    device_token: String,
    payload: Payload,
    high_priority: bool,
    expire_time: DateTime<Utc>,
}

impl PushMessage {
    /// Create a message expiring at an absolute instant
    ///
    /// Rejects an empty device token and an expiry less than one minute from now.
    pub fn new(
        device_token: impl Into<String>,
        payload: Payload,
        high_priority: bool,
        expire_time: DateTime<Utc>,
    ) -> Result<Self, PushError> {
        let device_token = device_token.into();
        if device_token.is_empty() {
            return Err(PushError::Format("device token is empty".to_string()));
        }

        if expire_time < Utc::now() + min_ttl() {
            return Err(PushError::Format(format!(
                "invalid expire time {expire_time}: must be at least one minute in the future"
            )));
        }

        Ok(Self {
            device_token,
            payload,
            high_priority,
            expire_time,
        })
    }

    /// Create a message expiring `time_to_live` from now
    pub fn with_time_to_live(
        device_token: impl Into<String>,
        payload: Payload,
        high_priority: bool,
        time_to_live: Duration,
    ) -> Result<Self, PushError> {
        if time_to_live < MIN_TIME_TO_LIVE {
            return Err(PushError::Format(format!(
                "invalid time to live {time_to_live:?}: minimum is one minute"
            )));
        }

        let ttl = chrono::Duration::from_std(time_to_live)
            .map_err(|e| PushError::Format(format!("invalid time to live: {e}")))?;

        let device_token = device_token.into();
        if device_token.is_empty() {
            return Err(PushError::Format("device token is empty".to_string()));
        }

        Ok(Self {
            device_token,
            payload,
            high_priority,
            expire_time: Utc::now() + ttl,
        })
    }

    pub fn device_token(&self) -> &str {
        &self.device_token
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn high_priority(&self) -> bool {
        self.high_priority
    }

    pub fn expire_time(&self) -> DateTime<Utc> {
        self.expire_time
    }

    /// First eight characters of the device token, for logs
    pub fn token_prefix(&self) -> &str {
        match self.device_token.char_indices().nth(8) {
            Some((idx, _)) => &self.device_token[..idx],
            None => &self.device_token,
        }
    }
}

fn min_ttl() -> chrono::Duration {
    chrono::Duration::seconds(MIN_TIME_TO_LIVE.as_secs() as i64)
}
