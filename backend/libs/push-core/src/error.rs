use std::fmt;

use thiserror::Error;

use crate::message::PushMessage;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of a delivery failure, stable across providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    Config,
    Connection,
    InvalidFormat,
    MessageExpired,
    DeviceNotFound,
    ServiceError,
    Authentication,
    Dropped,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::Config => "config",
            ErrorReason::Connection => "connection",
            ErrorReason::InvalidFormat => "invalid_format",
            ErrorReason::MessageExpired => "message_expired",
            ErrorReason::DeviceNotFound => "device_not_found",
            ErrorReason::ServiceError => "service_error",
            ErrorReason::Authentication => "authentication",
            ErrorReason::Dropped => "dropped",
            ErrorReason::Timeout => "timeout",
            ErrorReason::Cancelled => "cancelled",
            ErrorReason::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Push delivery error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid message format: {0}")]
    Format(String),

    #[error("Push message expired")]
    Expired,

    #[error("Unknown device")]
    DeviceNotFound,

    #[error("Push service error: {0}")]
    Service(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Message dropped: {0}")]
    Dropped(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PushError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            PushError::Config(_) => ErrorReason::Config,
            PushError::Connection(_) => ErrorReason::Connection,
            PushError::Format(_) => ErrorReason::InvalidFormat,
            PushError::Expired => ErrorReason::MessageExpired,
            PushError::DeviceNotFound => ErrorReason::DeviceNotFound,
            PushError::Service(_) => ErrorReason::ServiceError,
            PushError::Authentication(_) => ErrorReason::Authentication,
            PushError::Dropped(_) => ErrorReason::Dropped,
            PushError::Timeout(_) => ErrorReason::Timeout,
            PushError::Cancelled => ErrorReason::Cancelled,
            PushError::Internal(_) => ErrorReason::Internal,
        }
    }
}

/// A terminal failure handed to the producer's error callback
///
/// `message` is set when the failure concerns one specific message; connection-level
/// failures (connect errors, transport drops, failed teardown) carry `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    pub message: Option<PushMessage>,
    pub error: PushError,
}

impl DeliveryFailure {
    pub fn new(message: Option<PushMessage>, error: PushError) -> Self {
        Self { message, error }
    }

    pub fn for_message(message: PushMessage, error: PushError) -> Self {
        Self::new(Some(message), error)
    }

    pub fn connection(error: PushError) -> Self {
        Self::new(None, error)
    }

    pub fn reason(&self) -> ErrorReason {
        self.error.reason()
    }
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(
                f,
                "push to '{}…' failed: {}",
                message.token_prefix(),
                self.error
            ),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for DeliveryFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(PushError::DeviceNotFound.reason(), ErrorReason::DeviceNotFound);
        assert_eq!(PushError::Expired.reason(), ErrorReason::MessageExpired);
        assert_eq!(
            PushError::Service("status=400".into()).reason(),
            ErrorReason::ServiceError
        );
        assert_eq!(ErrorReason::Dropped.to_string(), "dropped");
    }

    #[test]
    fn test_connection_failure_has_no_message() {
        let failure = DeliveryFailure::connection(PushError::Connection("reset".into()));
        assert!(failure.message.is_none());
        assert_eq!(failure.reason(), ErrorReason::Connection);
        assert_eq!(failure.to_string(), "Connection error: reset");
    }
}
