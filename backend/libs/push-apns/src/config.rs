use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;

use push_core::PushError;

pub const PRODUCTION_GATEWAY: &str = "gateway.push.apple.com";
pub const SANDBOX_GATEWAY: &str = "gateway.sandbox.push.apple.com";
pub const GATEWAY_PORT: u16 = 2195;

pub const PRODUCTION_FEEDBACK: &str = "feedback.push.apple.com";
pub const SANDBOX_FEEDBACK: &str = "feedback.sandbox.push.apple.com";
pub const FEEDBACK_PORT: u16 = 2196;

pub const PRODUCTION_HTTP_SERVER: &str = "https://api.push.apple.com";
pub const SANDBOX_HTTP_SERVER: &str = "https://api.sandbox.push.apple.com";

pub const DEFAULT_RECYCLE_COUNT: u32 = 128;
pub const DEFAULT_RECYCLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Legacy binary gateway configuration
#[derive(Debug, Clone)]
pub struct LegacyConfig {
    pub sandbox: bool,
    /// Overrides the Apple gateway host and port
    pub gateway: Option<(String, u16)>,
    /// Overrides the Apple feedback host and port
    pub feedback: Option<(String, u16)>,
    pub recycle_count: u32,
    pub recycle_timeout: Duration,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
    pub tls: Arc<ClientConfig>,
}

impl LegacyConfig {
    pub fn new(tls: Arc<ClientConfig>) -> Self {
        Self {
            sandbox: false,
            gateway: None,
            feedback: None,
            recycle_count: DEFAULT_RECYCLE_COUNT,
            recycle_timeout: DEFAULT_RECYCLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            tls,
        }
    }

    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Set the recycle budget: identifiers per connection (1..=1024) and connection
    /// lifetime in whole seconds (1..=30)
    pub fn with_recycle(mut self, count: u32, timeout: Duration) -> Result<Self, PushError> {
        if !(1..=1024).contains(&count) {
            return Err(PushError::Config(format!(
                "recycle count {count} out of range 1..=1024"
            )));
        }
        if !(1..=30).contains(&timeout.as_secs()) {
            return Err(PushError::Config(format!(
                "recycle timeout {timeout:?} out of range 1..=30 seconds"
            )));
        }
        self.recycle_count = count;
        self.recycle_timeout = timeout;
        Ok(self)
    }

    pub fn gateway_address(&self) -> (String, u16) {
        match &self.gateway {
            Some(address) => address.clone(),
            None if self.sandbox => (SANDBOX_GATEWAY.to_string(), GATEWAY_PORT),
            None => (PRODUCTION_GATEWAY.to_string(), GATEWAY_PORT),
        }
    }

    pub fn feedback_address(&self) -> (String, u16) {
        match &self.feedback {
            Some(address) => address.clone(),
            None if self.sandbox => (SANDBOX_FEEDBACK.to_string(), FEEDBACK_PORT),
            None => (PRODUCTION_FEEDBACK.to_string(), FEEDBACK_PORT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{client_config, ClientIdentity};

    fn tls() -> Arc<ClientConfig> {
        let identity = ClientIdentity::from_pem(
            include_bytes!("../tests/fixtures/client_cert.pem"),
            include_bytes!("../tests/fixtures/client_key.pem"),
        )
        .unwrap();
        client_config(identity, Vec::new()).unwrap()
    }

    #[test]
    fn test_gateway_endpoints() {
        let prod = LegacyConfig::new(tls());
        assert_eq!(
            prod.gateway_address(),
            ("gateway.push.apple.com".to_string(), 2195)
        );
        assert_eq!(
            prod.feedback_address(),
            ("feedback.push.apple.com".to_string(), 2196)
        );

        let sandbox = prod.with_sandbox(true);
        assert_eq!(sandbox.gateway_address().0, "gateway.sandbox.push.apple.com");
        assert_eq!(sandbox.feedback_address().0, "feedback.sandbox.push.apple.com");
    }

    #[test]
    fn test_recycle_bounds() {
        let config = LegacyConfig::new(tls());
        assert!(config
            .clone()
            .with_recycle(0, Duration::from_secs(5))
            .is_err());
        assert!(config
            .clone()
            .with_recycle(1025, Duration::from_secs(5))
            .is_err());
        assert!(config
            .clone()
            .with_recycle(128, Duration::from_secs(31))
            .is_err());

        let config = config.with_recycle(1024, Duration::from_secs(30)).unwrap();
        assert_eq!(config.recycle_count, 1024);
    }
}
