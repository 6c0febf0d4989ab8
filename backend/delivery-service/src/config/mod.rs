/// Configuration management
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use push_apns::config::{DEFAULT_RECYCLE_COUNT, DEFAULT_RECYCLE_TIMEOUT};
use push_apns::{
    client_config, ApnsHttpConfig, ApnsHttpGateway, ClientIdentity, LegacyConfig,
    LegacyConnectionFactory,
};
use push_core::{ConnectionFactory, HttpConnectionFactory, PushError};
use push_fcm::{FcmLegacyConfig, FcmLegacyGateway, FcmV1Config, FcmV1Gateway, ServiceAccountKey};

const ENV_PREFIX: &str = "PUSH_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    ApnsLegacy,
    Apns,
    Fcm,
    FcmLegacy,
}

/// Service configuration, read from `PUSH_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub provider: ProviderKind,
    /// PEM client certificate (APNs)
    pub cert_path: Option<PathBuf>,
    /// PEM private key for `cert_path` (APNs)
    pub key_path: Option<PathBuf>,
    /// `apns-topic` (APNs HTTP/2)
    pub bundle_id: Option<String>,
    /// `apns-push-type` (APNs HTTP/2)
    pub apns_push_type: Option<String>,
    /// Google service account JSON (FCM v1)
    pub service_account_path: Option<PathBuf>,
    pub fcm_server_key: Option<String>,
    pub fcm_sender_id: Option<String>,
    #[serde(default)]
    pub sandbox: bool,
    #[serde(default = "default_recycle_count")]
    pub recycle_count: u32,
    #[serde(default = "default_recycle_timeout_secs")]
    pub recycle_timeout_secs: u64,
}

fn default_recycle_count() -> u32 {
    DEFAULT_RECYCLE_COUNT
}

fn default_recycle_timeout_secs() -> u64 {
    DEFAULT_RECYCLE_TIMEOUT.as_secs()
}

impl Config {
    pub fn from_env() -> Result<Self, PushError> {
        dotenvy::dotenv().ok();

        let config: Config = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| PushError::Config(format!("invalid environment: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Same as `from_env`, over explicit `(name, value)` pairs
    pub fn from_vars<I>(vars: I) -> Result<Self, PushError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .map_err(|e| PushError::Config(format!("invalid environment: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PushError> {
        if !(1..=1024).contains(&self.recycle_count) {
            return Err(PushError::Config(format!(
                "PUSH_RECYCLE_COUNT {} out of range 1..=1024",
                self.recycle_count
            )));
        }
        if !(1..=30).contains(&self.recycle_timeout_secs) {
            return Err(PushError::Config(format!(
                "PUSH_RECYCLE_TIMEOUT_SECS {} out of range 1..=30",
                self.recycle_timeout_secs
            )));
        }

        match self.provider {
            ProviderKind::ApnsLegacy => {
                require(&self.cert_path, "PUSH_CERT_PATH")?;
                require(&self.key_path, "PUSH_KEY_PATH")?;
            }
            ProviderKind::Apns => {
                require(&self.bundle_id, "PUSH_BUNDLE_ID")?;
                if self.cert_path.is_some() != self.key_path.is_some() {
                    return Err(PushError::Config(
                        "PUSH_CERT_PATH and PUSH_KEY_PATH must be set together".to_string(),
                    ));
                }
            }
            ProviderKind::Fcm => {
                require(&self.service_account_path, "PUSH_SERVICE_ACCOUNT_PATH")?;
            }
            ProviderKind::FcmLegacy => {
                require(&self.fcm_server_key, "PUSH_FCM_SERVER_KEY")?;
                require(&self.fcm_sender_id, "PUSH_FCM_SENDER_ID")?;
            }
        }
        Ok(())
    }

    /// Load credentials and build the provider configuration
    pub fn provider_config(&self) -> Result<ProviderConfig, PushError> {
        match self.provider {
            ProviderKind::ApnsLegacy => {
                let identity = ClientIdentity::from_files(
                    require(&self.cert_path, "PUSH_CERT_PATH")?,
                    require(&self.key_path, "PUSH_KEY_PATH")?,
                )?;
                let tls = client_config(identity, Vec::new())?;
                let config = LegacyConfig::new(tls)
                    .with_sandbox(self.sandbox)
                    .with_recycle(
                        self.recycle_count,
                        Duration::from_secs(self.recycle_timeout_secs),
                    )?;
                Ok(ProviderConfig::ApnsLegacy(config))
            }
            ProviderKind::Apns => {
                let mut config = ApnsHttpConfig::new(require(&self.bundle_id, "PUSH_BUNDLE_ID")?)
                    .with_sandbox(self.sandbox);
                if let Some(push_type) = &self.apns_push_type {
                    config.push_type = push_type.clone();
                }
                if let (Some(cert), Some(key)) = (&self.cert_path, &self.key_path) {
                    let mut pem = read_file(cert)?;
                    pem.push(b'\n');
                    pem.extend(read_file(key)?);
                    config = config.with_identity_pem(pem);
                }
                Ok(ProviderConfig::ApnsHttp(config))
            }
            ProviderKind::Fcm => {
                let account = ServiceAccountKey::from_file(require(
                    &self.service_account_path,
                    "PUSH_SERVICE_ACCOUNT_PATH",
                )?)?;
                Ok(ProviderConfig::FcmV1(FcmV1Config::new(account)))
            }
            ProviderKind::FcmLegacy => Ok(ProviderConfig::FcmLegacy(FcmLegacyConfig::new(
                require(&self.fcm_server_key, "PUSH_FCM_SERVER_KEY")?,
                require(&self.fcm_sender_id, "PUSH_FCM_SENDER_ID")?,
            ))),
        }
    }
}

fn require<'a, T>(value: &'a Option<T>, name: &str) -> Result<&'a T, PushError> {
    value
        .as_ref()
        .ok_or_else(|| PushError::Config(format!("{name} is required for this provider")))
}

fn read_file(path: &PathBuf) -> Result<Vec<u8>, PushError> {
    fs::read(path).map_err(|e| PushError::Config(format!("failed to read {}: {e}", path.display())))
}

/// The one gateway a delivery queue talks to, chosen at startup
#[derive(Debug)]
pub enum ProviderConfig {
    ApnsLegacy(LegacyConfig),
    ApnsHttp(ApnsHttpConfig),
    FcmV1(FcmV1Config),
    FcmLegacy(FcmLegacyConfig),
}

impl ProviderConfig {
    pub fn into_factory(self) -> Result<Arc<dyn ConnectionFactory>, PushError> {
        let factory: Arc<dyn ConnectionFactory> = match self {
            ProviderConfig::ApnsLegacy(config) => Arc::new(LegacyConnectionFactory::new(config)),
            ProviderConfig::ApnsHttp(config) => Arc::new(HttpConnectionFactory::new(Arc::new(
                ApnsHttpGateway::new(config)?,
            ))),
            ProviderConfig::FcmV1(config) => Arc::new(HttpConnectionFactory::new(Arc::new(
                FcmV1Gateway::new(config)?,
            ))),
            ProviderConfig::FcmLegacy(config) => Arc::new(HttpConnectionFactory::new(Arc::new(
                FcmLegacyGateway::new(config)?,
            ))),
        };
        Ok(factory)
    }
}
