use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use push_core::PushError;

/// Client certificate chain and private key presented to the gateway
pub struct ClientIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ClientIdentity {
    /// Parse a PEM certificate chain and a PEM private key (PKCS#1, PKCS#8 or SEC1)
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, PushError> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PushError::Config(format!("invalid client certificate: {e}")))?;
        if certs.is_empty() {
            return Err(PushError::Config(
                "no certificate found in client certificate PEM".to_string(),
            ));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(|e| PushError::Config(format!("invalid client key: {e}")))?
            .ok_or_else(|| PushError::Config("no private key found in client key PEM".to_string()))?;

        Ok(Self { certs, key })
    }

    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self, PushError> {
        let cert_pem = fs::read(cert_path).map_err(|e| {
            PushError::Config(format!("failed to read {}: {e}", cert_path.display()))
        })?;
        let key_pem = fs::read(key_path).map_err(|e| {
            PushError::Config(format!("failed to read {}: {e}", key_path.display()))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn certificate_count(&self) -> usize {
        self.certs.len()
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("certs", &self.certs.len())
            .finish_non_exhaustive()
    }
}

/// Build a TLS client configuration presenting `identity`
///
/// Server certificates are verified against the platform trust store plus `extra_roots`.
pub fn client_config(
    identity: ClientIdentity,
    extra_roots: Vec<CertificateDer<'static>>,
) -> Result<Arc<ClientConfig>, PushError> {
    let mut roots = RootCertStore::empty();

    match rustls_native_certs::load_native_certs() {
        Ok(native) => {
            let (added, ignored) = roots.add_parsable_certificates(native);
            debug!(added, ignored, "Loaded platform trust anchors");
        }
        Err(e) => warn!("Failed to load platform trust anchors: {}", e),
    }
    for root in extra_roots {
        roots
            .add(root)
            .map_err(|e| PushError::Config(format!("invalid trust anchor: {e}")))?;
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| PushError::Config(format!("TLS setup failed: {e}")))?
    .with_root_certificates(roots)
    .with_client_auth_cert(identity.certs, identity.key)
    .map_err(|e| PushError::Config(format!("client certificate rejected: {e}")))?;

    Ok(Arc::new(config))
}

/// Open a TCP connection and run the mutually authenticated TLS handshake
pub async fn connect_tls(
    host: &str,
    port: u16,
    config: Arc<ClientConfig>,
) -> Result<TlsStream<TcpStream>, PushError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| PushError::Config(format!("invalid gateway host '{host}': {e}")))?;

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| PushError::Connection(format!("connect({host}:{port}) failed: {e}")))?;
    tcp.set_nodelay(true)
        .map_err(|e| PushError::Connection(format!("connect({host}:{port}) failed: {e}")))?;

    TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .map_err(|e| PushError::Connection(format!("TLS handshake with {host} failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &[u8] = include_bytes!("../tests/fixtures/client_cert.pem");
    const KEY: &[u8] = include_bytes!("../tests/fixtures/client_key.pem");

    #[test]
    fn test_identity_from_pem() {
        let identity = ClientIdentity::from_pem(CERT, KEY).unwrap();
        assert_eq!(identity.certificate_count(), 1);
    }

    #[test]
    fn test_identity_rejects_missing_key() {
        let result = ClientIdentity::from_pem(CERT, CERT);
        assert!(matches!(result, Err(PushError::Config(msg)) if msg.contains("private key")));
    }

    #[test]
    fn test_identity_rejects_missing_certificate() {
        let result = ClientIdentity::from_pem(b"not a pem", KEY);
        assert!(matches!(result, Err(PushError::Config(_))));
    }

    #[test]
    fn test_client_config_accepts_identity() {
        let identity = ClientIdentity::from_pem(CERT, KEY).unwrap();
        assert!(client_config(identity, Vec::new()).is_ok());
    }
}
