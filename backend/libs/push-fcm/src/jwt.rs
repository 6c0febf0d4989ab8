use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

use push_core::PushError;

use crate::models::{JwtClaims, ServiceAccountKey};

pub const FIREBASE_SCOPES: &str =
    "https://www.googleapis.com/auth/firebase https://www.googleapis.com/auth/cloud-platform";

const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Signs RS256 assertions for the OAuth2 JWT-bearer grant
pub struct JwtSigner {
    key: EncodingKey,
    key_id: String,
    issuer: String,
    audience: String,
}

impl JwtSigner {
    pub fn new(account: &ServiceAccountKey) -> Result<Self, PushError> {
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| PushError::Config(format!("failed to parse private key: {e}")))?;

        Ok(Self {
            key,
            key_id: account.private_key_id.clone(),
            issuer: account.client_email.clone(),
            audience: account.token_uri.clone(),
        })
    }

    pub fn sign(&self, now: DateTime<Utc>) -> Result<String, PushError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());

        let claims = JwtClaims {
            scope: FIREBASE_SCOPES.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: (now + Duration::seconds(ASSERTION_LIFETIME_SECS)).timestamp(),
            iat: now.timestamp(),
        };

        encode(&header, &claims, &self.key)
            .map_err(|e| PushError::Authentication(format!("failed to encode JWT: {e}")))
    }
}

impl std::fmt::Debug for JwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSigner")
            .field("key_id", &self.key_id)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}
