/// Firebase Cloud Messaging delivery
///
/// It handles:
/// - OAuth2 access tokens minted from a Google service account (`JwtSigner`)
/// - Token caching with single-flight refresh (`BearerTokenCache`)
/// - The HTTP v1 send API (`FcmV1Gateway`)
/// - The legacy `fcm/send` API keyed by server key (`FcmLegacyGateway`)
pub mod client;
pub mod errors;
pub mod jwt;
pub mod legacy;
pub mod models;
pub mod token_cache;

pub use client::{FcmV1Config, FcmV1Gateway, DEFAULT_ENDPOINT};
pub use jwt::JwtSigner;
pub use legacy::{FcmLegacyConfig, FcmLegacyGateway};
pub use models::ServiceAccountKey;
pub use token_cache::{AuthorizationToken, BearerTokenCache};
