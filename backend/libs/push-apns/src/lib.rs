/// Apple Push Notification service delivery
///
/// Two gateways are supported:
/// - the legacy binary provider protocol over mutually authenticated TLS, with pipelined
///   notification identifiers and asynchronous error responses (`LegacyConnection`)
/// - the HTTP/2 provider API (`ApnsHttpGateway`), wrapped by `push_core::HttpConnection`
///
/// The feedback service reader reports devices that no longer accept notifications.
pub mod codec;
pub mod config;
pub mod feedback;
pub mod http;
pub mod ledger;
pub mod legacy;
pub mod transport;

pub use codec::{decode_device_token, encode_device_token, encode_frame, ErrorResponse};
pub use config::LegacyConfig;
pub use feedback::{fetch_feedback, read_feedback, FeedbackEntry};
pub use http::{ApnsHttpConfig, ApnsHttpGateway};
pub use ledger::{PendingLedger, Resolution};
pub use legacy::{LegacyConnection, LegacyConnectionFactory, LegacySettings, LegacyState};
pub use transport::{client_config, ClientIdentity};
