/// Push delivery core
///
/// Shared building blocks for every push provider in the workspace:
/// - `PushMessage`, the immutable unit of delivery
/// - `PushError` / `ErrorReason` / `DeliveryFailure`, the error taxonomy reported to producers
/// - the `Connection` abstraction driven by the delivery queue, its `ConnectionFactory`
///   and the `ConnectionListener` through which connections report back
/// - `HttpConnection`, the always-available connection over a stateless `WebGateway`
pub mod connection;
pub mod error;
pub mod http;
pub mod message;

pub use connection::{
    next_connection_id, Connection, ConnectionFactory, ConnectionId, ConnectionListener,
};
pub use error::{BoxError, DeliveryFailure, ErrorReason, PushError};
pub use http::{HttpConnection, HttpConnectionFactory, WebGateway};
pub use message::{Payload, PushMessage, MIN_TIME_TO_LIVE};
