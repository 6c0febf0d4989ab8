use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DeliveryFailure, PushError};
use crate::message::PushMessage;

/// Process-unique identity of one connection instance
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A managed link to one push gateway
///
/// Owned by a single delivery worker at a time. The owner always calls `close`, including
/// on error paths; dropping a connection only stops its background tasks.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Whether `send` may be called
    fn is_available(&self) -> bool;

    /// Whether the connection has used up its budget and should be closed proactively
    fn needs_recycle(&self) -> bool {
        false
    }

    /// Transmit one message
    ///
    /// A returned failure is terminal for this attempt. Failures that concern the message
    /// carry it; connection-level failures carry `None`, in which case the message has
    /// already been handed back through `ConnectionListener::connection_closed`.
    async fn send(&self, message: PushMessage) -> Result<(), DeliveryFailure>;

    /// Tear the connection down, gracefully when the protocol allows it
    async fn close(&self) -> Result<(), PushError>;

    /// Wait until the connection reached its final state; `false` on timeout
    async fn await_close(&self, _timeout: Duration) -> bool {
        true
    }
}

/// Receives asynchronous outcomes from connections
///
/// Implemented by the delivery queue. Called from connection background tasks, so
/// implementations must not block.
pub trait ConnectionListener: Send + Sync {
    /// The connection reached its final state; `requeue` holds messages that were
    /// accepted but never confirmed and must be delivered again
    fn connection_closed(&self, id: ConnectionId, requeue: Vec<PushMessage>);

    /// The connection asks its owner to close it at the next opportunity
    fn recycle_requested(&self, id: ConnectionId);

    /// A terminal failure detected outside of any `send` call
    fn report(&self, failure: DeliveryFailure);
}

/// Builds connected `Connection`s for one configured provider
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Provider label used in logs and metrics
    fn name(&self) -> &str;

    async fn connect(
        &self,
        listener: Weak<dyn ConnectionListener>,
    ) -> Result<Arc<dyn Connection>, PushError>;
}
