use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info};

use push_core::{Connection, ConnectionId, DeliveryFailure, PushError, PushMessage};

use crate::metrics;
use crate::services::delivery_queue::{QueueInner, QueueItem};
use crate::services::observers::panic_message;

/// Delivery worker entry point
///
/// Drains the queue and exits. A panic is contained here: it is reported as an internal
/// failure carrying the message being delivered, the active connection is closed and the
/// queue is left ready for a new worker.
pub(crate) async fn run(queue: Arc<QueueInner>) {
    debug!(provider = queue.provider(), "Delivery worker started");

    if let Err(panic) = AssertUnwindSafe(process(&queue)).catch_unwind().await {
        let reason = panic_message(panic.as_ref());
        error!(provider = queue.provider(), "Delivery worker crashed: {}", reason);

        let in_flight = queue.end_delivery();
        queue.worker_finished();
        if let Some(connection) = queue.take_connection() {
            let closer = queue.clone();
            tokio::spawn(async move { closer.close_connection(connection).await });
        }
        queue.report_failure(DeliveryFailure::new(
            in_flight,
            PushError::Internal(format!("delivery worker crashed: {reason}")),
        ));
        return;
    }

    debug!(provider = queue.provider(), "Delivery worker idle");
}

async fn process(queue: &Arc<QueueInner>) {
    while let Some(item) = queue.next_item() {
        match item {
            QueueItem::Message(message) => deliver(queue, message).await,
            QueueItem::Recycle(id) => {
                if !recycle(queue, id).await {
                    debug!(connection_id = id, "Ignoring recycle for inactive connection");
                }
            }
        }
    }
}

async fn deliver(queue: &Arc<QueueInner>, message: PushMessage) {
    queue.begin_delivery(&message);

    let connection = match ensure_connection(queue).await {
        Ok(connection) => connection,
        Err(e) => {
            queue.end_delivery();
            let error = match e {
                PushError::Connection(_) => e,
                other => PushError::Connection(other.to_string()),
            };
            queue.report_failure(DeliveryFailure::for_message(message, error));
            return;
        }
    };

    queue.observers().sending(&message);

    let token = message.token_prefix().to_string();
    let outcome = connection.send(message).await;
    queue.end_delivery();
    match outcome {
        Ok(()) => {
            debug!(connection_id = connection.id(), token = %token, "Push message sent");
            metrics::record_message(queue.provider(), "sent");
        }
        Err(failure) => queue.report_failure(failure),
    }

    if connection.needs_recycle() {
        recycle(queue, connection.id()).await;
    }
}

/// Reuse the active connection while it is available, otherwise replace it
async fn ensure_connection(queue: &Arc<QueueInner>) -> Result<Arc<dyn Connection>, PushError> {
    if let Some(connection) = queue.active_connection() {
        if connection.is_available() {
            return Ok(connection);
        }
        if let Some(stale) = queue.detach_connection(connection.id()) {
            queue.close_connection(stale).await;
        }
    }

    match queue.connect().await {
        Ok(connection) => {
            info!(
                connection_id = connection.id(),
                provider = queue.provider(),
                "Connection established"
            );
            metrics::record_connection(queue.provider(), "connected");
            queue.set_connection(connection.clone());
            Ok(connection)
        }
        Err(e) => {
            metrics::record_connection(queue.provider(), "connect_failed");
            Err(e)
        }
    }
}

/// Close connection `id` if it is still the active one
async fn recycle(queue: &Arc<QueueInner>, id: ConnectionId) -> bool {
    let Some(connection) = queue.detach_connection(id) else {
        return false;
    };
    info!(connection_id = id, "Recycling connection");
    metrics::record_connection(queue.provider(), "recycled");
    queue.close_connection(connection).await;
    true
}
