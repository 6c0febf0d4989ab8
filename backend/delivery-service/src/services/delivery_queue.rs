/// Delivery queue
///
/// Producers enqueue messages without waiting for the gateway. A single worker task drains
/// the queue onto one managed connection; it exits when the queue is empty and the next
/// enqueue starts a new one.
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use push_core::{
    Connection, ConnectionFactory, ConnectionId, ConnectionListener, DeliveryFailure, PushError,
    PushMessage,
};
use resilience::GATEWAY_TIMEOUT;

use crate::metrics;
use crate::services::observers::Observers;
use crate::services::worker;

/// Consumed prefix length that triggers compaction
const COMPACT_AFTER: usize = 128;
/// Capacity kept when the queue drains
const IDLE_CAPACITY: usize = 64;
/// How long shutdown waits for the worker after closing its connection
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub(crate) enum QueueItem {
    Message(PushMessage),
    /// Close the connection with this id if it is still the active one
    Recycle(ConnectionId),
}

#[derive(Default)]
struct QueueState {
    items: Vec<Option<QueueItem>>,
    read_pos: usize,
    connection: Option<Arc<dyn Connection>>,
    /// The message the worker is delivering right now
    in_flight: Option<PushMessage>,
    worker_active: bool,
    worker: Option<JoinHandle<()>>,
    shutdown: bool,
}

pub(crate) struct QueueInner {
    factory: Arc<dyn ConnectionFactory>,
    observers: Observers,
    state: Mutex<QueueState>,
    idle_tx: watch::Sender<bool>,
    runtime: Handle,
    this: Weak<QueueInner>,
}

/// Push delivery service for one configured provider
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    /// Create a queue delivering through connections from `factory`
    ///
    /// Workers are spawned on the runtime this is called from.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        observers: Observers,
    ) -> Result<Self, PushError> {
        let runtime = Handle::try_current().map_err(|_| {
            PushError::Config("delivery queue must be created inside a Tokio runtime".to_string())
        })?;
        let (idle_tx, _) = watch::channel(true);

        let inner = Arc::new_cyclic(|this| QueueInner {
            factory,
            observers,
            state: Mutex::new(QueueState::default()),
            idle_tx,
            runtime,
            this: this.clone(),
        });

        Ok(Self { inner })
    }

    pub fn provider(&self) -> &str {
        self.inner.factory.name()
    }

    /// Queue a message for delivery
    ///
    /// Never blocks. During shutdown the message is reported as dropped instead.
    pub fn enqueue(&self, message: PushMessage) {
        let rejected = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                Some(message)
            } else {
                state.items.push(Some(QueueItem::Message(message)));
                self.inner.ensure_worker(&mut state);
                None
            }
        };

        if let Some(message) = rejected {
            self.inner.report_failure(DeliveryFailure::for_message(
                message,
                PushError::Dropped("delivery queue is shutting down".to_string()),
            ));
        }
    }

    /// Number of items waiting for the worker
    pub fn queued(&self) -> usize {
        let state = self.inner.state.lock();
        state.items.len() - state.read_pos
    }

    /// Wait until no worker is active
    ///
    /// Returns `PushError::Cancelled` when `timeout` elapses first; the queue is left as is.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<(), PushError> {
        let mut idle = self.inner.idle_tx.subscribe();
        let result = tokio::time::timeout(timeout, idle.wait_for(|idle| *idle)).await;
        match result {
            Ok(Ok(_)) => Ok(()),
            _ => Err(PushError::Cancelled),
        }
    }

    /// Stop accepting messages, report everything still queued as dropped, wait for the
    /// worker and close the connection
    ///
    /// A worker still busy after `GATEWAY_TIMEOUT` has its connection closed under it, which
    /// ends pending retries and makes it report the message it holds. A worker that ignores
    /// that too is aborted and its message reported as dropped. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (dropped, worker) = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            let read_pos = state.read_pos;
            let dropped: Vec<PushMessage> = state
                .items
                .drain(read_pos..)
                .flatten()
                .filter_map(|item| match item {
                    QueueItem::Message(message) => Some(message),
                    QueueItem::Recycle(_) => None,
                })
                .collect();
            state.items.clear();
            state.read_pos = 0;
            (dropped, state.worker.take())
        };

        if !dropped.is_empty() {
            info!(
                provider = self.provider(),
                count = dropped.len(),
                "Dropping queued messages on shutdown"
            );
        }
        for message in dropped {
            self.inner.report_failure(DeliveryFailure::for_message(
                message,
                PushError::Dropped("delivery queue is shutting down".to_string()),
            ));
        }

        if let Some(worker) = worker {
            self.stop_worker(worker).await;
        }

        let connection = self.inner.state.lock().connection.take();
        if let Some(connection) = connection {
            self.inner.close_connection(connection).await;
        }
    }
}

impl DeliveryQueue {
    async fn stop_worker(&self, mut worker: JoinHandle<()>) {
        let finished = tokio::time::timeout(GATEWAY_TIMEOUT, &mut worker).await;
        match finished {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                warn!("Delivery worker ended abnormally: {}", e);
                return;
            }
            Err(_) => {}
        }

        warn!(
            timeout = ?GATEWAY_TIMEOUT,
            "Delivery worker still busy, closing its connection"
        );
        let connection = self.inner.take_connection();
        if let Some(connection) = connection {
            self.inner.close_connection(connection).await;
        }
        if tokio::time::timeout(CLOSE_GRACE, &mut worker).await.is_ok() {
            return;
        }

        warn!("Delivery worker did not stop, aborting it");
        worker.abort();
        let _ = worker.await;

        let in_flight = self.inner.end_delivery();
        self.inner.worker_finished();
        if let Some(message) = in_flight {
            self.inner.report_failure(DeliveryFailure::for_message(
                message,
                PushError::Dropped("delivery worker aborted on shutdown".to_string()),
            ));
        }
    }
}

impl QueueInner {
    /// Start a worker unless one is running; called with the state lock held
    fn ensure_worker(&self, state: &mut QueueState) {
        if state.worker_active {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };

        state.worker_active = true;
        self.idle_tx.send_replace(false);
        state.worker = Some(self.runtime.spawn(worker::run(this)));
    }

    pub(crate) fn provider(&self) -> &str {
        self.factory.name()
    }

    pub(crate) fn observers(&self) -> &Observers {
        &self.observers
    }

    pub(crate) async fn connect(&self) -> Result<Arc<dyn Connection>, PushError> {
        let listener: Weak<dyn ConnectionListener> = self.this.clone();
        self.factory.connect(listener).await
    }

    /// Take the next item, or mark the worker finished when the queue is empty
    pub(crate) fn next_item(&self) -> Option<QueueItem> {
        let mut state = self.state.lock();

        while state.read_pos < state.items.len() {
            let read_pos = state.read_pos;
            let item = state.items[read_pos].take();
            state.read_pos += 1;

            if state.read_pos > COMPACT_AFTER {
                let consumed = state.read_pos;
                state.items.drain(..consumed);
                state.read_pos = 0;
            }

            if item.is_some() {
                return item;
            }
        }

        state.items.clear();
        state.items.shrink_to(IDLE_CAPACITY);
        state.read_pos = 0;
        state.worker_active = false;
        self.idle_tx.send_replace(true);
        None
    }

    /// Reset the worker flag after the worker died without draining the queue
    pub(crate) fn worker_finished(&self) {
        let mut state = self.state.lock();
        state.worker_active = false;
        self.idle_tx.send_replace(true);
    }

    /// Remember `message` until the worker is done with it
    pub(crate) fn begin_delivery(&self, message: &PushMessage) {
        self.state.lock().in_flight = Some(message.clone());
    }

    /// Forget the in-flight message; the caller now owns its outcome
    pub(crate) fn end_delivery(&self) -> Option<PushMessage> {
        self.state.lock().in_flight.take()
    }

    pub(crate) fn active_connection(&self) -> Option<Arc<dyn Connection>> {
        self.state.lock().connection.clone()
    }

    pub(crate) fn set_connection(&self, connection: Arc<dyn Connection>) {
        let previous = self.state.lock().connection.replace(connection);
        drop(previous);
    }

    /// Remove `id` from the active slot; `None` if another connection took its place
    pub(crate) fn detach_connection(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        let mut state = self.state.lock();
        match &state.connection {
            Some(connection) if connection.id() == id => state.connection.take(),
            _ => None,
        }
    }

    pub(crate) fn take_connection(&self) -> Option<Arc<dyn Connection>> {
        self.state.lock().connection.take()
    }

    pub(crate) async fn close_connection(&self, connection: Arc<dyn Connection>) {
        let id = connection.id();
        debug!(connection_id = id, provider = self.provider(), "Closing connection");
        if let Err(e) = connection.close().await {
            self.report_failure(DeliveryFailure::connection(e));
        }
        metrics::record_connection(self.provider(), "closed");
    }

    /// Hand a terminal failure to the producer
    pub(crate) fn report_failure(&self, failure: DeliveryFailure) {
        let token = failure
            .message
            .as_ref()
            .map(|m| m.token_prefix().to_string())
            .unwrap_or_default();
        warn!(
            provider = self.provider(),
            reason = %failure.reason(),
            token = %token,
            "Push delivery failed: {}",
            failure.error
        );
        metrics::record_message(self.provider(), failure.reason().as_str());
        self.observers.failed(&failure);
    }
}

impl ConnectionListener for QueueInner {
    fn connection_closed(&self, id: ConnectionId, requeue: Vec<PushMessage>) {
        if requeue.is_empty() {
            debug!(connection_id = id, "Connection closed");
            return;
        }

        let dropped = {
            let mut state = self.state.lock();
            if state.shutdown {
                requeue
            } else {
                debug!(
                    connection_id = id,
                    count = requeue.len(),
                    "Requeueing unconfirmed messages"
                );
                state
                    .items
                    .extend(requeue.into_iter().map(|m| Some(QueueItem::Message(m))));
                self.ensure_worker(&mut state);
                Vec::new()
            }
        };

        for message in dropped {
            self.report_failure(DeliveryFailure::for_message(
                message,
                PushError::Dropped("delivery queue is shutting down".to_string()),
            ));
        }
    }

    fn recycle_requested(&self, id: ConnectionId) {
        let mut state = self.state.lock();
        let active = state.connection.as_ref().map(|c| c.id());
        if state.shutdown || active != Some(id) {
            debug!(connection_id = id, "Ignoring stale recycle request");
            return;
        }

        let read_pos = state.read_pos;
        state.items.insert(read_pos, Some(QueueItem::Recycle(id)));
        self.ensure_worker(&mut state);
    }

    fn report(&self, failure: DeliveryFailure) {
        self.report_failure(failure);
    }
}
