use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use push_core::{
    next_connection_id, Connection, ConnectionFactory, ConnectionId, ConnectionListener,
    DeliveryFailure, PushError, PushMessage,
};
use resilience::with_timeout;

use crate::codec::{encode_frame, ErrorResponse, ERROR_RESPONSE_SIZE};
use crate::config::{
    LegacyConfig, DEFAULT_CLOSE_TIMEOUT, DEFAULT_RECYCLE_COUNT, DEFAULT_RECYCLE_TIMEOUT,
};
use crate::ledger::PendingLedger;
use crate::transport::connect_tls;

/// Per-connection limits
#[derive(Debug, Clone)]
pub struct LegacySettings {
    /// Identifiers used before the connection asks to be recycled
    pub recycle_count: u32,
    /// Lifetime after which the connection asks to be recycled
    pub recycle_timeout: Duration,
    /// How long `close` waits for the gateway to confirm the close sentinel
    pub close_timeout: Duration,
}

impl Default for LegacySettings {
    fn default() -> Self {
        Self {
            recycle_count: DEFAULT_RECYCLE_COUNT,
            recycle_timeout: DEFAULT_RECYCLE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl From<&LegacyConfig> for LegacySettings {
    fn from(config: &LegacyConfig) -> Self {
        Self {
            recycle_count: config.recycle_count,
            recycle_timeout: config.recycle_timeout,
            close_timeout: config.close_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyState {
    Available,
    Closing,
    Closed,
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// How the response listener ended
enum Termination {
    Response(ErrorResponse),
    Eof,
    ReadFailed(String),
    Aborted,
}

struct Inner {
    state: LegacyState,
    next_identifier: u32,
    ledger: Option<PendingLedger>,
}

/// State shared between the connection handle and its response listener task
struct Shared {
    id: ConnectionId,
    inner: Mutex<Inner>,
    writer: AsyncMutex<Option<Writer>>,
    listener: Weak<dyn ConnectionListener>,
    finished: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    /// Move to `Closed` and hand the ledger's verdict to the listener; runs once
    fn finish(&self, termination: Termination) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        let (previous, ledger) = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = LegacyState::Closed;
            (previous, inner.ledger.take())
        };

        let (requeue, failure) = match termination {
            Termination::Response(response) => {
                let resolution = ledger.map(|l| l.resolve(response)).unwrap_or_default();
                if resolution.clean_shutdown {
                    info!(connection_id = self.id, "Gateway confirmed close");
                } else {
                    warn!(
                        connection_id = self.id,
                        status = response.status,
                        identifier = response.identifier,
                        "Gateway rejected notification: {}",
                        response.description()
                    );
                }
                (resolution.requeue, resolution.failed)
            }
            Termination::Eof => {
                self.dropped(previous, ledger, "connection dropped by gateway".to_string())
            }
            Termination::ReadFailed(e) => self.dropped(
                previous,
                ledger,
                format!("reading gateway response failed: {e}"),
            ),
            Termination::Aborted => (
                ledger.map(PendingLedger::drain_pending).unwrap_or_default(),
                None,
            ),
        };

        match self.listener.upgrade() {
            Some(listener) => {
                if let Some(failure) = failure {
                    listener.report(failure);
                }
                listener.connection_closed(self.id, requeue);
            }
            None if !requeue.is_empty() => warn!(
                connection_id = self.id,
                count = requeue.len(),
                "Connection listener gone, discarding unconfirmed messages"
            ),
            None => {}
        }

        self.closed_tx.send_replace(true);
    }

    fn dropped(
        &self,
        previous: LegacyState,
        ledger: Option<PendingLedger>,
        reason: String,
    ) -> (Vec<PushMessage>, Option<DeliveryFailure>) {
        let pending = ledger.map(PendingLedger::drain_pending).unwrap_or_default();
        let failure = (previous == LegacyState::Available || !pending.is_empty()).then(|| {
            warn!(
                connection_id = self.id,
                requeued = pending.len(),
                "{}",
                reason
            );
            DeliveryFailure::connection(PushError::Connection(reason))
        });
        (pending, failure)
    }

    async fn release_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(connection_id = self.id, "Transport shutdown failed: {}", e);
            }
        }
    }
}

/// Connection to the legacy binary gateway
///
/// Notifications are pipelined: the gateway only ever answers with a single error
/// response right before it drops the connection, so every written message stays in
/// the ledger until the connection ends.
pub struct LegacyConnection {
    shared: Arc<Shared>,
    settings: LegacySettings,
    reader: Mutex<Option<JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl LegacyConnection {
    /// Take over an established transport and start the response listener and recycle timer
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<S>(
        stream: S,
        settings: LegacySettings,
        listener: Weak<dyn ConnectionListener>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = next_connection_id();
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed_tx, _) = watch::channel(false);
        let writer: Writer = Box::new(write_half);

        let shared = Arc::new(Shared {
            id,
            inner: Mutex::new(Inner {
                state: LegacyState::Available,
                next_identifier: 0,
                ledger: Some(PendingLedger::with_capacity(
                    settings.recycle_count as usize,
                )),
            }),
            writer: AsyncMutex::new(Some(writer)),
            listener: listener.clone(),
            finished: AtomicBool::new(false),
            closed_tx,
        });

        let reader = tokio::spawn(read_responses(read_half, shared.clone()));
        let timer = tokio::spawn(recycle_timer(id, settings.recycle_timeout, listener));

        info!(connection_id = id, "Legacy gateway connection available");

        Self {
            shared,
            settings,
            reader: Mutex::new(Some(reader)),
            timer: Mutex::new(Some(timer)),
        }
    }

    pub fn state(&self) -> LegacyState {
        self.shared.inner.lock().state
    }

    /// Messages written but not yet confirmed
    pub fn pending(&self) -> usize {
        self.shared
            .inner
            .lock()
            .ledger
            .as_ref()
            .map_or(0, PendingLedger::len)
    }

    fn stop_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    async fn force_close(&self) {
        self.stop_timer();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.finish(Termination::Aborted);
        self.shared.release_writer().await;
    }

    async fn write_sentinel(&self) -> Result<(), PushError> {
        let mut writer = self.shared.writer.lock().await;

        let (identifier, frame) = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            let Some(ledger) = inner.ledger.as_mut() else {
                return Ok(());
            };
            let identifier = ledger.record(None);
            inner.next_identifier = identifier + 1;
            (identifier, encode_frame(None, identifier, Utc::now())?)
        };

        let result = match writer.as_mut() {
            Some(w) => write_frame(w, &frame).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "transport released")),
        };
        result.map_err(|e| PushError::Connection(format!("sending close request failed: {e}")))?;

        debug!(connection_id = self.shared.id, identifier, "Close sentinel written");
        Ok(())
    }
}

impl Drop for LegacyConnection {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl Connection for LegacyConnection {
    fn id(&self) -> ConnectionId {
        self.shared.id
    }

    fn is_available(&self) -> bool {
        self.state() == LegacyState::Available
    }

    fn needs_recycle(&self) -> bool {
        self.shared.inner.lock().next_identifier >= self.settings.recycle_count
    }

    async fn send(&self, message: PushMessage) -> Result<(), DeliveryFailure> {
        let mut writer = self.shared.writer.lock().await;

        // Identifier assignment and ledger entry happen together so wire order matches
        // ledger order.
        let reserved = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            match inner.ledger.as_mut() {
                Some(ledger) => {
                    let identifier = ledger.next_identifier();
                    match encode_frame(Some(&message), identifier, Utc::now()) {
                        Ok(frame) => {
                            let token = message.token_prefix().to_string();
                            ledger.record(Some(message));
                            inner.next_identifier = identifier + 1;
                            Ok((identifier, token, frame))
                        }
                        Err(error) => return Err(DeliveryFailure::for_message(message, error)),
                    }
                }
                None => Err(message),
            }
        };

        let (identifier, token, frame) = match reserved {
            Ok(reserved) => reserved,
            Err(message) => {
                drop(writer);
                debug!(
                    connection_id = self.shared.id,
                    "Connection already closed, handing message back"
                );
                return match self.shared.listener.upgrade() {
                    Some(listener) => {
                        listener.connection_closed(self.shared.id, vec![message]);
                        Ok(())
                    }
                    None => Err(DeliveryFailure::for_message(
                        message,
                        PushError::Connection("connection closed".to_string()),
                    )),
                };
            }
        };

        let result = match writer.as_mut() {
            Some(w) => write_frame(w, &frame).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "transport released")),
        };
        drop(writer);

        match result {
            Ok(()) => {
                debug!(
                    connection_id = self.shared.id,
                    identifier,
                    token = %token,
                    bytes = frame.len(),
                    "Notification written"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    connection_id = self.shared.id,
                    identifier, "Write to gateway failed: {}", e
                );
                self.shared.inner.lock().state = LegacyState::Closing;
                self.force_close().await;
                Err(DeliveryFailure::connection(PushError::Connection(format!(
                    "sending request to gateway failed: {e}"
                ))))
            }
        }
    }

    async fn close(&self) -> Result<(), PushError> {
        let was_available = {
            let mut inner = self.shared.inner.lock();
            let available = inner.state == LegacyState::Available;
            if available {
                inner.state = LegacyState::Closing;
            }
            available
        };
        self.stop_timer();

        if !was_available {
            self.force_close().await;
            return Ok(());
        }

        info!(
            connection_id = self.shared.id,
            pending = self.pending(),
            "Closing legacy gateway connection"
        );

        if let Err(e) = self.write_sentinel().await {
            self.force_close().await;
            return Err(e);
        }

        if self.await_close(self.settings.close_timeout).await {
            return Ok(());
        }

        warn!(
            connection_id = self.shared.id,
            timeout = ?self.settings.close_timeout,
            "Gateway did not confirm close, forcing shutdown"
        );
        self.force_close().await;
        Err(PushError::Service(
            "shutdown of gateway connection timed out".to_string(),
        ))
    }

    async fn await_close(&self, timeout: Duration) -> bool {
        let mut closed = self.shared.closed_tx.subscribe();
        let result = tokio::time::timeout(timeout, closed.wait_for(|closed| *closed)).await;
        matches!(result, Ok(Ok(_)))
    }
}

async fn write_frame(writer: &mut Writer, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read one error response, or EOF
async fn read_error_response<R>(reader: &mut R) -> io::Result<Option<[u8; ERROR_RESPONSE_SIZE]>>
where
    R: AsyncRead + Unpin,
{
    let mut frame = [0u8; ERROR_RESPONSE_SIZE];
    let mut filled = 0;

    while filled < ERROR_RESPONSE_SIZE {
        let n = reader.read(&mut frame[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    match filled {
        ERROR_RESPONSE_SIZE => Ok(Some(frame)),
        0 => Ok(None),
        n => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("incomplete error response ({n} of {ERROR_RESPONSE_SIZE} bytes)"),
        )),
    }
}

async fn read_responses<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let termination = match read_error_response(&mut reader).await {
        Ok(Some(frame)) => match ErrorResponse::parse(&frame) {
            Some(response) => Termination::Response(response),
            None => Termination::ReadFailed(format!("unexpected command {:#04x}", frame[0])),
        },
        Ok(None) => Termination::Eof,
        Err(e) => Termination::ReadFailed(e.to_string()),
    };

    shared.finish(termination);
    shared.release_writer().await;
}

async fn recycle_timer(id: ConnectionId, after: Duration, listener: Weak<dyn ConnectionListener>) {
    tokio::time::sleep(after).await;
    if let Some(listener) = listener.upgrade() {
        debug!(connection_id = id, "Recycle interval elapsed");
        listener.recycle_requested(id);
    }
}

/// Connect to the configured gateway and start a `LegacyConnection` on it
pub async fn connect(
    config: &LegacyConfig,
    listener: Weak<dyn ConnectionListener>,
) -> Result<LegacyConnection, PushError> {
    let (host, port) = config.gateway_address();
    info!(host = %host, port, "Connecting to legacy gateway");

    let stream = with_timeout(
        config.connect_timeout,
        connect_tls(&host, port, config.tls.clone()),
    )
    .await
    .map_err(|_| {
        PushError::Timeout(format!(
            "connect({host}:{port}) timed out after {:?}",
            config.connect_timeout
        ))
    })??;

    Ok(LegacyConnection::start(
        stream,
        LegacySettings::from(config),
        listener,
    ))
}

/// Produces legacy gateway connections for the delivery queue
pub struct LegacyConnectionFactory {
    config: LegacyConfig,
}

impl LegacyConnectionFactory {
    pub fn new(config: LegacyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LegacyConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionFactory for LegacyConnectionFactory {
    fn name(&self) -> &str {
        "apns-legacy"
    }

    async fn connect(
        &self,
        listener: Weak<dyn ConnectionListener>,
    ) -> Result<Arc<dyn Connection>, PushError> {
        let connection = connect(&self.config, listener).await?;
        Ok(Arc::new(connection))
    }
}
