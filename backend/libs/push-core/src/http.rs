use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{
    next_connection_id, Connection, ConnectionFactory, ConnectionId, ConnectionListener,
};
use crate::error::{DeliveryFailure, PushError};
use crate::message::PushMessage;

/// A stateless HTTPS push endpoint
#[async_trait]
pub trait WebGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Pre-warm provider state (credentials, tokens) before the first send
    async fn init(&self, _cancel: &CancellationToken) -> Result<(), PushError> {
        Ok(())
    }

    /// Deliver one message, retrying transient gateway failures internally
    async fn send(&self, message: &PushMessage, cancel: &CancellationToken)
        -> Result<(), PushError>;
}

/// Connection adapter over a `WebGateway`
///
/// Always available until closed. Closing cancels any request or backoff still in flight.
pub struct HttpConnection {
    id: ConnectionId,
    gateway: Arc<dyn WebGateway>,
    cancel: CancellationToken,
}

impl HttpConnection {
    pub fn new(gateway: Arc<dyn WebGateway>, cancel: CancellationToken) -> Self {
        Self {
            id: next_connection_id(),
            gateway,
            cancel,
        }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_available(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    async fn send(&self, message: PushMessage) -> Result<(), DeliveryFailure> {
        debug!(
            connection_id = self.id,
            gateway = self.gateway.name(),
            token = message.token_prefix(),
            "Sending push message"
        );

        match self.gateway.send(&message, &self.cancel).await {
            Ok(()) => Ok(()),
            Err(error) => Err(DeliveryFailure::for_message(message, error)),
        }
    }

    async fn close(&self) -> Result<(), PushError> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Hands out `HttpConnection`s sharing one gateway instance
///
/// The gateway is initialized on the first successful connect; a failed init is retried on
/// the next one.
pub struct HttpConnectionFactory {
    gateway: Arc<dyn WebGateway>,
    initialized: OnceCell<()>,
    cancel: CancellationToken,
}

impl HttpConnectionFactory {
    pub fn new(gateway: Arc<dyn WebGateway>) -> Self {
        Self {
            gateway,
            initialized: OnceCell::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn WebGateway> {
        &self.gateway
    }
}

impl Drop for HttpConnectionFactory {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ConnectionFactory for HttpConnectionFactory {
    fn name(&self) -> &str {
        self.gateway.name()
    }

    async fn connect(
        &self,
        _listener: Weak<dyn ConnectionListener>,
    ) -> Result<Arc<dyn Connection>, PushError> {
        self.initialized
            .get_or_try_init(|| async {
                self.gateway.init(&self.cancel).await?;
                info!(gateway = self.gateway.name(), "Push gateway initialized");
                Ok::<(), PushError>(())
            })
            .await?;

        let connection = HttpConnection::new(self.gateway.clone(), self.cancel.child_token());
        Ok(Arc::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyInit {
        inits: AtomicU32,
    }

    #[async_trait]
    impl WebGateway for FlakyInit {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn init(&self, _cancel: &CancellationToken) -> Result<(), PushError> {
            if self.inits.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(PushError::Authentication("first init fails".into()))
            } else {
                Ok(())
            }
        }

        async fn send(
            &self,
            message: &PushMessage,
            cancel: &CancellationToken,
        ) -> Result<(), PushError> {
            if message.device_token() == "slow" {
                cancel.cancelled().await;
                return Err(PushError::Cancelled);
            }
            Ok(())
        }
    }

    struct NoopListener;

    impl ConnectionListener for NoopListener {
        fn connection_closed(&self, _id: ConnectionId, _requeue: Vec<PushMessage>) {}
        fn recycle_requested(&self, _id: ConnectionId) {}
        fn report(&self, _failure: DeliveryFailure) {}
    }

    fn listener() -> Weak<dyn ConnectionListener> {
        let weak: Weak<NoopListener> = Weak::new();
        weak
    }

    fn message(token: &str) -> PushMessage {
        PushMessage::with_time_to_live(
            token,
            Default::default(),
            false,
            Duration::from_secs(300),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_init_retried_until_success() {
        let gateway = Arc::new(FlakyInit {
            inits: AtomicU32::new(0),
        });
        let factory = HttpConnectionFactory::new(gateway.clone());

        let first = factory.connect(listener()).await;
        assert!(matches!(first, Err(PushError::Authentication(_))));

        let conn = factory.connect(listener()).await.unwrap();
        assert!(conn.is_available());
        assert!(conn.send(message("device-1")).await.is_ok());

        factory.connect(listener()).await.unwrap();
        assert_eq!(gateway.inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_send() {
        let gateway = Arc::new(FlakyInit {
            inits: AtomicU32::new(1),
        });
        let factory = HttpConnectionFactory::new(gateway);
        let conn = factory.connect(listener()).await.unwrap();

        let sender = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(message("slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.close().await.unwrap();

        let failure = sender.await.unwrap().unwrap_err();
        assert_eq!(failure.error, PushError::Cancelled);
        assert_eq!(failure.message.unwrap().device_token(), "slow");
        assert!(!conn.is_available());
    }
}
