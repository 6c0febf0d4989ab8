use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use push_core::{BoxError, DeliveryFailure, PushMessage};

pub type ErrorCallback = Arc<dyn Fn(&DeliveryFailure) + Send + Sync>;
pub type SendCallback = Arc<dyn Fn(&PushMessage) -> Result<(), BoxError> + Send + Sync>;

/// Producer hooks invoked by the delivery queue
///
/// Both are best-effort: a failing or panicking callback is logged and otherwise ignored.
#[derive(Clone, Default)]
pub struct Observers {
    on_error: Option<ErrorCallback>,
    before_send: Option<SendCallback>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once for every terminal delivery failure
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DeliveryFailure) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Called right before a message is handed to the connection
    pub fn before_send<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PushMessage) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.before_send = Some(Arc::new(callback));
        self
    }

    pub(crate) fn failed(&self, failure: &DeliveryFailure) {
        if let Some(callback) = &self.on_error {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(failure))) {
                warn!(
                    "Error callback panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    pub(crate) fn sending(&self, message: &PushMessage) {
        if let Some(callback) = &self.before_send {
            match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    token = message.token_prefix(),
                    "Pre-send callback failed: {}", e
                ),
                Err(panic) => warn!(
                    token = message.token_prefix(),
                    "Pre-send callback panicked: {}",
                    panic_message(panic.as_ref())
                ),
            }
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("on_error", &self.on_error.is_some())
            .field("before_send", &self.before_send.is_some())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
