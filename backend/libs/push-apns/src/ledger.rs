use tracing::debug;

use push_core::{DeliveryFailure, PushError, PushMessage};

use crate::codec::{ErrorResponse, STATUS_INVALID_TOKEN};

/// Messages written on one legacy connection, indexed by notification identifier
///
/// Identifiers are dense and start at 0 for every connection. A slot holds the message
/// written under that identifier, or a tombstone once it is resolved (or for the close
/// sentinel, which never carried a message).
#[derive(Debug, Default)]
pub struct PendingLedger {
    slots: Vec<Option<PushMessage>>,
}

/// What an error response means for the messages still in the ledger
#[derive(Debug, Default)]
pub struct Resolution {
    /// The message the gateway rejected, if its slot still held one
    pub failed: Option<DeliveryFailure>,
    /// Messages written after the rejected one; the gateway discarded them
    pub requeue: Vec<PushMessage>,
    /// The error referred to our own close sentinel
    pub clean_shutdown: bool,
}

impl PendingLedger {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Identifier the next `record` call will assign
    pub fn next_identifier(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Record a written frame; `None` marks the close sentinel
    pub fn record(&mut self, message: Option<PushMessage>) -> u32 {
        let identifier = self.next_identifier();
        self.slots.push(message);
        identifier
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Apply an error response
    ///
    /// The referenced identifier failed, everything before it is implicitly delivered and
    /// everything after it must be sent again. An error against the last identifier whose
    /// slot is a tombstone is the gateway answering our close sentinel.
    pub fn resolve(mut self, response: ErrorResponse) -> Resolution {
        let failed_id = response.identifier as usize;

        if failed_id + 1 == self.slots.len() && self.slots[failed_id].is_none() {
            debug!(
                identifier = response.identifier,
                "Error response refers to close sentinel"
            );
            return Resolution {
                clean_shutdown: true,
                ..Default::default()
            };
        }

        let failed = self
            .slots
            .get_mut(failed_id)
            .and_then(Option::take)
            .map(|message| {
                let error = if response.status == STATUS_INVALID_TOKEN {
                    PushError::DeviceNotFound
                } else {
                    PushError::Service(format!(
                        "submit notification to '{}' failed error #{} ({})",
                        message.token_prefix(),
                        response.status,
                        response.description()
                    ))
                };
                DeliveryFailure::for_message(message, error)
            });

        let resolved = (failed_id + 1).min(self.slots.len());
        let requeue = self.slots.drain(resolved..).flatten().collect();

        Resolution {
            failed,
            requeue,
            clean_shutdown: false,
        }
    }

    /// Every message still awaiting confirmation, in identifier order
    pub fn drain_pending(self) -> Vec<PushMessage> {
        self.slots.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message(n: usize) -> PushMessage {
        PushMessage::with_time_to_live(
            format!("{n:064x}"),
            Default::default(),
            false,
            Duration::from_secs(600),
        )
        .unwrap()
    }

    fn ledger_with(count: usize) -> PendingLedger {
        let mut ledger = PendingLedger::with_capacity(count);
        for n in 0..count {
            assert_eq!(ledger.record(Some(message(n))), n as u32);
        }
        ledger
    }

    fn tokens(messages: &[PushMessage]) -> Vec<String> {
        messages.iter().map(|m| m.device_token().to_string()).collect()
    }

    #[test]
    fn test_invalid_token_in_the_middle() {
        let resolution = ledger_with(8).resolve(ErrorResponse {
            status: 8,
            identifier: 5,
        });

        let failed = resolution.failed.unwrap();
        assert_eq!(failed.error, PushError::DeviceNotFound);
        assert_eq!(failed.message.unwrap().device_token(), format!("{:064x}", 5));
        assert_eq!(tokens(&resolution.requeue), tokens(&[message(6), message(7)]));
        assert!(!resolution.clean_shutdown);
    }

    #[test]
    fn test_other_status_is_service_error() {
        let resolution = ledger_with(3).resolve(ErrorResponse {
            status: 7,
            identifier: 0,
        });

        match resolution.failed.unwrap().error {
            PushError::Service(text) => assert!(text.contains("error #7")),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(resolution.requeue.len(), 2);
    }

    #[test]
    fn test_error_against_close_sentinel_is_clean() {
        let mut ledger = ledger_with(3);
        assert_eq!(ledger.record(None), 3);

        let resolution = ledger.resolve(ErrorResponse {
            status: 2,
            identifier: 3,
        });
        assert!(resolution.clean_shutdown);
        assert!(resolution.failed.is_none());
        assert!(resolution.requeue.is_empty());
    }

    #[test]
    fn test_unknown_identifier_resolves_everything() {
        let resolution = ledger_with(4).resolve(ErrorResponse {
            status: 1,
            identifier: 99,
        });
        assert!(resolution.failed.is_none());
        assert!(resolution.requeue.is_empty());
    }

    #[test]
    fn test_drain_pending_skips_tombstones() {
        let mut ledger = ledger_with(2);
        ledger.record(None);
        ledger.record(Some(message(9)));
        assert_eq!(
            tokens(&ledger.drain_pending()),
            tokens(&[message(0), message(1), message(9)])
        );
    }
}
