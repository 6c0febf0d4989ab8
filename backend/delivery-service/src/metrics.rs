use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, TextEncoder};

static PUSH_MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "push_messages_total",
            "Push messages handled by the delivery queue, by outcome",
        ),
        &["provider", "outcome"],
    )
    .expect("failed to create push_messages_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register push_messages_total");
    counter
});

static PUSH_CONNECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "push_connections_total",
            "Gateway connection lifecycle events",
        ),
        &["provider", "event"],
    )
    .expect("failed to create push_connections_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register push_connections_total");
    counter
});

/// `outcome` is `sent` or an `ErrorReason` code
pub fn record_message(provider: &str, outcome: &str) {
    PUSH_MESSAGES_TOTAL
        .with_label_values(&[provider, outcome])
        .inc();
}

/// `event` is one of `connected`, `connect_failed`, `closed`, `recycled`
pub fn record_connection(provider: &str, event: &str) {
    PUSH_CONNECTIONS_TOTAL
        .with_label_values(&[provider, event])
        .inc();
}

/// Render the default registry in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_exported() {
        record_message("metrics-test", "sent");
        record_connection("metrics-test", "connected");

        let text = render().unwrap();
        let exported = |name: &str, label: &str| {
            text.lines().any(|line| {
                line.starts_with(name)
                    && line.contains("provider=\"metrics-test\"")
                    && line.contains(label)
            })
        };
        assert!(exported("push_messages_total", "outcome=\"sent\""));
        assert!(exported("push_connections_total", "event=\"connected\""));
    }
}
