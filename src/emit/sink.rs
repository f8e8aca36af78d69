//! Error sinks: log-only, and a Redis stream that alerting consumes.

use deadpool_redis::Pool;
use tracing::{error, warn};

use super::ErrorSink;
use crate::errors::ConsumerError;
use crate::ingest::Delivery;
use crate::types::fp::append_entry;

/// Sink that only records the alert in the log.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl ErrorSink for LogSink {
    async fn notify(&self, delivery: &Delivery, err: &ConsumerError) {
        error!(
            message_id = %delivery.id(),
            delivery_count = delivery.delivery_count(),
            error = %err,
            "alert"
        );
    }
}

/// Appends one entry per alert to a Redis stream.
#[derive(Clone)]
pub struct StreamAlertSink {
    pool: Pool,
    stream: String,
}

impl StreamAlertSink {
    pub fn new(pool: Pool, stream: &str) -> Self {
        Self {
            pool,
            stream: stream.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ErrorSink for StreamAlertSink {
    async fn notify(&self, delivery: &Delivery, err: &ConsumerError) {
        let count = delivery.delivery_count().to_string();
        let locked_until = delivery.locked_until().to_rfc3339();
        let text = err.to_string();
        let res = append_entry(
            &self.pool,
            &self.stream,
            &[
                ("message_id", delivery.id().as_bytes()),
                ("delivery_count", count.as_bytes()),
                ("locked_until", locked_until.as_bytes()),
                ("error", text.as_bytes()),
            ],
        )
        .await;

        if let Err(e) = res {
            warn!(
                error = %e,
                message_id = %delivery.id(),
                stream = %self.stream,
                "alert delivery failed"
            );
        }
    }
}
