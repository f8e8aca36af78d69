//! Emit layer: outbound side effects that are not settlement.
//!
//! - [`ErrorSink`]: best-effort alerting for unrecoverable and settlement
//!   failures.
//! - [`dlq`]: dead-letter stream records used by the Redis transport.

use crate::errors::ConsumerError;
use crate::ingest::Delivery;

pub mod dlq;
pub mod sink;

pub use sink::{LogSink, StreamAlertSink};

/// Receives failures that abandon cannot recover from.
///
/// Fire-and-forget: implementations must not panic or return errors, and a
/// failed notification must never block settlement. Log and move on.
#[async_trait::async_trait]
pub trait ErrorSink: Send + Sync {
    async fn notify(&self, delivery: &Delivery, error: &ConsumerError);
}

#[async_trait::async_trait]
impl<S: ErrorSink + ?Sized> ErrorSink for std::sync::Arc<S> {
    async fn notify(&self, delivery: &Delivery, error: &ConsumerError) {
        (**self).notify(delivery, error).await
    }
}
