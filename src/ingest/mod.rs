//! Ingest abstraction
//!
//! Overview
//! --------
//! Ports the consumer needs from a brokered queue: a source of deliveries
//! ([`Transport::receive`]) and the settlement calls ([`Settle`]). Concrete
//! implementations include Redis Streams (`crate::redis`).

mod envelope;

pub use envelope::{Delivery, Envelope, SettlementHandle, SettlementMode};

use chrono::{DateTime, Utc};

use crate::errors::{ConsumerError, SettlementError};

/// Settlement calls on a delivery id. Each fails with a [`SettlementError`]
/// when the lock has expired or the id is unknown.
#[async_trait::async_trait]
pub trait Settle: Send + Sync {
    /// Acknowledge successful processing; the broker drops the message.
    async fn complete(&self, id: &str) -> Result<(), SettlementError>;

    /// Release the lock so the message becomes redeliverable.
    async fn abandon(&self, id: &str) -> Result<(), SettlementError>;

    /// Move the message to the dead-letter queue; it will not be retried.
    async fn dead_letter(&self, id: &str, reason: &str, description: &str)
        -> Result<(), SettlementError>;
}

#[async_trait::async_trait]
pub trait Transport: Settle {
    /// Next delivery, or `None` when nothing arrived within the poll window.
    async fn receive(&self) -> Result<Option<Envelope>, ConsumerError>;

    /// Extend the lock on `id`; returns the new expiry.
    async fn renew_lock(&self, id: &str) -> Result<DateTime<Utc>, SettlementError>;
}
