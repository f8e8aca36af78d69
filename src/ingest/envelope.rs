//! Delivered-message value objects.
//!
//! An [`Envelope`] is what the transport hands to the consumer for one
//! delivery: the read-only [`Delivery`] plus, under manual settlement, the
//! [`SettlementHandle`] used to resolve it. The handle is consumed by its
//! settlement call, so a single envelope can be settled at most once.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::Settle;
use crate::errors::SettlementError;

/// Who settles a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementMode {
    /// The transport acknowledges on successful handler return.
    AutoComplete,
    /// The consumer must complete / abandon / dead-letter explicitly.
    ManualComplete,
}

impl fmt::Display for SettlementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementMode::AutoComplete => f.write_str("auto-complete"),
            SettlementMode::ManualComplete => f.write_str("manual-complete"),
        }
    }
}

/// Immutable view of one delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    id: String,
    payload: Bytes,
    delivery_count: u32,
    locked_until: DateTime<Utc>,
    received_at: DateTime<Utc>,
    mode: SettlementMode,
}

impl Delivery {
    /// `delivery_count` is clamped to at least 1.
    pub fn new(
        id: impl Into<String>,
        payload: impl Into<Bytes>,
        delivery_count: u32,
        locked_until: DateTime<Utc>,
        mode: SettlementMode,
    ) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            delivery_count: delivery_count.max(1),
            locked_until,
            received_at: Utc::now(),
            mode,
        }
    }

    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Broker message id. A redelivery of the same message carries the same
    /// id; what is unique per delivery attempt is the envelope itself, and
    /// its handle allows one settlement for that attempt only.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn locked_until(&self) -> DateTime<Utc> {
        self.locked_until
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn mode(&self) -> SettlementMode {
        self.mode
    }
}

/// One-shot authority to settle a specific delivery.
pub struct SettlementHandle {
    id: String,
    port: Arc<dyn Settle>,
}

impl SettlementHandle {
    pub fn new(id: impl Into<String>, port: Arc<dyn Settle>) -> Self {
        Self {
            id: id.into(),
            port,
        }
    }

    /// Broker message id. A redelivery of the same message carries the same
    /// id; what is unique per delivery attempt is the envelope itself, and
    /// its handle allows one settlement for that attempt only.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn complete(self) -> Result<(), SettlementError> {
        self.port.complete(&self.id).await
    }

    pub async fn abandon(self) -> Result<(), SettlementError> {
        self.port.abandon(&self.id).await
    }

    pub async fn dead_letter(self, reason: &str, description: &str) -> Result<(), SettlementError> {
        self.port.dead_letter(&self.id, reason, description).await
    }
}

impl fmt::Debug for SettlementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettlementHandle").field("id", &self.id).finish()
    }
}

#[derive(Debug)]
pub struct Envelope {
    delivery: Delivery,
    handle: Option<SettlementHandle>,
}

impl Envelope {
    /// Envelope for auto-complete consumers; carries no settlement authority.
    pub fn auto(delivery: Delivery) -> Self {
        Self {
            delivery,
            handle: None,
        }
    }

    /// Envelope for manual-complete consumers. A `None` handle is a transport
    /// contract violation that the settlement engine refuses to process.
    pub fn manual(delivery: Delivery, handle: Option<SettlementHandle>) -> Self {
        Self { delivery, handle }
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn into_parts(self) -> (Delivery, Option<SettlementHandle>) {
        (self.delivery, self.handle)
    }
}
