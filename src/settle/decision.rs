//! Settlement decision table.
//!
//! | mode   | outcome   | decision                                    |
//! |--------|-----------|---------------------------------------------|
//! | manual | succeeded | `Complete`                                  |
//! | manual | failed    | `Abandon`, or `DeadLetter` past the policy  |
//! | auto   | succeeded | `NoOp`                                      |
//! | auto   | failed    | `Unrecoverable`                             |
//!
//! [`decide`] is a pure function; executing the decision is the engine's job.

use std::fmt;

use crate::errors::ConsumerError;
use crate::ingest::SettlementMode;

/// Dead-letter reason used when the delivery-count policy trips.
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Complete,
    Abandon,
    DeadLetter { reason: String, description: String },
    /// Auto-complete is active and processing succeeded; the transport acks.
    NoOp,
    /// Auto-complete is active and processing failed; must propagate.
    Unrecoverable,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Complete => "complete",
            Decision::Abandon => "abandon",
            Decision::DeadLetter { .. } => "dead_letter",
            Decision::NoOp => "noop",
            Decision::Unrecoverable => "unrecoverable",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Consumer-side redelivery policy. `None` never dead-letters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_delivery_count: Option<u32>,
}

impl DeliveryPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn max_deliveries(n: u32) -> Self {
        Self {
            max_delivery_count: Some(n),
        }
    }

    /// True once this delivery is the last one the policy allows.
    pub fn exhausted(&self, delivery_count: u32) -> bool {
        matches!(self.max_delivery_count, Some(max) if delivery_count >= max)
    }
}

/// A call the consumer makes on its settlement handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementAction {
    Complete,
    Abandon,
    DeadLetter { reason: String, description: String },
}

impl From<SettlementAction> for Decision {
    fn from(action: SettlementAction) -> Self {
        match action {
            SettlementAction::Complete => Decision::Complete,
            SettlementAction::Abandon => Decision::Abandon,
            SettlementAction::DeadLetter {
                reason,
                description,
            } => Decision::DeadLetter {
                reason,
                description,
            },
        }
    }
}

/// Manual-mode half of the table: every outcome maps to a settlement call.
pub fn settlement_action(
    policy: &DeliveryPolicy,
    delivery_count: u32,
    outcome: &Result<(), ConsumerError>,
) -> SettlementAction {
    match outcome {
        Ok(()) => SettlementAction::Complete,
        Err(e) if policy.exhausted(delivery_count) => SettlementAction::DeadLetter {
            reason: MAX_DELIVERY_COUNT_EXCEEDED.to_string(),
            description: e.to_string(),
        },
        Err(_) => SettlementAction::Abandon,
    }
}

pub fn decide(
    mode: SettlementMode,
    policy: &DeliveryPolicy,
    delivery_count: u32,
    outcome: &Result<(), ConsumerError>,
) -> Decision {
    match (mode, outcome) {
        (SettlementMode::ManualComplete, _) => {
            settlement_action(policy, delivery_count, outcome).into()
        }
        (SettlementMode::AutoComplete, Ok(())) => Decision::NoOp,
        (SettlementMode::AutoComplete, Err(_)) => Decision::Unrecoverable,
    }
}
