//! Settlement engine (hot path).
//!
//! Overview
//! --------
//! `handle` drives one envelope through decode → work → decide → settle and
//! issues at most one settlement call. The settlement handle is moved into
//! that call, so a second one cannot be expressed.
//!
//! Error Model
//! -----------
//! - Manual mode without a handle: `Configuration`, nothing runs.
//! - Decode / processing / cancellation failures: `Abandon` or `DeadLetter`
//!   in manual mode; `Unrecoverable` (returned, and sent to the Error Sink)
//!   in auto mode.
//! - Settlement call failures: sent to the Error Sink and returned; never
//!   retried.
//!
//! Every terminal outcome produces exactly one structured event via
//! [`record`].

mod decision;

pub use decision::{
    decide, settlement_action, Decision, DeliveryPolicy, SettlementAction,
    MAX_DELIVERY_COUNT_EXCEEDED,
};

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::emit::ErrorSink;
use crate::errors::{ConsumerError, SettlementError};
use crate::ingest::{Delivery, Envelope, SettlementHandle, SettlementMode};
use crate::transform::decode::decode_work_item;
use crate::util::time::instant_at;
use crate::work::{self, Cancellation};

/// How long processing may run before the lock is presumed lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockBudget {
    /// Renewal budget past the initial lock, measured from receipt.
    pub max_auto_lock_renew: Duration,
    /// Work is cancelled this long before the lock expires.
    pub margin: Duration,
}

impl LockBudget {
    /// `max(locked_until, received_at + max_auto_lock_renew) - margin`.
    pub fn deadline(&self, delivery: &Delivery) -> DateTime<Utc> {
        let renewed = chrono::Duration::from_std(self.max_auto_lock_renew)
            .ok()
            .and_then(|d| delivery.received_at().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let expiry = delivery.locked_until().max(renewed);
        let margin = chrono::Duration::from_std(self.margin).unwrap_or(chrono::Duration::zero());
        expiry.checked_sub_signed(margin).unwrap_or(expiry)
    }
}

pub struct SettlementEngine<S> {
    policy: DeliveryPolicy,
    budget: LockBudget,
    sink: S,
    shutdown: watch::Receiver<bool>,
}

impl<S: ErrorSink> SettlementEngine<S> {
    pub fn new(
        policy: DeliveryPolicy,
        budget: LockBudget,
        sink: S,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            policy,
            budget,
            sink,
            shutdown,
        }
    }

    pub async fn handle(&self, envelope: Envelope) -> Result<Decision, ConsumerError> {
        let (delivery, handle) = envelope.into_parts();

        match (delivery.mode(), handle) {
            (SettlementMode::ManualComplete, None) => {
                let err = ConsumerError::Configuration(
                    "manual settlement requires a settlement handle; none supplied".into(),
                );
                record(&delivery, "rejected", Some(&err));
                Err(err)
            }
            (SettlementMode::ManualComplete, Some(handle)) => {
                let outcome = self.process(&delivery).await;
                let action = settlement_action(&self.policy, delivery.delivery_count(), &outcome);
                self.settle(&delivery, handle, action, outcome.err()).await
            }
            (SettlementMode::AutoComplete, _) => match self.process(&delivery).await {
                Ok(()) => {
                    record(&delivery, Decision::NoOp.label(), None);
                    Ok(Decision::NoOp)
                }
                Err(source) => {
                    let err = ConsumerError::Unrecoverable {
                        id: delivery.id().to_string(),
                        source: Box::new(source),
                    };
                    record(&delivery, Decision::Unrecoverable.label(), Some(&err));
                    self.sink.notify(&delivery, &err).await;
                    Err(err)
                }
            },
        }
    }

    /// Log a failed settlement call for `decision` and alert the Error Sink.
    pub async fn settlement_failed(
        &self,
        delivery: &Delivery,
        decision: &Decision,
        error: SettlementError,
    ) -> ConsumerError {
        let err = ConsumerError::Settlement(error);
        record(delivery, decision.label(), Some(&err));
        self.sink.notify(delivery, &err).await;
        err
    }

    async fn process(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let item = match decode_work_item(delivery.payload()) {
            Ok(item) => item,
            Err(e) => {
                #[cfg(debug_assertions)]
                {
                    use tracing::debug;
                    debug!(
                        message_id = %delivery.id(),
                        payload_hex = hex::encode(delivery.payload()),
                        "failed to decode payload"
                    );
                }
                return Err(e);
            }
        };

        #[cfg(debug_assertions)]
        {
            use tracing::debug;
            debug!(
                message_id = %delivery.id(),
                sleep_seconds = item.sleep_seconds,
                fails = item.failure().is_some(),
                "decoded work item"
            );
        }

        let mut cancel = Cancellation::new(self.shutdown.clone())
            .with_deadline(instant_at(self.budget.deadline(delivery)));
        work::execute(&item, &mut cancel).await
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        handle: SettlementHandle,
        action: SettlementAction,
        failure: Option<ConsumerError>,
    ) -> Result<Decision, ConsumerError> {
        let res = match &action {
            SettlementAction::Complete => handle.complete().await,
            SettlementAction::Abandon => handle.abandon().await,
            SettlementAction::DeadLetter {
                reason,
                description,
            } => handle.dead_letter(reason, description).await,
        };

        let decision = Decision::from(action);
        match res {
            Ok(()) => {
                record(delivery, decision.label(), failure.as_ref());
                Ok(decision)
            }
            Err(se) => Err(self.settlement_failed(delivery, &decision, se).await),
        }
    }
}

/// Single emission point for terminal outcomes.
pub fn record(delivery: &Delivery, decision: &str, err: Option<&ConsumerError>) {
    let id = delivery.id();
    let count = delivery.delivery_count();
    let locked_until = delivery.locked_until();
    match err {
        None => info!(
            message_id = %id,
            delivery_count = count,
            %locked_until,
            decision,
            "message settled"
        ),
        Some(e @ (ConsumerError::Unrecoverable { .. }
        | ConsumerError::Settlement(_)
        | ConsumerError::Configuration(_))) => error!(
            message_id = %id,
            delivery_count = count,
            %locked_until,
            decision,
            error = %e,
            "message not settled"
        ),
        Some(e) => warn!(
            message_id = %id,
            delivery_count = count,
            %locked_until,
            decision,
            error = %e,
            "message settled after failure"
        ),
    }
}
