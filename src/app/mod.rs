//! App runtime: receive loop + per-delivery worker (hot path).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::emit::ErrorSink;
use crate::errors::ConsumerError;
use crate::ingest::{Envelope, SettlementMode, Transport};
use crate::settle::{Decision, SettlementEngine};

/// Knobs the worker loop needs from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub lock_duration: Duration,
    pub max_auto_lock_renew: Duration,
}

impl From<&Config> for WorkerOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            concurrency: cfg.concurrency,
            lock_duration: cfg.lock_duration,
            max_auto_lock_renew: cfg.max_auto_lock_renew,
        }
    }
}

/// Receive and dispatch deliveries until shutdown, then drain in-flight work.
///
/// `receive` is always awaited to completion: once the transport has handed
/// a delivery over it is dispatched, even if shutdown arrives meanwhile.
/// Only the wait for a free worker slot races the shutdown signal.
pub async fn run<T, S>(
    transport: T,
    engine: Arc<SettlementEngine<S>>,
    opts: WorkerOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ConsumerError>
where
    T: Transport + Clone + 'static,
    S: ErrorSink + 'static,
{
    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let mut join = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            info!("shutdown: draining");
            break;
        }

        let permit = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    info!("shutdown sender dropped: draining");
                    break;
                }
                continue;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        while let Some(res) = join.try_join_next() {
            if let Err(e) = res {
                error!(error = ?e, "task join error");
            }
        }

        match transport.receive().await {
            Ok(Some(envelope)) => {
                #[cfg(debug_assertions)]
                debug!(
                    message_id = %envelope.delivery().id(),
                    delivery_count = envelope.delivery().delivery_count(),
                    locked_until = %envelope.delivery().locked_until(),
                    payload_len = envelope.delivery().payload().len(),
                    "received message"
                );

                let transport = transport.clone();
                let engine = engine.clone();
                join.spawn(async move {
                    let _permit = permit;
                    handle_delivery(transport, engine, opts, envelope).await;
                });
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "receive failed");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }

    while let Some(res) = join.join_next().await {
        if let Err(e) = res {
            error!(error = ?e, "task join error during drain");
        }
    }

    Ok(())
}

/// Run one delivery through the engine, with lock renewal alongside, and
/// apply the transport-side follow-up (auto-complete ack).
pub async fn handle_delivery<T, S>(
    transport: T,
    engine: Arc<SettlementEngine<S>>,
    opts: WorkerOptions,
    envelope: Envelope,
) where
    T: Transport + Clone + 'static,
    S: ErrorSink + 'static,
{
    let delivery = envelope.delivery().clone();
    let id = delivery.id().to_string();

    let (done_tx, done_rx) = watch::channel(false);
    let renewer = (!opts.max_auto_lock_renew.is_zero()).then(|| {
        tokio::spawn(renew_lock_until(
            transport.clone(),
            id.clone(),
            opts.lock_duration,
            opts.max_auto_lock_renew,
            done_rx,
        ))
    });

    let res = engine.handle(envelope).await;

    let _ = done_tx.send(true);
    if let Some(task) = renewer {
        let _ = task.await;
    }

    match (delivery.mode(), res) {
        (SettlementMode::AutoComplete, Ok(decision @ Decision::NoOp)) => {
            if let Err(e) = transport.complete(&id).await {
                engine.settlement_failed(&delivery, &decision, e).await;
            }
        }
        (_, Ok(_)) => {}
        (_, Err(e @ ConsumerError::Unrecoverable { .. })) => {
            error!(error = %e, message_id = %id, "left unsettled for redelivery");
        }
        (_, Err(e)) => {
            debug!(error = %e, message_id = %id, "delivery ended with error");
        }
    }
}

/// Renew the lock on `id` every half lock period until `budget` has elapsed
/// or `done` flips.
pub async fn renew_lock_until<T: Transport>(
    transport: T,
    id: String,
    lock_duration: Duration,
    budget: Duration,
    mut done: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let every = (lock_duration / 2).max(Duration::from_millis(100));

    loop {
        let next = Instant::now() + every;
        if next.duration_since(started) > budget {
            debug!(message_id = %id, "lock renewal budget exhausted");
            return;
        }
        tokio::select! {
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    return;
                }
            }
            _ = sleep_until(next) => {
                match transport.renew_lock(&id).await {
                    Ok(until) => debug!(message_id = %id, locked_until = %until, "lock renewed"),
                    Err(e) => {
                        warn!(error = %e, message_id = %id, "lock renewal failed");
                        return;
                    }
                }
            }
        }
    }
}
