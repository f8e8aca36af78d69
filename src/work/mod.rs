//! Work simulator: stands in for business logic.
//!
//! Sleeps for the item's `sleep_seconds` on a cancellable timer, then fails
//! if the item carries a failure message. The timer races two signals held by
//! [`Cancellation`]: the worker's shutdown channel and the lock deadline.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};

use crate::errors::{CancelReason, ConsumerError};
use crate::transform::decode::WorkItem;

/// Cancellation token for one unit of work.
#[derive(Debug, Clone)]
pub struct Cancellation {
    shutdown: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            shutdown,
            deadline: None,
        }
    }

    /// Cancel with [`CancelReason::LockDeadline`] once `deadline` is reached.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn shutdown_requested(&mut self) {
        loop {
            if *self.shutdown.borrow_and_update() {
                return;
            }
            if self.shutdown.changed().await.is_err() {
                // Sender gone: nobody can request shutdown any more.
                std::future::pending::<()>().await;
            }
        }
    }
}

pub async fn execute(item: &WorkItem, cancel: &mut Cancellation) -> Result<(), ConsumerError> {
    let delay = Duration::from_secs(item.sleep_seconds);
    let deadline = cancel.deadline;

    tokio::select! {
        biased;
        _ = cancel.shutdown_requested() => {
            return Err(ConsumerError::Cancelled(CancelReason::Shutdown));
        }
        _ = sleep(delay) => {}
        _ = async { sleep_until(deadline.unwrap_or_else(Instant::now)).await }, if deadline.is_some() => {
            return Err(ConsumerError::Cancelled(CancelReason::LockDeadline));
        }
    }

    match item.failure() {
        Some(msg) => Err(ConsumerError::Processing(msg.to_string())),
        None => Ok(()),
    }
}
