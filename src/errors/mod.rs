//! Error types for peeklock-consumer
//!
//! Overview
//! --------
//! Canonical error enumeration used across ingest, decode, work, settlement,
//! and emit layers. Keep variants stable and descriptive; prefer mapping
//! external libraries into these variants at module boundaries.
//!
//! Propagation
//! -----------
//! - `Decode` / `Processing` / `Cancelled` are per-message failures. The
//!   settlement engine turns them into `Abandon` / `DeadLetter` (manual mode)
//!   or wraps them in `Unrecoverable` (auto mode).
//! - `Configuration` aborts a single message before any work or settlement.
//! - `Settlement` is reported and never retried; a stale lock stays stale.
//!
//! Concurrency / Logging
//! ---------------------
//! Errors are `Send + Sync` and implement Display via `thiserror`.
//! Use `tracing` for context at call sites (`error!(...);`).
use std::fmt;

use thiserror::Error;

/// Why in-flight work was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The worker is shutting down.
    Shutdown,
    /// The lock (including any renewal budget) is about to expire.
    LockDeadline,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Shutdown => f.write_str("shutdown"),
            CancelReason::LockDeadline => f.write_str("lock deadline"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Payload is neither a structured work item nor a bare integer.
    #[error("Payload decode error: {0}")]
    Decode(String),

    /// Business-logic failure, including the forced-failure path.
    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Processing cancelled: {0}")]
    Cancelled(CancelReason),

    /// Missing settlement handle under manual settlement, bad env, etc.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    /// Failure while auto-complete is active; only the transport can react.
    #[error("Unrecoverable failure for message {id}: {source}")]
    Unrecoverable {
        id: String,
        #[source]
        source: Box<ConsumerError>,
    },

    /// Receive-side transport failure (pool, protocol).
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ConsumerError {
    /// True for the per-message failures routed through the Failed branch.
    pub fn is_processing_failure(&self) -> bool {
        matches!(
            self,
            ConsumerError::Decode(_) | ConsumerError::Processing(_) | ConsumerError::Cancelled(_)
        )
    }
}

/// Failure of a complete/abandon/dead-letter/renew call at the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("Lock lost for message {0}")]
    LockLost(String),

    #[error("Unknown message {0}")]
    UnknownMessage(String),

    #[error("Settlement transport error: {0}")]
    Transport(String),
}
