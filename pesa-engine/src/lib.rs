#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The transaction execution engine: pre-validation, idempotency,
//! receipt allocation, a fixed worker pool for asynchronous commits,
//! the atomic double-entry commit itself, and the post-commit fan-out
//! to receipts, notifications, events, the status tracker, and the
//! cache.

use std::time::Duration;

use pesa_accounts::AccountsError;
use pesa_ledger::LedgerError;
use pesa_protocol::AccountNumber;
use serde::Deserialize;

mod engine;
mod fx;
mod metrics;

pub use engine::EngineServices;
pub use engine::TransactionEngine;
pub use fx::FixedFxRates;
pub use fx::FxRateProvider;
pub use metrics::EngineMetrics;
pub use metrics::MetricsSnapshot;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("account {0} is locked")]
    AccountLocked(AccountNumber),
    #[error("account {0} is inactive")]
    AccountInactive(AccountNumber),
    #[error("currency mismatch on account {account_number}: expected {expected}, got {actual}")]
    CurrencyMismatch {
        account_number: AccountNumber,
        expected: String,
        actual: String,
    },
    #[error(
        "insufficient funds on account {account_number}: available {available_minor}, requested {requested_minor}"
    )]
    InsufficientFunds {
        account_number: AccountNumber,
        available_minor: i64,
        requested_minor: i64,
    },
    #[error("receipt generation timed out")]
    ReceiptTimeout,
    #[error("commit conflict: {0}")]
    CommitConflict(String),
    #[error("processor queue full")]
    QueueFull,
    #[error("external dependency error: {0}")]
    External(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<AccountsError> for EngineError {
    fn from(err: AccountsError) -> Self {
        match err {
            AccountsError::NotFound(what) => EngineError::NotFound(what),
            AccountsError::Validation(message) => EngineError::InvalidRequest(message),
            AccountsError::Duplicate(message) => EngineError::InvalidRequest(message),
            AccountsError::Storage(message) => EngineError::Internal(message),
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(what) => EngineError::NotFound(what),
            LedgerError::Validation(message) => EngineError::InvalidRequest(message),
            LedgerError::DuplicateIdempotencyKey(key) => {
                // Recovered by the commit path; surfacing it means the
                // stored journal vanished between the check and now.
                EngineError::Internal(format!("unrecovered idempotency replay for key {key}"))
            }
            LedgerError::InsufficientFunds {
                account_id,
                available_minor,
                requested_minor,
            } => EngineError::InsufficientFunds {
                account_number: format!("account-id:{account_id}"),
                available_minor,
                requested_minor,
            },
            LedgerError::Conflict(message) => EngineError::CommitConflict(message),
            LedgerError::Storage(message) => EngineError::Internal(message),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fixed worker count consuming the task queue.
    pub workers: usize,
    /// Bounded task queue; submission drops with an alert when full.
    pub queue_capacity: usize,
    /// Per-task commit deadline on the worker pool.
    pub task_timeout: Duration,
    /// Deadline for the detached post-commit side-effect batch.
    pub side_effect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 50,
            queue_capacity: 10_000,
            task_timeout: Duration::from_secs(30),
            side_effect_timeout: Duration::from_secs(5),
        }
    }
}
