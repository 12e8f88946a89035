//! Credit backend trait for abstracting counter store implementations.

use async_trait::async_trait;
use thiserror::Error;

use super::rules::{Operation, MAX_RESET_SECONDS};

/// Errors raised by a credit backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("hit(): Backend not initialized.")]
    NotInitialized,

    #[error("hit(): bad value for resetSeconds ({0})")]
    InvalidResetSeconds(i64),

    #[error("Unexpected result from counter store: {0}")]
    UnexpectedReply(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// The outcome of a single credit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditStatus {
    pub is_allowed: bool,
    pub current_credit: i64,
    pub next_reset_seconds: i64,
}

impl CreditStatus {
    /// The status returned for rules that grant no credit at all.
    pub fn no_credit() -> Self {
        Self {
            is_allowed: false,
            current_credit: 0,
            next_reset_seconds: -1,
        }
    }
}

/// Trait for counter store implementations.
///
/// A hit must be atomic with respect to every other hit on the same bucket,
/// across all server instances sharing the store.
#[async_trait]
pub trait CreditBackend: Send + Sync {
    /// One-time setup. Must complete before [`CreditBackend::hit`] is called.
    async fn initialize(&self) -> Result<(), BackendError>;

    /// Consume one unit of credit from the bucket for this rule and actor.
    async fn hit(
        &self,
        rule_operation: &Operation,
        actor: &str,
        credit_limit: i64,
        reset_seconds: i64,
    ) -> Result<CreditStatus, BackendError>;
}

/// Argument checks shared by all backends.
///
/// Returns `Some(status)` when the hit is decided without touching the store.
pub(crate) fn precheck(
    initialized: bool,
    credit_limit: i64,
    reset_seconds: i64,
) -> Result<Option<CreditStatus>, BackendError> {
    if !initialized {
        return Err(BackendError::NotInitialized);
    }
    if credit_limit <= 0 {
        return Ok(Some(CreditStatus::no_credit()));
    }
    if !(1..=MAX_RESET_SECONDS).contains(&reset_seconds) {
        return Err(BackendError::InvalidResetSeconds(reset_seconds));
    }
    Ok(None)
}
