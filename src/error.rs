//! Error types for the Divvy service.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::ratelimit::{BackendError, RuleError};

/// Main error type for Divvy operations.
#[derive(Error, Debug)]
pub enum DivvyError {
    /// Service settings errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rule validation errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Counter store errors
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Divvy operations.
pub type Result<T> = std::result::Result<T, DivvyError>;
