//! Engine error taxonomy
//!
//! Every user-visible failure in the engine maps onto one of these kinds.
//! Validation and not-found are reported to the caller; connection errors
//! are retried at the adapter; configuration errors are fatal at startup;
//! conflicts are swallowed by idempotent ensure operations.

use thiserror::Error;

/// Coordination engine errors
#[derive(Debug, Error)]
pub enum LoomError {
    #[error("{message}")]
    Validation { message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LoomError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is a caller bug rather than an infrastructure
    /// failure. Callers get remediation text; infrastructure failures get
    /// retried or logged.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            LoomError::Validation { .. } | LoomError::NotFound { .. }
        )
    }
}

impl From<serde_json::Error> for LoomError {
    fn from(e: serde_json::Error) -> Self {
        LoomError::Internal {
            message: format!("serialization failed: {e}"),
        }
    }
}
