//! Error types for Docflow.
//!
//! Library crates use [`DocflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Count drift is deliberately *not* an error variant — it is a validation
//! verdict routed to reconciliation while the run continues.

use std::path::PathBuf;

/// Top-level error type for all Docflow operations.
#[derive(Debug, thiserror::Error)]
pub enum DocflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A pass gate did not clear: the predecessor is not SUCCESS or its
    /// artifacts failed re-validation.
    #[error("gate blocked before pass '{pass}': {reason}")]
    GateBlocked { pass: String, reason: String },

    /// A pass's output failed its declared contract.
    #[error("contract violation in pass '{pass}': {reason}")]
    ContractViolation { pass: String, reason: String },

    /// A pass handler reported failure.
    #[error("pass '{pass}' failed: {reason}")]
    PassFailed { pass: String, reason: String },

    /// Reconciliation could not complete; prior state is untouched.
    #[error("reconciliation error: {0}")]
    Reconciliation(String),

    /// The actor lacks the role required for the attempted action.
    #[error("actor '{actor}' is not authorized to {action}")]
    Unauthorized { actor: String, action: String },

    /// An operation was attempted against an object in the wrong state
    /// (e.g., deciding an already-decided proposal).
    #[error("invalid state transition: {message}")]
    InvalidState { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DocflowError>;

impl DocflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a gate error for the named pass.
    pub fn gate(pass: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::GateBlocked {
            pass: pass.into(),
            reason: reason.into(),
        }
    }

    /// Create a contract violation for the named pass.
    pub fn contract(pass: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContractViolation {
            pass: pass.into(),
            reason: reason.into(),
        }
    }

    /// Create a pass failure for the named pass.
    pub fn pass_failed(pass: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PassFailed {
            pass: pass.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-state error from any displayable message.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState {
            message: msg.into(),
        }
    }

    /// Create an authorization error.
    pub fn unauthorized(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self::Unauthorized {
            actor: actor.into(),
            action: action.into(),
        }
    }
}
