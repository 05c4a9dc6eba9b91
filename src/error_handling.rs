//! Error types for the transaction engine.
//!
//! [`TxError`] covers every failure surface named by the error-kind
//! table: validation of a package manifest, a busy log, storage faults,
//! snapshot capture, step application, and compensation. Handlers and
//! the manager propagate these with `?`; the CLI renders them with
//! [`TxError::exit_code`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the durable log, the handler registry, and the
/// transaction manager.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum TxError {
    #[error("validation failed: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("another transaction is in progress: {transaction_id}")]
    Busy { transaction_id: i64 },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("snapshot failed for step {step_index} ({tag}): {reason}")]
    Snapshot {
        step_index: i64,
        tag: String,
        reason: String,
    },

    #[error("apply failed for step {step_index} ({tag}): {reason}")]
    Apply {
        step_index: i64,
        tag: String,
        reason: String,
    },

    #[error("compensation failed for step {step_index} ({tag}): {reason}")]
    Compensate {
        step_index: i64,
        tag: String,
        reason: String,
    },

    #[error("no handler registered for step type: {tag}")]
    UnknownStepType { tag: String },

    #[error("transaction {transaction_id} not found")]
    NotFound { transaction_id: i64 },

    #[error("transaction {transaction_id} is in terminal state {status} and cannot be {attempted}")]
    InvalidTransition {
        transaction_id: i64,
        status: String,
        attempted: String,
    },

    #[error("refusing to run irreversible step {step_index} ({tag}) without --allow-irreversible")]
    IrreversibleStep { step_index: i64, tag: String },

    #[error("permission denied: {operation}")]
    PermissionDenied { operation: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("unknown error: {message}")]
    Unknown { message: String },
}

impl From<sqlx::Error> for TxError {
    fn from(err: sqlx::Error) -> Self {
        TxError::Storage {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for TxError {
    fn from(err: std::io::Error) -> Self {
        TxError::Storage {
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for TxError {
    fn from(err: anyhow::Error) -> Self {
        TxError::Unknown {
            message: err.to_string(),
        }
    }
}

impl TxError {
    /// Handlers don't know their own position in a transaction, so
    /// they stamp step-indexed variants with a sentinel; the manager
    /// and rollback engine call this right after invoking a handler to
    /// fill in the real index before the error is logged or returned.
    pub fn with_step_index(self, index: i64) -> Self {
        match self {
            TxError::Snapshot {
                tag, reason, ..
            } => TxError::Snapshot {
                step_index: index,
                tag,
                reason,
            },
            TxError::Apply {
                tag, reason, ..
            } => TxError::Apply {
                step_index: index,
                tag,
                reason,
            },
            TxError::Compensate {
                tag, reason, ..
            } => TxError::Compensate {
                step_index: index,
                tag,
                reason,
            },
            other => other,
        }
    }

    /// Category used for logging and for the CLI's process exit code.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TxError::Validation { .. } => ErrorCategory::Validation,
            TxError::Busy { .. } => ErrorCategory::Concurrency,
            TxError::Storage { .. } => ErrorCategory::Storage,
            TxError::Snapshot { .. } => ErrorCategory::Snapshot,
            TxError::Apply { .. } => ErrorCategory::Apply,
            TxError::Compensate { .. } => ErrorCategory::Compensate,
            TxError::UnknownStepType { .. } => ErrorCategory::Validation,
            TxError::NotFound { .. } => ErrorCategory::Validation,
            TxError::InvalidTransition { .. } => ErrorCategory::Concurrency,
            TxError::IrreversibleStep { .. } => ErrorCategory::Validation,
            TxError::PermissionDenied { .. } => ErrorCategory::Permission,
            TxError::Timeout { .. } => ErrorCategory::Apply,
            TxError::Unknown { .. } => ErrorCategory::Unknown,
        }
    }

    /// Process exit code the CLI returns for this error (spec.md §6).
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Validation => 2,
            ErrorCategory::Concurrency => 3,
            ErrorCategory::Storage => 4,
            ErrorCategory::Snapshot | ErrorCategory::Apply | ErrorCategory::Compensate => 5,
            ErrorCategory::Permission => 6,
            ErrorCategory::Unknown => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Validation,
    Concurrency,
    Storage,
    Snapshot,
    Apply,
    Compensate,
    Permission,
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Concurrency => "concurrency",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Snapshot => "snapshot",
            ErrorCategory::Apply => "apply",
            ErrorCategory::Compensate => "compensate",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable_per_category() {
        let busy = TxError::Busy { transaction_id: 1 };
        assert_eq!(busy.category(), ErrorCategory::Concurrency);
        assert_eq!(busy.exit_code(), 3);

        let validation = TxError::Validation {
            field: "name".into(),
            message: "required".into(),
        };
        assert_eq!(validation.exit_code(), 2);
    }

    #[test]
    fn sqlx_errors_become_storage_errors() {
        let err: TxError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, TxError::Storage { .. }));
    }
}
