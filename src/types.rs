//! Shared enums and small value types used across the transaction engine.
//!
//! These mirror the state machines and identifiers defined by the data
//! model: a [`TransactionStatus`] drives the transaction lifecycle, a
//! [`StepStatus`] drives each step within it, and a [`RollbackStrategy`]
//! selects which compensator a step uses during rollback.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a transaction: a monotonically assigned integer, handed
/// out by the durable log's `AUTOINCREMENT` primary key.
pub type TransactionId = i64;

/// Overall transaction status (spec.md §4.1 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    InProgress,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "committed" => Self::Committed,
            "rolling_back" => Self::RollingBack,
            "rolled_back" => Self::RolledBack,
            "failed" => Self::Failed,
            _ => return None,
        })
    }

    /// Terminal statuses are immutable except for the retention sweep.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single step within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::CompensationFailed => "compensation_failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "compensating" => Self::Compensating,
            "compensated" => Self::Compensated,
            "compensation_failed" => Self::CompensationFailed,
            _ => return None,
        })
    }

    /// Invariant 1: every step in one of these statuses must have a
    /// paired snapshot row.
    pub fn requires_snapshot(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Selects which compensator runs for a step during rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackStrategy {
    /// Use the handler's built-in `compensate`.
    Auto,
    /// Defer to an operator-supplied rollback script.
    Manual,
    /// Defer to an operator-supplied rollback playbook.
    Ansible,
    /// The step declares itself irreversible.
    None,
}

impl Default for RollbackStrategy {
    fn default() -> Self {
        Self::Auto
    }
}

impl RollbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Ansible => "ansible",
            Self::None => "none",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "auto" => Self::Auto,
            "manual" => Self::Manual,
            "ansible" => Self::Ansible,
            "none" => Self::None,
            _ => return None,
        })
    }
}

impl fmt::Display for RollbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The six step types the registry ships handlers for (spec.md §4.3).
/// New handlers may register additional tags without touching this
/// list or the storage schema; it exists purely as a set of named
/// constants for callers who don't want to hand-type strings.
pub mod step_tags {
    pub const APT_PACKAGE: &str = "apt_package";
    pub const FILE_COPY: &str = "file_copy";
    pub const SYSTEMD_SERVICE: &str = "systemd_service";
    pub const USER_MANAGEMENT: &str = "user_management";
    pub const CUSTOM_SCRIPT: &str = "custom_script";
    pub const ANSIBLE_PLAYBOOK: &str = "ansible_playbook";
}
