//! Root-privilege check. Fills in the `privilege_manager.rs` stub with
//! the one thing the data model actually requires (§6,
//! "Environment"): the core does not drop or escalate privileges, it
//! only presumes the process has what it needs, so the CLI checks
//! once up front and surfaces a clear error instead of letting a
//! handler's subprocess fail opaquely partway through a transaction.

use crate::error_handling::TxError;

/// True when the current process is running as `root` (euid 0).
pub fn running_as_root() -> bool {
    // SAFETY: `geteuid` takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Returns `PermissionDenied` unless the process is running as root.
/// Called once before `install`/`rollback`, which are the only verbs
/// whose steps touch privileged resources.
pub fn require_root(operation: &str) -> Result<(), TxError> {
    if running_as_root() {
        Ok(())
    } else {
        Err(TxError::PermissionDenied {
            operation: operation.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_as_root_matches_euid_zero() {
        let expected = unsafe { libc::geteuid() == 0 };
        assert_eq!(running_as_root(), expected);
    }
}
