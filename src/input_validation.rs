//! Shape and character-set validation shared by handlers that feed
//! strings into a shell command. Adapted from `InputValidator`
//! (`input_validation.rs`), same character-class and
//! path-traversal checks, returning [`TxError::Validation`] instead of
//! `anyhow::Error` so handler `validate()` implementations can use `?`
//! directly.

use crate::error_handling::TxError;
use regex::Regex;
use std::sync::OnceLock;

fn package_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._+-]+$").unwrap())
}

fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").unwrap())
}

pub fn validate_package_name(field: &str, name: &str) -> Result<(), TxError> {
    let invalid = |message: &str| TxError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("package name cannot be empty"));
    }
    if name.len() > 255 {
        return Err(invalid("package name too long (max 255 characters)"));
    }
    if !package_name_re().is_match(name) {
        return Err(invalid("package name contains invalid characters"));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(invalid("package name cannot contain path separators"));
    }

    Ok(())
}

pub fn validate_username(field: &str, name: &str) -> Result<(), TxError> {
    if !username_re().is_match(name) {
        return Err(TxError::Validation {
            field: field.to_string(),
            message: "username must match ^[a-z_][a-z0-9_-]{0,31}$".to_string(),
        });
    }
    Ok(())
}

/// Rejects absolute escapes via `..` and requires an absolute path;
/// step handlers that write files always operate on absolute
/// destinations supplied by the operator.
pub fn validate_absolute_path(field: &str, path: &str) -> Result<(), TxError> {
    let invalid = |message: &str| TxError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    };

    if path.is_empty() {
        return Err(invalid("path cannot be empty"));
    }
    if path.contains("..") {
        return Err(invalid("path cannot contain '..'"));
    }
    if !path.starts_with('/') {
        return Err(invalid("path must be absolute"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal_in_package_names() {
        assert!(validate_package_name("packages[0]", "../etc/passwd").is_err());
    }

    #[test]
    fn accepts_ordinary_package_names() {
        assert!(validate_package_name("packages[0]", "nginx-extras").is_ok());
    }

    #[test]
    fn rejects_relative_file_copy_destinations() {
        assert!(validate_absolute_path("dest", "etc/a.conf").is_err());
        assert!(validate_absolute_path("dest", "/etc/a.conf").is_ok());
    }
}
