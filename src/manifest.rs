//! Package metadata: the YAML/JSON document an operator hands to
//! `debtx install`, and the fingerprinting used to pin it into a
//! transaction's durable record.
//!
//! Parsing is generalized from `OmniManifest`/`OmniApp` (`manifest.rs`),
//! widened from "project of named apps" to "package of
//! ordered install steps" and given the `requirements`/`dependencies`
//! fields the data model calls for.

use crate::error_handling::TxError;
use crate::types::RollbackStrategy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub package: Package,
    pub install_steps: Vec<StepSpec>,
    #[serde(default)]
    pub pre_install: Vec<ScriptSpec>,
    #[serde(default)]
    pub post_install: Vec<ScriptSpec>,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
}

/// One entry in `install_steps`. `data` is handler-specific and opaque
/// to everything except the handler registered under `r#type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(rename = "type")]
    pub r#type: String,
    pub data: serde_json::Value,
    pub rollback: Option<RollbackStrategy>,
}

/// A `pre_install`/`post_install` entry, run outside the transactional
/// envelope (design note, open question b).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    pub min_memory: Option<u64>,
    pub min_disk_space: Option<u64>,
    pub os_version: Option<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
}

impl PackageMetadata {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TxError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        let parsed = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(|e| TxError::Validation {
                field: "<root>".to_string(),
                message: format!("invalid JSON: {}", e),
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|e| TxError::Validation {
                field: "<root>".to_string(),
                message: format!("invalid YAML: {}", e),
            })?
        };

        Ok(parsed)
    }

    /// Shape validation that doesn't require a handler registry:
    /// required fields present, steps non-empty, order-index-free (the
    /// Rust encoding uses a `Vec`, so order is implicit and always
    /// contiguous). Per-step data shape is validated by the owning
    /// handler once a registry is available.
    pub fn validate_shape(&self) -> Result<(), TxError> {
        if self.package.name.trim().is_empty() {
            return Err(TxError::Validation {
                field: "package.name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.package.version.trim().is_empty() {
            return Err(TxError::Validation {
                field: "package.version".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.install_steps.is_empty() {
            return Err(TxError::Validation {
                field: "install_steps".to_string(),
                message: "must declare at least one step".to_string(),
            });
        }
        for (i, step) in self.install_steps.iter().enumerate() {
            if step.r#type.trim().is_empty() {
                return Err(TxError::Validation {
                    field: format!("install_steps[{}].type", i),
                    message: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Stable hash over the canonicalized metadata, stored alongside
    /// the transaction so an operator can confirm which exact document
    /// produced it.
    pub fn fingerprint(&self) -> Result<String, TxError> {
        let canonical = serde_json::to_vec(self).map_err(|e| TxError::Validation {
            field: "<root>".to_string(),
            message: format!("could not canonicalize metadata: {}", e),
        })?;
        let digest = Sha256::digest(&canonical);
        Ok(hex::encode(digest))
    }

    /// Minimal two-step skeleton written by `debtx create-template`.
    pub fn template(name: &str, version: &str) -> Self {
        PackageMetadata {
            package: Package {
                name: name.to_string(),
                version: version.to_string(),
                description: Some("".to_string()),
                author: None,
                license: None,
            },
            install_steps: vec![
                StepSpec {
                    r#type: crate::types::step_tags::APT_PACKAGE.to_string(),
                    data: serde_json::json!({ "packages": ["example-package"] }),
                    rollback: Some(RollbackStrategy::Auto),
                },
                StepSpec {
                    r#type: crate::types::step_tags::FILE_COPY.to_string(),
                    data: serde_json::json!({
                        "src": "/path/to/source",
                        "dest": "/path/to/destination",
                        "mode": "644",
                    }),
                    rollback: Some(RollbackStrategy::Auto),
                },
            ],
            pre_install: Vec::new(),
            post_install: Vec::new(),
            requirements: Requirements::default(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    pub fn to_yaml(&self) -> Result<String, TxError> {
        serde_yaml::to_string(self).map_err(|e| TxError::Validation {
            field: "<root>".to_string(),
            message: format!("could not serialize template: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_round_trips_through_yaml() {
        let tpl = PackageMetadata::template("nginx", "1.0.0");
        let yaml = tpl.to_yaml().unwrap();
        let parsed: PackageMetadata = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.package.name, "nginx");
        assert_eq!(parsed.install_steps.len(), 2);
        parsed.validate_shape().unwrap();
    }

    #[test]
    fn empty_steps_fail_shape_validation() {
        let mut tpl = PackageMetadata::template("nginx", "1.0.0");
        tpl.install_steps.clear();
        assert!(tpl.validate_shape().is_err());
    }

    #[test]
    fn fingerprint_is_stable_for_identical_metadata() {
        let a = PackageMetadata::template("nginx", "1.0.0");
        let b = PackageMetadata::template("nginx", "1.0.0");
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }
}
