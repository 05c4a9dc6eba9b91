//! `file_copy`: copy a source file to a destination with declared
//! owner/group/mode, creating parent directories as needed. Snapshot
//! strategy resolves design note (c): files at or below
//! `inline_blob_threshold_bytes` are inlined as base64 in the snapshot
//! row; larger files are content-hashed and copied into a `blobs/`
//! side directory, matching the copy-based backing store used for
//! whole-host snapshots in `snapshot.rs`, scoped down to a single file
//! instead of the whole package set.

use crate::config::TxConfig;
use crate::error_handling::TxError;
use crate::input_validation::validate_absolute_path;
use crate::registry::StepHandler;
use crate::secure_executor::{ExecutionConfig, SecureExecutor};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileCopyData {
    src: String,
    dest: String,
    mode: Option<String>,
    owner: Option<String>,
    group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum FileSnapshot {
    /// Nothing was at `dest` before this step.
    Absent,
    /// Prior contents fit under the threshold; stored inline.
    Inline {
        content_b64: String,
        mode: Option<u32>,
    },
    /// Prior contents were too large; stored by content hash under
    /// `blobs/<sha256>`.
    Blob { sha256: String, mode: Option<u32> },
}

pub struct FileCopyHandler {
    executor: SecureExecutor,
    inline_threshold: u64,
    timeout: Duration,
}

impl FileCopyHandler {
    pub fn new(config: &TxConfig) -> Self {
        Self {
            executor: SecureExecutor::new(),
            inline_threshold: config.snapshot.inline_blob_threshold_bytes,
            timeout: Duration::from_secs(config.general.default_timeout_secs),
        }
    }

    fn parse(&self, data: &Value) -> Result<FileCopyData, TxError> {
        serde_json::from_value(data.clone()).map_err(|e| TxError::Validation {
            field: "data".to_string(),
            message: format!("invalid file_copy data: {}", e),
        })
    }

    fn blobs_dir() -> Result<PathBuf, TxError> {
        TxConfig::blobs_dir().map_err(|e| TxError::Storage {
            message: e.to_string(),
        })
    }

    async fn set_ownership(&self, path: &Path, owner: Option<&str>, group: Option<&str>) -> Result<(), TxError> {
        let Some(owner) = owner else { return Ok(()) };
        let spec = match group {
            Some(group) => format!("{}:{}", owner, group),
            None => owner.to_string(),
        };
        let path_str = path.to_string_lossy().to_string();
        let result = self
            .executor
            .execute(
                "chown",
                &[&spec, &path_str],
                ExecutionConfig {
                    timeout: self.timeout,
                },
            )
            .await?;
        if !result.success() {
            return Err(TxError::Apply {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: format!("chown {} {} failed: {}", spec, path_str, result.stderr),
            });
        }
        Ok(())
    }

    async fn set_mode(&self, path: &Path, mode: Option<&str>) -> Result<(), TxError> {
        let Some(mode) = mode else { return Ok(()) };
        let path_str = path.to_string_lossy().to_string();
        let result = self
            .executor
            .execute(
                "chmod",
                &[mode, &path_str],
                ExecutionConfig {
                    timeout: self.timeout,
                },
            )
            .await?;
        if !result.success() {
            return Err(TxError::Apply {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: format!("chmod {} {} failed: {}", mode, path_str, result.stderr),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StepHandler for FileCopyHandler {
    fn tag(&self) -> &'static str {
        crate::types::step_tags::FILE_COPY
    }

    fn validate(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        validate_absolute_path("dest", &parsed.dest)?;
        if parsed.src.trim().is_empty() {
            return Err(TxError::Validation {
                field: "src".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    async fn snapshot(&self, data: &Value) -> Result<Value, TxError> {
        let parsed = self.parse(data)?;
        let dest = Path::new(&parsed.dest);

        if !dest.exists() {
            return serde_json::to_value(FileSnapshot::Absent).map_err(|e| TxError::Snapshot {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: e.to_string(),
            });
        }

        let meta = tokio::fs::metadata(dest).await?;
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(meta.permissions().mode() & 0o7777)
        };
        let bytes = tokio::fs::read(dest).await?;

        let snapshot = if bytes.len() as u64 <= self.inline_threshold {
            FileSnapshot::Inline {
                content_b64: base64::engine::general_purpose::STANDARD.encode(&bytes),
                mode,
            }
        } else {
            let digest = hex::encode(Sha256::digest(&bytes));
            let blobs_dir = Self::blobs_dir()?;
            tokio::fs::create_dir_all(&blobs_dir).await?;
            let blob_path = blobs_dir.join(&digest);
            if !blob_path.exists() {
                tokio::fs::write(&blob_path, &bytes).await?;
            }
            FileSnapshot::Blob {
                sha256: digest,
                mode,
            }
        };

        serde_json::to_value(snapshot).map_err(|e| TxError::Snapshot {
            step_index: -1,
            tag: self.tag().to_string(),
            reason: e.to_string(),
        })
    }

    async fn apply(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        let dest = Path::new(&parsed.dest);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::copy(&parsed.src, dest).await.map_err(|e| TxError::Apply {
            step_index: -1,
            tag: self.tag().to_string(),
            reason: format!("copy {} -> {} failed: {}", parsed.src, parsed.dest, e),
        })?;

        self.set_mode(dest, parsed.mode.as_deref()).await?;
        self.set_ownership(dest, parsed.owner.as_deref(), parsed.group.as_deref())
            .await?;

        Ok(())
    }

    async fn compensate(&self, data: &Value, snapshot: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        let dest = Path::new(&parsed.dest);
        let snapshot: FileSnapshot =
            serde_json::from_value(snapshot.clone()).map_err(|e| TxError::Compensate {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: format!("invalid snapshot: {}", e),
            })?;

        match snapshot {
            FileSnapshot::Absent => {
                if dest.exists() {
                    tokio::fs::remove_file(dest).await?;
                }
            }
            FileSnapshot::Inline { content_b64, mode } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(content_b64)
                    .map_err(|e| TxError::Compensate {
                        step_index: -1,
                        tag: self.tag().to_string(),
                        reason: format!("could not decode inlined snapshot: {}", e),
                    })?;
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(dest, bytes).await?;
                if let Some(mode) = mode {
                    self.set_mode(dest, Some(&format!("{:o}", mode))).await?;
                }
            }
            FileSnapshot::Blob { sha256, mode } => {
                let blob_path = Self::blobs_dir()?.join(&sha256);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&blob_path, dest)
                    .await
                    .map_err(|e| TxError::Compensate {
                        step_index: -1,
                        tag: self.tag().to_string(),
                        reason: format!("could not restore from blob {}: {}", sha256, e),
                    })?;
                if let Some(mode) = mode {
                    self.set_mode(dest, Some(&format!("{:o}", mode))).await?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn handler() -> FileCopyHandler {
        FileCopyHandler::new(&TxConfig::default())
    }

    #[test]
    fn validate_rejects_relative_dest() {
        let data = serde_json::json!({ "src": "/tmp/a", "dest": "etc/a.conf" });
        assert!(handler().validate(&data).is_err());
    }

    #[tokio::test]
    async fn snapshot_of_missing_file_is_absent() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("missing.conf");
        let data = serde_json::json!({ "src": "/dev/null", "dest": dest.to_string_lossy() });
        let snap = handler().snapshot(&data).await.unwrap();
        assert_eq!(snap["kind"], "Absent");
    }

    #[tokio::test]
    async fn apply_then_compensate_restores_absent_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("source.txt");
        tokio::fs::write(&src, b"hello").await.unwrap();
        let dest = dir.path().join("dest.txt");

        let data = serde_json::json!({
            "src": src.to_string_lossy(),
            "dest": dest.to_string_lossy(),
        });

        let h = handler();
        let snap = h.snapshot(&data).await.unwrap();
        h.apply(&data).await.unwrap();
        assert!(dest.exists());

        h.compensate(&data, &snap).await.unwrap();
        assert!(!dest.exists());
    }
}
