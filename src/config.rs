use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// On-disk configuration for the transaction engine, loaded once at
/// startup from `config_path()` and shared read-only thereafter.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TxConfig {
    pub general: GeneralConfig,
    pub apt: AptConfig,
    pub snapshot: SnapshotConfig,
    pub ui: UiConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG`
    /// is unset.
    pub log_level: String,
    /// Ask for interactive confirmation before `install` applies a
    /// manifest (ignored when the CLI passes `--yes`).
    pub confirm_installs: bool,
    /// Default subprocess timeout for step handlers that shell out
    /// (`apt_package`, `custom_script`, `ansible_playbook`).
    pub default_timeout_secs: u64,
    /// Default retention window for `debtx cleanup` when `--older-than`
    /// is not given, in days.
    pub default_retention_days: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AptConfig {
    /// Extra flags appended to every `apt-get` invocation, e.g. `-y`.
    pub options: Vec<String>,
    /// `apt-get` binary to invoke; overridable for testing against a
    /// fake executable on `PATH`.
    pub binary: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SnapshotConfig {
    /// Files at or below this size are inlined (base64) in the
    /// snapshot row; larger files are hashed and copied into
    /// `blobs/` instead (design note, file_copy snapshot strategy).
    pub inline_blob_threshold_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UiConfig {
    pub show_progress: bool,
    pub use_colors: bool,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                log_level: "info".to_string(),
                confirm_installs: true,
                default_timeout_secs: 300,
                default_retention_days: 30,
            },
            apt: AptConfig {
                options: vec!["-y".to_string()],
                binary: "apt-get".to_string(),
            },
            snapshot: SnapshotConfig {
                inline_blob_threshold_bytes: 1024 * 1024,
            },
            ui: UiConfig {
                show_progress: true,
                use_colors: true,
            },
        }
    }
}

impl TxConfig {
    /// Load from `config_path()`, writing out the default file on
    /// first run.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let config: TxConfig = serde_yaml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("could not find config directory"))?;
        Ok(config_dir.join("debtx").join("config.yaml"))
    }

    /// Root directory for the durable log and blob store. Created on
    /// first use by the durable log layer.
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("could not find data directory"))?;
        Ok(data_dir.join("debtx"))
    }

    pub fn db_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("transactions.db"))
    }

    pub fn blobs_dir() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("blobs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_timeouts() {
        let config = TxConfig::default();
        assert_eq!(config.general.default_timeout_secs, 300);
        assert_eq!(config.snapshot.inline_blob_threshold_bytes, 1024 * 1024);
    }
}
