//! `apt_package`: install, remove, or update a set of packages via
//! `apt-get`. Apply/compensate logic is grounded on `DnfBox`
//! (`boxes/dnf.rs`), same "optional cache refresh, then one
//! shelled-out command, exit-code-gated result" shape, adapted to
//! `apt-get` and widened to record/restore prior package versions via
//! `dpkg-query` the way the compensate contract requires.

use crate::config::TxConfig;
use crate::error_handling::TxError;
use crate::input_validation::validate_package_name;
use crate::secure_executor::{ExecutionConfig, SecureExecutor};
use crate::registry::StepHandler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AptAction {
    Install,
    Remove,
    Update,
}

impl Default for AptAction {
    fn default() -> Self {
        Self::Install
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AptPackageData {
    packages: Vec<String>,
    #[serde(default)]
    action: AptAction,
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackageState {
    name: String,
    /// `None` means the package was not installed before this step.
    version: Option<String>,
}

pub struct AptPackageHandler {
    executor: SecureExecutor,
    binary: String,
    options: Vec<String>,
    timeout: Duration,
}

impl AptPackageHandler {
    pub fn new(config: &TxConfig) -> Self {
        Self {
            executor: SecureExecutor::new(),
            binary: config.apt.binary.clone(),
            options: config.apt.options.clone(),
            timeout: Duration::from_secs(config.general.default_timeout_secs),
        }
    }

    fn parse(&self, data: &Value) -> Result<AptPackageData, TxError> {
        serde_json::from_value(data.clone()).map_err(|e| TxError::Validation {
            field: "data".to_string(),
            message: format!("invalid apt_package data: {}", e),
        })
    }

    async fn installed_version(&self, package: &str) -> Option<String> {
        let result = self
            .executor
            .execute(
                "dpkg-query",
                &["-W", "-f=${Version}", package],
                ExecutionConfig {
                    timeout: Duration::from_secs(10),
                },
            )
            .await
            .ok()?;

        if result.success() && !result.stdout.trim().is_empty() {
            Some(result.stdout.trim().to_string())
        } else {
            None
        }
    }

    fn args<'a>(&'a self, verb: &'a str, extra_flags: &[&'a str], packages: &'a [String]) -> Vec<&'a str> {
        let mut args = vec![verb];
        args.extend(extra_flags.iter().copied());
        args.extend(self.options.iter().map(String::as_str));
        args.extend(packages.iter().map(String::as_str));
        args
    }
}

#[async_trait]
impl StepHandler for AptPackageHandler {
    fn tag(&self) -> &'static str {
        crate::types::step_tags::APT_PACKAGE
    }

    fn validate(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        if parsed.packages.is_empty() {
            return Err(TxError::Validation {
                field: "packages".to_string(),
                message: "must list at least one package".to_string(),
            });
        }
        for (i, name) in parsed.packages.iter().enumerate() {
            validate_package_name(&format!("packages[{}]", i), name)?;
        }
        Ok(())
    }

    async fn snapshot(&self, data: &Value) -> Result<Value, TxError> {
        let parsed = self.parse(data)?;
        let mut states = Vec::with_capacity(parsed.packages.len());
        for name in &parsed.packages {
            states.push(PackageState {
                name: name.clone(),
                version: self.installed_version(name).await,
            });
        }
        serde_json::to_value(states).map_err(|e| TxError::Snapshot {
            step_index: -1,
            tag: self.tag().to_string(),
            reason: e.to_string(),
        })
    }

    async fn apply(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;

        if parsed.refresh {
            let refresh = self
                .executor
                .execute(
                    &self.binary,
                    &["update"],
                    ExecutionConfig {
                        timeout: self.timeout,
                    },
                )
                .await?;
            if !refresh.success() {
                warn!("apt-get update failed, continuing: {}", refresh.stderr);
            }
        }

        let (verb, extra_flags): (&str, &[&str]) = match parsed.action {
            AptAction::Install => ("install", &[][..]),
            AptAction::Remove => ("remove", &[][..]),
            AptAction::Update => ("install", &["--only-upgrade"][..]),
        };
        let args = self.args(verb, extra_flags, &parsed.packages);

        let result = self
            .executor
            .execute(
                &self.binary,
                &args,
                ExecutionConfig {
                    timeout: self.timeout,
                },
            )
            .await?;

        if result.success() {
            info!("apt-get {} succeeded for {:?}", verb, parsed.packages);
            Ok(())
        } else {
            Err(TxError::Apply {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: result.stderr,
            })
        }
    }

    async fn compensate(&self, data: &Value, snapshot: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        let states: Vec<PackageState> =
            serde_json::from_value(snapshot.clone()).map_err(|e| TxError::Compensate {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: format!("invalid snapshot: {}", e),
            })?;

        for state in states {
            let currently_installed = self.installed_version(&state.name).await;

            let needs_compensation = match parsed.action {
                AptAction::Install => currently_installed.is_some() && state.version.is_none(),
                AptAction::Remove => currently_installed.is_none() && state.version.is_some(),
                AptAction::Update => currently_installed != state.version,
            };

            if !needs_compensation {
                continue;
            }

            let (verb, extra_flags, target): (&str, &[&str], String) = match parsed.action {
                AptAction::Install => ("remove", &[][..], state.name.clone()),
                AptAction::Remove => {
                    let pinned = state
                        .version
                        .as_ref()
                        .map(|v| format!("{}={}", state.name, v))
                        .unwrap_or_else(|| state.name.clone());
                    ("install", &[][..], pinned)
                }
                AptAction::Update => match &state.version {
                    Some(version) => (
                        "install",
                        &["--allow-downgrades"][..],
                        format!("{}={}", state.name, version),
                    ),
                    None => ("remove", &[][..], state.name.clone()),
                },
            };

            let args = self.args(verb, extra_flags, std::slice::from_ref(&target));
            let result = self
                .executor
                .execute(
                    &self.binary,
                    &args,
                    ExecutionConfig {
                        timeout: self.timeout,
                    },
                )
                .await?;

            if !result.success() {
                return Err(TxError::Compensate {
                    step_index: -1,
                    tag: self.tag().to_string(),
                    reason: format!("could not restore {}: {}", state.name, result.stderr),
                });
            }
        }

        Ok(())
    }
}
