//! `user_management`: create, modify, or remove a user account via
//! `useradd`/`usermod`/`userdel`, snapshotting the prior account
//! record (or an "absent" marker) the way the handler contract
//! requires.

use crate::config::TxConfig;
use crate::error_handling::TxError;
use crate::input_validation::validate_username;
use crate::registry::StepHandler;
use crate::secure_executor::{ExecutionConfig, SecureExecutor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum UserAction {
    Create,
    Modify,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserManagementData {
    name: String,
    action: UserAction,
    #[serde(default)]
    home: Option<String>,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum UserSnapshot {
    Absent,
    Present {
        uid: String,
        home: String,
        shell: String,
        groups: Vec<String>,
    },
}

pub struct UserManagementHandler {
    executor: SecureExecutor,
    timeout: Duration,
}

impl UserManagementHandler {
    pub fn new(config: &TxConfig) -> Self {
        Self {
            executor: SecureExecutor::new(),
            timeout: Duration::from_secs(config.general.default_timeout_secs),
        }
    }

    fn parse(&self, data: &Value) -> Result<UserManagementData, TxError> {
        serde_json::from_value(data.clone()).map_err(|e| TxError::Validation {
            field: "data".to_string(),
            message: format!("invalid user_management data: {}", e),
        })
    }

    async fn lookup(&self, name: &str) -> Option<UserSnapshot> {
        let passwd = self
            .executor
            .execute(
                "getent",
                &["passwd", name],
                ExecutionConfig {
                    timeout: Duration::from_secs(10),
                },
            )
            .await
            .ok()?;

        if !passwd.success() {
            return Some(UserSnapshot::Absent);
        }

        let line = passwd.stdout.trim();
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 {
            return Some(UserSnapshot::Absent);
        }

        let groups_out = self
            .executor
            .execute(
                "id",
                &["-Gn", name],
                ExecutionConfig {
                    timeout: Duration::from_secs(10),
                },
            )
            .await
            .ok()?;
        let groups = groups_out
            .stdout
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Some(UserSnapshot::Present {
            uid: fields[2].to_string(),
            home: fields[5].to_string(),
            shell: fields[6].to_string(),
            groups,
        })
    }
}

#[async_trait]
impl StepHandler for UserManagementHandler {
    fn tag(&self) -> &'static str {
        crate::types::step_tags::USER_MANAGEMENT
    }

    fn validate(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        validate_username("name", &parsed.name)?;
        Ok(())
    }

    async fn snapshot(&self, data: &Value) -> Result<Value, TxError> {
        let parsed = self.parse(data)?;
        let snapshot = self
            .lookup(&parsed.name)
            .await
            .unwrap_or(UserSnapshot::Absent);
        serde_json::to_value(snapshot).map_err(|e| TxError::Snapshot {
            step_index: -1,
            tag: self.tag().to_string(),
            reason: e.to_string(),
        })
    }

    async fn apply(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        let mut args: Vec<String> = Vec::new();

        let verb = match parsed.action {
            UserAction::Create => "useradd",
            UserAction::Modify => "usermod",
            UserAction::Remove => "userdel",
        };

        match parsed.action {
            UserAction::Create | UserAction::Modify => {
                if let Some(home) = &parsed.home {
                    args.push("-d".to_string());
                    args.push(home.clone());
                }
                if let Some(shell) = &parsed.shell {
                    args.push("-s".to_string());
                    args.push(shell.clone());
                }
                if !parsed.groups.is_empty() {
                    args.push("-G".to_string());
                    args.push(parsed.groups.join(","));
                }
                if parsed.action == UserAction::Create && parsed.system {
                    args.push("--system".to_string());
                }
                args.push(parsed.name.clone());
            }
            UserAction::Remove => {
                args.push(parsed.name.clone());
            }
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self
            .executor
            .execute(
                verb,
                &arg_refs,
                ExecutionConfig {
                    timeout: self.timeout,
                },
            )
            .await?;

        if result.success() {
            Ok(())
        } else {
            Err(TxError::Apply {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: format!("{} failed: {}", verb, result.stderr),
            })
        }
    }

    async fn compensate(&self, data: &Value, snapshot: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        let prior: UserSnapshot =
            serde_json::from_value(snapshot.clone()).map_err(|e| TxError::Compensate {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: format!("invalid snapshot: {}", e),
            })?;

        let currently_present = !matches!(self.lookup(&parsed.name).await, Some(UserSnapshot::Absent) | None);

        match prior {
            UserSnapshot::Absent => {
                if currently_present {
                    let result = self
                        .executor
                        .execute(
                            "userdel",
                            &["-r", &parsed.name],
                            ExecutionConfig {
                                timeout: self.timeout,
                            },
                        )
                        .await?;
                    if !result.success() {
                        return Err(TxError::Compensate {
                            step_index: -1,
                            tag: self.tag().to_string(),
                            reason: format!("userdel {} failed: {}", parsed.name, result.stderr),
                        });
                    }
                }
            }
            UserSnapshot::Present { home, shell, groups, .. } => {
                if !currently_present {
                    let mut args = vec!["-d".to_string(), home, "-s".to_string(), shell];
                    if !groups.is_empty() {
                        args.push("-G".to_string());
                        args.push(groups.join(","));
                    }
                    args.push(parsed.name.clone());
                    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                    let result = self
                        .executor
                        .execute(
                            "useradd",
                            &arg_refs,
                            ExecutionConfig {
                                timeout: self.timeout,
                            },
                        )
                        .await?;
                    if !result.success() {
                        return Err(TxError::Compensate {
                            step_index: -1,
                            tag: self.tag().to_string(),
                            reason: format!("useradd {} failed: {}", parsed.name, result.stderr),
                        });
                    }
                } else {
                    let arg_refs = [
                        "-d",
                        home.as_str(),
                        "-s",
                        shell.as_str(),
                        parsed.name.as_str(),
                    ];
                    let result = self
                        .executor
                        .execute(
                            "usermod",
                            &arg_refs,
                            ExecutionConfig {
                                timeout: self.timeout,
                            },
                        )
                        .await?;
                    if !result.success() {
                        return Err(TxError::Compensate {
                            step_index: -1,
                            tag: self.tag().to_string(),
                            reason: format!("usermod {} failed: {}", parsed.name, result.stderr),
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_invalid_username() {
        let handler = UserManagementHandler::new(&TxConfig::default());
        let data = serde_json::json!({ "name": "Invalid User!", "action": "create" });
        assert!(handler.validate(&data).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_username() {
        let handler = UserManagementHandler::new(&TxConfig::default());
        let data = serde_json::json!({ "name": "deploy", "action": "create", "home": "/home/deploy" });
        assert!(handler.validate(&data).is_ok());
    }
}
