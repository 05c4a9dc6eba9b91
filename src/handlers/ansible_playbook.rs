//! `ansible_playbook`: run a declared playbook with supplied variables
//! via `ansible-playbook`. Like `custom_script`, there is no automatic
//! state capture: the operator supplies a paired `rollback_playbook`
//! and the engine runs it in place of a handler-computed compensation.

use crate::config::TxConfig;
use crate::error_handling::TxError;
use crate::registry::StepHandler;
use crate::secure_executor::{ExecutionConfig, SecureExecutor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnsiblePlaybookData {
    playbook: String,
    #[serde(default)]
    variables: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    inventory: Option<String>,
    rollback_playbook: Option<String>,
}

pub struct AnsiblePlaybookHandler {
    executor: SecureExecutor,
    timeout: Duration,
}

impl AnsiblePlaybookHandler {
    pub fn new(config: &TxConfig) -> Self {
        Self {
            executor: SecureExecutor::new(),
            timeout: Duration::from_secs(config.general.default_timeout_secs),
        }
    }

    fn parse(&self, data: &Value) -> Result<AnsiblePlaybookData, TxError> {
        serde_json::from_value(data.clone()).map_err(|e| TxError::Validation {
            field: "data".to_string(),
            message: format!("invalid ansible_playbook data: {}", e),
        })
    }

    fn build_args<'a>(playbook: &'a str, inventory: &'a Option<String>, extra_vars: &'a Option<String>) -> Vec<&'a str> {
        let mut args = vec![playbook];
        if let Some(inventory) = inventory {
            args.push("-i");
            args.push(inventory);
        }
        if let Some(extra_vars) = extra_vars {
            args.push("--extra-vars");
            args.push(extra_vars);
        }
        args
    }

    async fn run_playbook(&self, playbook: &str, inventory: &Option<String>, variables: &std::collections::BTreeMap<String, String>) -> Result<crate::secure_executor::ExecutionResult, TxError> {
        let extra_vars = if variables.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(variables).map_err(|e| TxError::Apply {
                    step_index: -1,
                    tag: crate::types::step_tags::ANSIBLE_PLAYBOOK.to_string(),
                    reason: format!("could not encode variables: {}", e),
                })?,
            )
        };
        let args = Self::build_args(playbook, inventory, &extra_vars);
        self.executor
            .execute(
                "ansible-playbook",
                &args,
                ExecutionConfig {
                    timeout: self.timeout,
                },
            )
            .await
    }
}

#[async_trait]
impl StepHandler for AnsiblePlaybookHandler {
    fn tag(&self) -> &'static str {
        crate::types::step_tags::ANSIBLE_PLAYBOOK
    }

    fn validate(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        if parsed.playbook.trim().is_empty() {
            return Err(TxError::Validation {
                field: "playbook".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// No state capture; the rollback playbook reference is carried
    /// through so `compensate` doesn't need the original step data.
    async fn snapshot(&self, data: &Value) -> Result<Value, TxError> {
        let parsed = self.parse(data)?;
        Ok(serde_json::json!({ "rollback_playbook": parsed.rollback_playbook }))
    }

    async fn apply(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        let result = self
            .run_playbook(&parsed.playbook, &parsed.inventory, &parsed.variables)
            .await?;

        if result.success() {
            Ok(())
        } else {
            Err(TxError::Apply {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: format!("{} run failed: {}", parsed.playbook, result.stderr),
            })
        }
    }

    async fn compensate(&self, data: &Value, snapshot: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        let rollback_playbook = snapshot
            .get("rollback_playbook")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(parsed.rollback_playbook);

        let Some(playbook) = rollback_playbook else {
            return Err(TxError::Compensate {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: "no rollback_playbook supplied for this ansible_playbook step".to_string(),
            });
        };

        let result = self
            .run_playbook(&playbook, &parsed.inventory, &parsed.variables)
            .await?;

        if result.success() {
            Ok(())
        } else {
            Err(TxError::Compensate {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: format!("rollback playbook {} failed: {}", playbook, result.stderr),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_playbook() {
        let handler = AnsiblePlaybookHandler::new(&TxConfig::default());
        let data = serde_json::json!({ "playbook": "" });
        assert!(handler.validate(&data).is_err());
    }

    #[tokio::test]
    async fn compensate_without_rollback_playbook_is_an_error() {
        let handler = AnsiblePlaybookHandler::new(&TxConfig::default());
        let data = serde_json::json!({ "playbook": "site.yml" });
        let snap = handler.snapshot(&data).await.unwrap();
        let result = handler.compensate(&data, &snap).await;
        assert!(matches!(result, Err(TxError::Compensate { .. })));
    }
}
