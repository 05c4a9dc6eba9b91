//! `custom_script`: run an operator-supplied script; success is exit
//! 0. There is no automatic pre-image capture: the operator must pair
//! the step with a `rollback_script` in its data, or declare
//! `rollback: manual`/`ansible`/`none` explicitly (resolved open
//! question a). Compensation with no paired script is reported as a
//! `Compensate` error rather than silently skipped.

use crate::config::TxConfig;
use crate::error_handling::TxError;
use crate::registry::StepHandler;
use crate::secure_executor::{ExecutionConfig, SecureExecutor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CustomScriptData {
    script: String,
    #[serde(default)]
    args: Vec<String>,
    rollback_script: Option<String>,
    #[serde(default)]
    rollback_args: Vec<String>,
}

pub struct CustomScriptHandler {
    executor: SecureExecutor,
    timeout: Duration,
}

impl CustomScriptHandler {
    pub fn new(config: &TxConfig) -> Self {
        Self {
            executor: SecureExecutor::new(),
            timeout: Duration::from_secs(config.general.default_timeout_secs),
        }
    }

    fn parse(&self, data: &Value) -> Result<CustomScriptData, TxError> {
        serde_json::from_value(data.clone()).map_err(|e| TxError::Validation {
            field: "data".to_string(),
            message: format!("invalid custom_script data: {}", e),
        })
    }
}

#[async_trait]
impl StepHandler for CustomScriptHandler {
    fn tag(&self) -> &'static str {
        crate::types::step_tags::CUSTOM_SCRIPT
    }

    fn validate(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        if parsed.script.trim().is_empty() {
            return Err(TxError::Validation {
                field: "script".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// No automatic pre-image; the operator-supplied `rollback_script`
    /// (if any) is carried through as the snapshot so `compensate` can
    /// find it without re-parsing `data`.
    async fn snapshot(&self, data: &Value) -> Result<Value, TxError> {
        let parsed = self.parse(data)?;
        Ok(serde_json::json!({ "rollback_script": parsed.rollback_script }))
    }

    async fn apply(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        let arg_refs: Vec<&str> = parsed.args.iter().map(String::as_str).collect();
        let result = self
            .executor
            .execute(
                &parsed.script,
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
                reason: format!("{} exited non-zero: {}", parsed.script, result.stderr),
            })
        }
    }

    async fn compensate(&self, data: &Value, snapshot: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        let rollback_script = snapshot
            .get("rollback_script")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(parsed.rollback_script);

        let Some(script) = rollback_script else {
            return Err(TxError::Compensate {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: "no rollback_script supplied for this custom_script step".to_string(),
            });
        };

        let arg_refs: Vec<&str> = parsed.rollback_args.iter().map(String::as_str).collect();
        let result = self
            .executor
            .execute(
                &script,
                &arg_refs,
                ExecutionConfig {
                    timeout: self.timeout,
                },
            )
            .await?;

        if result.success() {
            Ok(())
        } else {
            Err(TxError::Compensate {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: format!("rollback script {} exited non-zero: {}", script, result.stderr),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compensate_without_rollback_script_is_an_error() {
        let handler = CustomScriptHandler::new(&TxConfig::default());
        let data = serde_json::json!({ "script": "/bin/true" });
        let snap = handler.snapshot(&data).await.unwrap();
        let result = handler.compensate(&data, &snap).await;
        assert!(matches!(result, Err(TxError::Compensate { .. })));
    }

    #[tokio::test]
    async fn apply_runs_the_script() {
        let handler = CustomScriptHandler::new(&TxConfig::default());
        let data = serde_json::json!({ "script": "/bin/true" });
        handler.apply(&data).await.unwrap();
    }
}
