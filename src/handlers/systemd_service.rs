//! `systemd_service`: drive a unit through `enable|disable|start|stop|
//! restart` via `systemctl`, snapshotting and restoring its prior
//! enabled/active state. Same shelled-out, exit-code-gated shape as
//! `apt_package.rs`.

use crate::config::TxConfig;
use crate::error_handling::TxError;
use crate::registry::StepHandler;
use crate::secure_executor::{ExecutionConfig, SecureExecutor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ServiceAction {
    Enable,
    Disable,
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SystemdServiceData {
    unit: String,
    action: ServiceAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceState {
    enabled: bool,
    active: bool,
}

pub struct SystemdServiceHandler {
    executor: SecureExecutor,
    timeout: Duration,
}

impl SystemdServiceHandler {
    pub fn new(config: &TxConfig) -> Self {
        Self {
            executor: SecureExecutor::new(),
            timeout: Duration::from_secs(config.general.default_timeout_secs),
        }
    }

    fn parse(&self, data: &Value) -> Result<SystemdServiceData, TxError> {
        serde_json::from_value(data.clone()).map_err(|e| TxError::Validation {
            field: "data".to_string(),
            message: format!("invalid systemd_service data: {}", e),
        })
    }

    async fn is_enabled(&self, unit: &str) -> bool {
        self.executor
            .execute(
                "systemctl",
                &["is-enabled", "--quiet", unit],
                ExecutionConfig {
                    timeout: Duration::from_secs(10),
                },
            )
            .await
            .map(|r| r.success())
            .unwrap_or(false)
    }

    async fn is_active(&self, unit: &str) -> bool {
        self.executor
            .execute(
                "systemctl",
                &["is-active", "--quiet", unit],
                ExecutionConfig {
                    timeout: Duration::from_secs(10),
                },
            )
            .await
            .map(|r| r.success())
            .unwrap_or(false)
    }

    async fn run(&self, verb: &str, unit: &str) -> Result<(), TxError> {
        let result = self
            .executor
            .execute(
                "systemctl",
                &[verb, unit],
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
                reason: format!("systemctl {} {} failed: {}", verb, unit, result.stderr),
            })
        }
    }
}

#[async_trait]
impl StepHandler for SystemdServiceHandler {
    fn tag(&self) -> &'static str {
        crate::types::step_tags::SYSTEMD_SERVICE
    }

    fn validate(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        if parsed.unit.trim().is_empty() {
            return Err(TxError::Validation {
                field: "unit".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    async fn snapshot(&self, data: &Value) -> Result<Value, TxError> {
        let parsed = self.parse(data)?;
        let state = ServiceState {
            enabled: self.is_enabled(&parsed.unit).await,
            active: self.is_active(&parsed.unit).await,
        };
        serde_json::to_value(state).map_err(|e| TxError::Snapshot {
            step_index: -1,
            tag: self.tag().to_string(),
            reason: e.to_string(),
        })
    }

    async fn apply(&self, data: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        let verb = match parsed.action {
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        };
        self.run(verb, &parsed.unit).await
    }

    async fn compensate(&self, data: &Value, snapshot: &Value) -> Result<(), TxError> {
        let parsed = self.parse(data)?;
        let prior: ServiceState =
            serde_json::from_value(snapshot.clone()).map_err(|e| TxError::Compensate {
                step_index: -1,
                tag: self.tag().to_string(),
                reason: format!("invalid snapshot: {}", e),
            })?;

        if prior.enabled != self.is_enabled(&parsed.unit).await {
            let verb = if prior.enabled { "enable" } else { "disable" };
            self.run(verb, &parsed.unit)
                .await
                .map_err(|e| TxError::Compensate {
                    step_index: -1,
                    tag: self.tag().to_string(),
                    reason: e.to_string(),
                })?;
        }

        if prior.active != self.is_active(&parsed.unit).await {
            let verb = if prior.active { "start" } else { "stop" };
            self.run(verb, &parsed.unit)
                .await
                .map_err(|e| TxError::Compensate {
                    step_index: -1,
                    tag: self.tag().to_string(),
                    reason: e.to_string(),
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_unit_name() {
        let handler = SystemdServiceHandler::new(&TxConfig::default());
        let data = serde_json::json!({ "unit": "", "action": "start" });
        assert!(handler.validate(&data).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_request() {
        let handler = SystemdServiceHandler::new(&TxConfig::default());
        let data = serde_json::json!({ "unit": "nginx.service", "action": "restart" });
        assert!(handler.validate(&data).is_ok());
    }
}
