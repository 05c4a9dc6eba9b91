//! Subprocess execution for step handlers that shell out (`apt-get`,
//! `systemctl`, `useradd`/`usermod`/`userdel`, operator scripts,
//! `ansible-playbook`). Generalizes the `SecureExecutor` stub into a
//! real `tokio::process::Command` wrapper with a
//! timeout, matching the `Duration`-based `ExecutionConfig` shape the
//! box modules already pass around.

use crate::error_handling::TxError;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Clone, Default)]
pub struct SecureExecutor;

impl SecureExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run `command args...` under `config.timeout`. A timeout kills
    /// the child and is surfaced as [`TxError::Timeout`], matching the
    /// apply-failure semantics the handler contract requires.
    pub async fn execute(
        &self,
        command: &str,
        args: &[&str],
        config: ExecutionConfig,
    ) -> Result<ExecutionResult, TxError> {
        let op = format!("{} {}", command, args.join(" "));

        let child = Command::new(command)
            .args(args)
            .output();

        let output = timeout(config.timeout, child)
            .await
            .map_err(|_| TxError::Timeout {
                operation: op.clone(),
                seconds: config.timeout.as_secs(),
            })?
            .map_err(TxError::from)?;

        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_a_trivial_command() {
        let executor = SecureExecutor::new();
        let result = executor
            .execute("true", &[], ExecutionConfig::default())
            .await
            .unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let executor = SecureExecutor::new();
        let result = executor
            .execute("false", &[], ExecutionConfig::default())
            .await
            .unwrap();
        assert!(!result.success());
    }

    #[tokio::test]
    async fn timeout_is_reported_as_timeout_error() {
        let executor = SecureExecutor::new();
        let config = ExecutionConfig {
            timeout: Duration::from_millis(50),
        };
        let result = executor.execute("sleep", &["5"], config).await;
        assert!(matches!(result, Err(TxError::Timeout { .. })));
    }
}
