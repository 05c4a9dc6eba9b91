//! Crash-recovery: seed a durable log with a transaction left
//! mid-flight by a simulated crash, then hand that same log to a
//! second `TransactionManager` standing in for the restarted process,
//! the way `TransactionManager::new` runs recovery eagerly at startup.

use async_trait::async_trait;
use debtx::durable_log::DurableLog;
use debtx::registry::{HandlerRegistry, StepHandler};
use debtx::types::{StepStatus, TransactionStatus};
use debtx::{TransactionManager, TxError};
use serde_json::{json, Value};

struct TolerantHandler;

#[async_trait]
impl StepHandler for TolerantHandler {
    fn tag(&self) -> &'static str {
        "apt_package"
    }

    fn validate(&self, _data: &Value) -> Result<(), TxError> {
        Ok(())
    }

    async fn snapshot(&self, _data: &Value) -> Result<Value, TxError> {
        Ok(json!({"kind": "absent"}))
    }

    async fn apply(&self, _data: &Value) -> Result<(), TxError> {
        Ok(())
    }

    // Per the §4.3 handler contract, `compensate` on a `running` step
    // must tolerate the change never having taken effect.
    async fn compensate(&self, _data: &Value, _snapshot: &Value) -> Result<(), TxError> {
        Ok(())
    }
}

/// Seed scenario 3: process killed during step 1's `apply`. Recovery
/// on restart finds the transaction `in_progress` with step 0
/// `succeeded` and step 1 `running`, and must compensate both in
/// reverse order, ending `rolled_back`.
#[tokio::test]
async fn crash_mid_apply_is_rolled_back_on_restart() {
    let log = DurableLog::open_in_memory().await.unwrap();

    let tx_id = log.create_transaction("demo", "hash", "{}").await.unwrap();
    log.set_transaction_status(tx_id, TransactionStatus::InProgress)
        .await
        .unwrap();

    log.insert_step(tx_id, 0, "apt_package", "{}", "auto").await.unwrap();
    log.insert_snapshot(tx_id, 0, r#"{"kind":"absent"}"#).await.unwrap();
    log.set_step_status(tx_id, 0, StepStatus::Succeeded).await.unwrap();

    log.insert_step(tx_id, 1, "apt_package", "{}", "auto").await.unwrap();
    log.insert_snapshot(tx_id, 1, r#"{"kind":"absent"}"#).await.unwrap();
    log.set_step_status(tx_id, 1, StepStatus::Running).await.unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register(Box::new(TolerantHandler));

    let manager = TransactionManager::from_log(log, registry).await.unwrap();

    let view = manager.status(tx_id).await.unwrap();
    assert_eq!(view.status, TransactionStatus::RolledBack);
    assert_eq!(view.steps[0].status, StepStatus::Compensated);
    assert_eq!(view.steps[1].status, StepStatus::Compensated);
}

/// A `pending` transaction with no step rows at all (crashed before
/// the first `insert_step`) is deleted outright on recovery: nothing
/// happened, so there is nothing to compensate or mark terminal.
#[tokio::test]
async fn empty_pending_transaction_is_deleted_on_recovery() {
    let log = DurableLog::open_in_memory().await.unwrap();
    let tx_id = log.create_transaction("demo", "hash", "{}").await.unwrap();

    let registry = HandlerRegistry::new();
    let manager = TransactionManager::from_log(log, registry).await.unwrap();

    let result = manager.status(tx_id).await;
    assert!(matches!(result, Err(TxError::NotFound { .. })));
}
