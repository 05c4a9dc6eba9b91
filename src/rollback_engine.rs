//! Reverse-order compensation. Generalizes
//! `transaction.rs::rollback_transaction` (a fixed `match` over
//! `TransactionType` that falls back to a whole-host snapshot revert)
//! into a walk driven purely by each step's own snapshot row and its
//! `rollback` strategy tag; see DESIGN.md for why the whole-host
//! fallback is dropped.

use crate::durable_log::DurableLog;
use crate::error_handling::TxError;
use crate::registry::HandlerRegistry;
use crate::types::{RollbackStrategy, StepStatus, TransactionId, TransactionStatus};
use serde_json::Value;
use tracing::{error, info, warn};

pub struct RollbackEngine<'a> {
    log: &'a DurableLog,
    registry: &'a HandlerRegistry,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(log: &'a DurableLog, registry: &'a HandlerRegistry) -> Self {
        Self { log, registry }
    }

    /// Walks every recorded step of `transaction_id` in strictly
    /// reverse order, compensating each one not already `compensated`.
    /// Best-effort: a failed compensation does not stop the walk.
    /// Returns the terminal transaction status (`rolled_back` or
    /// `failed`) the caller should persist.
    pub async fn run(&self, transaction_id: TransactionId) -> Result<TransactionStatus, TxError> {
        self.log
            .set_transaction_status(transaction_id, TransactionStatus::RollingBack)
            .await?;

        let mut steps = self.log.get_steps(transaction_id).await?;
        steps.sort_by_key(|s| std::cmp::Reverse(s.order_index));

        let mut any_failed = false;

        for step in steps {
            match step.status {
                // `Pending`/`Compensated` need no work. `Failed` means
                // this step's own `apply` returned an error; nothing
                // it did was verified to take effect, so the Manager's
                // `rollback_to(i-1)` never includes the failing step
                // itself (seed scenario 2); it stays `failed` forever.
                StepStatus::Pending | StepStatus::Compensated | StepStatus::Failed => continue,
                StepStatus::Running | StepStatus::Succeeded | StepStatus::CompensationFailed => {}
                StepStatus::Compensating => {}
            }

            let rollback_strategy = RollbackStrategy::from_str(&step.rollback_strategy)
                .unwrap_or(RollbackStrategy::Auto);

            if rollback_strategy == RollbackStrategy::None {
                warn!(
                    transaction_id,
                    step = step.order_index,
                    "step declares itself irreversible, cannot compensate"
                );
                self.log
                    .set_step_status(transaction_id, step.order_index, StepStatus::CompensationFailed)
                    .await?;
                any_failed = true;
                continue;
            }

            self.log
                .set_step_status(transaction_id, step.order_index, StepStatus::Compensating)
                .await?;

            let outcome = self.compensate_one(transaction_id, step.order_index, &step.step_type, &step.data_blob).await;

            match outcome {
                Ok(()) => {
                    info!(transaction_id, step = step.order_index, "step compensated");
                    self.log
                        .set_step_status(transaction_id, step.order_index, StepStatus::Compensated)
                        .await?;
                }
                Err(e) => {
                    error!(transaction_id, step = step.order_index, error = %e, "compensation failed");
                    self.log
                        .set_step_status(transaction_id, step.order_index, StepStatus::CompensationFailed)
                        .await?;
                    any_failed = true;
                }
            }
        }

        let terminal = if any_failed {
            TransactionStatus::Failed
        } else {
            TransactionStatus::RolledBack
        };
        self.log.set_transaction_status(transaction_id, terminal).await?;
        Ok(terminal)
    }

    async fn compensate_one(
        &self,
        transaction_id: TransactionId,
        order_index: i64,
        step_type: &str,
        data_blob: &str,
    ) -> Result<(), TxError> {
        let handler = self.registry.get(step_type)?;

        let data: Value = serde_json::from_str(data_blob).map_err(|e| TxError::Compensate {
            step_index: order_index,
            tag: step_type.to_string(),
            reason: format!("corrupt step data: {}", e),
        })?;

        let snapshot_row = self.log.get_snapshot(transaction_id, order_index).await?;
        let Some(snapshot_row) = snapshot_row else {
            return Err(TxError::Compensate {
                step_index: order_index,
                tag: step_type.to_string(),
                reason: "no snapshot row recorded for this step".to_string(),
            });
        };

        let snapshot: Value = serde_json::from_str(&snapshot_row.data_blob).map_err(|e| TxError::Compensate {
            step_index: order_index,
            tag: step_type.to_string(),
            reason: format!("corrupt snapshot data: {}", e),
        })?;

        handler
            .compensate(&data, &snapshot)
            .await
            .map_err(|e| e.with_step_index(order_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StepHandler;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingHandler {
        tag: &'static str,
        compensated: Arc<std::sync::Mutex<Vec<i64>>>,
        fail_index: Option<i64>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StepHandler for RecordingHandler {
        fn tag(&self) -> &'static str {
            self.tag
        }

        fn validate(&self, _data: &Value) -> Result<(), TxError> {
            Ok(())
        }

        async fn snapshot(&self, _data: &Value) -> Result<Value, TxError> {
            Ok(json!({}))
        }

        async fn apply(&self, _data: &Value) -> Result<(), TxError> {
            Ok(())
        }

        async fn compensate(&self, data: &Value, _snapshot: &Value) -> Result<(), TxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let index = data["index"].as_i64().unwrap();
            if Some(index) == self.fail_index {
                return Err(TxError::Compensate {
                    step_index: -1,
                    tag: self.tag.to_string(),
                    reason: "simulated failure".to_string(),
                });
            }
            self.compensated.lock().unwrap().push(index);
            Ok(())
        }
    }

    async fn seed_transaction(
        log: &DurableLog,
        statuses: &[StepStatus],
    ) -> TransactionId {
        let tx_id = log.create_transaction("pkg", "hash", "{}").await.unwrap();
        for (i, status) in statuses.iter().enumerate() {
            log.insert_step(tx_id, i as i64, "fake", &json!({"index": i as i64}).to_string(), "auto")
                .await
                .unwrap();
            log.insert_snapshot(tx_id, i as i64, "{}").await.unwrap();
            log.set_step_status(tx_id, i as i64, *status).await.unwrap();
        }
        tx_id
    }

    #[tokio::test]
    async fn compensates_in_strict_reverse_order() {
        let log = DurableLog::open_in_memory().await.unwrap();
        let tx_id = seed_transaction(
            &log,
            &[StepStatus::Succeeded, StepStatus::Succeeded, StepStatus::Succeeded],
        )
        .await;

        let compensated = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(RecordingHandler {
            tag: "fake",
            compensated: compensated.clone(),
            fail_index: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }));

        let engine = RollbackEngine::new(&log, &registry);
        let terminal = engine.run(tx_id).await.unwrap();

        assert_eq!(terminal, TransactionStatus::RolledBack);
        assert_eq!(*compensated.lock().unwrap(), vec![2, 1, 0]);
    }

    /// Seed scenario 2/5: the step whose own `apply` failed keeps
    /// status `failed` and is never itself compensated; only the
    /// steps before it are walked in reverse.
    #[tokio::test]
    async fn the_failing_step_itself_is_never_compensated() {
        let log = DurableLog::open_in_memory().await.unwrap();
        let tx_id = seed_transaction(
            &log,
            &[StepStatus::Succeeded, StepStatus::Succeeded, StepStatus::Failed],
        )
        .await;

        let compensated = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(RecordingHandler {
            tag: "fake",
            compensated: compensated.clone(),
            fail_index: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }));

        let engine = RollbackEngine::new(&log, &registry);
        let terminal = engine.run(tx_id).await.unwrap();

        assert_eq!(terminal, TransactionStatus::RolledBack);
        assert_eq!(*compensated.lock().unwrap(), vec![1, 0]);

        let steps = log.get_steps(tx_id).await.unwrap();
        let step2 = steps.iter().find(|s| s.order_index == 2).unwrap();
        assert_eq!(step2.status, StepStatus::Failed);
    }

    /// Seed scenario 5: best-effort rollback. A compensation failure
    /// on one step does not stop the walk, and the transaction ends
    /// `failed` rather than `rolled_back`.
    #[tokio::test]
    async fn a_failed_compensation_does_not_stop_the_walk() {
        let log = DurableLog::open_in_memory().await.unwrap();
        let tx_id = seed_transaction(
            &log,
            &[StepStatus::Succeeded, StepStatus::Succeeded, StepStatus::Failed],
        )
        .await;

        let compensated = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(RecordingHandler {
            tag: "fake",
            compensated: compensated.clone(),
            fail_index: Some(1),
            calls: Arc::new(AtomicUsize::new(0)),
        }));

        let engine = RollbackEngine::new(&log, &registry);
        let terminal = engine.run(tx_id).await.unwrap();

        assert_eq!(terminal, TransactionStatus::Failed);
        assert_eq!(*compensated.lock().unwrap(), vec![0]);

        let steps = log.get_steps(tx_id).await.unwrap();
        let step1 = steps.iter().find(|s| s.order_index == 1).unwrap();
        assert_eq!(step1.status, StepStatus::CompensationFailed);
        let step0 = steps.iter().find(|s| s.order_index == 0).unwrap();
        assert_eq!(step0.status, StepStatus::Compensated);
    }

    #[tokio::test]
    async fn compensated_steps_are_skipped_and_compensation_failed_steps_retried() {
        let log = DurableLog::open_in_memory().await.unwrap();
        let tx_id = seed_transaction(
            &log,
            &[StepStatus::Compensated, StepStatus::CompensationFailed],
        )
        .await;

        let compensated = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(RecordingHandler {
            tag: "fake",
            compensated: compensated.clone(),
            fail_index: None,
            calls: calls.clone(),
        }));

        let engine = RollbackEngine::new(&log, &registry);
        engine.run(tx_id).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*compensated.lock().unwrap(), vec![1]);
    }
}
