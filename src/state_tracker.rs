//! Snapshot-capture coordinator: given a step and its handler, produce
//! a pre-image and make it durable before the step is allowed to run.
//! Thin on purpose: the actual pre-image logic lives in each
//! [`crate::registry::StepHandler::snapshot`] implementation; this
//! module's only job is sequencing (snapshot-before-apply, invariant
//! 1) and persisting the result through the durable log.

use crate::durable_log::DurableLog;
use crate::error_handling::TxError;
use crate::registry::StepHandler;
use crate::types::TransactionId;
use serde_json::Value;

/// Captures and durably records a step's pre-image.
pub struct StateTracker<'a> {
    log: &'a DurableLog,
}

impl<'a> StateTracker<'a> {
    pub fn new(log: &'a DurableLog) -> Self {
        Self { log }
    }

    /// Calls `handler.snapshot(data)`, serializes the result, and
    /// writes it to the `snapshots` table before returning. Returning
    /// `Ok` is the caller's signal that it is now safe to `apply`.
    pub async fn capture(
        &self,
        handler: &dyn StepHandler,
        transaction_id: TransactionId,
        order_index: i64,
        data: &Value,
    ) -> Result<Value, TxError> {
        let snapshot = handler
            .snapshot(data)
            .await
            .map_err(|e| e.with_step_index(order_index))?;

        let blob = serde_json::to_string(&snapshot).map_err(|e| TxError::Snapshot {
            step_index: order_index,
            tag: handler.tag().to_string(),
            reason: e.to_string(),
        })?;

        self.log
            .insert_snapshot(transaction_id, order_index, &blob)
            .await?;

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct FakeHandler;

    #[async_trait]
    impl StepHandler for FakeHandler {
        fn tag(&self) -> &'static str {
            "fake"
        }

        fn validate(&self, _data: &Value) -> Result<(), TxError> {
            Ok(())
        }

        async fn snapshot(&self, _data: &Value) -> Result<Value, TxError> {
            Ok(json!({"prior": "absent"}))
        }

        async fn apply(&self, _data: &Value) -> Result<(), TxError> {
            Ok(())
        }

        async fn compensate(&self, _data: &Value, _snapshot: &Value) -> Result<(), TxError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn capture_persists_the_snapshot_row() {
        let log = DurableLog::open_in_memory().await.unwrap();
        let tx_id = log.create_transaction("nginx", "hash", "{}").await.unwrap();
        log.insert_step(tx_id, 0, "fake", "{}", "auto").await.unwrap();

        let tracker = StateTracker::new(&log);
        let snapshot = tracker
            .capture(&FakeHandler, tx_id, 0, &json!({}))
            .await
            .unwrap();
        assert_eq!(snapshot, json!({"prior": "absent"}));

        let row = log.get_snapshot(tx_id, 0).await.unwrap().unwrap();
        assert_eq!(row.data_blob, r#"{"prior":"absent"}"#);
    }
}
