//! The Transaction Manager: the engine's single public entry point.
//! Same "current transaction" handle and begin/execute/commit shape as
//! the `TransactionManager` it replaces, rebuilt onto the
//! step/handler/registry model instead of a fixed `TransactionType`
//! match.

use crate::config::TxConfig;
use crate::durable_log::DurableLog;
use crate::error_handling::TxError;
use crate::manifest::{PackageMetadata, Requirements};
use crate::registry::HandlerRegistry;
use crate::rollback_engine::RollbackEngine;
use crate::state_tracker::StateTracker;
use crate::types::{RollbackStrategy, StepStatus, TransactionId, TransactionStatus};
use serde::Serialize;
use tracing::{error, info, warn};

/// Read-side projection of a transaction and its steps, returned by
/// `status`/`list`.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionView {
    pub id: TransactionId,
    pub package_name: String,
    pub status: TransactionStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub steps: Vec<StepView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub order_index: i64,
    pub step_type: String,
    pub status: StepStatus,
}

pub struct TransactionManager {
    log: DurableLog,
    registry: HandlerRegistry,
    config: TxConfig,
    current: Option<TransactionId>,
}

impl TransactionManager {
    /// Opens the durable log at the configured path, builds the
    /// built-in handler registry, and runs crash recovery before
    /// returning, the way the prior `TransactionManager::new` called
    /// `recover_incomplete_transactions` eagerly.
    pub async fn new(config: TxConfig) -> Result<Self, TxError> {
        let log = DurableLog::open(&config).await?;
        let registry = HandlerRegistry::with_builtin_handlers(&config);
        let mut manager = Self {
            log,
            registry,
            config,
            current: None,
        };
        manager.recover().await?;
        Ok(manager)
    }

    /// In-memory variant for tests: same registry wiring, no file on
    /// disk, matching the old `Database::new_in_memory` shape.
    pub async fn for_testing(registry: HandlerRegistry) -> Result<Self, TxError> {
        let log = DurableLog::open_in_memory().await?;
        Ok(Self {
            log,
            registry,
            config: TxConfig::default(),
            current: None,
        })
    }

    /// Wraps an already-open log and immediately runs recovery over
    /// it, the way `new` does for a freshly opened one. Lets a test
    /// seed a log as if left behind by a crashed process, then hand it
    /// to a second manager instance standing in for the restarted one
    /// (spec.md §8 seed scenario 3, "crash recovery idempotence").
    pub async fn from_log(log: DurableLog, registry: HandlerRegistry) -> Result<Self, TxError> {
        let mut manager = Self {
            log,
            registry,
            config: TxConfig::default(),
            current: None,
        };
        manager.recover().await?;
        Ok(manager)
    }

    /// Scans for non-terminal transactions left over from a prior
    /// process and drives them to a terminal state (spec.md §4.1 crash
    /// recovery rule).
    pub async fn recover(&mut self) -> Result<(), TxError> {
        for row in self.log.non_terminal_transactions().await? {
            let steps = self.log.get_steps(row.id).await?;
            if row.status == TransactionStatus::Pending && steps.is_empty() {
                info!(transaction_id = row.id, "deleting empty pending transaction left by a crash");
                self.log.delete_transaction(row.id).await?;
                continue;
            }

            warn!(
                transaction_id = row.id,
                status = %row.status,
                "recovering non-terminal transaction from a prior run"
            );
            let engine = RollbackEngine::new(&self.log, &self.registry);
            engine.run(row.id).await?;
        }
        Ok(())
    }

    /// Opens a new transaction. Fails with `Busy` if another
    /// transaction is `in_progress`.
    pub async fn begin(&mut self, package_name: &str, metadata: &PackageMetadata) -> Result<TransactionId, TxError> {
        if self.log.has_active_transaction().await? {
            return Err(TxError::Busy { transaction_id: -1 });
        }

        let metadata_hash = metadata.fingerprint()?;
        let metadata_json = serde_json::to_string(metadata).map_err(|e| TxError::Validation {
            field: "<root>".to_string(),
            message: e.to_string(),
        })?;

        let id = self
            .log
            .create_transaction(package_name, &metadata_hash, &metadata_json)
            .await?;
        self.log
            .set_transaction_status(id, TransactionStatus::InProgress)
            .await?;
        self.current = Some(id);
        info!(transaction_id = id, package_name, "transaction begun");
        Ok(id)
    }

    /// Runs the §4.1 execution algorithm for the currently open
    /// transaction against the metadata's `install_steps`. On any step
    /// failure, rolls back and propagates the original error.
    pub async fn execute(&mut self, metadata: &PackageMetadata, allow_irreversible: bool) -> Result<(), TxError> {
        let transaction_id = self.current.ok_or_else(|| TxError::InvalidTransition {
            transaction_id: -1,
            status: "none".to_string(),
            attempted: "execute".to_string(),
        })?;

        // Re-validate every step's shape before any side effect runs
        // (§4.1: "the Manager re-validates each step's shape ... before
        // running any side effects"). A failure here ends the
        // transaction `failed` with no rollback, since nothing has
        // been snapshotted or applied yet.
        if let Err(e) = Self::validate_all_steps(&self.registry, metadata, allow_irreversible) {
            self.log
                .set_transaction_status(transaction_id, TransactionStatus::Failed)
                .await?;
            self.current = None;
            return Err(e);
        }

        for (index, step) in metadata.install_steps.iter().enumerate() {
            let order_index = index as i64;
            let handler = self.registry.get(&step.r#type)?;
            let rollback_strategy = step.rollback.unwrap_or(RollbackStrategy::Auto);

            let data_blob = serde_json::to_string(&step.data).map_err(|e| TxError::Validation {
                field: format!("install_steps[{}].data", index),
                message: e.to_string(),
            })?;
            self.log
                .insert_step(transaction_id, order_index, &step.r#type, &data_blob, rollback_strategy.as_str())
                .await?;

            let tracker = StateTracker::new(&self.log);
            if let Err(e) = tracker.capture(handler, transaction_id, order_index, &step.data).await {
                error!(transaction_id, step = order_index, error = %e, "snapshot capture failed");
                return self.fail_and_rollback(transaction_id, e).await;
            }

            self.log
                .set_step_status(transaction_id, order_index, StepStatus::Running)
                .await?;

            match handler.apply(&step.data).await {
                Ok(()) => {
                    self.log
                        .set_step_status(transaction_id, order_index, StepStatus::Succeeded)
                        .await?;
                }
                Err(e) => {
                    let e = e.with_step_index(order_index);
                    self.log
                        .set_step_status(transaction_id, order_index, StepStatus::Failed)
                        .await?;
                    error!(transaction_id, step = order_index, error = %e, "step apply failed");
                    return self.fail_and_rollback(transaction_id, e).await;
                }
            }
        }

        Ok(())
    }

    /// Shared by `execute` and by the CLI's `validate`/`install --dry-run`
    /// paths, so the rollback-strategy rule below is enforced wherever a
    /// manifest is checked, not only where a transaction actually runs.
    pub fn validate_all_steps(
        registry: &HandlerRegistry,
        metadata: &PackageMetadata,
        allow_irreversible: bool,
    ) -> Result<(), TxError> {
        for (index, step) in metadata.install_steps.iter().enumerate() {
            let handler = registry.get(&step.r#type)?;
            handler.validate(&step.data).map_err(|e| e.with_step_index(index as i64))?;

            let rollback_strategy = step.rollback.unwrap_or(RollbackStrategy::Auto);

            // `custom_script`/`ansible_playbook` have no built-in compensator
            // (resolved open question a): a step of one of these tags left at
            // the `auto` default is refused at validate time, before any side
            // effect runs, rather than discovered at rollback time once
            // `compensate` finds no paired rollback script/playbook.
            let is_manual_only_tag = matches!(
                step.r#type.as_str(),
                crate::types::step_tags::CUSTOM_SCRIPT | crate::types::step_tags::ANSIBLE_PLAYBOOK
            );
            if is_manual_only_tag && rollback_strategy == RollbackStrategy::Auto {
                return Err(TxError::Validation {
                    field: format!("install_steps[{}].rollback", index),
                    message: format!(
                        "{} has no automatic compensator; set rollback: manual or rollback: ansible explicitly, or rollback: none with --allow-irreversible",
                        step.r#type
                    ),
                });
            }

            if rollback_strategy == RollbackStrategy::None && !allow_irreversible {
                return Err(TxError::IrreversibleStep {
                    step_index: index as i64,
                    tag: step.r#type.clone(),
                });
            }
        }
        Ok(())
    }

    async fn fail_and_rollback(&mut self, transaction_id: TransactionId, cause: TxError) -> Result<(), TxError> {
        let engine = RollbackEngine::new(&self.log, &self.registry);
        engine.run(transaction_id).await?;
        self.current = None;
        Err(cause)
    }

    /// Transitions `in_progress → committed`, deletes snapshot rows,
    /// clears the current transaction handle.
    pub async fn commit(&mut self) -> Result<(), TxError> {
        let transaction_id = self.current.ok_or_else(|| TxError::InvalidTransition {
            transaction_id: -1,
            status: "none".to_string(),
            attempted: "commit".to_string(),
        })?;

        self.log
            .set_transaction_status(transaction_id, TransactionStatus::Committed)
            .await?;
        self.log.delete_snapshots(transaction_id).await?;
        self.current = None;
        info!(transaction_id, "transaction committed");
        Ok(())
    }

    /// Re-attempts rollback for any non-terminal or `failed`
    /// transaction; idempotent per the rollback engine's own skip rule.
    pub async fn rollback(&mut self, transaction_id: TransactionId) -> Result<(), TxError> {
        let row = self
            .log
            .get_transaction(transaction_id)
            .await?
            .ok_or(TxError::NotFound { transaction_id })?;

        if row.status == TransactionStatus::Committed || row.status == TransactionStatus::RolledBack {
            return Err(TxError::InvalidTransition {
                transaction_id,
                status: row.status.to_string(),
                attempted: "rollback".to_string(),
            });
        }

        let engine = RollbackEngine::new(&self.log, &self.registry);
        engine.run(transaction_id).await?;
        if self.current == Some(transaction_id) {
            self.current = None;
        }
        Ok(())
    }

    pub async fn status(&self, transaction_id: TransactionId) -> Result<TransactionView, TxError> {
        let row = self
            .log
            .get_transaction(transaction_id)
            .await?
            .ok_or(TxError::NotFound { transaction_id })?;
        let steps = self.log.get_steps(transaction_id).await?;

        Ok(TransactionView {
            id: row.id,
            package_name: row.package_name,
            status: row.status,
            created_at: row.created_at.to_rfc3339(),
            completed_at: row.completed_at.map(|t| t.to_rfc3339()),
            steps: steps
                .into_iter()
                .map(|s| StepView {
                    order_index: s.order_index,
                    step_type: s.step_type,
                    status: s.status,
                })
                .collect(),
        })
    }

    pub async fn list(&self, limit: i64, status: Option<TransactionStatus>) -> Result<Vec<TransactionView>, TxError> {
        let rows = self.log.list_transactions(limit, status).await?;
        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            let steps = self.log.get_steps(row.id).await?;
            views.push(TransactionView {
                id: row.id,
                package_name: row.package_name,
                status: row.status,
                created_at: row.created_at.to_rfc3339(),
                completed_at: row.completed_at.map(|t| t.to_rfc3339()),
                steps: steps
                    .into_iter()
                    .map(|s| StepView {
                        order_index: s.order_index,
                        step_type: s.step_type,
                        status: s.status,
                    })
                    .collect(),
            });
        }
        Ok(views)
    }

    pub async fn gc(&self, older_than_days: u32) -> Result<u64, TxError> {
        self.log.gc(older_than_days).await
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    /// Checked before `begin`, per §6: opaque requirement fields
    /// surfaced as `Validation` failures rather than interpreted
    /// against live hardware beyond architecture and memory, which are
    /// cheap to read from `/proc` the way a hardware detector reads
    /// `/proc/cpuinfo`.
    pub fn check_requirements(requirements: &Requirements) -> Result<(), TxError> {
        if !requirements.architectures.is_empty() {
            let current = std::env::consts::ARCH;
            if !requirements.architectures.iter().any(|a| a == current) {
                return Err(TxError::Validation {
                    field: "requirements.architectures".to_string(),
                    message: format!("host architecture {} not in {:?}", current, requirements.architectures),
                });
            }
        }

        if let Some(min_memory) = requirements.min_memory {
            let available = total_memory_bytes().unwrap_or(u64::MAX);
            if available < min_memory {
                return Err(TxError::Validation {
                    field: "requirements.min_memory".to_string(),
                    message: format!("host has {} bytes, requires {}", available, min_memory),
                });
            }
        }

        Ok(())
    }
}

/// Reads total installed memory from `/proc/meminfo`, in bytes.
fn total_memory_bytes() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Package, Requirements, ScriptSpec, StepSpec};
    use crate::registry::StepHandler;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct AlwaysOkHandler {
        tag: &'static str,
    }

    #[async_trait]
    impl StepHandler for AlwaysOkHandler {
        fn tag(&self) -> &'static str {
            self.tag
        }
        fn validate(&self, _data: &Value) -> Result<(), TxError> {
            Ok(())
        }
        async fn snapshot(&self, _data: &Value) -> Result<Value, TxError> {
            Ok(json!({"kind": "Absent"}))
        }
        async fn apply(&self, _data: &Value) -> Result<(), TxError> {
            Ok(())
        }
        async fn compensate(&self, _data: &Value, _snapshot: &Value) -> Result<(), TxError> {
            Ok(())
        }
    }

    struct AlwaysFailHandler {
        tag: &'static str,
    }

    #[async_trait]
    impl StepHandler for AlwaysFailHandler {
        fn tag(&self) -> &'static str {
            self.tag
        }
        fn validate(&self, _data: &Value) -> Result<(), TxError> {
            Ok(())
        }
        async fn snapshot(&self, _data: &Value) -> Result<Value, TxError> {
            Ok(json!({"kind": "Absent"}))
        }
        async fn apply(&self, _data: &Value) -> Result<(), TxError> {
            Err(TxError::Apply {
                step_index: -1,
                tag: self.tag.to_string(),
                reason: "simulated failure".to_string(),
            })
        }
        async fn compensate(&self, _data: &Value, _snapshot: &Value) -> Result<(), TxError> {
            Ok(())
        }
    }

    fn metadata(steps: Vec<StepSpec>) -> PackageMetadata {
        PackageMetadata {
            package: Package {
                name: "demo".to_string(),
                version: "1.0.0".to_string(),
                description: None,
                author: None,
                license: None,
            },
            install_steps: steps,
            pre_install: Vec::<ScriptSpec>::new(),
            post_install: Vec::<ScriptSpec>::new(),
            requirements: Requirements::default(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    #[tokio::test]
    async fn happy_path_commits_and_clears_snapshots() {
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(AlwaysOkHandler { tag: "ok" }));
        let mut manager = TransactionManager::for_testing(registry).await.unwrap();

        let meta = metadata(vec![StepSpec {
            r#type: "ok".to_string(),
            data: json!({}),
            rollback: None,
        }]);

        let id = manager.begin("demo", &meta).await.unwrap();
        manager.execute(&meta, false).await.unwrap();
        manager.commit().await.unwrap();

        let view = manager.status(id).await.unwrap();
        assert_eq!(view.status, TransactionStatus::Committed);
        assert_eq!(view.steps[0].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn failing_step_triggers_rollback_to_failed_or_rolled_back() {
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(AlwaysOkHandler { tag: "ok" }));
        registry.register(Box::new(AlwaysFailHandler { tag: "boom" }));
        let mut manager = TransactionManager::for_testing(registry).await.unwrap();

        let meta = metadata(vec![
            StepSpec {
                r#type: "ok".to_string(),
                data: json!({}),
                rollback: None,
            },
            StepSpec {
                r#type: "boom".to_string(),
                data: json!({}),
                rollback: None,
            },
        ]);

        let id = manager.begin("demo", &meta).await.unwrap();
        let result = manager.execute(&meta, false).await;
        assert!(result.is_err());

        let view = manager.status(id).await.unwrap();
        assert_eq!(view.status, TransactionStatus::RolledBack);
        assert_eq!(view.steps[1].status, StepStatus::Failed);
        assert_eq!(view.steps[0].status, StepStatus::Compensated);
    }

    #[tokio::test]
    async fn second_begin_while_in_progress_is_busy() {
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(AlwaysOkHandler { tag: "ok" }));
        let mut manager = TransactionManager::for_testing(registry).await.unwrap();

        let meta = metadata(vec![StepSpec {
            r#type: "ok".to_string(),
            data: json!({}),
            rollback: None,
        }]);

        manager.begin("demo", &meta).await.unwrap();
        let second = manager.begin("other", &meta).await;
        assert!(matches!(second, Err(TxError::Busy { .. })));
    }

    #[tokio::test]
    async fn irreversible_step_is_rejected_without_the_escape_hatch() {
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(AlwaysOkHandler { tag: "ok" }));
        let mut manager = TransactionManager::for_testing(registry).await.unwrap();

        let meta = metadata(vec![StepSpec {
            r#type: "ok".to_string(),
            data: json!({}),
            rollback: Some(RollbackStrategy::None),
        }]);

        manager.begin("demo", &meta).await.unwrap();
        let result = manager.execute(&meta, false).await;
        assert!(matches!(result, Err(TxError::IrreversibleStep { .. })));
    }

    #[tokio::test]
    async fn custom_script_left_at_default_rollback_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(AlwaysOkHandler {
            tag: crate::types::step_tags::CUSTOM_SCRIPT,
        }));
        let mut manager = TransactionManager::for_testing(registry).await.unwrap();

        let meta = metadata(vec![StepSpec {
            r#type: crate::types::step_tags::CUSTOM_SCRIPT.to_string(),
            data: json!({"script": "/bin/true"}),
            rollback: None,
        }]);

        manager.begin("demo", &meta).await.unwrap();
        let result = manager.execute(&meta, false).await;
        assert!(matches!(result, Err(TxError::Validation { .. })));
    }

    #[tokio::test]
    async fn custom_script_with_explicit_manual_rollback_is_accepted() {
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(AlwaysOkHandler {
            tag: crate::types::step_tags::CUSTOM_SCRIPT,
        }));
        let mut manager = TransactionManager::for_testing(registry).await.unwrap();

        let meta = metadata(vec![StepSpec {
            r#type: crate::types::step_tags::CUSTOM_SCRIPT.to_string(),
            data: json!({"script": "/bin/true"}),
            rollback: Some(RollbackStrategy::Manual),
        }]);

        manager.begin("demo", &meta).await.unwrap();
        manager.execute(&meta, false).await.unwrap();
    }
}
