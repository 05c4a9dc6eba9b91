//! The crash-durable relational store backing every transaction, step,
//! and snapshot. A thin wrapper around a single-writer [`SqlitePool`]
//! running in WAL mode, generalized from `Database` (`database.rs`),
//! same connection-pool setup and pragma tuning, new
//! schema (`transactions`/`steps`/`snapshots` instead of
//! `install_records`/`snapshots`/`package_cache`).

use crate::config::TxConfig;
use crate::error_handling::TxError;
use crate::types::{StepStatus, TransactionId, TransactionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRow {
    pub id: TransactionId,
    pub package_name: String,
    pub metadata_hash: String,
    pub metadata: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRow {
    pub transaction_id: TransactionId,
    pub order_index: i64,
    pub step_type: String,
    pub data_blob: String,
    pub status: StepStatus,
    pub rollback_strategy: String,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub transaction_id: TransactionId,
    pub order_index: i64,
    pub data_blob: String,
    pub created_at: DateTime<Utc>,
}

pub struct DurableLog {
    pool: SqlitePool,
}

impl DurableLog {
    /// Open (creating if absent) the log at `config`'s configured path.
    pub async fn open(config: &TxConfig) -> Result<Self, TxError> {
        let _ = config; // path comes from TxConfig::db_path, kept explicit for callers
        let db_path = TxConfig::db_path().map_err(|e| TxError::Storage {
            message: e.to_string(),
        })?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path.display());
        Self::connect(&database_url).await
    }

    /// In-memory log for tests: same schema and pragmas, no file on
    /// disk.
    pub async fn open_in_memory() -> Result<Self, TxError> {
        Self::connect("sqlite::memory:").await
    }

    async fn connect(database_url: &str) -> Result<Self, TxError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .max_lifetime(Some(Duration::from_secs(3600)))
            .idle_timeout(Some(Duration::from_secs(600)))
            .test_before_acquire(true)
            .connect(database_url)
            .await?;

        let log = DurableLog { pool };
        log.migrate().await?;
        Ok(log)
    }

    async fn migrate(&self) -> Result<(), TxError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                package_name TEXT NOT NULL,
                metadata_hash TEXT NOT NULL,
                metadata TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS steps (
                transaction_id INTEGER NOT NULL,
                order_index INTEGER NOT NULL,
                step_type TEXT NOT NULL,
                data_blob TEXT NOT NULL,
                status TEXT NOT NULL,
                rollback_strategy TEXT NOT NULL,
                executed_at TEXT,
                PRIMARY KEY (transaction_id, order_index),
                FOREIGN KEY (transaction_id) REFERENCES transactions (id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                transaction_id INTEGER NOT NULL,
                order_index INTEGER NOT NULL,
                data_blob TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (transaction_id, order_index),
                FOREIGN KEY (transaction_id) REFERENCES transactions (id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_created_at ON transactions(created_at)",
        )
        .execute(&self.pool)
        .await?;

        self.optimize().await?;
        Ok(())
    }

    async fn optimize(&self) -> Result<(), TxError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA cache_size = -10000")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA mmap_size = 268435456")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 30000")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The single-writer `Busy` check (invariant 4): is any transaction
    /// currently `in_progress` or `rolling_back`?
    pub async fn has_active_transaction(&self) -> Result<bool, TxError> {
        let row: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM transactions WHERE status IN ('in_progress', 'rolling_back') LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn create_transaction(
        &self,
        package_name: &str,
        metadata_hash: &str,
        metadata: &str,
    ) -> Result<TransactionId, TxError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO transactions (package_name, metadata_hash, metadata, status, created_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL)
            "#,
        )
        .bind(package_name)
        .bind(metadata_hash)
        .bind(metadata)
        .bind(TransactionStatus::Pending.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn set_transaction_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<(), TxError> {
        if status.is_terminal() {
            sqlx::query("UPDATE transactions SET status = ?1, completed_at = ?2 WHERE id = ?3")
                .bind(status.as_str())
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE transactions SET status = ?1 WHERE id = ?2")
                .bind(status.as_str())
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<TransactionRow>, TxError> {
        let row = sqlx::query("SELECT * FROM transactions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_transaction).transpose()
    }

    pub async fn list_transactions(
        &self,
        limit: i64,
        status: Option<TransactionStatus>,
    ) -> Result<Vec<TransactionRow>, TxError> {
        let rows = if let Some(status) = status {
            sqlx::query("SELECT * FROM transactions WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2")
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM transactions ORDER BY created_at DESC LIMIT ?1")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        };

        rows.into_iter().map(Self::row_to_transaction).collect()
    }

    /// Non-terminal transactions at startup, for crash recovery.
    pub async fn non_terminal_transactions(&self) -> Result<Vec<TransactionRow>, TxError> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE status IN ('pending', 'in_progress', 'rolling_back')",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_transaction).collect()
    }

    fn row_to_transaction(row: sqlx::sqlite::SqliteRow) -> Result<TransactionRow, TxError> {
        let status_str: String = row.get("status");
        let status = TransactionStatus::from_str(&status_str).ok_or_else(|| TxError::Storage {
            message: format!("unrecognized transaction status: {}", status_str),
        })?;

        let created_at: String = row.get("created_at");
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| TxError::Storage {
                message: e.to_string(),
            })?
            .with_timezone(&Utc);

        let completed_at: Option<String> = row.get("completed_at");
        let completed_at = completed_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| TxError::Storage {
                message: e.to_string(),
            })?;

        Ok(TransactionRow {
            id: row.get("id"),
            package_name: row.get("package_name"),
            metadata_hash: row.get("metadata_hash"),
            metadata: row.get("metadata"),
            status,
            created_at,
            completed_at,
        })
    }

    pub async fn insert_step(
        &self,
        transaction_id: TransactionId,
        order_index: i64,
        step_type: &str,
        data_blob: &str,
        rollback_strategy: &str,
    ) -> Result<(), TxError> {
        sqlx::query(
            r#"
            INSERT INTO steps (transaction_id, order_index, step_type, data_blob, status, rollback_strategy, executed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
            "#,
        )
        .bind(transaction_id)
        .bind(order_index)
        .bind(step_type)
        .bind(data_blob)
        .bind(StepStatus::Pending.as_str())
        .bind(rollback_strategy)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_step_status(
        &self,
        transaction_id: TransactionId,
        order_index: i64,
        status: StepStatus,
    ) -> Result<(), TxError> {
        sqlx::query(
            "UPDATE steps SET status = ?1, executed_at = ?2 WHERE transaction_id = ?3 AND order_index = ?4",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(transaction_id)
        .bind(order_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_steps(&self, transaction_id: TransactionId) -> Result<Vec<StepRow>, TxError> {
        let rows = sqlx::query(
            "SELECT * FROM steps WHERE transaction_id = ?1 ORDER BY order_index ASC",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_step).collect()
    }

    fn row_to_step(row: sqlx::sqlite::SqliteRow) -> Result<StepRow, TxError> {
        let status_str: String = row.get("status");
        let status = StepStatus::from_str(&status_str).ok_or_else(|| TxError::Storage {
            message: format!("unrecognized step status: {}", status_str),
        })?;

        let executed_at: Option<String> = row.get("executed_at");
        let executed_at = executed_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| TxError::Storage {
                message: e.to_string(),
            })?;

        Ok(StepRow {
            transaction_id: row.get("transaction_id"),
            order_index: row.get("order_index"),
            step_type: row.get("step_type"),
            data_blob: row.get("data_blob"),
            status,
            rollback_strategy: row.get("rollback_strategy"),
            executed_at,
        })
    }

    pub async fn insert_snapshot(
        &self,
        transaction_id: TransactionId,
        order_index: i64,
        data_blob: &str,
    ) -> Result<(), TxError> {
        sqlx::query(
            "INSERT INTO snapshots (transaction_id, order_index, data_blob, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(transaction_id)
        .bind(order_index)
        .bind(data_blob)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_snapshot(
        &self,
        transaction_id: TransactionId,
        order_index: i64,
    ) -> Result<Option<SnapshotRow>, TxError> {
        let row = sqlx::query(
            "SELECT * FROM snapshots WHERE transaction_id = ?1 AND order_index = ?2",
        )
        .bind(transaction_id)
        .bind(order_index)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let created_at: String = row.get("created_at");
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| TxError::Storage {
                    message: e.to_string(),
                })?
                .with_timezone(&Utc);

            Ok(SnapshotRow {
                transaction_id: row.get("transaction_id"),
                order_index: row.get("order_index"),
                data_blob: row.get("data_blob"),
                created_at,
            })
        })
        .transpose()
    }

    /// Deletes every snapshot for a transaction (called on commit:
    /// invariant 4, no snapshot rows remain after commit).
    pub async fn delete_snapshots(&self, transaction_id: TransactionId) -> Result<(), TxError> {
        sqlx::query("DELETE FROM snapshots WHERE transaction_id = ?1")
            .bind(transaction_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes a single transaction's row along with any steps and
    /// snapshots it has (used by crash recovery for a `pending`
    /// transaction that never got past `begin`: §4.1 says nothing
    /// happened, so the whole row is removed rather than transitioned
    /// to a terminal status).
    pub async fn delete_transaction(&self, transaction_id: TransactionId) -> Result<(), TxError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM snapshots WHERE transaction_id = ?1")
            .bind(transaction_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM steps WHERE transaction_id = ?1")
            .bind(transaction_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM transactions WHERE id = ?1")
            .bind(transaction_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Retention sweep: delete the whole (transaction, steps,
    /// snapshots) triple for terminal transactions older than the
    /// cutoff, atomically, leaving non-terminal transactions untouched
    /// regardless of age.
    pub async fn gc(&self, older_than_days: u32) -> Result<u64, TxError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days as i64);
        let cutoff_str = cutoff.to_rfc3339();

        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM transactions
            WHERE status IN ('committed', 'rolled_back', 'failed')
              AND created_at < ?1
            "#,
        )
        .bind(&cutoff_str)
        .fetch_all(&mut *tx)
        .await?;

        for id in &ids {
            sqlx::query("DELETE FROM snapshots WHERE transaction_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM steps WHERE transaction_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM transactions WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_and_read_back_a_transaction() {
        let log = DurableLog::open_in_memory().await.unwrap();
        let id = log
            .create_transaction("nginx", "deadbeef", "{}")
            .await
            .unwrap();

        let row = log.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Pending);
        assert_eq!(row.package_name, "nginx");
    }

    #[tokio::test]
    async fn busy_check_sees_in_progress_transactions() {
        let log = DurableLog::open_in_memory().await.unwrap();
        assert!(!log.has_active_transaction().await.unwrap());

        let id = log
            .create_transaction("nginx", "deadbeef", "{}")
            .await
            .unwrap();
        log.set_transaction_status(id, TransactionStatus::InProgress)
            .await
            .unwrap();

        assert!(log.has_active_transaction().await.unwrap());
    }

    #[tokio::test]
    async fn commit_deletes_snapshots_but_keeps_steps() {
        let log = DurableLog::open_in_memory().await.unwrap();
        let id = log
            .create_transaction("nginx", "deadbeef", "{}")
            .await
            .unwrap();

        log.insert_step(id, 0, "apt_package", "{}", "auto")
            .await
            .unwrap();
        log.insert_snapshot(id, 0, "{}").await.unwrap();

        log.delete_snapshots(id).await.unwrap();
        assert!(log.get_snapshot(id, 0).await.unwrap().is_none());
        assert_eq!(log.get_steps(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_transaction_removes_the_whole_triple() {
        let log = DurableLog::open_in_memory().await.unwrap();
        let id = log
            .create_transaction("nginx", "deadbeef", "{}")
            .await
            .unwrap();
        log.insert_step(id, 0, "apt_package", "{}", "auto")
            .await
            .unwrap();
        log.insert_snapshot(id, 0, "{}").await.unwrap();

        log.delete_transaction(id).await.unwrap();

        assert!(log.get_transaction(id).await.unwrap().is_none());
        assert!(log.get_steps(id).await.unwrap().is_empty());
        assert!(log.get_snapshot(id, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn gc_removes_only_old_terminal_transactions() {
        let log = DurableLog::open_in_memory().await.unwrap();

        let old_committed = log
            .create_transaction("old-committed", "hash1", "{}")
            .await
            .unwrap();
        log.set_transaction_status(old_committed, TransactionStatus::Committed)
            .await
            .unwrap();
        sqlx::query("UPDATE transactions SET created_at = ?1 WHERE id = ?2")
            .bind((Utc::now() - chrono::Duration::days(45)).to_rfc3339())
            .bind(old_committed)
            .execute(&log.pool)
            .await
            .unwrap();

        let old_in_progress = log
            .create_transaction("old-in-progress", "hash2", "{}")
            .await
            .unwrap();
        log.set_transaction_status(old_in_progress, TransactionStatus::InProgress)
            .await
            .unwrap();
        sqlx::query("UPDATE transactions SET created_at = ?1 WHERE id = ?2")
            .bind((Utc::now() - chrono::Duration::days(45)).to_rfc3339())
            .bind(old_in_progress)
            .execute(&log.pool)
            .await
            .unwrap();

        let deleted = log.gc(30).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(log.get_transaction(old_committed).await.unwrap().is_none());
        assert!(log.get_transaction(old_in_progress).await.unwrap().is_some());
    }
}
