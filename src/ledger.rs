//! Ledger of applied migrations, stored as an ordinary table inside the target
//! database so that ledger writes commit atomically with the schema change.
//!
//! Every function takes the caller's transaction; the ledger never opens its own
//! except in [`LedgerStore::install`].

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;

use crate::config::{MigratorConfig, check_distinct_tables};
use crate::core::{
    Column, DataType, EngineError, MigrationError, Result, TableSchema, Value,
};
use crate::engine::{Engine, Transaction};
use crate::lock;
use crate::schema::SchemaOperation;

const INSTALL_ATTEMPTS: usize = 3;

/// One applied descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub descriptor_id: String,
    pub applied_at: DateTime<Utc>,
    pub batch: u64,
}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    table: String,
    lock_table: String,
}

impl LedgerStore {
    pub fn new(table: impl Into<String>, lock_table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            lock_table: lock_table.into(),
        }
    }

    pub fn from_config(config: &MigratorConfig) -> Self {
        Self::new(config.ledger_table.clone(), config.lock_table.clone())
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn table_schema(&self) -> TableSchema {
        TableSchema::new(
            self.table.clone(),
            vec![
                Column::new("descriptor_id", DataType::String(255)).primary_key(),
                Column::new("applied_at", DataType::Timestamp),
                Column::new("batch", DataType::BigInteger),
            ],
        )
    }

    /// Creates the ledger and lock tables if missing. Returns `true` when this call
    /// created the ledger table.
    ///
    /// Safe to run concurrently: a losing creator retries and finds the table.
    pub async fn install(&self, engine: &dyn Engine) -> Result<bool> {
        check_distinct_tables(&self.table, &self.lock_table)?;
        let create = SchemaOperation::CreateTable(self.table_schema());
        let created = install_table(engine, &self.table, &create).await?;
        lock::install(engine, &self.lock_table).await?;
        Ok(created)
    }

    pub async fn is_installed(&self, tx: &dyn Transaction) -> Result<bool> {
        Ok(tx.describe(&self.table).await?.is_some())
    }

    pub async fn find(&self, tx: &dyn Transaction, descriptor_id: &str) -> Result<Option<LedgerEntry>> {
        Ok(self
            .list_applied(tx)
            .await?
            .into_iter()
            .find(|entry| entry.descriptor_id == descriptor_id))
    }

    pub async fn is_applied(&self, tx: &dyn Transaction, descriptor_id: &str) -> Result<bool> {
        Ok(self.find(tx, descriptor_id).await?.is_some())
    }

    /// Records `descriptor_id` as applied in `batch`.
    pub async fn record_applied(
        &self,
        tx: &mut dyn Transaction,
        descriptor_id: &str,
        batch: u64,
    ) -> Result<LedgerEntry> {
        if self.is_applied(tx, descriptor_id).await? {
            return Err(MigrationError::DuplicateApplication {
                descriptor_id: descriptor_id.to_string(),
            });
        }

        let entry = LedgerEntry {
            descriptor_id: descriptor_id.to_string(),
            applied_at: Utc::now(),
            batch,
        };
        let batch = i64::try_from(batch)
            .map_err(|_| MigrationError::Storage(format!("Batch number {} out of range", batch)))?;
        tx.insert(
            &self.table,
            vec![
                Value::Text(entry.descriptor_id.clone()),
                Value::Timestamp(entry.applied_at),
                Value::Integer(batch),
            ],
        )
        .await?;
        debug!("Ledger: recorded {} in batch {}", descriptor_id, entry.batch);
        Ok(entry)
    }

    /// Removes the ledger entry for `descriptor_id`.
    pub async fn record_reverted(&self, tx: &mut dyn Transaction, descriptor_id: &str) -> Result<()> {
        if !self.is_installed(tx).await? {
            return Err(MigrationError::NotApplied {
                descriptor_id: descriptor_id.to_string(),
            });
        }
        let removed = tx
            .delete_where(&self.table, "descriptor_id", &Value::Text(descriptor_id.to_string()))
            .await?;
        if removed == 0 {
            return Err(MigrationError::NotApplied {
                descriptor_id: descriptor_id.to_string(),
            });
        }
        debug!("Ledger: removed {}", descriptor_id);
        Ok(())
    }

    /// Applied entries ordered by `applied_at`, ties broken by id.
    ///
    /// A database without a ledger table has nothing applied.
    pub async fn list_applied(&self, tx: &dyn Transaction) -> Result<Vec<LedgerEntry>> {
        if !self.is_installed(tx).await? {
            return Ok(Vec::new());
        }
        let mut entries = tx
            .scan(&self.table)
            .await?
            .iter()
            .map(|row| decode_row(&self.table, row))
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|a, b| {
            a.applied_at
                .cmp(&b.applied_at)
                .then_with(|| a.descriptor_id.cmp(&b.descriptor_id))
        });
        Ok(entries)
    }

    /// One greater than the highest recorded batch, `1` for an empty ledger.
    pub async fn next_batch_number(&self, tx: &dyn Transaction) -> Result<u64> {
        let entries = self.list_applied(tx).await?;
        Ok(entries.iter().map(|e| e.batch).max().unwrap_or(0) + 1)
    }

    /// The newest `n` distinct batch numbers, newest first.
    pub async fn latest_batches(&self, tx: &dyn Transaction, n: usize) -> Result<Vec<u64>> {
        let mut batches: Vec<u64> = self
            .list_applied(tx)
            .await?
            .iter()
            .map(|e| e.batch)
            .collect();
        batches.sort_unstable_by(|a, b| b.cmp(a));
        batches.dedup();
        batches.truncate(n);
        Ok(batches)
    }
}

fn decode_row(table: &str, row: &[Value]) -> Result<LedgerEntry> {
    let malformed = || MigrationError::Storage(format!("Malformed row in ledger table '{}'", table));
    match row {
        [Value::Text(id), Value::Timestamp(applied_at), Value::Integer(batch)] => Ok(LedgerEntry {
            descriptor_id: id.clone(),
            applied_at: *applied_at,
            batch: u64::try_from(*batch).map_err(|_| malformed())?,
        }),
        _ => Err(malformed()),
    }
}

/// Shared by the ledger and the lock: create `table` unless it exists, retrying when a
/// concurrent installer wins the commit.
pub(crate) async fn install_table(
    engine: &dyn Engine,
    table: &str,
    create: &SchemaOperation,
) -> Result<bool> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut tx = engine.begin().await?;
        if tx.describe(table).await?.is_some() {
            tx.rollback().await?;
            return Ok(false);
        }
        if let Err(e) = tx.execute(create).await {
            tx.rollback().await?;
            return Err(e.into());
        }
        match tx.commit().await {
            Ok(()) => {
                info!("Created table '{}'", table);
                return Ok(true);
            }
            Err(EngineError::TransactionAborted(msg)) if attempt < INSTALL_ATTEMPTS => {
                debug!("Install of '{}' lost a commit race, retrying: {}", table, msg);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::engine::MemoryEngine;

    async fn installed() -> (MemoryEngine, LedgerStore) {
        let engine = MemoryEngine::new();
        let ledger = LedgerStore::new("migrations", "migrations_lock");
        assert!(ledger.install(&engine).await.unwrap());
        (engine, ledger)
    }

    #[tokio::test]
    async fn install_is_idempotent() {
        let (engine, ledger) = installed().await;
        assert!(!ledger.install(&engine).await.unwrap());
        assert_eq!(
            engine.catalog().await.table_names(),
            vec!["migrations".to_string(), "migrations_lock".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_table_means_nothing_applied() {
        let engine = MemoryEngine::new();
        let ledger = LedgerStore::new("migrations", "migrations_lock");
        let tx = engine.begin().await.unwrap();
        assert!(ledger.list_applied(tx.as_ref()).await.unwrap().is_empty());
        assert_eq!(ledger.next_batch_number(tx.as_ref()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn record_and_list() {
        let (engine, ledger) = installed().await;
        let mut tx = engine.begin().await.unwrap();
        ledger.record_applied(tx.as_mut(), "2025_01_01_a", 1).await.unwrap();
        ledger.record_applied(tx.as_mut(), "2025_01_02_b", 1).await.unwrap();
        ledger.record_applied(tx.as_mut(), "2025_01_03_c", 2).await.unwrap();
        tx.commit().await.unwrap();

        let tx = engine.begin().await.unwrap();
        let ids: Vec<String> = ledger
            .list_applied(tx.as_ref())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.descriptor_id)
            .collect();
        assert_eq!(ids, vec!["2025_01_01_a", "2025_01_02_b", "2025_01_03_c"]);
        assert_eq!(ledger.next_batch_number(tx.as_ref()).await.unwrap(), 3);
        assert_eq!(ledger.latest_batches(tx.as_ref(), 5).await.unwrap(), vec![2, 1]);
        assert_eq!(ledger.latest_batches(tx.as_ref(), 1).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn duplicate_record_is_rejected() {
        let (engine, ledger) = installed().await;
        let mut tx = engine.begin().await.unwrap();
        ledger.record_applied(tx.as_mut(), "a", 1).await.unwrap();
        let err = ledger.record_applied(tx.as_mut(), "a", 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateApplication);
    }

    #[tokio::test]
    async fn reverting_unknown_entry_is_not_applied() {
        let (engine, ledger) = installed().await;
        let mut tx = engine.begin().await.unwrap();
        let err = ledger.record_reverted(tx.as_mut(), "a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotApplied);

        ledger.record_applied(tx.as_mut(), "a", 1).await.unwrap();
        ledger.record_reverted(tx.as_mut(), "a").await.unwrap();
        assert!(!ledger.is_applied(tx.as_ref(), "a").await.unwrap());
    }
}
