//! Advisory migration lock.
//!
//! The lock is a single row in its own table, written through the same engine as the
//! ledger. Acquisition is a read-check-insert transaction; two contenders that both see
//! the row missing race on commit and the engine lets exactly one of them win.
//!
//! The row carries a lease. A run renews it between descriptors; a row whose lease ran
//! out belongs to a crashed run and may be taken over. A row with `blocked_by` set marks
//! a failed revert and refuses every acquisition until [`MigrationLock::force_release`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::config::MigratorConfig;
use crate::core::{Column, DataType, EngineError, MigrationError, Result, TableSchema, Value};
use crate::engine::{Engine, Transaction};
use crate::ledger::install_table;
use crate::schema::SchemaOperation;

pub const LOCK_KEY: &str = "migrate";

const RELEASE_ATTEMPTS: usize = 3;

/// Contents of the lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Descriptor whose revert failed, if the lock is blocked.
    pub blocked_by: Option<String>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub fn table_schema(table: &str) -> TableSchema {
    TableSchema::new(
        table,
        vec![
            Column::new("lock_key", DataType::String(64)).primary_key(),
            Column::new("owner", DataType::String(255)),
            Column::new("acquired_at", DataType::Timestamp),
            Column::new("expires_at", DataType::Timestamp),
            Column::new("blocked_by", DataType::String(255)).nullable(),
        ],
    )
}

/// Creates the lock table if missing.
pub async fn install(engine: &dyn Engine, table: &str) -> Result<bool> {
    install_table(engine, table, &SchemaOperation::CreateTable(table_schema(table))).await
}

/// Current lock row, if any.
pub async fn inspect(engine: &dyn Engine, table: &str) -> Result<Option<LockRecord>> {
    let tx = engine.begin().await?;
    let record = read_record(tx.as_ref(), table).await;
    tx.rollback().await?;
    record
}

/// A held migration lock.
///
/// Release explicitly with [`MigrationLock::release`]. A lock dropped while still held
/// is released by a background task when a tokio runtime is available; otherwise it
/// stays until its lease expires.
pub struct MigrationLock {
    engine: Arc<dyn Engine>,
    table: String,
    owner: String,
    lease: Duration,
    released: bool,
}

impl std::fmt::Debug for MigrationLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationLock")
            .field("table", &self.table)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish()
    }
}

impl MigrationLock {
    /// Acquires the lock, failing fast or waiting up to `config.lock_timeout`.
    pub async fn acquire(engine: Arc<dyn Engine>, config: &MigratorConfig) -> Result<Self> {
        let mut lock = Self {
            engine,
            table: config.lock_table.clone(),
            owner: format!("pid-{}-{}", std::process::id(), Uuid::new_v4()),
            lease: config.lock_lease,
            released: false,
        };
        let deadline = config.lock_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let attempt = lock.try_acquire().await;
            match attempt {
                Ok(()) => {
                    info!("Acquired migration lock as {}", lock.owner);
                    return Ok(lock);
                }
                Err(MigrationError::MigrationInProgress { owner, .. })
                    if deadline.is_some_and(|deadline| Instant::now() < deadline) =>
                {
                    debug!("Migration lock held by {}, waiting", owner);
                    tokio::time::sleep(config.lock_poll_interval).await;
                }
                Err(e) => {
                    // Never acquired; nothing to release on drop.
                    lock.released = true;
                    return Err(e);
                }
            }
        }
    }

    async fn try_acquire(&self) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.engine.begin().await?;

        if let Some(current) = read_record(tx.as_ref(), &self.table).await? {
            if let Some(descriptor_id) = current.blocked_by {
                tx.rollback().await?;
                return Err(MigrationError::RevertFailed {
                    descriptor_id,
                    reason: "a previous rollback failed; repair the schema and run migrate:resolve"
                        .to_string(),
                });
            }
            if !current.is_expired(now) {
                tx.rollback().await?;
                return Err(MigrationError::MigrationInProgress {
                    owner: current.owner,
                    expires_at: current.expires_at,
                });
            }
            warn!(
                "Taking over stale migration lock from {} (lease expired at {})",
                current.owner, current.expires_at
            );
            tx.delete_where(&self.table, "lock_key", &key()).await?;
        }

        let record = LockRecord {
            owner: self.owner.clone(),
            acquired_at: now,
            expires_at: now + self.lease_delta(),
            blocked_by: None,
        };
        tx.insert(&self.table, encode_record(&record)).await?;

        match tx.commit().await {
            Ok(()) => Ok(()),
            Err(EngineError::TransactionAborted(_)) => {
                // Lost the race; report whoever won.
                let winner = inspect(self.engine.as_ref(), &self.table).await?;
                Err(match winner {
                    Some(winner) => MigrationError::MigrationInProgress {
                        owner: winner.owner,
                        expires_at: winner.expires_at,
                    },
                    None => MigrationError::MigrationInProgress {
                        owner: "unknown".to_string(),
                        expires_at: record.expires_at,
                    },
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Extends the lease. Fails with `TransactionAborted` if the lock was lost.
    pub async fn renew(&self) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.engine.begin().await?;
        let mut record = self.owned_record(tx.as_ref()).await?;
        record.expires_at = now + self.lease_delta();
        tx.delete_where(&self.table, "lock_key", &key()).await?;
        tx.insert(&self.table, encode_record(&record)).await?;
        tx.commit().await?;
        debug!("Renewed migration lock until {}", record.expires_at);
        Ok(())
    }

    /// Marks the lock blocked by a failed revert. A blocked lock survives release.
    pub async fn block(&self, descriptor_id: &str) -> Result<()> {
        let mut tx = self.engine.begin().await?;
        let mut record = self.owned_record(tx.as_ref()).await?;
        record.blocked_by = Some(descriptor_id.to_string());
        tx.delete_where(&self.table, "lock_key", &key()).await?;
        tx.insert(&self.table, encode_record(&record)).await?;
        tx.commit().await?;
        warn!("Migration lock blocked by failed revert of {}", descriptor_id);
        Ok(())
    }

    /// Releases the lock unless it is blocked.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        release_row(self.engine.as_ref(), &self.table, &self.owner).await
    }

    async fn owned_record(&self, tx: &dyn Transaction) -> Result<LockRecord> {
        match read_record(tx, &self.table).await? {
            Some(record) if record.owner == self.owner => Ok(record),
            Some(record) => Err(MigrationError::TransactionAborted(format!(
                "Migration lock was taken over by {}",
                record.owner
            ))),
            None => Err(MigrationError::TransactionAborted(
                "Migration lock was removed while held".to_string(),
            )),
        }
    }

    fn lease_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    /// Removes the lock row whatever its state. Returns the removed record.
    pub async fn force_release(engine: &dyn Engine, table: &str) -> Result<Option<LockRecord>> {
        let mut tx = engine.begin().await?;
        let record = read_record(tx.as_ref(), table).await?;
        if record.is_some() {
            tx.delete_where(table, "lock_key", &key()).await?;
            tx.commit().await?;
            info!("Cleared migration lock");
        } else {
            tx.rollback().await?;
        }
        Ok(record)
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("Migration lock {} dropped while held", self.owner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let engine = Arc::clone(&self.engine);
            let table = self.table.clone();
            let owner = self.owner.clone();
            handle.spawn(async move {
                if let Err(e) = release_row(engine.as_ref(), &table, &owner).await {
                    warn!("Background release of migration lock failed: {}", e);
                }
            });
        }
    }
}

async fn release_row(engine: &dyn Engine, table: &str, owner: &str) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut tx = engine.begin().await?;
        match read_record(tx.as_ref(), table).await? {
            Some(record) if record.owner == owner && record.blocked_by.is_none() => {
                tx.delete_where(table, "lock_key", &key()).await?;
            }
            Some(record) if record.blocked_by.is_some() => {
                tx.rollback().await?;
                debug!("Leaving blocked migration lock in place");
                return Ok(());
            }
            _ => {
                tx.rollback().await?;
                return Ok(());
            }
        }
        match tx.commit().await {
            Ok(()) => {
                info!("Released migration lock");
                return Ok(());
            }
            Err(EngineError::TransactionAborted(_)) if attempt < RELEASE_ATTEMPTS => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn key() -> Value {
    Value::Text(LOCK_KEY.to_string())
}

async fn read_record(tx: &dyn Transaction, table: &str) -> Result<Option<LockRecord>> {
    if tx.describe(table).await?.is_none() {
        return Ok(None);
    }
    let rows = tx.scan(table).await?;
    let Some(row) = rows
        .iter()
        .find(|row| row.first().and_then(Value::as_str) == Some(LOCK_KEY))
    else {
        return Ok(None);
    };
    decode_record(table, row).map(Some)
}

fn encode_record(record: &LockRecord) -> Vec<Value> {
    vec![
        key(),
        Value::Text(record.owner.clone()),
        Value::Timestamp(record.acquired_at),
        Value::Timestamp(record.expires_at),
        record
            .blocked_by
            .clone()
            .map(Value::Text)
            .unwrap_or(Value::Null),
    ]
}

fn decode_record(table: &str, row: &[Value]) -> Result<LockRecord> {
    match row {
        [_, Value::Text(owner), Value::Timestamp(acquired_at), Value::Timestamp(expires_at), blocked_by] => {
            Ok(LockRecord {
                owner: owner.clone(),
                acquired_at: *acquired_at,
                expires_at: *expires_at,
                blocked_by: blocked_by.as_str().map(str::to_string),
            })
        }
        _ => Err(MigrationError::Storage(format!(
            "Malformed row in lock table '{}'",
            table
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::engine::MemoryEngine;

    async fn setup() -> (Arc<dyn Engine>, MigratorConfig) {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        let config = MigratorConfig::new();
        install(engine.as_ref(), &config.lock_table).await.unwrap();
        (engine, config)
    }

    #[tokio::test]
    async fn second_acquire_fails_fast() {
        let (engine, config) = setup().await;
        let held = MigrationLock::acquire(engine.clone(), &config).await.unwrap();

        let err = MigrationLock::acquire(engine.clone(), &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MigrationInProgress);

        held.release().await.unwrap();
        MigrationLock::acquire(engine, &config)
            .await
            .unwrap()
            .release()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let (engine, config) = setup().await;
        let short = config.clone().lock_lease(Duration::from_millis(1));
        let crashed = MigrationLock::acquire(engine.clone(), &short).await.unwrap();
        std::mem::forget(crashed);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lock = MigrationLock::acquire(engine.clone(), &config).await.unwrap();
        let record = inspect(engine.as_ref(), &config.lock_table).await.unwrap().unwrap();
        assert_eq!(record.owner, lock.owner());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn blocked_lock_survives_release() {
        let (engine, config) = setup().await;
        let lock = MigrationLock::acquire(engine.clone(), &config).await.unwrap();
        lock.block("2025_05_18_103615_create_sessions_table").await.unwrap();
        lock.release().await.unwrap();

        let err = MigrationLock::acquire(engine.clone(), &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RevertFailed);

        let cleared = MigrationLock::force_release(engine.as_ref(), &config.lock_table)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            cleared.blocked_by.as_deref(),
            Some("2025_05_18_103615_create_sessions_table")
        );
        assert!(MigrationLock::acquire(engine, &config).await.is_ok());
    }
}
