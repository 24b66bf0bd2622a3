//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rustmigrate::core::{EngineError, EngineResult, Row, TableSchema, Value};
use rustmigrate::engine::{Engine, MemoryEngine, Transaction};
use rustmigrate::schema::{Blueprint, SchemaOperation};
use rustmigrate::{CancelToken, ChangeDescriptor, DescriptorSet, Migrator, MigratorConfig};

pub const EVENTS_ID: &str = "2025_05_18_000001_create_events_table";
pub const SESSIONS_ID: &str = "2025_05_18_103615_create_sessions_table";

/// Failure injected into a [`FaultyEngine`].
#[derive(Debug, Clone)]
pub enum Fault {
    /// Inserts into this table fail.
    InsertInto(String),
    /// Schema operations whose SQL mentions this text fail.
    ExecuteMentioning(String),
    /// Every commit that wrote something fails.
    Commit,
    /// Cancels the token when a row is inserted into this table.
    CancelOnInsertInto(String, CancelToken),
    /// Once a transaction that inserted into this table commits, the given owner takes
    /// the migration lock. Fires once.
    StealLockAfterInsertInto(String, String),
}

/// [`MemoryEngine`] wrapper that fails on demand.
#[derive(Clone, Default)]
pub struct FaultyEngine {
    inner: MemoryEngine,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl FaultyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryEngine {
        &self.inner
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().unwrap().push(fault);
    }

    pub fn clear(&self) {
        self.faults.lock().unwrap().clear();
    }
}

#[async_trait]
impl Engine for FaultyEngine {
    async fn begin(&self) -> EngineResult<Box<dyn Transaction>> {
        Ok(Box::new(FaultyTransaction {
            inner: self.inner.begin().await?,
            engine: self.inner.clone(),
            faults: Arc::clone(&self.faults),
            wrote: false,
            inserted: Vec::new(),
        }))
    }
}

struct FaultyTransaction {
    inner: Box<dyn Transaction>,
    engine: MemoryEngine,
    faults: Arc<Mutex<Vec<Fault>>>,
    wrote: bool,
    inserted: Vec<String>,
}

impl FaultyTransaction {
    fn faults(&self) -> Vec<Fault> {
        self.faults.lock().unwrap().clone()
    }

    fn take_steal(&self) -> Option<String> {
        let mut faults = self.faults.lock().unwrap();
        let pos = faults.iter().position(|fault| {
            matches!(fault, Fault::StealLockAfterInsertInto(table, _) if self.inserted.contains(table))
        })?;
        match faults.remove(pos) {
            Fault::StealLockAfterInsertInto(_, owner) => Some(owner),
            _ => None,
        }
    }
}

#[async_trait]
impl Transaction for FaultyTransaction {
    async fn execute(&mut self, operation: &SchemaOperation) -> EngineResult<()> {
        let sql = operation.to_string();
        for fault in self.faults() {
            if let Fault::ExecuteMentioning(text) = fault {
                if sql.contains(&text) {
                    return Err(EngineError::SchemaConflict(format!("injected failure: {}", sql)));
                }
            }
        }
        self.wrote = true;
        self.inner.execute(operation).await
    }

    async fn describe(&self, table: &str) -> EngineResult<Option<TableSchema>> {
        self.inner.describe(table).await
    }

    async fn table_names(&self) -> EngineResult<Vec<String>> {
        self.inner.table_names().await
    }

    async fn insert(&mut self, table: &str, row: Row) -> EngineResult<()> {
        for fault in self.faults() {
            match fault {
                Fault::InsertInto(name) if name == table => {
                    return Err(EngineError::Storage(format!("injected failure writing '{}'", table)));
                }
                Fault::CancelOnInsertInto(name, token) if name == table => token.cancel(),
                _ => {}
            }
        }
        self.wrote = true;
        self.inserted.push(table.to_string());
        self.inner.insert(table, row).await
    }

    async fn delete_where(&mut self, table: &str, column: &str, value: &Value) -> EngineResult<usize> {
        self.wrote = true;
        self.inner.delete_where(table, column, value).await
    }

    async fn scan(&self, table: &str) -> EngineResult<Vec<Row>> {
        self.inner.scan(table).await
    }

    async fn commit(self: Box<Self>) -> EngineResult<()> {
        if self.wrote && self.faults().iter().any(|f| matches!(f, Fault::Commit)) {
            return Err(EngineError::TransactionAborted("injected commit failure".into()));
        }
        let steal = self.take_steal();
        let FaultyTransaction { inner, engine, .. } = *self;
        inner.commit().await?;
        if let Some(owner) = steal {
            take_over_lock(&engine, &owner).await;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        self.inner.rollback().await
    }
}

/// The bundled `events` and `event_sessions` migrations.
pub fn event_descriptors() -> DescriptorSet {
    rustmigrate::migrations::descriptors().unwrap()
}

pub fn create_table(id: &str, table: &str) -> ChangeDescriptor {
    ChangeDescriptor::create_table(id, Blueprint::create(table).id("id"))
}

pub fn migrator_on<E: Engine + Clone + 'static>(engine: &E, descriptors: DescriptorSet) -> Migrator {
    Migrator::new(Arc::new(engine.clone()), descriptors, MigratorConfig::new())
}

pub async fn ledger_ids(engine: &dyn Engine) -> Vec<String> {
    let tx = engine.begin().await.unwrap();
    let ids = tx
        .scan("migrations")
        .await
        .unwrap()
        .into_iter()
        .map(|row| row[0].as_str().unwrap().to_string())
        .collect();
    tx.rollback().await.unwrap();
    ids
}

/// Replaces whatever lock row exists with one held by `owner` for five minutes.
pub async fn take_over_lock(engine: &dyn Engine, owner: &str) {
    let mut tx = engine.begin().await.unwrap();
    tx.delete_where("migrations_lock", "lock_key", &Value::from("migrate"))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    plant_lock(engine, owner, Duration::minutes(5)).await;
}

/// Writes a lock row as a crashed or concurrent run would have left it.
pub async fn plant_lock(engine: &dyn Engine, owner: &str, expires_in: Duration) {
    let now = Utc::now();
    let mut tx = engine.begin().await.unwrap();
    tx.insert(
        "migrations_lock",
        vec![
            Value::from("migrate"),
            Value::from(owner),
            Value::Timestamp(now - Duration::minutes(10)),
            Value::Timestamp(now + expires_in),
            Value::Null,
        ],
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
}
