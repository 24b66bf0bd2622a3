use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::catalog::Catalog;
use super::persistence::SnapshotStore;
use super::{Engine, Transaction};
use crate::core::{EngineError, EngineResult, Row, TableSchema, Value};
use crate::schema::SchemaOperation;

const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

struct Shared {
    catalog: Catalog,
    /// Bumped by every commit that wrote something.
    version: u64,
    store: Option<SnapshotStore>,
}

impl Shared {
    /// Picks up commits made by other processes sharing the snapshot file.
    fn reload_if_newer(&mut self) -> EngineResult<()> {
        if let Some(store) = &self.store {
            if let Some((version, catalog)) = store.load()? {
                if version > self.version {
                    debug!("Reloading snapshot: version {} -> {}", self.version, version);
                    self.version = version;
                    self.catalog = catalog;
                }
            }
        }
        Ok(())
    }
}

/// In-process engine with snapshot-isolated transactions.
///
/// `begin` takes an O(1) copy of the committed catalog. `commit` publishes the copy only
/// if nothing else committed in between (first committer wins); otherwise it fails with
/// [`EngineError::TransactionAborted`]. Read-only transactions never conflict.
///
/// Clones share the same database.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Mutex<Shared>>,
    commit_timeout: Duration,
}

impl MemoryEngine {
    /// Volatile database, gone when the last clone is dropped.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                catalog: Catalog::new(),
                version: 0,
                store: None,
            })),
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        }
    }

    /// Durable database stored in `data_dir`, created if missing.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> EngineResult<Self> {
        let store = SnapshotStore::new(data_dir)?;
        let (version, catalog) = store.load()?.unwrap_or_default();
        debug!(
            "Opened {} at version {}",
            store.snapshot_path().display(),
            version
        );
        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                catalog,
                version,
                store: Some(store),
            })),
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        })
    }

    /// How long a commit waits for another process's commit to finish.
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    /// Copy of the committed catalog.
    pub async fn catalog(&self) -> Catalog {
        self.shared.lock().await.catalog.clone()
    }

    pub async fn version(&self) -> u64 {
        self.shared.lock().await.version
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn begin(&self) -> EngineResult<Box<dyn Transaction>> {
        let mut shared = self.shared.lock().await;
        shared.reload_if_newer()?;
        Ok(Box::new(MemoryTransaction {
            id: Uuid::new_v4(),
            shared: Arc::clone(&self.shared),
            base_version: shared.version,
            working: shared.catalog.clone(),
            dirty: false,
            commit_timeout: self.commit_timeout,
        }))
    }
}

struct MemoryTransaction {
    id: Uuid,
    shared: Arc<Mutex<Shared>>,
    base_version: u64,
    working: Catalog,
    dirty: bool,
    commit_timeout: Duration,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn execute(&mut self, operation: &SchemaOperation) -> EngineResult<()> {
        // Statement-level atomicity: a failing multi-statement `Sql` leaves nothing behind.
        let mut next = self.working.clone();
        next.apply(operation)?;
        self.working = next;
        self.dirty = true;
        Ok(())
    }

    async fn describe(&self, table: &str) -> EngineResult<Option<TableSchema>> {
        Ok(self.working.get_schema(table).cloned())
    }

    async fn table_names(&self) -> EngineResult<Vec<String>> {
        Ok(self.working.table_names())
    }

    async fn insert(&mut self, table: &str, row: Row) -> EngineResult<()> {
        self.working.insert(table, row)?;
        self.dirty = true;
        Ok(())
    }

    async fn delete_where(&mut self, table: &str, column: &str, value: &Value) -> EngineResult<usize> {
        let mut next = self.working.clone();
        let deleted = next.delete_where(table, column, value)?;
        if deleted > 0 {
            self.working = next;
            self.dirty = true;
        }
        Ok(deleted)
    }

    async fn scan(&self, table: &str) -> EngineResult<Vec<Row>> {
        self.working.scan(table)
    }

    async fn commit(self: Box<Self>) -> EngineResult<()> {
        let this = *self;
        if !this.dirty {
            return Ok(());
        }

        let store = this.shared.lock().await.store.clone();
        let _guard = match &store {
            Some(store) => Some(store.lock_commits(this.commit_timeout).await?),
            None => None,
        };

        let mut shared = this.shared.lock().await;
        shared.reload_if_newer()?;
        if shared.version != this.base_version {
            return Err(EngineError::TransactionAborted(format!(
                "Transaction {} conflicts with a concurrent commit (started at version {}, now {})",
                this.id, this.base_version, shared.version
            )));
        }

        let next_version = shared.version + 1;
        if let Some(store) = &shared.store {
            store.save(&this.working, next_version)?;
        }
        shared.catalog = this.working;
        shared.version = next_version;
        debug!("Transaction {} committed version {}", this.id, next_version);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        debug!("Transaction {} rolled back", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Blueprint;
    use tempfile::TempDir;

    fn create_events() -> SchemaOperation {
        Blueprint::create("events")
            .id("id")
            .into_operations()
            .remove(0)
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let engine = MemoryEngine::new();
        let mut tx = engine.begin().await.unwrap();
        tx.execute(&create_events()).await.unwrap();
        assert!(tx.describe("events").await.unwrap().is_some());

        let other = engine.begin().await.unwrap();
        assert!(other.describe("events").await.unwrap().is_none());

        tx.rollback().await.unwrap();
        assert!(engine.catalog().await.table_names().is_empty());
    }

    #[tokio::test]
    async fn first_committer_wins() {
        let engine = MemoryEngine::new();
        let mut first = engine.begin().await.unwrap();
        let mut second = engine.begin().await.unwrap();
        first.execute(&create_events()).await.unwrap();
        second.execute(&create_events()).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, EngineError::TransactionAborted(_)));
        assert_eq!(engine.version().await, 1);
    }

    #[tokio::test]
    async fn read_only_commit_does_not_bump_version() {
        let engine = MemoryEngine::new();
        let tx = engine.begin().await.unwrap();
        tx.table_names().await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(engine.version().await, 0);
    }

    #[tokio::test]
    async fn durable_engine_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let engine = MemoryEngine::open(dir.path()).unwrap();
            let mut tx = engine.begin().await.unwrap();
            tx.execute(&create_events()).await.unwrap();
            tx.commit().await.unwrap();
        }

        let reopened = MemoryEngine::open(dir.path()).unwrap();
        assert_eq!(reopened.version().await, 1);
        assert!(reopened.catalog().await.table_exists("events"));
    }

    #[tokio::test]
    async fn separate_handles_on_one_directory_see_each_other() {
        let dir = TempDir::new().unwrap();
        let a = MemoryEngine::open(dir.path()).unwrap();
        let b = MemoryEngine::open(dir.path()).unwrap();

        let mut stale = b.begin().await.unwrap();

        let mut tx = a.begin().await.unwrap();
        tx.execute(&create_events()).await.unwrap();
        tx.commit().await.unwrap();

        let fresh = b.begin().await.unwrap();
        assert!(fresh.describe("events").await.unwrap().is_some());

        stale.execute(&create_events()).await.unwrap();
        let err = stale.commit().await.unwrap_err();
        assert!(matches!(err, EngineError::TransactionAborted(_)));
    }
}
