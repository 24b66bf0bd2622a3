//! Applies or reverts a single descriptor inside one transaction.
//!
//! The schema change and its ledger write commit together or not at all.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::{MigrationError, Result};
use crate::descriptor::{ChangeDescriptor, Down};
use crate::engine::{Engine, Transaction};
use crate::ledger::{LedgerEntry, LedgerStore};
use crate::schema::SchemaOperation;

#[derive(Clone)]
pub struct Executor {
    engine: Arc<dyn Engine>,
    ledger: LedgerStore,
}

impl Executor {
    pub fn new(engine: Arc<dyn Engine>, ledger: LedgerStore) -> Self {
        Self { engine, ledger }
    }

    /// Runs `up` and records the descriptor in `batch`.
    pub async fn apply(&self, descriptor: &ChangeDescriptor, batch: u64) -> Result<LedgerEntry> {
        let mut tx = self.engine.begin().await?;
        let result = self.apply_in(tx.as_mut(), descriptor, batch).await;
        match result {
            Ok(entry) => {
                tx.commit().await?;
                info!(descriptor_id = descriptor.id(), batch, "Applied");
                Ok(entry)
            }
            Err(e) => {
                abandon(tx, descriptor.id()).await;
                Err(e)
            }
        }
    }

    async fn apply_in(
        &self,
        tx: &mut dyn Transaction,
        descriptor: &ChangeDescriptor,
        batch: u64,
    ) -> Result<LedgerEntry> {
        if self.ledger.is_applied(tx, descriptor.id()).await? {
            return Err(MigrationError::DuplicateApplication {
                descriptor_id: descriptor.id().to_string(),
            });
        }
        for operation in descriptor.up() {
            debug!(descriptor_id = descriptor.id(), %operation, "Executing");
            tx.execute(operation).await?;
        }
        self.ledger.record_applied(tx, descriptor.id(), batch).await
    }

    /// Runs `down` and removes the descriptor from the ledger.
    pub async fn revert(&self, descriptor: &ChangeDescriptor) -> Result<()> {
        let Down::Reversible(operations) = descriptor.down() else {
            return Err(MigrationError::IrreversibleChange {
                descriptor_id: descriptor.id().to_string(),
            });
        };

        let mut tx = self.engine.begin().await?;
        let result = self.revert_in(tx.as_mut(), descriptor, operations).await;
        match result {
            Ok(()) => {
                tx.commit().await?;
                info!(descriptor_id = descriptor.id(), "Reverted");
                Ok(())
            }
            Err(e) => {
                abandon(tx, descriptor.id()).await;
                Err(e)
            }
        }
    }

    async fn revert_in(
        &self,
        tx: &mut dyn Transaction,
        descriptor: &ChangeDescriptor,
        operations: &[SchemaOperation],
    ) -> Result<()> {
        if !self.ledger.is_applied(tx, descriptor.id()).await? {
            return Err(MigrationError::NotApplied {
                descriptor_id: descriptor.id().to_string(),
            });
        }
        for operation in operations {
            debug!(descriptor_id = descriptor.id(), %operation, "Executing");
            tx.execute(operation).await?;
        }
        self.ledger.record_reverted(tx, descriptor.id()).await
    }
}

async fn abandon(tx: Box<dyn Transaction>, descriptor_id: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(descriptor_id, error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorKind, TableSchema};
    use crate::engine::MemoryEngine;
    use crate::schema::Blueprint;

    async fn setup() -> (MemoryEngine, Executor, LedgerStore) {
        let engine = MemoryEngine::new();
        let ledger = LedgerStore::new("migrations", "migrations_lock");
        ledger.install(&engine).await.unwrap();
        let executor = Executor::new(Arc::new(engine.clone()), ledger.clone());
        (engine, executor, ledger)
    }

    fn create_events() -> ChangeDescriptor {
        ChangeDescriptor::create_table(
            "2025_05_18_000001_create_events_table",
            Blueprint::create("events").id("id").string("name", 255),
        )
    }

    #[tokio::test]
    async fn apply_then_revert_restores_schema() {
        let (engine, executor, ledger) = setup().await;
        let before = engine.catalog().await;

        executor.apply(&create_events(), 1).await.unwrap();
        assert!(engine.catalog().await.table_exists("events"));

        executor.revert(&create_events()).await.unwrap();
        assert_eq!(engine.catalog().await, before);
        let tx = engine.begin().await.unwrap();
        assert!(ledger.list_applied(tx.as_ref()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_apply_is_duplicate() {
        let (_engine, executor, _ledger) = setup().await;
        executor.apply(&create_events(), 1).await.unwrap();
        let err = executor.apply(&create_events(), 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateApplication);
    }

    #[tokio::test]
    async fn irreversible_revert_touches_nothing() {
        let (engine, executor, _ledger) = setup().await;
        executor.apply(&create_events(), 1).await.unwrap();
        let drop_events = ChangeDescriptor::irreversible(
            "2025_06_01_000000_drop_events",
            vec![SchemaOperation::drop_table("events")],
        );
        executor.apply(&drop_events, 2).await.unwrap();
        let version = engine.version().await;

        let err = executor.revert(&drop_events).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IrreversibleChange);
        assert_eq!(engine.version().await, version);
    }

    #[tokio::test]
    async fn failing_operation_rolls_back_earlier_ones() {
        let (engine, executor, _ledger) = setup().await;
        let mut up = Blueprint::create("rooms").id("id").into_operations();
        up.push(SchemaOperation::drop_table("missing"));
        let broken = ChangeDescriptor::new(
            "2025_06_01_000000_broken",
            up,
            vec![
                SchemaOperation::drop_table_if_exists("rooms"),
                SchemaOperation::CreateTable(TableSchema::new("missing", vec![])),
            ],
        );
        let err = executor.apply(&broken, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaConflict);
        assert!(!engine.catalog().await.table_exists("rooms"));
    }

    #[tokio::test]
    async fn reverting_unapplied_is_not_applied() {
        let (_engine, executor, _ledger) = setup().await;
        let err = executor.revert(&create_events()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotApplied);
    }
}
