//! The database capability migrations run against.
//!
//! The runner never talks to a concrete database; it opens [`Transaction`]s through an
//! [`Engine`] and passes them explicitly to the ledger and executor. [`MemoryEngine`] is
//! the bundled implementation.

pub mod catalog;
pub mod memory;
pub mod persistence;

use async_trait::async_trait;

use crate::core::{EngineResult, Row, TableSchema, Value};
use crate::schema::SchemaOperation;

pub use catalog::Catalog;
pub use memory::MemoryEngine;
pub use persistence::SnapshotStore;

#[async_trait]
pub trait Engine: Send + Sync {
    /// Opens a transaction. Dropping it without [`Transaction::commit`] discards its writes.
    async fn begin(&self) -> EngineResult<Box<dyn Transaction>>;
}

#[async_trait]
pub trait Transaction: Send + Sync {
    async fn execute(&mut self, operation: &SchemaOperation) -> EngineResult<()>;

    async fn describe(&self, table: &str) -> EngineResult<Option<TableSchema>>;

    async fn table_names(&self) -> EngineResult<Vec<String>>;

    async fn insert(&mut self, table: &str, row: Row) -> EngineResult<()>;

    /// Deletes rows whose `column` equals `value`; returns how many were removed.
    async fn delete_where(&mut self, table: &str, column: &str, value: &Value) -> EngineResult<usize>;

    async fn scan(&self, table: &str) -> EngineResult<Vec<Row>>;

    async fn commit(self: Box<Self>) -> EngineResult<()>;

    async fn rollback(self: Box<Self>) -> EngineResult<()>;
}
