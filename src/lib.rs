// ============================================================================
// rustmigrate Library
// ============================================================================

//! Versioned schema migrations.
//!
//! Migrations are [`ChangeDescriptor`]s: an id plus forward and reverse lists of
//! structured [`SchemaOperation`](schema::SchemaOperation)s. A [`Migrator`] applies
//! pending descriptors in id order, records each one in a ledger table inside the same
//! transaction as its schema change, and rolls back whole batches in reverse order.
//! Runs are serialized by a lease-based advisory lock stored next to the ledger.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use rustmigrate::{ChangeDescriptor, DescriptorSet, MemoryEngine, Migrator, MigratorConfig};
//! use rustmigrate::schema::Blueprint;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> rustmigrate::Result<()> {
//! let descriptors = DescriptorSet::new([ChangeDescriptor::create_table(
//!     "2025_05_18_000001_create_events_table",
//!     Blueprint::create("events").id("id").string("name", 255).timestamps(),
//! )])?;
//!
//! let engine = MemoryEngine::new();
//! let migrator = Migrator::new(Arc::new(engine.clone()), descriptors, MigratorConfig::new());
//!
//! let result = migrator.migrate_up().await?;
//! assert_eq!(result.completed, vec!["2025_05_18_000001_create_events_table"]);
//! assert!(engine.catalog().await.table_exists("events"));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod descriptor;
pub mod engine;
pub mod executor;
pub mod ledger;
pub mod lock;
pub mod migrations;
pub mod planner;
pub mod runner;
pub mod schema;

// Re-export main types for convenience
pub use config::{FailurePolicy, MigratorConfig};
pub use core::{ErrorKind, MigrationError, Result};
pub use descriptor::{ChangeDescriptor, DescriptorSet, Down};
pub use engine::{Engine, MemoryEngine, Transaction};
pub use ledger::{LedgerEntry, LedgerStore};
pub use runner::{BatchResult, CancelToken, DescriptorState, Migrator, StepFailure, UpOptions};
