/// Executor atomicity tests
///
/// A descriptor's schema change and its ledger record commit together or not at all.
/// Run with: cargo test --test executor_tests

mod common;

use common::*;
use rustmigrate::executor::Executor;
use rustmigrate::{ErrorKind, LedgerStore};
use std::sync::Arc;

async fn executor_on(engine: &FaultyEngine) -> Executor {
    let ledger = LedgerStore::new("migrations", "migrations_lock");
    ledger.install(engine).await.unwrap();
    Executor::new(Arc::new(engine.clone()), ledger)
}

#[tokio::test]
async fn test_ledger_write_failure_rolls_back_schema_change() {
    let engine = FaultyEngine::new();
    let executor = executor_on(&engine).await;
    let events = event_descriptors().get(EVENTS_ID).cloned().unwrap();

    engine.inject(Fault::InsertInto("migrations".into()));
    let err = executor.apply(&events, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(!engine.inner().catalog().await.table_exists("events"));
    assert!(ledger_ids(&engine).await.is_empty());

    engine.clear();
    executor.apply(&events, 1).await.unwrap();
    assert!(engine.inner().catalog().await.table_exists("events"));
    assert_eq!(ledger_ids(&engine).await, vec![EVENTS_ID]);
}

#[tokio::test]
async fn test_commit_failure_leaves_nothing_behind() {
    let engine = FaultyEngine::new();
    let executor = executor_on(&engine).await;
    let events = event_descriptors().get(EVENTS_ID).cloned().unwrap();

    engine.inject(Fault::Commit);
    let err = executor.apply(&events, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionAborted);
    assert!(!engine.inner().catalog().await.table_exists("events"));
    assert!(ledger_ids(&engine).await.is_empty());
}

#[tokio::test]
async fn test_revert_failure_keeps_ledger_entry() {
    let engine = FaultyEngine::new();
    let executor = executor_on(&engine).await;
    let descriptors = event_descriptors();
    let events = descriptors.get(EVENTS_ID).unwrap();
    let sessions = descriptors.get(SESSIONS_ID).unwrap();
    executor.apply(events, 1).await.unwrap();
    executor.apply(sessions, 1).await.unwrap();

    // Dropping `events` first violates the sessions foreign key.
    let err = executor.revert(events).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert_eq!(ledger_ids(&engine).await.len(), 2);
    assert!(engine.inner().catalog().await.table_exists("events"));

    executor.revert(sessions).await.unwrap();
    executor.revert(events).await.unwrap();
    assert!(ledger_ids(&engine).await.is_empty());
}
