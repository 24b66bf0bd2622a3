//! Migration runs.
//!
//! A [`Migrator`] serializes runs through the advisory lock, asks the planner what to do,
//! and hands descriptors one at a time to the [`Executor`]. A descriptor failure ends the
//! run but is not an `Err`: it is reported in [`BatchResult::failure`] together with the
//! descriptors that committed before it. `Err` is reserved for runs that could not start
//! (lock held, ledger unreadable, plan refused).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{Instrument, Level, event, info_span};

use crate::config::{FailurePolicy, MigratorConfig};
use crate::core::{MigrationError, Result};
use crate::descriptor::{ChangeDescriptor, DescriptorSet, Down};
use crate::engine::Engine;
use crate::executor::Executor;
use crate::ledger::{LedgerEntry, LedgerStore};
use crate::lock::{LockRecord, MigrationLock};
use crate::planner::{self, BatchPlan, StatusReport};

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation, checked between descriptors.
///
/// A descriptor already executing finishes (commits or rolls back) before the run stops.
/// A cancellation applies to the run in progress, or to the next one if none is; the
/// [`Migrator`] clears it when that run finishes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Lifecycle of one descriptor within a run.
///
/// `Pending -> Applying -> Applied | Failed` going up,
/// `Applied -> Reverting -> Pending | RevertFailed` going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DescriptorState {
    Pending,
    Applying,
    Applied,
    Failed,
    Reverting,
    RevertFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Apply,
    Revert,
    /// Reverting earlier descriptors of a failed run under [`FailurePolicy::CompensateBatch`].
    Compensate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// The error that ended a run, with the descriptor it happened on.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub descriptor_id: String,
    pub batch: u64,
    pub phase: Phase,
    pub error: MigrationError,
}

/// Final state of one planned descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub descriptor_id: String,
    pub batch: u64,
    pub state: DescriptorState,
}

/// One statement list per descriptor, for `--pretend`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub descriptor_id: String,
    pub batch: u64,
    pub statements: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub direction: Direction,
    /// Every planned descriptor in execution order with its final state.
    pub steps: Vec<StepOutcome>,
    /// Ids that were applied (up) or reverted (down), in execution order.
    pub completed: Vec<String>,
    pub failure: Option<StepFailure>,
    /// Ids reverted by [`FailurePolicy::CompensateBatch`], newest first.
    pub compensated: Vec<String>,
    pub compensation_failure: Option<StepFailure>,
    pub cancelled: bool,
    /// Filled instead of executing when the run was a pretend run.
    pub planned: Vec<PlannedStep>,
}

impl BatchResult {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            steps: Vec::new(),
            completed: Vec::new(),
            failure: None,
            compensated: Vec::new(),
            compensation_failure: None,
            cancelled: false,
            planned: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.compensation_failure.is_none() && !self.cancelled
    }

    /// Nothing was planned.
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty() && self.planned.is_empty()
    }

    /// Distinct batches of completed descriptors, in execution order.
    pub fn batches(&self) -> Vec<u64> {
        let mut batches: Vec<u64> = Vec::new();
        for step in &self.steps {
            if self.completed.contains(&step.descriptor_id) && !batches.contains(&step.batch) {
                batches.push(step.batch);
            }
        }
        batches
    }

    pub fn state_of(&self, descriptor_id: &str) -> Option<DescriptorState> {
        self.steps
            .iter()
            .find(|step| step.descriptor_id == descriptor_id)
            .map(|step| step.state)
    }

    fn fail(&mut self, index: usize, phase: Phase, error: MigrationError) {
        let step = &self.steps[index];
        self.failure = Some(StepFailure {
            descriptor_id: step.descriptor_id.clone(),
            batch: step.batch,
            phase,
            error,
        });
    }
}

#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub down: BatchResult,
    /// `None` when the rollback half did not succeed.
    pub up: Option<BatchResult>,
}

impl RefreshResult {
    pub fn is_success(&self) -> bool {
        self.down.is_success() && self.up.as_ref().is_some_and(BatchResult::is_success)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpOptions {
    /// Give every descriptor its own batch.
    pub step: bool,
    /// Report what would run without executing anything.
    pub pretend: bool,
}

// ============================================================================
// Migrator
// ============================================================================

pub struct Migrator {
    engine: Arc<dyn Engine>,
    descriptors: DescriptorSet,
    config: MigratorConfig,
    ledger: LedgerStore,
    executor: Executor,
    cancel: CancelToken,
}

impl Migrator {
    pub fn new(engine: Arc<dyn Engine>, descriptors: DescriptorSet, config: MigratorConfig) -> Self {
        let ledger = LedgerStore::from_config(&config);
        let executor = Executor::new(Arc::clone(&engine), ledger.clone());
        Self {
            engine,
            descriptors,
            config,
            ledger,
            executor,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    pub fn descriptors(&self) -> &DescriptorSet {
        &self.descriptors
    }

    /// Creates the ledger and lock tables if missing.
    pub async fn install(&self) -> Result<bool> {
        self.ledger.install(self.engine.as_ref()).await
    }

    /// Applied and pending descriptors. Takes no lock and writes nothing.
    pub async fn status(&self) -> Result<StatusReport> {
        let (applied, _) = self.read_ledger().await?;
        Ok(planner::status(&self.descriptors, &applied))
    }

    /// Lock record currently in the database, if any.
    pub async fn lock_status(&self) -> Result<Option<LockRecord>> {
        crate::lock::inspect(self.engine.as_ref(), &self.config.lock_table).await
    }

    /// Clears the migration lock, including a block left by a failed revert.
    ///
    /// Run only after repairing the schema by hand.
    pub async fn resolve(&self) -> Result<Option<LockRecord>> {
        let cleared = MigrationLock::force_release(self.engine.as_ref(), &self.config.lock_table).await?;
        if let Some(record) = &cleared {
            event!(
                Level::WARN,
                owner = %record.owner,
                blocked_by = ?record.blocked_by,
                "Migration lock cleared by operator"
            );
        }
        Ok(cleared)
    }

    pub async fn migrate_up(&self) -> Result<BatchResult> {
        self.migrate_up_with(UpOptions::default()).await
    }

    /// Applies every pending descriptor in id order.
    pub async fn migrate_up_with(&self, options: UpOptions) -> Result<BatchResult> {
        if options.pretend {
            let mut result = BatchResult::new(Direction::Up);
            result.planned = self.pretend_up(options.step).await?;
            return Ok(result);
        }

        self.install().await?;
        let lock = MigrationLock::acquire(Arc::clone(&self.engine), &self.config).await?;
        let result = self.run_up(&lock, options.step).await;
        self.finish(lock, result).await
    }

    /// Reverts the newest `steps` batches.
    pub async fn migrate_down(&self, steps: usize) -> Result<BatchResult> {
        self.install().await?;
        let lock = MigrationLock::acquire(Arc::clone(&self.engine), &self.config).await?;
        let result = self.run_down(&lock, steps).await;
        self.finish(lock, result).await
    }

    /// Reverts every batch.
    pub async fn reset(&self) -> Result<BatchResult> {
        self.migrate_down(usize::MAX).await
    }

    /// Reverts every batch, then applies everything again, under a single lock.
    pub async fn refresh(&self) -> Result<RefreshResult> {
        self.install().await?;
        let lock = MigrationLock::acquire(Arc::clone(&self.engine), &self.config).await?;
        let result = self.run_refresh(&lock).await;
        self.finish(lock, result).await
    }

    async fn run_refresh(&self, lock: &MigrationLock) -> Result<RefreshResult> {
        let down = self.run_down(lock, usize::MAX).await?;
        if !down.is_success() {
            return Ok(RefreshResult { down, up: None });
        }
        let up = self.run_up(lock, false).await?;
        Ok(RefreshResult { down, up: Some(up) })
    }

    /// Statements `migrate_up` would run.
    pub async fn pretend_up(&self, step: bool) -> Result<Vec<PlannedStep>> {
        let (applied, next_batch) = self.read_ledger().await?;
        let applied_ids: Vec<&str> = applied.iter().map(|e| e.descriptor_id.as_str()).collect();
        let plan = planner::plan_up(&self.descriptors, &applied_ids)?;
        Ok(plan
            .iter()
            .enumerate()
            .map(|(i, descriptor)| PlannedStep {
                descriptor_id: descriptor.id().to_string(),
                batch: batch_for(next_batch, i, step),
                statements: descriptor.up().iter().map(ToString::to_string).collect(),
            })
            .collect())
    }

    /// Statements `migrate_down(steps)` would run.
    pub async fn pretend_down(&self, steps: usize) -> Result<Vec<PlannedStep>> {
        let (applied, _) = self.read_ledger().await?;
        let plan = planner::plan_rollback(&self.descriptors, &applied, steps)?;
        Ok(plan
            .iter()
            .flat_map(|batch| {
                batch.descriptors.iter().map(move |descriptor| PlannedStep {
                    descriptor_id: descriptor.id().to_string(),
                    batch: batch.batch,
                    statements: match descriptor.down() {
                        Down::Reversible(ops) => ops.iter().map(ToString::to_string).collect(),
                        Down::Irreversible => Vec::new(),
                    },
                })
            })
            .collect())
    }

    async fn read_ledger(&self) -> Result<(Vec<LedgerEntry>, u64)> {
        let tx = self.engine.begin().await?;
        let applied = self.ledger.list_applied(tx.as_ref()).await?;
        let next_batch = self.ledger.next_batch_number(tx.as_ref()).await?;
        tx.rollback().await?;
        Ok((applied, next_batch))
    }

    // ========================================================================
    // Up
    // ========================================================================

    async fn run_up(&self, lock: &MigrationLock, step: bool) -> Result<BatchResult> {
        let (applied, next_batch) = self.read_ledger().await?;
        let applied_ids: Vec<&str> = applied.iter().map(|e| e.descriptor_id.as_str()).collect();
        let plan = planner::plan_up(&self.descriptors, &applied_ids)?;

        let span = info_span!("migrate_up", batch = next_batch, pending = plan.len());
        self.apply_plan(lock, &plan, next_batch, step)
            .instrument(span)
            .await
    }

    async fn apply_plan(
        &self,
        lock: &MigrationLock,
        plan: &[&ChangeDescriptor],
        next_batch: u64,
        step: bool,
    ) -> Result<BatchResult> {
        let mut result = BatchResult::new(Direction::Up);
        let mut lock_lost = false;
        result.steps = plan
            .iter()
            .enumerate()
            .map(|(i, descriptor)| StepOutcome {
                descriptor_id: descriptor.id().to_string(),
                batch: batch_for(next_batch, i, step),
                state: DescriptorState::Pending,
            })
            .collect();

        if plan.is_empty() {
            event!(Level::INFO, "Nothing to migrate");
            return Ok(result);
        }

        for (i, descriptor) in plan.iter().enumerate() {
            if self.cancel.is_cancelled() {
                event!(Level::WARN, next = descriptor.id(), "Migration cancelled");
                result.cancelled = true;
                break;
            }
            if i > 0 {
                if let Err(error) = lock.renew().await {
                    lock_lost = true;
                    result.fail(i, Phase::Apply, error);
                    break;
                }
            }

            let batch = result.steps[i].batch;
            result.steps[i].state = DescriptorState::Applying;
            event!(Level::INFO, descriptor_id = descriptor.id(), batch, "Migrating");

            match self.executor.apply(descriptor, batch).await {
                Ok(_) => {
                    result.steps[i].state = DescriptorState::Applied;
                    result.completed.push(descriptor.id().to_string());
                }
                Err(error) => {
                    event!(
                        Level::ERROR,
                        descriptor_id = descriptor.id(),
                        kind = %error.kind(),
                        error = %error,
                        "Migration failed"
                    );
                    result.steps[i].state = DescriptorState::Failed;
                    result.fail(i, Phase::Apply, error);
                    break;
                }
            }
        }

        if result.failure.is_some()
            && !result.completed.is_empty()
            && self.config.failure_policy == FailurePolicy::CompensateBatch
        {
            if lock_lost {
                // Another run owns the schema now.
                event!(
                    Level::WARN,
                    count = result.completed.len(),
                    "Migration lock lost; not compensating"
                );
            } else {
                self.compensate(lock, plan, &mut result).await;
            }
        }
        Ok(result)
    }

    /// Reverts descriptors applied earlier in this run, newest first.
    async fn compensate(&self, lock: &MigrationLock, plan: &[&ChangeDescriptor], result: &mut BatchResult) {
        event!(
            Level::WARN,
            count = result.completed.len(),
            "Compensating applied migrations"
        );
        for i in (0..plan.len()).rev() {
            if result.steps[i].state != DescriptorState::Applied {
                continue;
            }
            let descriptor = plan[i];
            let batch = result.steps[i].batch;
            if let Err(error) = lock.renew().await {
                event!(Level::WARN, error = %error, "Migration lock lost during compensation");
                result.compensation_failure = Some(StepFailure {
                    descriptor_id: descriptor.id().to_string(),
                    batch,
                    phase: Phase::Compensate,
                    error,
                });
                break;
            }
            result.steps[i].state = DescriptorState::Reverting;

            match self.executor.revert(descriptor).await {
                Ok(()) => {
                    result.steps[i].state = DescriptorState::Pending;
                    result.compensated.push(descriptor.id().to_string());
                }
                Err(error @ MigrationError::IrreversibleChange { .. }) => {
                    // Schema is intact; older descriptors stay applied to keep order.
                    result.steps[i].state = DescriptorState::Applied;
                    result.compensation_failure = Some(StepFailure {
                        descriptor_id: descriptor.id().to_string(),
                        batch,
                        phase: Phase::Compensate,
                        error,
                    });
                    break;
                }
                Err(error) => {
                    result.steps[i].state = DescriptorState::RevertFailed;
                    let error = self.block_after_failed_revert(lock, descriptor.id(), error).await;
                    result.compensation_failure = Some(StepFailure {
                        descriptor_id: descriptor.id().to_string(),
                        batch,
                        phase: Phase::Compensate,
                        error,
                    });
                    break;
                }
            }
        }
    }

    // ========================================================================
    // Down
    // ========================================================================

    async fn run_down(&self, lock: &MigrationLock, steps: usize) -> Result<BatchResult> {
        let (applied, _) = self.read_ledger().await?;
        let plan = planner::plan_rollback(&self.descriptors, &applied, steps)?;

        let span = info_span!("migrate_down", batches = plan.len());
        self.revert_plan(lock, &plan).instrument(span).await
    }

    async fn revert_plan(&self, lock: &MigrationLock, plan: &[BatchPlan<'_>]) -> Result<BatchResult> {
        let mut result = BatchResult::new(Direction::Down);
        let descriptors: Vec<(u64, &ChangeDescriptor)> = plan
            .iter()
            .flat_map(|batch| batch.descriptors.iter().map(move |d| (batch.batch, *d)))
            .collect();
        result.steps = descriptors
            .iter()
            .map(|(batch, descriptor)| StepOutcome {
                descriptor_id: descriptor.id().to_string(),
                batch: *batch,
                state: DescriptorState::Applied,
            })
            .collect();

        if descriptors.is_empty() {
            event!(Level::INFO, "Nothing to roll back");
            return Ok(result);
        }

        for (i, (batch, descriptor)) in descriptors.iter().enumerate() {
            if self.cancel.is_cancelled() {
                event!(Level::WARN, next = descriptor.id(), "Rollback cancelled");
                result.cancelled = true;
                break;
            }
            if i > 0 {
                if let Err(error) = lock.renew().await {
                    result.fail(i, Phase::Revert, error);
                    break;
                }
            }

            result.steps[i].state = DescriptorState::Reverting;
            event!(Level::INFO, descriptor_id = descriptor.id(), batch = *batch, "Rolling back");

            match self.executor.revert(descriptor).await {
                Ok(()) => {
                    result.steps[i].state = DescriptorState::Pending;
                    result.completed.push(descriptor.id().to_string());
                }
                Err(error) => {
                    result.steps[i].state = DescriptorState::RevertFailed;
                    let error = self.block_after_failed_revert(lock, descriptor.id(), error).await;
                    result.fail(i, Phase::Revert, error);
                    break;
                }
            }
        }
        Ok(result)
    }

    /// Turns a revert error into `RevertFailed` and blocks the lock so that no further
    /// run starts until an operator resolves it.
    async fn block_after_failed_revert(
        &self,
        lock: &MigrationLock,
        descriptor_id: &str,
        error: MigrationError,
    ) -> MigrationError {
        event!(
            Level::ERROR,
            descriptor_id,
            kind = %error.kind(),
            error = %error,
            "Revert failed; manual intervention required"
        );
        if let Err(e) = lock.block(descriptor_id).await {
            event!(Level::ERROR, error = %e, "Failed to block migration lock");
        }
        MigrationError::RevertFailed {
            descriptor_id: descriptor_id.to_string(),
            reason: format!("{}: {}", error.kind(), error),
        }
    }

    /// Releases the lock on every exit path; a release failure only costs the lease.
    async fn finish<T>(&self, lock: MigrationLock, result: Result<T>) -> Result<T> {
        self.cancel.reset();
        if let Err(e) = lock.release().await {
            event!(Level::WARN, error = %e, "Failed to release migration lock");
        }
        result
    }
}

fn batch_for(next_batch: u64, index: usize, step: bool) -> u64 {
    if step { next_batch + index as u64 } else { next_batch }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::schema::Blueprint;

    fn migrator(engine: &MemoryEngine) -> Migrator {
        let descriptors = DescriptorSet::new([
            ChangeDescriptor::create_table("2025_01_01_000001_a", Blueprint::create("a").id("id")),
            ChangeDescriptor::create_table("2025_01_01_000002_b", Blueprint::create("b").id("id")),
        ])
        .unwrap();
        Migrator::new(Arc::new(engine.clone()), descriptors, MigratorConfig::new())
    }

    #[tokio::test]
    async fn step_gives_each_descriptor_its_own_batch() {
        let engine = MemoryEngine::new();
        let migrator = migrator(&engine);
        let result = migrator
            .migrate_up_with(UpOptions { step: true, pretend: false })
            .await
            .unwrap();
        assert_eq!(result.batches(), vec![1, 2]);

        let down = migrator.migrate_down(1).await.unwrap();
        assert_eq!(down.completed, vec!["2025_01_01_000002_b"]);
        assert!(engine.catalog().await.table_exists("a"));
    }

    #[tokio::test]
    async fn pretend_executes_nothing() {
        let engine = MemoryEngine::new();
        let migrator = migrator(&engine);
        let result = migrator
            .migrate_up_with(UpOptions { step: false, pretend: true })
            .await
            .unwrap();
        assert_eq!(result.planned.len(), 2);
        assert!(result.planned[0].statements[0].starts_with("CREATE TABLE a"));
        assert!(engine.catalog().await.table_names().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_descriptor() {
        let engine = MemoryEngine::new();
        let migrator = migrator(&engine);
        migrator.cancel_token().cancel();
        let result = migrator.migrate_up().await.unwrap();
        assert!(result.cancelled);
        assert!(result.completed.is_empty());
        assert_eq!(result.state_of("2025_01_01_000001_a"), Some(DescriptorState::Pending));
        assert!(migrator.lock_status().await.unwrap().is_none());

        let next = migrator.migrate_up().await.unwrap();
        assert!(!next.cancelled);
        assert_eq!(next.completed.len(), 2);
    }
}
