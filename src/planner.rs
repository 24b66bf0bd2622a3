//! Pure planning: which descriptors to apply or revert, in which order.
//!
//! Nothing here touches the engine. Every plan is fully validated before it is returned,
//! so a refused plan never leaves a half-executed run behind.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{MigrationError, Result};
use crate::descriptor::{ChangeDescriptor, DescriptorSet};
use crate::ledger::LedgerEntry;

/// Descriptors absent from `applied_ids`, ascending by id.
pub fn plan_up<'a>(all: &'a DescriptorSet, applied_ids: &[&str]) -> Result<Vec<&'a ChangeDescriptor>> {
    for id in applied_ids {
        if !all.contains(id) {
            return Err(MigrationError::UnknownDescriptor {
                descriptor_id: id.to_string(),
            });
        }
    }
    let applied: HashSet<&str> = applied_ids.iter().copied().collect();
    Ok(all.iter().filter(|d| !applied.contains(d.id())).collect())
}

/// Descriptors recorded in `batch`, descending by id.
pub fn plan_down<'a>(
    all: &'a DescriptorSet,
    applied: &[LedgerEntry],
    batch: u64,
) -> Result<Vec<&'a ChangeDescriptor>> {
    let mut ids: Vec<&str> = applied
        .iter()
        .filter(|entry| entry.batch == batch)
        .map(|entry| entry.descriptor_id.as_str())
        .collect();
    ids.sort_unstable_by(|a, b| b.cmp(a));

    let mut plan = Vec::with_capacity(ids.len());
    for id in ids {
        let descriptor = all.get(id).ok_or_else(|| MigrationError::UnknownDescriptor {
            descriptor_id: id.to_string(),
        })?;
        if !descriptor.is_reversible() {
            return Err(MigrationError::IrreversibleChange {
                descriptor_id: id.to_string(),
            });
        }
        plan.push(descriptor);
    }
    Ok(plan)
}

/// One batch of a rollback plan.
#[derive(Debug, Clone)]
pub struct BatchPlan<'a> {
    pub batch: u64,
    pub descriptors: Vec<&'a ChangeDescriptor>,
}

/// Plans the newest `steps` batches, newest batch first.
pub fn plan_rollback<'a>(
    all: &'a DescriptorSet,
    applied: &[LedgerEntry],
    steps: usize,
) -> Result<Vec<BatchPlan<'a>>> {
    let mut batches: Vec<u64> = applied.iter().map(|e| e.batch).collect();
    batches.sort_unstable_by(|a, b| b.cmp(a));
    batches.dedup();
    batches.truncate(steps);

    batches
        .into_iter()
        .map(|batch| {
            Ok(BatchPlan {
                batch,
                descriptors: plan_down(all, applied, batch)?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DescriptorStatus {
    Applied {
        batch: u64,
        applied_at: DateTime<Utc>,
    },
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRow {
    pub descriptor_id: String,
    #[serde(flatten)]
    pub status: DescriptorStatus,
    pub reversible: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Every known descriptor, ascending by id.
    pub rows: Vec<StatusRow>,
    /// Ledger entries naming descriptors the application no longer ships.
    pub orphaned: Vec<LedgerEntry>,
}

impl StatusReport {
    pub fn pending(&self) -> impl Iterator<Item = &StatusRow> {
        self.rows
            .iter()
            .filter(|row| row.status == DescriptorStatus::Pending)
    }

    pub fn applied_count(&self) -> usize {
        self.rows.len() - self.pending().count()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.pending().next().is_none() && self.orphaned.is_empty()
    }
}

pub fn status(all: &DescriptorSet, applied: &[LedgerEntry]) -> StatusReport {
    let by_id: BTreeMap<&str, &LedgerEntry> = applied
        .iter()
        .map(|entry| (entry.descriptor_id.as_str(), entry))
        .collect();

    let rows = all
        .iter()
        .map(|descriptor| StatusRow {
            descriptor_id: descriptor.id().to_string(),
            status: match by_id.get(descriptor.id()) {
                Some(entry) => DescriptorStatus::Applied {
                    batch: entry.batch,
                    applied_at: entry.applied_at,
                },
                None => DescriptorStatus::Pending,
            },
            reversible: descriptor.is_reversible(),
        })
        .collect();

    let orphaned = applied
        .iter()
        .filter(|entry| !all.contains(&entry.descriptor_id))
        .cloned()
        .collect();

    StatusReport { rows, orphaned }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::schema::{Blueprint, SchemaOperation};

    fn set() -> DescriptorSet {
        DescriptorSet::new([
            ChangeDescriptor::create_table("2025_01_01_000001_a", Blueprint::create("a").id("id")),
            ChangeDescriptor::create_table("2025_01_01_000002_b", Blueprint::create("b").id("id")),
            ChangeDescriptor::create_table("2025_01_01_000003_c", Blueprint::create("c").id("id")),
            ChangeDescriptor::irreversible(
                "2025_01_01_000004_drop_c",
                vec![SchemaOperation::drop_table("c")],
            ),
        ])
        .unwrap()
    }

    fn entry(id: &str, batch: u64) -> LedgerEntry {
        LedgerEntry {
            descriptor_id: id.to_string(),
            applied_at: Utc::now(),
            batch,
        }
    }

    fn ids(plan: &[&ChangeDescriptor]) -> Vec<String> {
        plan.iter().map(|d| d.id().to_string()).collect()
    }

    #[test]
    fn up_is_the_set_difference_in_id_order() {
        let all = set();
        let plan = plan_up(&all, &["2025_01_01_000002_b"]).unwrap();
        assert_eq!(
            ids(&plan),
            vec!["2025_01_01_000001_a", "2025_01_01_000003_c", "2025_01_01_000004_drop_c"]
        );
    }

    #[test]
    fn unknown_ledger_id_blocks_planning() {
        let err = plan_up(&set(), &["2024_12_31_000000_gone"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownDescriptor);
    }

    #[test]
    fn down_is_descending_within_batch() {
        let all = set();
        let applied = vec![
            entry("2025_01_01_000001_a", 1),
            entry("2025_01_01_000002_b", 2),
            entry("2025_01_01_000003_c", 2),
        ];
        let plan = plan_down(&all, &applied, 2).unwrap();
        assert_eq!(ids(&plan), vec!["2025_01_01_000003_c", "2025_01_01_000002_b"]);
    }

    #[test]
    fn irreversible_member_refuses_the_batch() {
        let all = set();
        let applied = vec![
            entry("2025_01_01_000003_c", 1),
            entry("2025_01_01_000004_drop_c", 1),
        ];
        let err = plan_down(&all, &applied, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IrreversibleChange);
    }

    #[test]
    fn rollback_plans_newest_batches_first() {
        let all = set();
        let applied = vec![
            entry("2025_01_01_000001_a", 1),
            entry("2025_01_01_000002_b", 2),
            entry("2025_01_01_000003_c", 3),
        ];
        let plan = plan_rollback(&all, &applied, 2).unwrap();
        let batches: Vec<u64> = plan.iter().map(|p| p.batch).collect();
        assert_eq!(batches, vec![3, 2]);

        let everything = plan_rollback(&all, &applied, usize::MAX).unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[test]
    fn status_reports_pending_applied_and_orphans() {
        let all = set();
        let applied = vec![entry("2025_01_01_000001_a", 1), entry("2024_legacy", 1)];
        let report = status(&all, &applied);

        assert_eq!(report.rows.len(), 4);
        assert!(matches!(report.rows[0].status, DescriptorStatus::Applied { batch: 1, .. }));
        assert_eq!(report.pending().count(), 3);
        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.orphaned.len(), 1);
        assert!(!report.is_up_to_date());
    }
}
