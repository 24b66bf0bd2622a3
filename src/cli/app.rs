use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rustmigrate::config::{FailurePolicy, MigratorConfig};
use rustmigrate::core::MigrationError;
use rustmigrate::engine::MemoryEngine;
use rustmigrate::migrations;
use rustmigrate::planner::{DescriptorStatus, StatusReport};
use rustmigrate::runner::{BatchResult, Direction, Migrator, PlannedStep, StepFailure, UpOptions};
use tracing::{info, warn};

use super::args::{Cli, Command};

/// Exit code for a run that stopped on a migration error, a held lock or cancellation.
const EXIT_FAILED: u8 = 1;

pub struct App {
    migrator: Migrator,
    command: Command,
}

impl App {
    /// Loads configuration, opens the database and registers the bundled migrations.
    pub fn new(cli: Cli) -> Result<Self> {
        let mut config = MigratorConfig::from_env().context("Invalid RUSTMIGRATE_* configuration")?;
        if let Some(dir) = cli.data_dir {
            config = config.data_dir(dir);
        }
        if let Some(ms) = cli.lock_timeout_ms.filter(|ms| *ms > 0) {
            config = config.lock_timeout(Duration::from_millis(ms));
        }
        if let Command::Migrate { compensate: true, .. } = cli.command {
            config = config.failure_policy(FailurePolicy::CompensateBatch);
        }

        let engine = MemoryEngine::open(&config.data_dir).with_context(|| {
            format!("Failed to open database in '{}'", config.data_dir.display())
        })?;
        let descriptors = migrations::descriptors().context("Bundled migrations are invalid")?;

        Ok(Self {
            migrator: Migrator::new(Arc::new(engine), descriptors, config),
            command: cli.command,
        })
    }

    pub async fn run(self) -> ExitCode {
        let token = self.migrator.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; stopping after the current migration");
                token.cancel();
            }
        });

        let outcome = self.execute().await;
        if let Err(error) = &outcome {
            print_error(None, error);
        }
        ExitCode::from(exit_status(&outcome))
    }

    /// Runs the command and prints its report. `Ok(false)` means the run stopped early.
    async fn execute(&self) -> rustmigrate::Result<bool> {
        match self.command.clone() {
            Command::Migrate { step, pretend, .. } => self
                .migrator
                .migrate_up_with(UpOptions { step, pretend })
                .await
                .map(|result| report_batch(&result)),
            Command::Rollback { step, pretend: true } => self
                .migrator
                .pretend_down(step)
                .await
                .map(|planned| {
                    print_planned(&planned);
                    true
                }),
            Command::Rollback { step, pretend: false } => self
                .migrator
                .migrate_down(step)
                .await
                .map(|result| report_batch(&result)),
            Command::Status { json } => self
                .migrator
                .status()
                .await
                .and_then(|report| print_status(&report, json).map(|()| true)),
            Command::Reset => self
                .migrator
                .reset()
                .await
                .map(|result| report_batch(&result)),
            Command::Refresh => self.migrator.refresh().await.map(|result| {
                let down_ok = report_batch(&result.down);
                match &result.up {
                    Some(up) => down_ok && report_batch(up),
                    None => false,
                }
            }),
            Command::Install => self.migrator.install().await.map(|created| {
                if created {
                    println!("Migration table created.");
                } else {
                    println!("Migration table already exists.");
                }
                true
            }),
            Command::Resolve => self.migrator.resolve().await.map(|cleared| {
                match cleared {
                    Some(record) => match record.blocked_by {
                        Some(id) => println!("Cleared block left by failed rollback of {}.", id),
                        None => println!("Cleared lock held by {}.", record.owner),
                    },
                    None => println!("No migration lock present."),
                }
                true
            }),
        }
    }
}

fn exit_status(outcome: &rustmigrate::Result<bool>) -> u8 {
    match outcome {
        Ok(true) => 0,
        Ok(false) | Err(_) => EXIT_FAILED,
    }
}

/// Prints a run report; returns whether the run succeeded.
fn report_batch(result: &BatchResult) -> bool {
    if !result.planned.is_empty() {
        print_planned(&result.planned);
        return true;
    }
    if result.is_noop() {
        match result.direction {
            Direction::Up => println!("Nothing to migrate."),
            Direction::Down => println!("Nothing to rollback."),
        }
        return true;
    }

    let verb = match result.direction {
        Direction::Up => "Migrated",
        Direction::Down => "Rolled back",
    };
    for step in &result.steps {
        if result.completed.contains(&step.descriptor_id) {
            println!("{:>12}:  {} (batch {})", verb, step.descriptor_id, step.batch);
        }
    }
    if let Some(failure) = &result.failure {
        print_failure(failure);
    }
    for id in &result.compensated {
        println!("{:>12}:  {}", "Compensated", id);
    }
    if let Some(failure) = &result.compensation_failure {
        print_failure(failure);
    }
    if result.cancelled {
        println!("Cancelled; {} migration(s) completed.", result.completed.len());
    }
    info!(completed = result.completed.len(), success = result.is_success(), "Run finished");
    result.is_success()
}

fn print_planned(planned: &[PlannedStep]) {
    if planned.is_empty() {
        println!("Nothing to do.");
    }
    for step in planned {
        println!("{} (batch {}):", step.descriptor_id, step.batch);
        for statement in &step.statements {
            println!("    {};", statement);
        }
    }
}

fn print_failure(failure: &StepFailure) {
    print_error(Some(&failure.descriptor_id), &failure.error);
}

fn print_error(descriptor_id: Option<&str>, error: &MigrationError) {
    match descriptor_id {
        Some(id) => eprintln!("error[{}]: {}: {}", error.kind(), id, error),
        None => eprintln!("error[{}]: {}", error.kind(), error),
    }
    if error.requires_operator() {
        eprintln!("Repair the schema by hand, then run `rustmigrate migrate:resolve`.");
    }
}

fn print_status(report: &StatusReport, json: bool) -> rustmigrate::Result<()> {
    if json {
        let rendered = serde_json::to_string_pretty(report)
            .map_err(|e| MigrationError::Storage(format!("Failed to render status: {}", e)))?;
        println!("{}", rendered);
        return Ok(());
    }

    if report.rows.is_empty() {
        println!("No migrations found.");
    }
    let width = report
        .rows
        .iter()
        .map(|row| row.descriptor_id.len())
        .max()
        .unwrap_or(0)
        .max("Migration".len());
    println!("{:<5} {:<width$} {}", "Ran?", "Migration", "Batch", width = width);
    for row in &report.rows {
        match &row.status {
            DescriptorStatus::Applied { batch, .. } => {
                println!("{:<5} {:<width$} {}", "Yes", row.descriptor_id, batch, width = width)
            }
            DescriptorStatus::Pending => {
                println!("{:<5} {:<width$}", "No", row.descriptor_id, width = width)
            }
        }
    }
    for entry in &report.orphaned {
        println!(
            "Warning: ledger lists unknown migration {} (batch {})",
            entry.descriptor_id, entry.batch
        );
    }
    Ok(())
}
