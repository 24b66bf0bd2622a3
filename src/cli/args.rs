use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "rustmigrate", version)]
#[command(about = "Applies, tracks and reverts versioned schema migrations")]
pub struct Cli {
    /// Database directory (overrides RUSTMIGRATE_DATA_DIR)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Wait this long for a held migration lock instead of failing immediately
    #[arg(long, global = true)]
    pub lock_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run all pending migrations
    #[command(name = "migrate")]
    Migrate {
        /// Give every migration its own batch
        #[arg(long)]
        step: bool,
        /// Print the statements instead of running them
        #[arg(long)]
        pretend: bool,
        /// Revert this run's migrations if one of them fails
        #[arg(long)]
        compensate: bool,
    },

    /// Roll back the latest batches
    #[command(name = "migrate:rollback")]
    Rollback {
        /// Number of batches to roll back
        #[arg(long, default_value_t = 1)]
        step: usize,
        #[arg(long)]
        pretend: bool,
    },

    /// Show which migrations have run
    #[command(name = "migrate:status")]
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Roll back every migration
    #[command(name = "migrate:reset")]
    Reset,

    /// Roll back every migration, then run them all again
    #[command(name = "migrate:refresh")]
    Refresh,

    /// Create the ledger and lock tables
    #[command(name = "migrate:install")]
    Install,

    /// Clear the migration lock after repairing a failed rollback
    #[command(name = "migrate:resolve")]
    Resolve,
}
