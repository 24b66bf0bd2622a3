use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_LEDGER_TABLE: &str = "migrations";
pub const DEFAULT_LOCK_TABLE: &str = "migrations_lock";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Ledger and lock tables must differ, both are '{0}'")]
    TableNameClash(String),
}

/// What the runner does with descriptors already committed by a `migrate` call that
/// later fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop and leave committed descriptors applied.
    #[default]
    Halt,
    /// Stop, then revert the descriptors this call applied, newest first.
    CompensateBatch,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "halt" => Ok(FailurePolicy::Halt),
            "compensate" | "compensate-batch" => Ok(FailurePolicy::CompensateBatch),
            other => Err(format!("expected 'halt' or 'compensate', got '{}'", other)),
        }
    }
}

/// Migration runner configuration
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Directory holding the database snapshot (used by the binary)
    pub data_dir: PathBuf,

    /// Table recording applied migrations
    pub ledger_table: String,

    /// Table holding the advisory lock record
    pub lock_table: String,

    /// How long a lock stays valid without renewal
    pub lock_lease: Duration,

    /// How long to wait for a held lock; `None` fails immediately
    pub lock_timeout: Option<Duration>,

    /// Delay between lock attempts while waiting
    pub lock_poll_interval: Duration,

    pub failure_policy: FailurePolicy,
}

impl MigratorConfig {
    pub fn new() -> Self {
        Self {
            data_dir: PathBuf::from(".rustmigrate"),
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            lock_lease: Duration::from_secs(300),
            lock_timeout: None,
            lock_poll_interval: Duration::from_millis(50),
            failure_policy: FailurePolicy::Halt,
        }
    }

    /// Set the data directory
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the ledger table name
    pub fn ledger_table(mut self, table: &str) -> Self {
        self.ledger_table = table.to_string();
        self
    }

    /// Set the lock table name
    pub fn lock_table(mut self, table: &str) -> Self {
        self.lock_table = table.to_string();
        self
    }

    /// Set the lock lease
    pub fn lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    /// Wait up to `timeout` for a held lock instead of failing fast
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Reads `RUSTMIGRATE_*` variables from the process environment.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `RUSTMIGRATE_DATA_DIR` | snapshot directory |
    /// | `RUSTMIGRATE_LEDGER_TABLE` | ledger table name |
    /// | `RUSTMIGRATE_LOCK_TABLE` | lock table name |
    /// | `RUSTMIGRATE_LOCK_LEASE_SECS` | lock lease in seconds |
    /// | `RUSTMIGRATE_LOCK_TIMEOUT_MS` | lock wait in milliseconds, `0` fails fast |
    /// | `RUSTMIGRATE_FAILURE_POLICY` | `halt` or `compensate` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`MigratorConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(dir) = lookup("RUSTMIGRATE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(table) = lookup("RUSTMIGRATE_LEDGER_TABLE") {
            config.ledger_table = parse_table_name("RUSTMIGRATE_LEDGER_TABLE", &table)?;
        }
        if let Some(table) = lookup("RUSTMIGRATE_LOCK_TABLE") {
            config.lock_table = parse_table_name("RUSTMIGRATE_LOCK_TABLE", &table)?;
        }
        if let Some(secs) = lookup("RUSTMIGRATE_LOCK_LEASE_SECS") {
            let secs: u64 = parse_number("RUSTMIGRATE_LOCK_LEASE_SECS", &secs)?;
            if secs == 0 {
                return Err(invalid("RUSTMIGRATE_LOCK_LEASE_SECS", "0", "lease must be positive"));
            }
            config.lock_lease = Duration::from_secs(secs);
        }
        if let Some(ms) = lookup("RUSTMIGRATE_LOCK_TIMEOUT_MS") {
            let ms: u64 = parse_number("RUSTMIGRATE_LOCK_TIMEOUT_MS", &ms)?;
            config.lock_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(policy) = lookup("RUSTMIGRATE_FAILURE_POLICY") {
            config.failure_policy = policy
                .parse()
                .map_err(|reason| invalid("RUSTMIGRATE_FAILURE_POLICY", &policy, reason))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks settings the builder cannot reject one at a time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_distinct_tables(&self.ledger_table, &self.lock_table)
    }
}

/// The ledger and the lock need tables of their own; their rows have different shapes.
pub fn check_distinct_tables(ledger_table: &str, lock_table: &str) -> Result<(), ConfigError> {
    if ledger_table.eq_ignore_ascii_case(lock_table) {
        return Err(ConfigError::TableNameClash(ledger_table.to_string()));
    }
    Ok(())
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| invalid(key, value, e.to_string()))
}

fn parse_table_name(key: &str, value: &str) -> Result<String, ConfigError> {
    let name = value.trim();
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(invalid(key, value, "expected an identifier"));
    }
    Ok(name.to_string())
}
