use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::ConfigError;

/// Failures reported by an [`Engine`](crate::engine::Engine) implementation.
///
/// The engine only knows about schema objects and rows; the executor lifts these into
/// [`MigrationError`] with descriptor context.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::TransactionAborted(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MigrationError {
    #[error("Migration '{descriptor_id}' has already been applied")]
    DuplicateApplication { descriptor_id: String },

    #[error("Migration '{descriptor_id}' is not applied")]
    NotApplied { descriptor_id: String },

    #[error("Ledger references unknown migration '{descriptor_id}'")]
    UnknownDescriptor { descriptor_id: String },

    #[error("Migration '{descriptor_id}' cannot be reversed")]
    IrreversibleChange { descriptor_id: String },

    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Another migration run holds the lock (owner '{owner}', lease until {expires_at})")]
    MigrationInProgress {
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Reverting '{descriptor_id}' failed, manual intervention required: {reason}")]
    RevertFailed { descriptor_id: String, reason: String },

    #[error("Invalid migration '{descriptor_id}': {reason}")]
    InvalidDescriptor { descriptor_id: String, reason: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, MigrationError>;

impl From<EngineError> for MigrationError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::SchemaConflict(msg) => Self::SchemaConflict(msg),
            EngineError::ConstraintViolation(msg) => Self::ConstraintViolation(msg),
            EngineError::TransactionAborted(msg) => Self::TransactionAborted(msg),
            EngineError::Unsupported(msg) => Self::Unsupported(msg),
            EngineError::Storage(msg) => Self::Storage(msg),
        }
    }
}

/// Stable, printable classification of a [`MigrationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DuplicateApplication,
    NotApplied,
    UnknownDescriptor,
    IrreversibleChange,
    SchemaConflict,
    ConstraintViolation,
    TransactionAborted,
    MigrationInProgress,
    RevertFailed,
    InvalidDescriptor,
    Unsupported,
    Storage,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::DuplicateApplication => "DuplicateApplication",
            ErrorKind::NotApplied => "NotApplied",
            ErrorKind::UnknownDescriptor => "UnknownDescriptor",
            ErrorKind::IrreversibleChange => "IrreversibleChange",
            ErrorKind::SchemaConflict => "SchemaConflict",
            ErrorKind::ConstraintViolation => "ConstraintViolation",
            ErrorKind::TransactionAborted => "TransactionAborted",
            ErrorKind::MigrationInProgress => "MigrationInProgress",
            ErrorKind::RevertFailed => "RevertFailed",
            ErrorKind::InvalidDescriptor => "InvalidDescriptor",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::Storage => "Storage",
            ErrorKind::Config => "Config",
        };
        f.write_str(name)
    }
}

impl MigrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::DuplicateApplication { .. } => ErrorKind::DuplicateApplication,
            MigrationError::NotApplied { .. } => ErrorKind::NotApplied,
            MigrationError::UnknownDescriptor { .. } => ErrorKind::UnknownDescriptor,
            MigrationError::IrreversibleChange { .. } => ErrorKind::IrreversibleChange,
            MigrationError::SchemaConflict(_) => ErrorKind::SchemaConflict,
            MigrationError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            MigrationError::TransactionAborted(_) => ErrorKind::TransactionAborted,
            MigrationError::MigrationInProgress { .. } => ErrorKind::MigrationInProgress,
            MigrationError::RevertFailed { .. } => ErrorKind::RevertFailed,
            MigrationError::InvalidDescriptor { .. } => ErrorKind::InvalidDescriptor,
            MigrationError::Unsupported(_) => ErrorKind::Unsupported,
            MigrationError::Storage(_) => ErrorKind::Storage,
            MigrationError::Config(_) => ErrorKind::Config,
        }
    }

    /// `RevertFailed` stops all automation until an operator resolves it.
    pub fn requires_operator(&self) -> bool {
        matches!(self, MigrationError::RevertFailed { .. })
    }

    pub(crate) fn invalid(descriptor_id: impl Into<String>, reason: impl Into<String>) -> Self {
        MigrationError::InvalidDescriptor {
            descriptor_id: descriptor_id.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_keep_their_kind() {
        let err: MigrationError = EngineError::SchemaConflict("table 'events' already exists".into()).into();
        assert_eq!(err.kind(), ErrorKind::SchemaConflict);

        let err: MigrationError = EngineError::TransactionAborted("conflict".into()).into();
        assert_eq!(err.kind(), ErrorKind::TransactionAborted);
        assert_eq!(err.kind().to_string(), "TransactionAborted");
    }

    #[test]
    fn only_revert_failures_need_an_operator() {
        let failed = MigrationError::RevertFailed {
            descriptor_id: "a".into(),
            reason: "boom".into(),
        };
        assert!(failed.requires_operator());
        assert!(!MigrationError::NotApplied { descriptor_id: "a".into() }.requires_operator());
    }
}
