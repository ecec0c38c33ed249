//! Migration error types.

use crate::registry::RegistrationError;
use crate::store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a change unit's apply or compensate step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ChangeUnitError(pub String);

impl ChangeUnitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MigrationError {
    #[error("No migration path for '{module}' from {from} to {to}: {reason}")]
    NoPathFound {
        module: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("Migration unit '{unit_id}' of '{module}' failed in run {run_id}: {error}")]
    UnitFailed {
        module: String,
        run_id: Uuid,
        unit_id: String,
        error: String,
    },

    #[error("Rollback of '{module}' in run {run_id} is incomplete; compensation failed for {failed_units:?}")]
    RollbackIncomplete {
        module: String,
        run_id: Uuid,
        failed_units: Vec<String>,
    },

    #[error("Version pointer of '{module}' was not committed for run {run_id}: {error}")]
    CommitFailed {
        module: String,
        run_id: Uuid,
        error: String,
    },

    #[error("Module '{module}' already has a migration from version {from}")]
    DuplicateEdge { module: String, from: String },

    #[error("Module '{module}' needs manual intervention before migrating: {reason}")]
    NeedsIntervention { module: String, reason: String },

    #[error("Invalid migration for '{module}': {reason}")]
    InvalidMigration { module: String, reason: String },

    #[error("Module '{module}' is not registered")]
    ModuleNotFound { module: String },

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("Migration persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl MigrationError {
    pub fn no_path(
        module: impl Into<String>,
        from: impl ToString,
        to: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::NoPathFound {
            module: module.into(),
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMigration {
            module: module.into(),
            reason: reason.into(),
        }
    }

    pub fn module_not_found(module: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module: module.into(),
        }
    }
}

pub type MigrationResult<T> = Result<T, MigrationError>;
