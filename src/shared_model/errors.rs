//! Shared model error types.

use crate::store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Schema or record content problems; never retried
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Model '{model}' is not defined")]
    UnknownModel { model: String },

    #[error("Model '{model}' is already defined")]
    DuplicateModel { model: String },

    #[error("{model}.{field} is required")]
    MissingField { model: String, field: String },

    #[error("{model}.{field} expected {expected}, got {actual}")]
    TypeMismatch {
        model: String,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("{model}.{field} is not declared in the schema")]
    UnknownField { model: String, field: String },

    #[error("Invalid schema for '{model}': {reason}")]
    InvalidSchema { model: String, reason: String },
}

impl ValidationError {
    pub fn unknown_model(model: impl Into<String>) -> Self {
        Self::UnknownModel {
            model: model.into(),
        }
    }

    pub fn missing_field(model: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            model: model.into(),
            field: field.into(),
        }
    }

    pub fn unknown_field(model: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            model: model.into(),
            field: field.into(),
        }
    }

    pub fn invalid_schema(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchema {
            model: model.into(),
            reason: reason.into(),
        }
    }
}

/// A write carried a stale `expected_version`; re-read and retry
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Version conflict on {model}/{id}: expected version {expected_version}, found {current_version}")]
pub struct ConflictError {
    pub model: String,
    pub id: Uuid,
    pub expected_version: i64,
    pub current_version: i64,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Record {model}/{id} not found")]
pub struct RecordNotFound {
    pub model: String,
    pub id: Uuid,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SharedModelError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    NotFound(#[from] RecordNotFound),

    #[error("Record {model}/{id} is archived")]
    Archived { model: String, id: Uuid },

    #[error("Shared record persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl SharedModelError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type SharedModelResult<T> = Result<T, SharedModelError>;
