//! # Store Error Types
//!
//! Structured errors for the document persistence layer using thiserror.

use thiserror::Error;

/// Errors raised by a [`DocumentStore`](super::DocumentStore) backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Document already exists: {collection}/{key}")]
    DuplicateKey { collection: String, key: String },

    #[error("Write predicate failed for {collection}/{key}: expected version {expected_version}")]
    PredicateFailed {
        collection: String,
        key: String,
        expected_version: i64,
    },

    #[error("Document serialization error: {message}")]
    Serialization { message: String },

    #[error("Database error: {operation}: {message}")]
    Database { operation: String, message: String },
}

impl StoreError {
    pub fn duplicate_key(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self::DuplicateKey {
            collection: collection.into(),
            key: key.into(),
        }
    }

    pub fn predicate_failed(
        collection: impl Into<String>,
        key: impl Into<String>,
        expected_version: i64,
    ) -> Self {
        Self::PredicateFailed {
            collection: collection.into(),
            key: key.into(),
            expected_version,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::serialization(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                StoreError::database("database", db_err.message().to_string())
            }
            sqlx::Error::PoolTimedOut => StoreError::database("pool", "connection pool timed out"),
            sqlx::Error::PoolClosed => StoreError::database("pool", "connection pool is closed"),
            other => StoreError::database("query", other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
