//! # Document Store
//!
//! Narrow persistence boundary used by every orchestration subsystem.
//!
//! ## Overview
//!
//! The orchestration layer never talks to a database directly. It needs exactly
//! four capabilities from persistence:
//!
//! - **Atomic insert** of a new document (fails on duplicate key)
//! - **Predicate-guarded update** returning the affected-row count, used for
//!   optimistic concurrency (`WHERE version = expected`)
//! - **Filtered select** on top-level body fields
//! - **Atomic batch commit** so that a migration's completion record and the
//!   module version pointer land together
//!
//! Every document carries a `version` counter owned by the store: inserts start
//! at 1 and every guarded update bumps it by exactly one.
//!
//! ## Backends
//!
//! - [`InMemoryDocumentStore`] - lock-protected maps, used by tests and embedded setups
//! - [`PgDocumentStore`] - PostgreSQL JSONB table (feature `postgres`)

pub mod errors;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use errors::{StoreError, StoreResult};
pub use memory::InMemoryDocumentStore;
#[cfg(feature = "postgres")]
pub use postgres::PgDocumentStore;

/// A persisted document with its store-managed version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub key: String,
    pub version: i64,
    pub body: Value,
}

impl StoredDocument {
    /// Deserialize the body into a typed value
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Equality filter over top-level body fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    equals: Vec<(String, Value)>,
    limit: Option<usize>,
}

impl DocumentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `body[field] == value`
    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.equals
    }

    pub fn max_results(&self) -> Option<usize> {
        self.limit
    }

    /// Check a document body against every condition
    pub fn matches(&self, body: &Value) -> bool {
        self.equals
            .iter()
            .all(|(field, expected)| body.get(field) == Some(expected))
    }

    /// Render the conditions as a JSON object suitable for containment queries
    pub fn as_containment(&self) -> Value {
        let map: serde_json::Map<String, Value> = self.equals.iter().cloned().collect();
        Value::Object(map)
    }
}

/// One write in an atomic [`DocumentStore::commit`] batch
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    /// Insert a new document; the whole batch fails on duplicate key
    Insert {
        collection: String,
        key: String,
        body: Value,
    },
    /// Insert or overwrite unconditionally
    Upsert {
        collection: String,
        key: String,
        body: Value,
    },
    /// Update only if the stored version equals `expected_version`
    UpdateWhere {
        collection: String,
        key: String,
        expected_version: i64,
        body: Value,
    },
}

impl WriteOperation {
    pub fn collection(&self) -> &str {
        match self {
            Self::Insert { collection, .. }
            | Self::Upsert { collection, .. }
            | Self::UpdateWhere { collection, .. } => collection,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Insert { key, .. } | Self::Upsert { key, .. } | Self::UpdateWhere { key, .. } => {
                key
            }
        }
    }
}

/// Persistence collaborator consumed by the orchestration layer
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document at version 1
    async fn insert(&self, collection: &str, key: &str, body: Value)
        -> StoreResult<StoredDocument>;

    /// Replace the body if the stored version equals `expected_version`.
    ///
    /// Returns the number of affected documents (0 or 1). On success the stored
    /// version becomes `expected_version + 1`.
    async fn update_where(
        &self,
        collection: &str,
        key: &str,
        expected_version: i64,
        body: Value,
    ) -> StoreResult<u64>;

    /// Insert or overwrite without a version predicate
    async fn upsert(&self, collection: &str, key: &str, body: Value)
        -> StoreResult<StoredDocument>;

    async fn get(&self, collection: &str, key: &str) -> StoreResult<Option<StoredDocument>>;

    /// Select documents ordered by key
    async fn select(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> StoreResult<Vec<StoredDocument>>;

    async fn delete(&self, collection: &str, key: &str) -> StoreResult<u64>;

    /// Apply every operation or none of them
    async fn commit(&self, operations: Vec<WriteOperation>) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_top_level_fields() {
        let filter = DocumentFilter::new()
            .field_eq("model", "Invoice")
            .field_eq("status", "active");

        assert!(filter.matches(&json!({"model": "Invoice", "status": "active", "x": 1})));
        assert!(!filter.matches(&json!({"model": "Invoice", "status": "archived"})));
        assert!(!filter.matches(&json!({"status": "active"})));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(DocumentFilter::new().matches(&json!({})));
        assert_eq!(DocumentFilter::new().as_containment(), json!({}));
    }

    #[test]
    fn test_write_operation_accessors() {
        let op = WriteOperation::UpdateWhere {
            collection: "modules".to_string(),
            key: "Billing".to_string(),
            expected_version: 2,
            body: json!({}),
        };
        assert_eq!(op.collection(), "modules");
        assert_eq!(op.key(), "Billing");
    }
}
