//! In-memory document store.
//!
//! Every operation runs under a single `parking_lot::RwLock`, which makes each
//! call (and each [`commit`](DocumentStore::commit) batch) atomic with respect
//! to every other call.

use super::{DocumentFilter, DocumentStore, StoreError, StoreResult, StoredDocument, WriteOperation};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

type Collection = BTreeMap<String, StoredDocument>;

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn check(collections: &HashMap<String, Collection>, op: &WriteOperation) -> StoreResult<()> {
        let existing = collections
            .get(op.collection())
            .and_then(|c| c.get(op.key()));
        match op {
            WriteOperation::Insert { collection, key, .. } if existing.is_some() => {
                Err(StoreError::duplicate_key(collection.as_str(), key.as_str()))
            }
            WriteOperation::UpdateWhere {
                collection,
                key,
                expected_version,
                ..
            } => match existing {
                Some(doc) if doc.version == *expected_version => Ok(()),
                _ => Err(StoreError::predicate_failed(
                    collection.as_str(),
                    key.as_str(),
                    *expected_version,
                )),
            },
            _ => Ok(()),
        }
    }

    fn apply(collections: &mut HashMap<String, Collection>, op: WriteOperation) {
        match op {
            WriteOperation::Insert {
                collection,
                key,
                body,
            } => {
                collections.entry(collection).or_default().insert(
                    key.clone(),
                    StoredDocument {
                        key,
                        version: 1,
                        body,
                    },
                );
            }
            WriteOperation::Upsert {
                collection,
                key,
                body,
            } => {
                let docs = collections.entry(collection).or_default();
                let version = docs.get(&key).map(|d| d.version + 1).unwrap_or(1);
                docs.insert(key.clone(), StoredDocument { key, version, body });
            }
            WriteOperation::UpdateWhere {
                collection,
                key,
                expected_version,
                body,
            } => {
                collections.entry(collection).or_default().insert(
                    key.clone(),
                    StoredDocument {
                        key,
                        version: expected_version + 1,
                        body,
                    },
                );
            }
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(
        &self,
        collection: &str,
        key: &str,
        body: Value,
    ) -> StoreResult<StoredDocument> {
        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(key) {
            return Err(StoreError::duplicate_key(collection, key));
        }
        let doc = StoredDocument {
            key: key.to_string(),
            version: 1,
            body,
        };
        docs.insert(key.to_string(), doc.clone());
        trace!(collection, key, "inserted document");
        Ok(doc)
    }

    async fn update_where(
        &self,
        collection: &str,
        key: &str,
        expected_version: i64,
        body: Value,
    ) -> StoreResult<u64> {
        let mut collections = self.collections.write();
        let Some(doc) = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(key))
        else {
            return Ok(0);
        };
        if doc.version != expected_version {
            return Ok(0);
        }
        doc.version += 1;
        doc.body = body;
        trace!(collection, key, version = doc.version, "updated document");
        Ok(1)
    }

    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        body: Value,
    ) -> StoreResult<StoredDocument> {
        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();
        let version = docs.get(key).map(|d| d.version + 1).unwrap_or(1);
        let doc = StoredDocument {
            key: key.to_string(),
            version,
            body,
        };
        docs.insert(key.to_string(), doc.clone());
        Ok(doc)
    }

    async fn get(&self, collection: &str, key: &str) -> StoreResult<Option<StoredDocument>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn select(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> StoreResult<Vec<StoredDocument>> {
        let collections = self.collections.read();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let matching = docs.values().filter(|doc| filter.matches(&doc.body)).cloned();
        Ok(match filter.max_results() {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn delete(&self, collection: &str, key: &str) -> StoreResult<u64> {
        let removed = self
            .collections
            .write()
            .get_mut(collection)
            .and_then(|docs| docs.remove(key));
        Ok(u64::from(removed.is_some()))
    }

    async fn commit(&self, operations: Vec<WriteOperation>) -> StoreResult<()> {
        let mut collections = self.collections.write();
        for op in &operations {
            Self::check(&collections, op)?;
        }
        for op in operations {
            Self::apply(&mut collections, op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_starts_at_version_one() {
        let store = InMemoryDocumentStore::new();
        let doc = store.insert("c", "k", json!({"a": 1})).await.unwrap();
        assert_eq!(doc.version, 1);

        let dup = store.insert("c", "k", json!({})).await;
        assert!(matches!(dup, Err(StoreError::DuplicateKey { .. })));
    }

    #[tokio::test]
    async fn test_update_where_guards_on_version() {
        let store = InMemoryDocumentStore::new();
        store.insert("c", "k", json!({"a": 1})).await.unwrap();

        assert_eq!(store.update_where("c", "k", 1, json!({"a": 2})).await.unwrap(), 1);
        assert_eq!(store.update_where("c", "k", 1, json!({"a": 3})).await.unwrap(), 0);
        assert_eq!(store.update_where("c", "missing", 1, json!({})).await.unwrap(), 0);

        let doc = store.get("c", "k").await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.body, json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_select_filters_and_orders_by_key() {
        let store = InMemoryDocumentStore::new();
        store.insert("c", "b", json!({"kind": "x"})).await.unwrap();
        store.insert("c", "a", json!({"kind": "x"})).await.unwrap();
        store.insert("c", "c", json!({"kind": "y"})).await.unwrap();

        let docs = store
            .select("c", &DocumentFilter::new().field_eq("kind", "x"))
            .await
            .unwrap();
        let keys: Vec<_> = docs.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let limited = store
            .select("c", &DocumentFilter::new().limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let store = InMemoryDocumentStore::new();
        store.insert("modules", "Billing", json!({"v": "1.0"})).await.unwrap();

        let failing = vec![
            WriteOperation::Insert {
                collection: "runs".to_string(),
                key: "r1".to_string(),
                body: json!({}),
            },
            WriteOperation::UpdateWhere {
                collection: "modules".to_string(),
                key: "Billing".to_string(),
                expected_version: 7,
                body: json!({"v": "1.2"}),
            },
        ];
        assert!(store.commit(failing).await.is_err());
        assert_eq!(store.count("runs"), 0);

        let ok = vec![
            WriteOperation::Insert {
                collection: "runs".to_string(),
                key: "r1".to_string(),
                body: json!({}),
            },
            WriteOperation::UpdateWhere {
                collection: "modules".to_string(),
                key: "Billing".to_string(),
                expected_version: 1,
                body: json!({"v": "1.2"}),
            },
        ];
        store.commit(ok).await.unwrap();
        assert_eq!(store.count("runs"), 1);
        let module = store.get("modules", "Billing").await.unwrap().unwrap();
        assert_eq!(module.version, 2);
    }

    #[tokio::test]
    async fn test_delete_reports_affected_rows() {
        let store = InMemoryDocumentStore::new();
        store.upsert("c", "k", json!({})).await.unwrap();
        assert_eq!(store.delete("c", "k").await.unwrap(), 1);
        assert_eq!(store.delete("c", "k").await.unwrap(), 0);
    }
}
